//! Monitored area queries.

use chrono::{DateTime, Utc};
use georisk_monitor_models::{AreaSchedule, MonitoredArea};
use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{Database, DatabaseValue};

use crate::{
    DbError, opt_str, opt_timestamp, row_bool, row_opt_timestamp, row_timestamp, timestamp,
};

const AREA_COLUMNS: &str = "id, name, boundary_geojson, schedule_cron, schedule_enabled, \
     max_cloud_cover, lookback_days, last_checked_at, last_processed_at, created_at";

/// Inserts an area, or replaces its name, boundary and schedule settings
/// if it already exists. Check/processing timestamps are preserved.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn upsert_area(db: &dyn Database, area: &MonitoredArea) -> Result<(), DbError> {
    db.exec_raw_params(
        "INSERT INTO monitored_areas (id, name, boundary_geojson, schedule_cron,
             schedule_enabled, max_cloud_cover, lookback_days, last_checked_at,
             last_processed_at, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
         ON CONFLICT (id) DO UPDATE SET
           name = excluded.name,
           boundary_geojson = excluded.boundary_geojson,
           schedule_cron = excluded.schedule_cron,
           schedule_enabled = excluded.schedule_enabled,
           max_cloud_cover = excluded.max_cloud_cover,
           lookback_days = excluded.lookback_days",
        &[
            DatabaseValue::String(area.id.clone()),
            DatabaseValue::String(area.name.clone()),
            DatabaseValue::String(area.boundary_geojson.clone()),
            opt_str(area.schedule_cron.as_deref()),
            DatabaseValue::Int64(i64::from(area.schedule_enabled)),
            DatabaseValue::Real64(area.max_cloud_cover),
            DatabaseValue::Int64(i64::from(area.lookback_days)),
            opt_timestamp(area.last_checked_at),
            opt_timestamp(area.last_processed_at),
            timestamp(area.created_at),
        ],
    )
    .await
    .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(())
}

/// Loads one area.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_area(db: &dyn Database, id: &str) -> Result<Option<MonitoredArea>, DbError> {
    let rows = db
        .query_raw_params(
            &format!("SELECT {AREA_COLUMNS} FROM monitored_areas WHERE id = $1"),
            &[DatabaseValue::String(id.to_string())],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(rows.first().map(row_to_area))
}

/// Lists all areas ordered by name.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn list_areas(db: &dyn Database) -> Result<Vec<MonitoredArea>, DbError> {
    let rows = db
        .query_raw_params(
            &format!("SELECT {AREA_COLUMNS} FROM monitored_areas ORDER BY name, id"),
            &[],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(rows.iter().map(row_to_area).collect())
}

/// Lists areas with an enabled, non-blank schedule expression.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn list_scheduled_areas(db: &dyn Database) -> Result<Vec<MonitoredArea>, DbError> {
    let rows = db
        .query_raw_params(
            &format!(
                "SELECT {AREA_COLUMNS} FROM monitored_areas
                 WHERE schedule_enabled = 1
                   AND schedule_cron IS NOT NULL
                   AND TRIM(schedule_cron) != ''
                 ORDER BY name, id"
            ),
            &[],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(rows.iter().map(row_to_area).collect())
}

/// Records that the area was checked for new imagery.
///
/// Returns `false` if the area does not exist.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn touch_last_checked(
    db: &dyn Database,
    id: &str,
    at: DateTime<Utc>,
) -> Result<bool, DbError> {
    let updated = db
        .exec_raw_params(
            "UPDATE monitored_areas SET last_checked_at = $1 WHERE id = $2",
            &[timestamp(at), DatabaseValue::String(id.to_string())],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(updated > 0)
}

/// Records that a run was triggered for the area.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn set_last_processed(
    db: &dyn Database,
    id: &str,
    at: DateTime<Utc>,
) -> Result<bool, DbError> {
    let updated = db
        .exec_raw_params(
            "UPDATE monitored_areas SET last_processed_at = $1 WHERE id = $2",
            &[timestamp(at), DatabaseValue::String(id.to_string())],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(updated > 0)
}

/// Writes validated schedule settings.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn update_area_schedule(
    db: &dyn Database,
    id: &str,
    schedule: &AreaSchedule,
) -> Result<bool, DbError> {
    let updated = db
        .exec_raw_params(
            "UPDATE monitored_areas
             SET schedule_cron = $1, schedule_enabled = $2, max_cloud_cover = $3,
                 lookback_days = $4
             WHERE id = $5",
            &[
                opt_str(schedule.schedule_cron.as_deref()),
                DatabaseValue::Int64(i64::from(schedule.schedule_enabled)),
                DatabaseValue::Real64(schedule.max_cloud_cover),
                DatabaseValue::Int64(i64::from(schedule.lookback_days)),
                DatabaseValue::String(id.to_string()),
            ],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(updated > 0)
}

/// Deletes an area with its runs, their change polygons and risk events.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn delete_area(db: &dyn Database, id: &str) -> Result<bool, DbError> {
    let params = [DatabaseValue::String(id.to_string())];

    db.exec_raw_params(
        "DELETE FROM risk_events WHERE change_polygon_id IN (
             SELECT cp.id FROM change_polygons cp
             JOIN processing_runs r ON r.id = cp.run_id
             WHERE r.area_id = $1)",
        &params,
    )
    .await
    .map_err(|e| DbError::Database(e.to_string()))?;

    db.exec_raw_params(
        "DELETE FROM change_polygons WHERE run_id IN (
             SELECT id FROM processing_runs WHERE area_id = $1)",
        &params,
    )
    .await
    .map_err(|e| DbError::Database(e.to_string()))?;

    db.exec_raw_params("DELETE FROM processing_runs WHERE area_id = $1", &params)
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    let deleted = db
        .exec_raw_params("DELETE FROM monitored_areas WHERE id = $1", &params)
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(deleted > 0)
}

fn row_to_area(row: &switchy_database::Row) -> MonitoredArea {
    MonitoredArea {
        id: row.to_value("id").unwrap_or_default(),
        name: row.to_value("name").unwrap_or_default(),
        boundary_geojson: row.to_value("boundary_geojson").unwrap_or_default(),
        schedule_cron: row.to_value("schedule_cron").unwrap_or(None),
        schedule_enabled: row_bool(row, "schedule_enabled"),
        max_cloud_cover: row
            .to_value("max_cloud_cover")
            .unwrap_or(MonitoredArea::DEFAULT_MAX_CLOUD_COVER),
        lookback_days: row
            .to_value::<i64>("lookback_days")
            .ok()
            .and_then(|d| u32::try_from(d).ok())
            .unwrap_or(MonitoredArea::DEFAULT_LOOKBACK_DAYS),
        last_checked_at: row_opt_timestamp(row, "last_checked_at"),
        last_processed_at: row_opt_timestamp(row, "last_processed_at"),
        created_at: row_timestamp(row, "created_at"),
    }
}
