#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Persistent store for area monitoring.
//!
//! A single `SQLite` file accessed through `switchy_database`. The store is
//! the only synchronization point between schedulers, the run state
//! machine and executors: single-flight run creation and monotonic status
//! updates are both enforced by conditional SQL, not by in-process locks.

pub mod areas;
pub mod detections;
pub mod runs;

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{Database, DatabaseValue};
use switchy_database_connection::init_sqlite_rusqlite;

pub use areas::*;
pub use detections::*;
pub use runs::*;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A database query or command failed.
    #[error("Database error: {0}")]
    Database(String),

    /// An I/O operation failed (e.g., creating the database file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored JSON column could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored value could not be converted to its model type.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },

    /// A write was rejected by a model invariant.
    #[error("Invalid data: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Database lifecycle
// ---------------------------------------------------------------------------

/// Opens (or creates) the store at the given path and ensures the schema
/// exists.
///
/// # Errors
///
/// Returns [`DbError`] if the database file cannot be created or the schema
/// DDL fails.
pub async fn open_db(path: &Path) -> Result<Box<dyn Database>, DbError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let db = init_sqlite_rusqlite(Some(path)).map_err(|e| DbError::Database(e.to_string()))?;

    ensure_schema(db.as_ref()).await?;
    log::debug!("Opened store at {}", path.display());

    Ok(db)
}

/// Creates all tables and indexes if they don't already exist.
///
/// # Errors
///
/// Returns [`DbError`] if any DDL statement fails.
pub async fn ensure_schema(db: &dyn Database) -> Result<(), DbError> {
    for statement in SCHEMA {
        db.exec_raw(statement)
            .await
            .map_err(|e| DbError::Database(e.to_string()))?;
    }
    Ok(())
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS monitored_areas (
        id                TEXT PRIMARY KEY,
        name              TEXT NOT NULL,
        boundary_geojson  TEXT NOT NULL,
        schedule_cron     TEXT,
        schedule_enabled  INTEGER NOT NULL DEFAULT 0,
        max_cloud_cover   REAL NOT NULL DEFAULT 20.0,
        lookback_days     INTEGER NOT NULL DEFAULT 90,
        last_checked_at   TEXT,
        last_processed_at TEXT,
        created_at        TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS processing_runs (
        id              TEXT PRIMARY KEY,
        area_id         TEXT NOT NULL REFERENCES monitored_areas(id) ON DELETE CASCADE,
        status          TEXT NOT NULL DEFAULT 'PENDING',
        before_date     TEXT NOT NULL,
        after_date      TEXT NOT NULL,
        before_scene_id TEXT,
        after_scene_id  TEXT,
        started_at      TEXT,
        completed_at    TEXT,
        error_message   TEXT,
        metadata        TEXT NOT NULL DEFAULT '{}',
        created_at      TEXT NOT NULL,
        CHECK (before_date < after_date)
    )",
    // At most one in-flight run per area.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_active_per_area
     ON processing_runs (area_id)
     WHERE status NOT IN ('COMPLETED', 'FAILED')",
    "CREATE INDEX IF NOT EXISTS idx_runs_area_after
     ON processing_runs (area_id, status, after_date)",
    "CREATE TABLE IF NOT EXISTS change_polygons (
        id                  TEXT PRIMARY KEY,
        run_id              TEXT NOT NULL REFERENCES processing_runs(id) ON DELETE CASCADE,
        geometry_geojson    TEXT NOT NULL,
        area_m2             REAL NOT NULL,
        mean_ndvi_delta     REAL NOT NULL,
        max_ndvi_delta      REAL NOT NULL,
        change_type         TEXT NOT NULL,
        mean_slope_degrees  REAL,
        mean_aspect_degrees REAL,
        mean_elevation_m    REAL,
        land_cover          TEXT,
        ml_confidence       REAL,
        ml_model_version    TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_change_polygons_run ON change_polygons (run_id)",
    "CREATE TABLE IF NOT EXISTS assets (
        id          TEXT PRIMARY KEY,
        name        TEXT NOT NULL,
        asset_type  TEXT NOT NULL,
        criticality TEXT NOT NULL,
        longitude   REAL NOT NULL,
        latitude    REAL NOT NULL,
        elevation_m REAL
    )",
    "CREATE TABLE IF NOT EXISTS risk_events (
        id                TEXT PRIMARY KEY,
        change_polygon_id TEXT NOT NULL REFERENCES change_polygons(id) ON DELETE CASCADE,
        asset_id          TEXT NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
        distance_m        REAL NOT NULL,
        score             INTEGER NOT NULL CHECK (score BETWEEN 0 AND 100),
        level             TEXT NOT NULL,
        factors           TEXT NOT NULL,
        created_at        TEXT NOT NULL,
        acknowledged_by   TEXT,
        acknowledged_at   TEXT,
        dismissed         INTEGER NOT NULL DEFAULT 0,
        dismissed_reason  TEXT,
        UNIQUE (change_polygon_id, asset_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_risk_events_polygon ON risk_events (change_polygon_id)",
    "PRAGMA foreign_keys = ON",
];

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// Converts an `Option<&str>` to a [`DatabaseValue`], using `Null` for `None`.
pub(crate) fn opt_str(value: Option<&str>) -> DatabaseValue {
    value.map_or(DatabaseValue::Null, |s| DatabaseValue::String(s.to_string()))
}

/// Converts an `Option<f64>` to a [`DatabaseValue`], using `Null` for `None`.
pub(crate) fn opt_f64(value: Option<f64>) -> DatabaseValue {
    value.map_or(DatabaseValue::Null, DatabaseValue::Real64)
}

pub(crate) fn timestamp(value: DateTime<Utc>) -> DatabaseValue {
    DatabaseValue::String(value.to_rfc3339())
}

pub(crate) fn opt_timestamp(value: Option<DateTime<Utc>>) -> DatabaseValue {
    value.map_or(DatabaseValue::Null, timestamp)
}

pub(crate) fn date(value: NaiveDate) -> DatabaseValue {
    DatabaseValue::String(value.format("%Y-%m-%d").to_string())
}

/// Reads an RFC 3339 `TEXT` column as an optional UTC timestamp.
pub(crate) fn row_opt_timestamp(row: &switchy_database::Row, col: &str) -> Option<DateTime<Utc>> {
    row.to_value::<Option<String>>(col)
        .unwrap_or(None)
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn row_timestamp(row: &switchy_database::Row, col: &str) -> DateTime<Utc> {
    row_opt_timestamp(row, col).unwrap_or_default()
}

pub(crate) fn row_date(row: &switchy_database::Row, col: &str) -> Result<NaiveDate, DbError> {
    let raw: String = row.to_value(col).unwrap_or_default();
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| DbError::Conversion {
        message: format!("{col} '{raw}': {e}"),
    })
}

/// Reads an `INTEGER` column as a `bool` (non-zero = true).
pub(crate) fn row_bool(row: &switchy_database::Row, col: &str) -> bool {
    row.to_value::<i64>(col).unwrap_or(0) != 0
}

/// Renders statuses as a SQL `IN` list. Status strings are fixed
/// identifiers, never user input.
pub(crate) fn status_list(statuses: &[georisk_monitor_models::RunStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;

    use georisk_monitor_models::MonitoredArea;
    use switchy_database::Database;

    /// A store in a fresh temp file, removed on drop.
    pub struct TempStore {
        pub db: Box<dyn Database>,
        path: PathBuf,
    }

    impl TempStore {
        pub async fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "georisk_db_test_{name}_{}.sqlite",
                std::process::id()
            ));
            let _ = std::fs::remove_file(&path);
            let db = super::open_db(&path).await.unwrap();
            Self { db, path }
        }
    }

    impl Drop for TempStore {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    pub fn area(id: &str) -> MonitoredArea {
        MonitoredArea {
            id: id.to_string(),
            name: format!("Area {id}"),
            boundary_geojson:
                r#"{"type":"Polygon","coordinates":[[[10,45],[10.01,45],[10.01,45.01],[10,45.01],[10,45]]]}"#
                    .to_string(),
            schedule_cron: Some("0 6 * * *".to_string()),
            schedule_enabled: true,
            max_cloud_cover: 25.0,
            lookback_days: 90,
            last_checked_at: None,
            last_processed_at: None,
            created_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::TempStore;

    #[tokio::test]
    async fn schema_is_idempotent() {
        let store = TempStore::new("schema").await;
        super::ensure_schema(store.db.as_ref()).await.unwrap();
        super::ensure_schema(store.db.as_ref()).await.unwrap();
    }
}
