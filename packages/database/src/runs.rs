//! Processing run queries.
//!
//! Run creation is an atomic claim: the insert only happens when the area
//! has no in-flight run, and the partial unique index on `area_id` rejects
//! any insert that races past the `NOT EXISTS` check. Status writes are
//! guarded by the set of legal predecessor statuses, so a terminal run can
//! never be moved again.

use chrono::Utc;
use georisk_monitor_models::{NewRun, ProcessingRun, RunMetadata, RunStatus};
use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{Database, DatabaseValue};

use crate::{
    DbError, date, new_id, opt_str, row_date, row_opt_timestamp, row_timestamp, status_list,
    timestamp,
};

const RUN_COLUMNS: &str = "id, area_id, status, before_date, after_date, before_scene_id, \
     after_scene_id, started_at, completed_at, error_message, metadata, created_at";

/// Creates a `Pending` run unless the area already has one in flight.
///
/// Returns `None` when the claim was lost to an existing in-flight run.
///
/// # Errors
///
/// Returns [`DbError::Invalid`] if the dates are not strictly ordered, or
/// [`DbError`] if the database operation fails.
pub async fn claim_run(
    db: &dyn Database,
    new_run: &NewRun,
) -> Result<Option<ProcessingRun>, DbError> {
    new_run
        .validate()
        .map_err(|e| DbError::Invalid(e.to_string()))?;

    let id = new_id();
    let metadata = serde_json::to_string(&new_run.metadata)?;

    let inserted = db
        .exec_raw_params(
            &format!(
                "INSERT OR IGNORE INTO processing_runs (id, area_id, status, before_date,
                     after_date, before_scene_id, after_scene_id, metadata, created_at)
                 SELECT $1, $2, 'PENDING', $3, $4, $5, $6, $7, $8
                 WHERE NOT EXISTS (
                     SELECT 1 FROM processing_runs
                     WHERE area_id = $2 AND status IN ({}))",
                status_list(RunStatus::active())
            ),
            &[
                DatabaseValue::String(id.clone()),
                DatabaseValue::String(new_run.area_id.clone()),
                date(new_run.before_date),
                date(new_run.after_date),
                opt_str(new_run.before_scene_id.as_deref()),
                opt_str(new_run.after_scene_id.as_deref()),
                DatabaseValue::String(metadata),
                timestamp(Utc::now()),
            ],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    if inserted == 0 {
        log::debug!(
            "Run claim for area {} lost to an in-flight run",
            new_run.area_id
        );
        return Ok(None);
    }

    get_run(db, &id).await
}

/// Loads one run.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails or the row is
/// malformed.
pub async fn get_run(db: &dyn Database, id: &str) -> Result<Option<ProcessingRun>, DbError> {
    let rows = db
        .query_raw_params(
            &format!("SELECT {RUN_COLUMNS} FROM processing_runs WHERE id = $1"),
            &[DatabaseValue::String(id.to_string())],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    rows.first().map(row_to_run).transpose()
}

/// The area's in-flight run, if any.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn find_active_run(
    db: &dyn Database,
    area_id: &str,
) -> Result<Option<ProcessingRun>, DbError> {
    let rows = db
        .query_raw_params(
            &format!(
                "SELECT {RUN_COLUMNS} FROM processing_runs
                 WHERE area_id = $1 AND status IN ({})
                 ORDER BY created_at DESC
                 LIMIT 1",
                status_list(RunStatus::active())
            ),
            &[DatabaseValue::String(area_id.to_string())],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    rows.first().map(row_to_run).transpose()
}

/// The area's completed run with the latest after-date.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn latest_completed_run(
    db: &dyn Database,
    area_id: &str,
) -> Result<Option<ProcessingRun>, DbError> {
    let rows = db
        .query_raw_params(
            &format!(
                "SELECT {RUN_COLUMNS} FROM processing_runs
                 WHERE area_id = $1 AND status = 'COMPLETED'
                 ORDER BY after_date DESC, completed_at DESC
                 LIMIT 1"
            ),
            &[DatabaseValue::String(area_id.to_string())],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    rows.first().map(row_to_run).transpose()
}

/// Most recent runs of an area, newest first.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn list_runs(
    db: &dyn Database,
    area_id: &str,
    limit: u32,
) -> Result<Vec<ProcessingRun>, DbError> {
    let rows = db
        .query_raw_params(
            &format!(
                "SELECT {RUN_COLUMNS} FROM processing_runs
                 WHERE area_id = $1
                 ORDER BY created_at DESC
                 LIMIT $2"
            ),
            &[
                DatabaseValue::String(area_id.to_string()),
                DatabaseValue::Int32(i32::try_from(limit).unwrap_or(i32::MAX)),
            ],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    rows.iter().map(row_to_run).collect()
}

/// All in-flight runs across areas.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn list_active_runs(db: &dyn Database) -> Result<Vec<ProcessingRun>, DbError> {
    let rows = db
        .query_raw_params(
            &format!(
                "SELECT {RUN_COLUMNS} FROM processing_runs
                 WHERE status IN ({})
                 ORDER BY created_at",
                status_list(RunStatus::active())
            ),
            &[],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    rows.iter().map(row_to_run).collect()
}

/// Moves a run to `next` if that is a legal transition from its current
/// status.
///
/// Sets `started_at` on the first move past `Pending` and `completed_at` on
/// a move to a terminal status. Returns `false` if the run does not exist
/// or the transition is not allowed.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn update_run_status(
    db: &dyn Database,
    id: &str,
    next: RunStatus,
) -> Result<bool, DbError> {
    let predecessors = RunStatus::predecessors(next);
    if predecessors.is_empty() {
        return Ok(false);
    }

    let now = Utc::now();
    let started_at = if next == RunStatus::Pending {
        DatabaseValue::Null
    } else {
        timestamp(now)
    };
    let completed_at = if next.is_terminal() {
        timestamp(now)
    } else {
        DatabaseValue::Null
    };

    let updated = db
        .exec_raw_params(
            &format!(
                "UPDATE processing_runs
                 SET status = $1,
                     started_at = COALESCE(started_at, $2),
                     completed_at = $3
                 WHERE id = $4 AND status IN ({})",
                status_list(&predecessors)
            ),
            &[
                DatabaseValue::String(next.as_str().to_string()),
                started_at,
                completed_at,
                DatabaseValue::String(id.to_string()),
            ],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    if updated == 0 {
        log::debug!("Run {id}: status write to {next} rejected");
    }

    Ok(updated > 0)
}

/// Forces an in-flight run to `Failed` with an error message.
///
/// Returns `false` if the run does not exist or is already terminal.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn fail_run(db: &dyn Database, id: &str, message: &str) -> Result<bool, DbError> {
    let updated = db
        .exec_raw_params(
            &format!(
                "UPDATE processing_runs
                 SET status = 'FAILED', error_message = $1, completed_at = $2
                 WHERE id = $3 AND status IN ({})",
                status_list(RunStatus::active())
            ),
            &[
                DatabaseValue::String(message.to_string()),
                timestamp(Utc::now()),
                DatabaseValue::String(id.to_string()),
            ],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(updated > 0)
}

/// Marks an in-flight run `Completed`.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn complete_run(db: &dyn Database, id: &str) -> Result<bool, DbError> {
    update_run_status(db, id, RunStatus::Completed).await
}

/// Merges keys into a run's metadata map.
///
/// Returns `false` if the run does not exist.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn merge_run_metadata(
    db: &dyn Database,
    id: &str,
    entries: &RunMetadata,
) -> Result<bool, DbError> {
    let Some(run) = get_run(db, id).await? else {
        return Ok(false);
    };

    let mut metadata = run.metadata;
    for (key, value) in entries {
        metadata.insert(key.clone(), value.clone());
    }

    let updated = db
        .exec_raw_params(
            "UPDATE processing_runs SET metadata = $1 WHERE id = $2",
            &[
                DatabaseValue::String(serde_json::to_string(&metadata)?),
                DatabaseValue::String(id.to_string()),
            ],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(updated > 0)
}

/// Deletes a run with its change polygons and their risk events.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn delete_run(db: &dyn Database, id: &str) -> Result<bool, DbError> {
    let params = [DatabaseValue::String(id.to_string())];

    db.exec_raw_params(
        "DELETE FROM risk_events WHERE change_polygon_id IN (
             SELECT id FROM change_polygons WHERE run_id = $1)",
        &params,
    )
    .await
    .map_err(|e| DbError::Database(e.to_string()))?;

    db.exec_raw_params("DELETE FROM change_polygons WHERE run_id = $1", &params)
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    let deleted = db
        .exec_raw_params("DELETE FROM processing_runs WHERE id = $1", &params)
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(deleted > 0)
}

fn row_to_run(row: &switchy_database::Row) -> Result<ProcessingRun, DbError> {
    let status: String = row.to_value("status").unwrap_or_default();
    let status = status
        .parse::<RunStatus>()
        .map_err(|message| DbError::Conversion { message })?;

    let metadata_json: String = row.to_value("metadata").unwrap_or_default();
    let metadata: RunMetadata = if metadata_json.is_empty() {
        RunMetadata::new()
    } else {
        serde_json::from_str(&metadata_json)?
    };

    Ok(ProcessingRun {
        id: row.to_value("id").unwrap_or_default(),
        area_id: row.to_value("area_id").unwrap_or_default(),
        status,
        before_date: row_date(row, "before_date")?,
        after_date: row_date(row, "after_date")?,
        before_scene_id: row.to_value("before_scene_id").unwrap_or(None),
        after_scene_id: row.to_value("after_scene_id").unwrap_or(None),
        started_at: row_opt_timestamp(row, "started_at"),
        completed_at: row_opt_timestamp(row, "completed_at"),
        error_message: row.to_value("error_message").unwrap_or(None),
        metadata,
        created_at: row_timestamp(row, "created_at"),
    })
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use georisk_monitor_models::RunTrigger;

    use super::*;
    use crate::areas::upsert_area;
    use crate::test_support::{TempStore, area};

    fn new_run(area_id: &str, before: (i32, u32, u32), after: (i32, u32, u32)) -> NewRun {
        NewRun::new(
            area_id,
            NaiveDate::from_ymd_opt(before.0, before.1, before.2).unwrap(),
            NaiveDate::from_ymd_opt(after.0, after.1, after.2).unwrap(),
            RunTrigger::Scheduled,
        )
    }

    #[tokio::test]
    async fn claim_is_single_flight_per_area() {
        let store = TempStore::new("runs_claim").await;
        let db = store.db.as_ref();
        upsert_area(db, &area("x")).await.unwrap();
        upsert_area(db, &area("y")).await.unwrap();

        let first = claim_run(db, &new_run("x", (2024, 1, 1), (2024, 2, 1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.status, RunStatus::Pending);
        assert_eq!(first.metadata["trigger"], "scheduled");

        let second = claim_run(db, &new_run("x", (2024, 2, 1), (2024, 3, 1))).await.unwrap();
        assert!(second.is_none());

        let other = claim_run(db, &new_run("y", (2024, 2, 1), (2024, 3, 1))).await.unwrap();
        assert!(other.is_some());

        assert!(fail_run(db, &first.id, "boom").await.unwrap());
        let third = claim_run(db, &new_run("x", (2024, 2, 1), (2024, 3, 1))).await.unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn claim_rejects_unordered_dates() {
        let store = TempStore::new("runs_dates").await;
        let db = store.db.as_ref();
        upsert_area(db, &area("x")).await.unwrap();

        let result = claim_run(db, &new_run("x", (2024, 2, 1), (2024, 2, 1))).await;
        assert!(matches!(result, Err(DbError::Invalid(_))));
    }

    #[tokio::test]
    async fn status_never_regresses_or_leaves_terminal() {
        let store = TempStore::new("runs_monotonic").await;
        let db = store.db.as_ref();
        upsert_area(db, &area("x")).await.unwrap();
        let run = claim_run(db, &new_run("x", (2024, 1, 1), (2024, 2, 1)))
            .await
            .unwrap()
            .unwrap();

        assert!(update_run_status(db, &run.id, RunStatus::FetchingImagery).await.unwrap());
        assert!(update_run_status(db, &run.id, RunStatus::DetectingChanges).await.unwrap());
        assert!(!update_run_status(db, &run.id, RunStatus::CalculatingNdvi).await.unwrap());

        let loaded = get_run(db, &run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::DetectingChanges);
        assert!(loaded.started_at.is_some());
        assert!(loaded.completed_at.is_none());

        assert!(complete_run(db, &run.id).await.unwrap());
        assert!(!fail_run(db, &run.id, "late failure").await.unwrap());
        assert!(!update_run_status(db, &run.id, RunStatus::ScoringRisk).await.unwrap());

        let loaded = get_run(db, &run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert!(loaded.completed_at.is_some());
        assert!(loaded.error_message.is_none());
    }

    #[tokio::test]
    async fn latest_completed_orders_by_after_date() {
        let store = TempStore::new("runs_latest").await;
        let db = store.db.as_ref();
        upsert_area(db, &area("x")).await.unwrap();

        for (before, after) in [((2024, 3, 1), (2024, 4, 1)), ((2024, 1, 1), (2024, 2, 1))] {
            let run = claim_run(db, &new_run("x", before, after)).await.unwrap().unwrap();
            complete_run(db, &run.id).await.unwrap();
        }
        let failed = claim_run(db, &new_run("x", (2024, 4, 1), (2024, 5, 1)))
            .await
            .unwrap()
            .unwrap();
        fail_run(db, &failed.id, "boom").await.unwrap();

        let latest = latest_completed_run(db, "x").await.unwrap().unwrap();
        assert_eq!(latest.after_date, NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
        assert!(find_active_run(db, "x").await.unwrap().is_none());
        assert_eq!(list_runs(db, "x", 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn metadata_merges_keys() {
        let store = TempStore::new("runs_metadata").await;
        let db = store.db.as_ref();
        upsert_area(db, &area("x")).await.unwrap();
        let run = claim_run(db, &new_run("x", (2024, 1, 1), (2024, 2, 1)))
            .await
            .unwrap()
            .unwrap();

        let mut extra = RunMetadata::new();
        extra.insert("polygon_count".to_string(), serde_json::json!(4));
        assert!(merge_run_metadata(db, &run.id, &extra).await.unwrap());

        let loaded = get_run(db, &run.id).await.unwrap().unwrap();
        assert_eq!(loaded.metadata["polygon_count"], 4);
        assert_eq!(loaded.metadata["trigger"], "scheduled");
        assert!(!merge_run_metadata(db, "missing", &extra).await.unwrap());
    }
}
