//! Change polygons, assets and risk events.

use chrono::{DateTime, Utc};
use georisk_monitor_models::{Asset, ChangePolygonRecord, RiskEvent};
use georisk_risk_models::{AssetCriticality, AssetType, ChangeType, RiskLevel, ScoringFactor};
use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{Database, DatabaseValue};

use crate::{
    DbError, opt_f64, opt_str, opt_timestamp, row_bool, row_opt_timestamp, row_timestamp,
    timestamp,
};

// ---------------------------------------------------------------------------
// Change polygons
// ---------------------------------------------------------------------------

/// Stores a detected change polygon.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn insert_change_polygon(
    db: &dyn Database,
    polygon: &ChangePolygonRecord,
) -> Result<(), DbError> {
    db.exec_raw_params(
        "INSERT INTO change_polygons (id, run_id, geometry_geojson, area_m2,
             mean_ndvi_delta, max_ndvi_delta, change_type, mean_slope_degrees,
             mean_aspect_degrees, mean_elevation_m, land_cover, ml_confidence,
             ml_model_version)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        &[
            DatabaseValue::String(polygon.id.clone()),
            DatabaseValue::String(polygon.run_id.clone()),
            DatabaseValue::String(polygon.geometry_geojson.clone()),
            DatabaseValue::Real64(polygon.area_m2),
            DatabaseValue::Real64(polygon.mean_ndvi_delta),
            DatabaseValue::Real64(polygon.max_ndvi_delta),
            DatabaseValue::String(polygon.change_type.as_ref().to_string()),
            opt_f64(polygon.mean_slope_degrees),
            opt_f64(polygon.mean_aspect_degrees),
            opt_f64(polygon.mean_elevation_m),
            opt_str(polygon.land_cover.as_ref().map(AsRef::as_ref)),
            opt_f64(polygon.ml_confidence),
            opt_str(polygon.ml_model_version.as_deref()),
        ],
    )
    .await
    .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(())
}

/// Lists the change polygons detected by a run.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails or a row is
/// malformed.
pub async fn list_change_polygons(
    db: &dyn Database,
    run_id: &str,
) -> Result<Vec<ChangePolygonRecord>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT id, run_id, geometry_geojson, area_m2, mean_ndvi_delta, max_ndvi_delta,
                    change_type, mean_slope_degrees, mean_aspect_degrees, mean_elevation_m,
                    land_cover, ml_confidence, ml_model_version
             FROM change_polygons
             WHERE run_id = $1
             ORDER BY area_m2 DESC, id",
            &[DatabaseValue::String(run_id.to_string())],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    rows.iter().map(row_to_change_polygon).collect()
}

fn row_to_change_polygon(row: &switchy_database::Row) -> Result<ChangePolygonRecord, DbError> {
    let change_type: String = row.to_value("change_type").unwrap_or_default();
    let change_type = change_type
        .parse::<ChangeType>()
        .map_err(|e| DbError::Conversion {
            message: format!("change_type '{change_type}': {e}"),
        })?;

    Ok(ChangePolygonRecord {
        id: row.to_value("id").unwrap_or_default(),
        run_id: row.to_value("run_id").unwrap_or_default(),
        geometry_geojson: row.to_value("geometry_geojson").unwrap_or_default(),
        area_m2: row.to_value("area_m2").unwrap_or(0.0),
        mean_ndvi_delta: row.to_value("mean_ndvi_delta").unwrap_or(0.0),
        max_ndvi_delta: row.to_value("max_ndvi_delta").unwrap_or(0.0),
        change_type,
        mean_slope_degrees: row.to_value("mean_slope_degrees").unwrap_or(None),
        mean_aspect_degrees: row.to_value("mean_aspect_degrees").unwrap_or(None),
        mean_elevation_m: row.to_value("mean_elevation_m").unwrap_or(None),
        land_cover: row
            .to_value::<Option<String>>("land_cover")
            .unwrap_or(None)
            .and_then(|s| s.parse().ok()),
        ml_confidence: row.to_value("ml_confidence").unwrap_or(None),
        ml_model_version: row.to_value("ml_model_version").unwrap_or(None),
    })
}

// ---------------------------------------------------------------------------
// Assets
// ---------------------------------------------------------------------------

/// Inserts or replaces an asset.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn upsert_asset(db: &dyn Database, asset: &Asset) -> Result<(), DbError> {
    db.exec_raw_params(
        "INSERT INTO assets (id, name, asset_type, criticality, longitude, latitude, elevation_m)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (id) DO UPDATE SET
           name = excluded.name,
           asset_type = excluded.asset_type,
           criticality = excluded.criticality,
           longitude = excluded.longitude,
           latitude = excluded.latitude,
           elevation_m = excluded.elevation_m",
        &[
            DatabaseValue::String(asset.id.clone()),
            DatabaseValue::String(asset.name.clone()),
            DatabaseValue::String(asset.asset_type.as_ref().to_string()),
            DatabaseValue::String(asset.criticality.as_ref().to_string()),
            DatabaseValue::Real64(asset.longitude),
            DatabaseValue::Real64(asset.latitude),
            opt_f64(asset.elevation_m),
        ],
    )
    .await
    .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(())
}

/// Lists assets inside a bounding box `(min_lon, min_lat, max_lon, max_lat)`,
/// or all assets when no box is given.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn list_assets(
    db: &dyn Database,
    bbox: Option<(f64, f64, f64, f64)>,
) -> Result<Vec<Asset>, DbError> {
    const COLUMNS: &str = "id, name, asset_type, criticality, longitude, latitude, elevation_m";

    let rows = match bbox {
        Some((min_lon, min_lat, max_lon, max_lat)) => {
            db.query_raw_params(
                &format!(
                    "SELECT {COLUMNS} FROM assets
                     WHERE longitude BETWEEN $1 AND $2 AND latitude BETWEEN $3 AND $4
                     ORDER BY id"
                ),
                &[
                    DatabaseValue::Real64(min_lon),
                    DatabaseValue::Real64(max_lon),
                    DatabaseValue::Real64(min_lat),
                    DatabaseValue::Real64(max_lat),
                ],
            )
            .await
        }
        None => {
            db.query_raw_params(&format!("SELECT {COLUMNS} FROM assets ORDER BY id"), &[])
                .await
        }
    }
    .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(rows.iter().map(row_to_asset).collect())
}

fn row_to_asset(row: &switchy_database::Row) -> Asset {
    Asset {
        id: row.to_value("id").unwrap_or_default(),
        name: row.to_value("name").unwrap_or_default(),
        asset_type: row
            .to_value::<String>("asset_type")
            .unwrap_or_default()
            .parse()
            .unwrap_or(AssetType::Other),
        criticality: row
            .to_value::<String>("criticality")
            .unwrap_or_default()
            .parse()
            .unwrap_or(AssetCriticality::Medium),
        longitude: row.to_value("longitude").unwrap_or(0.0),
        latitude: row.to_value("latitude").unwrap_or(0.0),
        elevation_m: row.to_value("elevation_m").unwrap_or(None),
    }
}

// ---------------------------------------------------------------------------
// Risk events
// ---------------------------------------------------------------------------

/// Stores a scored risk event. A second event for the same
/// (polygon, asset) pair is ignored; re-scoring requires a new run.
///
/// Returns `false` if the pair was already scored.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn insert_risk_event(db: &dyn Database, event: &RiskEvent) -> Result<bool, DbError> {
    let inserted = db
        .exec_raw_params(
            "INSERT OR IGNORE INTO risk_events (id, change_polygon_id, asset_id, distance_m,
                 score, level, factors, created_at, acknowledged_by, acknowledged_at,
                 dismissed, dismissed_reason)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            &[
                DatabaseValue::String(event.id.clone()),
                DatabaseValue::String(event.change_polygon_id.clone()),
                DatabaseValue::String(event.asset_id.clone()),
                DatabaseValue::Real64(event.distance_m),
                DatabaseValue::Int64(i64::from(event.score)),
                DatabaseValue::String(event.level.as_ref().to_string()),
                DatabaseValue::String(serde_json::to_string(&event.factors)?),
                timestamp(event.created_at),
                opt_str(event.acknowledged_by.as_deref()),
                opt_timestamp(event.acknowledged_at),
                DatabaseValue::Int64(i64::from(event.dismissed)),
                opt_str(event.dismissed_reason.as_deref()),
            ],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(inserted > 0)
}

const EVENT_COLUMNS: &str = "e.id, e.change_polygon_id, e.asset_id, e.distance_m, e.score, \
     e.level, e.factors, e.created_at, e.acknowledged_by, e.acknowledged_at, e.dismissed, \
     e.dismissed_reason";

/// Loads one risk event.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails or the row is
/// malformed.
pub async fn get_risk_event(db: &dyn Database, id: &str) -> Result<Option<RiskEvent>, DbError> {
    let rows = db
        .query_raw_params(
            &format!("SELECT {EVENT_COLUMNS} FROM risk_events e WHERE e.id = $1"),
            &[DatabaseValue::String(id.to_string())],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    rows.first().map(row_to_risk_event).transpose()
}

/// Lists the risk events of a run, highest score first. Dismissed events
/// are left out unless `include_dismissed` is set.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails or a row is
/// malformed.
pub async fn list_risk_events_for_run(
    db: &dyn Database,
    run_id: &str,
    include_dismissed: bool,
) -> Result<Vec<RiskEvent>, DbError> {
    let rows = db
        .query_raw_params(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM risk_events e
                 JOIN change_polygons cp ON cp.id = e.change_polygon_id
                 WHERE cp.run_id = $1 AND (e.dismissed = 0 OR $2 = 1)
                 ORDER BY e.score DESC, e.distance_m, e.id"
            ),
            &[
                DatabaseValue::String(run_id.to_string()),
                DatabaseValue::Int64(i64::from(include_dismissed)),
            ],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    rows.iter().map(row_to_risk_event).collect()
}

/// Records who acknowledged an event and when.
///
/// Returns `false` if the event does not exist.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn acknowledge_risk_event(
    db: &dyn Database,
    id: &str,
    by: &str,
    at: DateTime<Utc>,
) -> Result<bool, DbError> {
    let updated = db
        .exec_raw_params(
            "UPDATE risk_events SET acknowledged_by = $1, acknowledged_at = $2 WHERE id = $3",
            &[
                DatabaseValue::String(by.to_string()),
                timestamp(at),
                DatabaseValue::String(id.to_string()),
            ],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(updated > 0)
}

/// Dismisses an event with an optional reason.
///
/// Returns `false` if the event does not exist.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn dismiss_risk_event(
    db: &dyn Database,
    id: &str,
    reason: Option<&str>,
) -> Result<bool, DbError> {
    let updated = db
        .exec_raw_params(
            "UPDATE risk_events SET dismissed = 1, dismissed_reason = $1 WHERE id = $2",
            &[opt_str(reason), DatabaseValue::String(id.to_string())],
        )
        .await
        .map_err(|e| DbError::Database(e.to_string()))?;

    Ok(updated > 0)
}

fn row_to_risk_event(row: &switchy_database::Row) -> Result<RiskEvent, DbError> {
    let factors_json: String = row.to_value("factors").unwrap_or_default();
    let factors: Vec<ScoringFactor> = serde_json::from_str(&factors_json)?;

    let score = row
        .to_value::<i64>("score")
        .ok()
        .and_then(|s| u8::try_from(s).ok())
        .ok_or_else(|| DbError::Conversion {
            message: "score out of range".to_string(),
        })?;

    Ok(RiskEvent {
        id: row.to_value("id").unwrap_or_default(),
        change_polygon_id: row.to_value("change_polygon_id").unwrap_or_default(),
        asset_id: row.to_value("asset_id").unwrap_or_default(),
        distance_m: row.to_value("distance_m").unwrap_or(0.0),
        score,
        level: row
            .to_value::<String>("level")
            .unwrap_or_default()
            .parse()
            .unwrap_or_else(|_| RiskLevel::from_score(score)),
        factors,
        created_at: row_timestamp(row, "created_at"),
        acknowledged_by: row.to_value("acknowledged_by").unwrap_or(None),
        acknowledged_at: row_opt_timestamp(row, "acknowledged_at"),
        dismissed: row_bool(row, "dismissed"),
        dismissed_reason: row.to_value("dismissed_reason").unwrap_or(None),
    })
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use georisk_monitor_models::{NewRun, RunTrigger};
    use georisk_risk_models::LandCoverClass;

    use super::*;
    use crate::areas::{delete_area, upsert_area};
    use crate::runs::claim_run;
    use crate::test_support::{TempStore, area};

    fn polygon(id: &str, run_id: &str) -> ChangePolygonRecord {
        ChangePolygonRecord {
            id: id.to_string(),
            run_id: run_id.to_string(),
            geometry_geojson: r#"{"type":"Polygon","coordinates":[[[10,45],[10.001,45],[10.001,45.001],[10,45]]]}"#
                .to_string(),
            area_m2: 4_200.0,
            mean_ndvi_delta: -0.42,
            max_ndvi_delta: -0.7,
            change_type: ChangeType::VegetationLoss,
            mean_slope_degrees: Some(12.5),
            mean_aspect_degrees: None,
            mean_elevation_m: None,
            land_cover: Some(LandCoverClass::Forest),
            ml_confidence: None,
            ml_model_version: None,
        }
    }

    fn asset(id: &str) -> Asset {
        Asset {
            id: id.to_string(),
            name: format!("Tower {id}"),
            asset_type: AssetType::SupportStructure,
            criticality: AssetCriticality::High,
            longitude: 10.002,
            latitude: 45.0,
            elevation_m: Some(310.0),
        }
    }

    fn event(id: &str, polygon_id: &str, asset_id: &str, score: u8) -> RiskEvent {
        RiskEvent {
            id: id.to_string(),
            change_polygon_id: polygon_id.to_string(),
            asset_id: asset_id.to_string(),
            distance_m: 80.0,
            score,
            level: RiskLevel::from_score(score),
            factors: vec![ScoringFactor::additive(
                "Distance",
                u32::from(score),
                28,
                "DISTANCE_LE_100M",
                "80m from asset",
            )],
            created_at: Utc::now(),
            acknowledged_by: None,
            acknowledged_at: None,
            dismissed: false,
            dismissed_reason: None,
        }
    }

    async fn seeded(store: &TempStore) -> String {
        let db = store.db.as_ref();
        upsert_area(db, &area("x")).await.unwrap();
        let run = claim_run(
            db,
            &NewRun::new(
                "x",
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
                RunTrigger::Manual,
            ),
        )
        .await
        .unwrap()
        .unwrap();
        insert_change_polygon(db, &polygon("p1", &run.id)).await.unwrap();
        upsert_asset(db, &asset("t1")).await.unwrap();
        upsert_asset(db, &asset("t2")).await.unwrap();
        run.id
    }

    #[tokio::test]
    async fn polygons_roundtrip_with_taxonomy() {
        let store = TempStore::new("detections_polygons").await;
        let run_id = seeded(&store).await;

        let polygons = list_change_polygons(store.db.as_ref(), &run_id).await.unwrap();
        assert_eq!(polygons, vec![polygon("p1", &run_id)]);
    }

    #[tokio::test]
    async fn events_are_written_once_per_pair() {
        let store = TempStore::new("detections_events").await;
        let db = store.db.as_ref();
        let run_id = seeded(&store).await;

        assert!(insert_risk_event(db, &event("e1", "p1", "t1", 20)).await.unwrap());
        assert!(!insert_risk_event(db, &event("e2", "p1", "t1", 25)).await.unwrap());
        assert!(insert_risk_event(db, &event("e3", "p1", "t2", 27)).await.unwrap());

        let events = list_risk_events_for_run(db, &run_id, false).await.unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["e3", "e1"]);
        assert_eq!(events[1].factors, event("e1", "p1", "t1", 20).factors);
    }

    #[tokio::test]
    async fn acknowledge_and_dismiss() {
        let store = TempStore::new("detections_ack").await;
        let db = store.db.as_ref();
        let run_id = seeded(&store).await;
        insert_risk_event(db, &event("e1", "p1", "t1", 20)).await.unwrap();

        assert!(acknowledge_risk_event(db, "e1", "ops@example.com", Utc::now()).await.unwrap());
        assert!(dismiss_risk_event(db, "e1", Some("vegetation management")).await.unwrap());
        assert!(!dismiss_risk_event(db, "missing", None).await.unwrap());

        let loaded = get_risk_event(db, "e1").await.unwrap().unwrap();
        assert_eq!(loaded.acknowledged_by.as_deref(), Some("ops@example.com"));
        assert!(loaded.acknowledged_at.is_some());
        assert!(loaded.dismissed);

        assert!(list_risk_events_for_run(db, &run_id, false).await.unwrap().is_empty());
        assert_eq!(list_risk_events_for_run(db, &run_id, true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_area_cascades_to_events() {
        let store = TempStore::new("detections_cascade").await;
        let db = store.db.as_ref();
        let run_id = seeded(&store).await;
        insert_risk_event(db, &event("e1", "p1", "t1", 20)).await.unwrap();

        assert!(delete_area(db, "x").await.unwrap());
        assert!(get_risk_event(db, "e1").await.unwrap().is_none());
        assert!(list_change_polygons(db, &run_id).await.unwrap().is_empty());
        assert_eq!(list_assets(db, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn assets_filter_by_bbox() {
        let store = TempStore::new("detections_assets").await;
        let db = store.db.as_ref();
        seeded(&store).await;

        let mut far = asset("far");
        far.longitude = 12.0;
        upsert_asset(db, &far).await.unwrap();

        let inside = list_assets(db, Some((9.9, 44.9, 10.1, 45.1))).await.unwrap();
        assert_eq!(inside.len(), 2);
        assert_eq!(inside[0].criticality, AssetCriticality::High);
        assert_eq!(list_assets(db, None).await.unwrap().len(), 3);
    }
}
