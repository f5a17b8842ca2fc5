//! Loading areas and assets from `GeoJSON` files.

use geo::Centroid;
use geojson::{Feature, GeoJson, feature::Id};
use georisk_monitor_models::{
    AreaSchedule, Asset, MonitoredArea, ScheduleUpdate, ValidationError, parse_polygon,
    polygon_to_geojson,
};
use georisk_risk_models::{AssetCriticality, AssetType};
use georisk_scheduler::{ScheduleError, ScheduleExpression};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Invalid GeoJSON: {0}")]
    GeoJson(#[from] geojson::Error),
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("{0}")]
    Invalid(String),
}

/// Command-line settings of an imported area.
#[derive(Debug, Clone, Default)]
pub struct AreaImport {
    pub id: String,
    pub name: Option<String>,
    pub schedule_cron: Option<String>,
    pub max_cloud_cover: Option<f64>,
    pub lookback_days: Option<u32>,
}

/// Builds the area to store from an import request and the boundary file.
///
/// Re-importing an existing area replaces its boundary and any settings
/// given on the command line; everything else (timestamps, unspecified
/// settings) is carried over from `existing`.
pub fn build_area(
    request: &AreaImport,
    boundary_text: &str,
    existing: Option<MonitoredArea>,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<MonitoredArea, ImportError> {
    let polygon = parse_polygon(boundary_text).ok_or_else(|| {
        ImportError::Invalid("Boundary must contain a Polygon or MultiPolygon".to_string())
    })?;

    if let Some(expression) = request.schedule_cron.as_deref().map(str::trim) {
        if !expression.is_empty() {
            ScheduleExpression::parse(expression)?;
        }
    }

    let mut area = existing.unwrap_or_else(|| MonitoredArea {
        id: request.id.clone(),
        name: request.id.clone(),
        boundary_geojson: String::new(),
        schedule_cron: None,
        schedule_enabled: false,
        max_cloud_cover: MonitoredArea::DEFAULT_MAX_CLOUD_COVER,
        lookback_days: MonitoredArea::DEFAULT_LOOKBACK_DAYS,
        last_checked_at: None,
        last_processed_at: None,
        created_at: now,
    });

    let update = ScheduleUpdate {
        schedule_cron: request.schedule_cron.clone(),
        schedule_enabled: request
            .schedule_cron
            .as_deref()
            .map(|s| !s.trim().is_empty()),
        max_cloud_cover: request.max_cloud_cover,
        lookback_days: request.lookback_days,
    };
    let schedule = update.apply_to(&AreaSchedule::from(&area))?;

    if let Some(name) = &request.name {
        area.name.clone_from(name);
    }
    area.boundary_geojson = polygon_to_geojson(&polygon);
    area.schedule_cron = schedule.schedule_cron;
    area.schedule_enabled = schedule.schedule_enabled;
    area.max_cloud_cover = schedule.max_cloud_cover;
    area.lookback_days = schedule.lookback_days;

    Ok(area)
}

/// Parses assets from a `GeoJSON` feature collection.
///
/// Each feature needs an `id` (property or feature id) and an
/// `asset_type`. Non-point geometries are placed at their centroid.
/// Returns the parsed assets and a description of every skipped feature.
pub fn parse_assets(text: &str) -> Result<(Vec<Asset>, Vec<String>), ImportError> {
    let features = match text.parse::<GeoJson>()? {
        GeoJson::FeatureCollection(collection) => collection.features,
        GeoJson::Feature(feature) => vec![feature],
        GeoJson::Geometry(_) => {
            return Err(ImportError::Invalid(
                "Expected a Feature or FeatureCollection, got a bare geometry".to_string(),
            ));
        }
    };

    let mut assets = Vec::with_capacity(features.len());
    let mut skipped = Vec::new();

    for (index, feature) in features.iter().enumerate() {
        match parse_asset(feature) {
            Ok(asset) => assets.push(asset),
            Err(reason) => skipped.push(format!("feature {index}: {reason}")),
        }
    }

    Ok((assets, skipped))
}

fn parse_asset(feature: &Feature) -> Result<Asset, String> {
    let text = |key: &str| {
        feature
            .property(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    let id = text("id")
        .map(String::from)
        .or_else(|| match &feature.id {
            Some(Id::String(id)) => Some(id.clone()),
            Some(Id::Number(id)) => Some(id.to_string()),
            None => None,
        })
        .ok_or("missing id")?;

    let asset_type = text("asset_type").ok_or("missing asset_type")?;
    let asset_type: AssetType = normalize(asset_type)
        .parse()
        .map_err(|_| format!("unknown asset_type '{asset_type}'"))?;

    let criticality = match feature.property("criticality") {
        None | Some(Value::Null) => AssetCriticality::Medium,
        Some(Value::String(name)) => normalize(name)
            .parse()
            .map_err(|_| format!("unknown criticality '{name}'"))?,
        Some(Value::Number(code)) => code
            .as_u64()
            .and_then(|c| u8::try_from(c).ok())
            .and_then(AssetCriticality::from_code)
            .ok_or_else(|| format!("unknown criticality code {code}"))?,
        Some(other) => return Err(format!("invalid criticality {other}")),
    };

    let geometry = feature.geometry.clone().ok_or("missing geometry")?;
    let geometry: geo::Geometry<f64> = geometry
        .try_into()
        .map_err(|e: geojson::Error| format!("invalid geometry: {e}"))?;
    let location = match geometry {
        geo::Geometry::Point(point) => point,
        other => other.centroid().ok_or("empty geometry")?,
    };

    Ok(Asset {
        name: text("name").map_or_else(|| id.clone(), String::from),
        id,
        asset_type,
        criticality,
        longitude: location.x(),
        latitude: location.y(),
        elevation_m: feature.property("elevation_m").and_then(Value::as_f64),
    })
}

/// `"transmission line"` and `"transmission-line"` become
/// `"TRANSMISSION_LINE"`.
fn normalize(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    const SQUARE: &str = r#"{"type":"Polygon","coordinates":[[[-120.0,39.0],[-119.9,39.0],[-119.9,39.1],[-120.0,39.1],[-120.0,39.0]]]}"#;

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn new_area_gets_defaults_and_enabled_schedule() {
        let request = AreaImport {
            id: "tahoe".to_string(),
            schedule_cron: Some("0 6 * * 1".to_string()),
            ..AreaImport::default()
        };

        let area = build_area(&request, SQUARE, None, now()).unwrap();

        assert_eq!(area.name, "tahoe");
        assert_eq!(area.schedule_cron.as_deref(), Some("0 6 * * 1"));
        assert!(area.schedule_enabled);
        assert!((area.max_cloud_cover - MonitoredArea::DEFAULT_MAX_CLOUD_COVER).abs() < f64::EPSILON);
        assert_eq!(area.lookback_days, MonitoredArea::DEFAULT_LOOKBACK_DAYS);
        assert_eq!(area.created_at, now());
        assert!(area.boundary().is_some());
    }

    #[test]
    fn reimport_keeps_timestamps_and_unspecified_settings() {
        let first = AreaImport {
            id: "tahoe".to_string(),
            name: Some("Lake Tahoe".to_string()),
            schedule_cron: Some("0 6 * * 1".to_string()),
            lookback_days: Some(30),
            ..AreaImport::default()
        };
        let mut existing = build_area(&first, SQUARE, None, now()).unwrap();
        existing.last_checked_at = Some(now());

        let second = AreaImport {
            id: "tahoe".to_string(),
            max_cloud_cover: Some(5.0),
            ..AreaImport::default()
        };
        let later = now() + chrono::Duration::days(3);
        let area = build_area(&second, SQUARE, Some(existing), later).unwrap();

        assert_eq!(area.name, "Lake Tahoe");
        assert_eq!(area.lookback_days, 30);
        assert!((area.max_cloud_cover - 5.0).abs() < f64::EPSILON);
        assert!(area.schedule_enabled);
        assert_eq!(area.created_at, now());
        assert_eq!(area.last_checked_at, Some(now()));
    }

    #[test]
    fn rejects_bad_boundary_and_schedule() {
        let request = AreaImport {
            id: "a".to_string(),
            ..AreaImport::default()
        };
        let line = r#"{"type":"LineString","coordinates":[[0.0,0.0],[1.0,1.0]]}"#;
        assert!(matches!(
            build_area(&request, line, None, now()),
            Err(ImportError::Invalid(_))
        ));

        let request = AreaImport {
            id: "a".to_string(),
            schedule_cron: Some("every tuesday".to_string()),
            ..AreaImport::default()
        };
        assert!(matches!(
            build_area(&request, SQUARE, None, now()),
            Err(ImportError::Schedule(_))
        ));

        let request = AreaImport {
            id: "a".to_string(),
            max_cloud_cover: Some(120.0),
            ..AreaImport::default()
        };
        assert!(matches!(
            build_area(&request, SQUARE, None, now()),
            Err(ImportError::Validation(ValidationError::CloudCover(_)))
        ));
    }

    #[test]
    fn parses_assets_and_reports_skipped_features() {
        let text = r#"{
          "type": "FeatureCollection",
          "features": [
            {"type": "Feature", "id": "sub-1",
             "geometry": {"type": "Point", "coordinates": [-120.01, 39.02]},
             "properties": {"name": "North Substation", "asset_type": "substation",
                            "criticality": "critical", "elevation_m": 1920.5}},
            {"type": "Feature",
             "geometry": {"type": "LineString", "coordinates": [[-120.0, 39.0], [-119.9, 39.0]]},
             "properties": {"id": "line-7", "asset_type": "transmission line", "criticality": 2}},
            {"type": "Feature",
             "geometry": {"type": "Point", "coordinates": [-120.0, 39.0]},
             "properties": {"id": "x", "asset_type": "windmill"}},
            {"type": "Feature",
             "geometry": {"type": "Point", "coordinates": [-120.0, 39.0]},
             "properties": {"asset_type": "building"}}
          ]
        }"#;

        let (assets, skipped) = parse_assets(text).unwrap();

        assert_eq!(assets.len(), 2);
        assert_eq!(assets[0].id, "sub-1");
        assert_eq!(assets[0].name, "North Substation");
        assert_eq!(assets[0].asset_type, AssetType::Substation);
        assert_eq!(assets[0].criticality, AssetCriticality::Critical);
        assert_eq!(assets[0].elevation_m, Some(1920.5));

        assert_eq!(assets[1].id, "line-7");
        assert_eq!(assets[1].name, "line-7");
        assert_eq!(assets[1].asset_type, AssetType::TransmissionLine);
        assert_eq!(assets[1].criticality, AssetCriticality::High);
        assert!((assets[1].longitude - -119.95).abs() < 1e-9);
        assert!((assets[1].latitude - 39.0).abs() < 1e-9);

        assert_eq!(skipped.len(), 2);
        assert!(skipped[0].contains("windmill"));
        assert!(skipped[1].contains("missing id"));
    }

    #[test]
    fn bare_geometry_is_not_an_asset_file() {
        assert!(matches!(
            parse_assets(SQUARE),
            Err(ImportError::Invalid(_))
        ));
    }
}
