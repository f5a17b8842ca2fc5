//! Change detection collaborator.
//!
//! Pixel-level NDVI differencing, vectorisation and ML inference happen
//! outside this crate. A [`ChangeDetector`] hands back their result as
//! polygons with the attributes the scoring engine consumes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use geo::{Area, Centroid, Coord, MapCoords, Polygon};
use geojson::{Feature, GeoJson};
use georisk_monitor_models::MonitoredArea;
use georisk_risk::ChangeFeatures;
use georisk_risk_models::{ChangeType, LandCoverClass, TaxonomyVersion};
use serde_json::Value;

const METERS_PER_DEGREE_LAT: f64 = 110_540.0;
const METERS_PER_DEGREE_LON_EQUATOR: f64 = 111_320.0;

/// Errors raised while loading detections.
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid GeoJSON in {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// One change polygon as produced by the raster stages.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedChange {
    pub geometry: Polygon<f64>,
    pub area_m2: f64,
    pub mean_ndvi_delta: f64,
    pub max_ndvi_delta: f64,
    pub change_type: ChangeType,
    pub mean_slope_degrees: Option<f64>,
    pub mean_aspect_degrees: Option<f64>,
    pub mean_elevation_m: Option<f64>,
    pub land_cover: Option<LandCoverClass>,
    pub ml_confidence: Option<f64>,
    pub ml_model_version: Option<String>,
}

impl DetectedChange {
    /// The attributes the scoring engine reads.
    #[must_use]
    pub fn features(&self) -> ChangeFeatures {
        ChangeFeatures {
            mean_ndvi_delta: self.mean_ndvi_delta,
            area_m2: self.area_m2,
            change_type: self.change_type,
            mean_slope_degrees: self.mean_slope_degrees,
            aspect_degrees: self.mean_aspect_degrees,
            land_cover: self.land_cover,
            ml_confidence: self.ml_confidence,
        }
    }

    #[must_use]
    pub const fn has_terrain(&self) -> bool {
        self.mean_slope_degrees.is_some() || self.mean_elevation_m.is_some()
    }
}

/// Produces change polygons for an area between two imagery dates.
#[async_trait]
pub trait ChangeDetector: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns [`DetectorError`] if the detections cannot be produced.
    async fn detect(
        &self,
        area: &MonitoredArea,
        before: NaiveDate,
        after: NaiveDate,
    ) -> Result<Vec<DetectedChange>, DetectorError>;
}

/// Reads precomputed detections from `GeoJSON` files.
///
/// Looks for `<dir>/<area_id>/<before>_<after>.geojson` first, then
/// `<dir>/<area_id>.geojson`. No file means no detected change.
#[derive(Debug, Clone)]
pub struct GeoJsonChangeDetector {
    dir: PathBuf,
}

impl GeoJsonChangeDetector {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn candidates(&self, area_id: &str, before: NaiveDate, after: NaiveDate) -> [PathBuf; 2] {
        [
            self.dir.join(area_id).join(format!(
                "{}_{}.geojson",
                before.format("%Y-%m-%d"),
                after.format("%Y-%m-%d")
            )),
            self.dir.join(format!("{area_id}.geojson")),
        ]
    }
}

#[async_trait]
impl ChangeDetector for GeoJsonChangeDetector {
    async fn detect(
        &self,
        area: &MonitoredArea,
        before: NaiveDate,
        after: NaiveDate,
    ) -> Result<Vec<DetectedChange>, DetectorError> {
        for path in self.candidates(&area.id, before, after) {
            match tokio::fs::read_to_string(&path).await {
                Ok(contents) => {
                    let changes = parse_detections(&path, &contents)?;
                    log::info!(
                        "Loaded {} detections for area {} from {}",
                        changes.len(),
                        area.id,
                        path.display()
                    );
                    return Ok(changes);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(DetectorError::Io { path, source }),
            }
        }

        log::info!("No detections on disk for area {}", area.id);
        Ok(Vec::new())
    }
}

/// Parses a `FeatureCollection` (or single feature) of change polygons.
/// Features without a polygon geometry are skipped.
///
/// # Errors
///
/// Returns [`DetectorError::Parse`] if the text is not valid `GeoJSON`.
pub fn parse_detections(path: &Path, contents: &str) -> Result<Vec<DetectedChange>, DetectorError> {
    let geojson: GeoJson = contents.parse().map_err(|e: geojson::Error| DetectorError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let features = match geojson {
        GeoJson::FeatureCollection(collection) => collection.features,
        GeoJson::Feature(feature) => vec![feature],
        GeoJson::Geometry(_) => {
            return Err(DetectorError::Parse {
                path: path.to_path_buf(),
                message: "expected a Feature or FeatureCollection".to_string(),
            });
        }
    };

    Ok(features
        .into_iter()
        .filter_map(|feature| {
            let change = feature_to_change(&feature);
            if change.is_none() {
                log::warn!("Skipping detection without polygon geometry in {}", path.display());
            }
            change
        })
        .collect())
}

fn feature_to_change(feature: &Feature) -> Option<DetectedChange> {
    let geometry: geo::Geometry<f64> = feature.geometry.clone()?.try_into().ok()?;
    let polygon = match geometry {
        geo::Geometry::Polygon(polygon) => polygon,
        geo::Geometry::MultiPolygon(multi) => multi
            .0
            .into_iter()
            .max_by(|a, b| a.unsigned_area().total_cmp(&b.unsigned_area()))?,
        _ => return None,
    };

    let number = |key: &str| feature.property(key).and_then(Value::as_f64);

    let mean_ndvi_delta = number("mean_ndvi_delta").unwrap_or(0.0);
    let max_ndvi_delta = number("max_ndvi_delta").unwrap_or(mean_ndvi_delta);
    let change_type = feature
        .property("change_type")
        .and_then(parse_change_type)
        .unwrap_or_else(|| ChangeType::from_ndvi_delta(mean_ndvi_delta));
    let land_cover = feature
        .property("land_cover")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<LandCoverClass>().ok());

    Some(DetectedChange {
        area_m2: number("area_m2").unwrap_or_else(|| approximate_area_m2(&polygon)),
        geometry: polygon,
        mean_ndvi_delta,
        max_ndvi_delta,
        change_type,
        mean_slope_degrees: number("slope_degrees").or_else(|| number("mean_slope_degrees")),
        mean_aspect_degrees: number("aspect_degrees").or_else(|| number("mean_aspect_degrees")),
        mean_elevation_m: number("elevation_m").or_else(|| number("mean_elevation_m")),
        land_cover,
        ml_confidence: number("ml_confidence"),
        ml_model_version: feature
            .property("ml_model_version")
            .and_then(Value::as_str)
            .map(ToString::to_string),
    })
}

/// Accepts a change type name or a numeric code in the current table.
fn parse_change_type(value: &Value) -> Option<ChangeType> {
    match value {
        Value::String(name) => name.parse().ok(),
        Value::Number(code) => code
            .as_u64()
            .and_then(|c| u8::try_from(c).ok())
            .and_then(|c| ChangeType::from_code(c, TaxonomyVersion::CURRENT).ok()),
        _ => None,
    }
}

/// Planar area in square meters after projecting to a local equirectangular
/// grid centred on the polygon. Good enough for polygons a few km across.
#[must_use]
pub fn approximate_area_m2(polygon: &Polygon<f64>) -> f64 {
    let Some(centroid) = polygon.centroid() else {
        return 0.0;
    };
    let lon_scale = METERS_PER_DEGREE_LON_EQUATOR * centroid.y().to_radians().cos();

    polygon
        .map_coords(|c| Coord {
            x: (c.x - centroid.x()) * lon_scale,
            y: (c.y - centroid.y()) * METERS_PER_DEGREE_LAT,
        })
        .unsigned_area()
}
