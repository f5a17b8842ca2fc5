#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Shared types for area monitoring.
//!
//! A [`MonitoredArea`] owns [`ProcessingRun`]s, a run owns the
//! [`ChangePolygonRecord`]s it detected, and each polygon is scored against
//! nearby [`Asset`]s into [`RiskEvent`]s.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use georisk_risk_models::{
    AssetCriticality, AssetType, ChangeType, LandCoverClass, RiskLevel, ScoringFactor,
};
use serde::{Deserialize, Serialize};

/// Inclusive bounds of an area's maximum cloud cover percentage.
pub const CLOUD_COVER_RANGE: std::ops::RangeInclusive<f64> = 0.0..=100.0;

/// Inclusive bounds of an area's default lookback window.
pub const LOOKBACK_DAYS_RANGE: std::ops::RangeInclusive<u32> = 1..=400;

/// Validation failures at the configuration boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("max_cloud_cover must be between 0 and 100, got {0}")]
    CloudCover(String),
    #[error("lookback_days must be between 1 and 400, got {0}")]
    LookbackDays(u32),
    #[error("Cannot enable a schedule without a schedule expression")]
    EnabledWithoutSchedule,
    #[error("before_date {before} must be earlier than after_date {after}")]
    DateRange { before: NaiveDate, after: NaiveDate },
    #[error("Invalid schedule expression '{expression}': {message}")]
    Schedule { expression: String, message: String },
    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Lifecycle state of a processing run.
///
/// States only move forward. `Failed` is reachable from every non-terminal
/// state; `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    FetchingImagery,
    CalculatingNdvi,
    DetectingChanges,
    ScoringRisk,
    Completed,
    Failed,
}

impl RunStatus {
    /// Returns all variants of this enum, in lifecycle order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Pending,
            Self::FetchingImagery,
            Self::CalculatingNdvi,
            Self::DetectingChanges,
            Self::ScoringRisk,
            Self::Completed,
            Self::Failed,
        ]
    }

    /// Statuses of a run that is still in flight.
    #[must_use]
    pub const fn active() -> &'static [Self] {
        &[
            Self::Pending,
            Self::FetchingImagery,
            Self::CalculatingNdvi,
            Self::DetectingChanges,
            Self::ScoringRisk,
        ]
    }

    /// Returns the stored string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::FetchingImagery => "FETCHING_IMAGERY",
            Self::CalculatingNdvi => "CALCULATING_NDVI",
            Self::DetectingChanges => "DETECTING_CHANGES",
            Self::ScoringRisk => "SCORING_RISK",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Legacy numeric status code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::FetchingImagery => 1,
            Self::CalculatingNdvi => 2,
            Self::DetectingChanges => 3,
            Self::ScoringRisk => 4,
            Self::Completed => 5,
            Self::Failed => 6,
        }
    }

    /// Decodes a legacy numeric status code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Pending),
            1 => Some(Self::FetchingImagery),
            2 => Some(Self::CalculatingNdvi),
            3 => Some(Self::DetectingChanges),
            4 => Some(Self::ScoringRisk),
            5 => Some(Self::Completed),
            6 => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a run in this status may move to `next`.
    ///
    /// Non-terminal runs may stay put, move forward (skipping stages is
    /// allowed) or fail. Terminal runs never move.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(next, Self::Failed) || next.code() >= self.code()
    }

    /// Statuses from which a run may move to `next`.
    #[must_use]
    pub fn predecessors(next: Self) -> Vec<Self> {
        Self::all()
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for RunStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::all()
            .iter()
            .copied()
            .find(|s| s.as_str() == value)
            .ok_or_else(|| format!("unknown RunStatus: {value}"))
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

/// What caused a run to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    /// Created by the scheduling guard after an imagery check.
    Scheduled,
    /// Created by an explicit request.
    Manual,
}

impl RunTrigger {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Areas
// ---------------------------------------------------------------------------

/// A named region under continuous change monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredArea {
    pub id: String,
    pub name: String,
    /// Boundary polygon as a `GeoJSON` geometry string.
    pub boundary_geojson: String,
    pub schedule_cron: Option<String>,
    pub schedule_enabled: bool,
    pub max_cloud_cover: f64,
    pub lookback_days: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MonitoredArea {
    pub const DEFAULT_MAX_CLOUD_COVER: f64 = 20.0;
    pub const DEFAULT_LOOKBACK_DAYS: u32 = 90;

    /// The schedule expression the area should be ticked on, if any.
    ///
    /// A blank expression means "not scheduled" whatever the enabled flag
    /// says.
    #[must_use]
    pub fn active_schedule(&self) -> Option<&str> {
        if !self.schedule_enabled {
            return None;
        }
        self.schedule_cron
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Parses the boundary into a polygon. Multi-polygons yield their
    /// largest member.
    #[must_use]
    pub fn boundary(&self) -> Option<geo::Polygon<f64>> {
        parse_polygon(&self.boundary_geojson)
    }
}

/// Schedule settings of an area after applying a [`ScheduleUpdate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaSchedule {
    pub schedule_cron: Option<String>,
    pub schedule_enabled: bool,
    pub max_cloud_cover: f64,
    pub lookback_days: u32,
}

impl From<&MonitoredArea> for AreaSchedule {
    fn from(area: &MonitoredArea) -> Self {
        Self {
            schedule_cron: area.schedule_cron.clone(),
            schedule_enabled: area.schedule_enabled,
            max_cloud_cover: area.max_cloud_cover,
            lookback_days: area.lookback_days,
        }
    }
}

/// Partial update of an area's schedule settings. Absent fields keep
/// their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleUpdate {
    /// A blank string clears the schedule.
    pub schedule_cron: Option<String>,
    pub schedule_enabled: Option<bool>,
    pub max_cloud_cover: Option<f64>,
    pub lookback_days: Option<u32>,
}

impl ScheduleUpdate {
    /// Merges this update into `current`, normalising a blank expression
    /// to "unscheduled" and validating ranges.
    ///
    /// Clearing the expression also clears the enabled flag. Expression
    /// syntax is checked by the scheduler, not here.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if a threshold is out of range or the
    /// result would be enabled without an expression.
    pub fn apply_to(&self, current: &AreaSchedule) -> Result<AreaSchedule, ValidationError> {
        let mut next = current.clone();

        if let Some(cron) = &self.schedule_cron {
            let trimmed = cron.trim();
            if trimmed.is_empty() {
                next.schedule_cron = None;
                next.schedule_enabled = false;
            } else {
                next.schedule_cron = Some(trimmed.to_string());
            }
        }
        if let Some(enabled) = self.schedule_enabled {
            next.schedule_enabled = enabled;
        }
        if let Some(cloud) = self.max_cloud_cover {
            if !cloud.is_finite() || !CLOUD_COVER_RANGE.contains(&cloud) {
                return Err(ValidationError::CloudCover(cloud.to_string()));
            }
            next.max_cloud_cover = cloud;
        }
        if let Some(days) = self.lookback_days {
            if !LOOKBACK_DAYS_RANGE.contains(&days) {
                return Err(ValidationError::LookbackDays(days));
            }
            next.lookback_days = days;
        }

        let has_expression = next
            .schedule_cron
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
        if next.schedule_enabled && !has_expression {
            if self.schedule_enabled == Some(true) {
                return Err(ValidationError::EnabledWithoutSchedule);
            }
            next.schedule_enabled = false;
        }

        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Well-known keys of [`ProcessingRun::metadata`].
pub mod metadata_keys {
    pub const TRIGGER: &str = "trigger";
    pub const SCENE_ID: &str = "scene_id";
    pub const SCENE_DATE: &str = "scene_date";
    pub const CLOUD_COVER: &str = "cloud_cover";
    pub const EXIT_CODE: &str = "exit_code";
    pub const POLYGON_COUNT: &str = "polygon_count";
    pub const RISK_EVENT_COUNT: &str = "risk_event_count";
    pub const HAS_TERRAIN: &str = "has_terrain";
    pub const HAS_LAND_COVER: &str = "has_land_cover";
    pub const MODEL_VERSION: &str = "model_version";
}

pub type RunMetadata = serde_json::Map<String, serde_json::Value>;

/// One imagery comparison of an area between two dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingRun {
    pub id: String,
    pub area_id: String,
    pub status: RunStatus,
    pub before_date: NaiveDate,
    pub after_date: NaiveDate,
    pub before_scene_id: Option<String>,
    pub after_scene_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub metadata: RunMetadata,
    pub created_at: DateTime<Utc>,
}

impl ProcessingRun {
    /// How the run was created, from its metadata.
    #[must_use]
    pub fn trigger(&self) -> Option<RunTrigger> {
        match self.metadata.get(metadata_keys::TRIGGER)?.as_str()? {
            "scheduled" => Some(RunTrigger::Scheduled),
            "manual" => Some(RunTrigger::Manual),
            _ => None,
        }
    }
}

/// A run about to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub area_id: String,
    pub before_date: NaiveDate,
    pub after_date: NaiveDate,
    pub before_scene_id: Option<String>,
    pub after_scene_id: Option<String>,
    pub metadata: RunMetadata,
}

impl NewRun {
    /// Creates a run request with trigger provenance recorded in metadata.
    #[must_use]
    pub fn new(
        area_id: impl Into<String>,
        before_date: NaiveDate,
        after_date: NaiveDate,
        trigger: RunTrigger,
    ) -> Self {
        let mut metadata = RunMetadata::new();
        metadata.insert(
            metadata_keys::TRIGGER.to_string(),
            serde_json::Value::String(trigger.as_str().to_string()),
        );
        Self {
            area_id: area_id.into(),
            before_date,
            after_date,
            before_scene_id: None,
            after_scene_id: None,
            metadata,
        }
    }

    /// # Errors
    ///
    /// Returns [`ValidationError::DateRange`] unless `before_date` is
    /// strictly earlier than `after_date`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.before_date >= self.after_date {
            return Err(ValidationError::DateRange {
                before: self.before_date,
                after: self.after_date,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Detections
// ---------------------------------------------------------------------------

/// A detected land-surface change, owned by its run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePolygonRecord {
    pub id: String,
    pub run_id: String,
    pub geometry_geojson: String,
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

/// An infrastructure asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    pub name: String,
    pub asset_type: AssetType,
    pub criticality: AssetCriticality,
    pub longitude: f64,
    pub latitude: f64,
    pub elevation_m: Option<f64>,
}

/// The scored impact of one change polygon on one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskEvent {
    pub id: String,
    pub change_polygon_id: String,
    pub asset_id: String,
    pub distance_m: f64,
    pub score: u8,
    pub level: RiskLevel,
    pub factors: Vec<ScoringFactor>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub dismissed: bool,
    pub dismissed_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Imagery check
// ---------------------------------------------------------------------------

/// Answer to "is there new acceptable imagery for this area?".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageryCheckResult {
    pub new_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_cover: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_before_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_after_date: Option<NaiveDate>,
}

impl ImageryCheckResult {
    /// The "no new data" answer.
    #[must_use]
    pub fn no_new_data() -> Self {
        Self::default()
    }

    /// Checks that a positive answer carries both recommended dates.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Other`] if `new_data` is set without both
    /// recommended dates.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.new_data
            && (self.recommended_before_date.is_none() || self.recommended_after_date.is_none())
        {
            return Err(ValidationError::Other(
                "new_data is true but recommended_before_date/recommended_after_date are missing"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// The date the discovered scene was captured, falling back to the
    /// recommended after-date.
    #[must_use]
    pub fn discovered_date(&self) -> Option<NaiveDate> {
        self.scene_date.or(self.recommended_after_date)
    }
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Parses a `GeoJSON` geometry, feature or feature collection into a single
/// polygon. Multi-polygons and collections yield their largest polygon.
#[must_use]
pub fn parse_polygon(geojson_str: &str) -> Option<geo::Polygon<f64>> {
    use geo::Area;
    use geojson::GeoJson;

    let geometry = match geojson_str.parse::<GeoJson>().ok()? {
        GeoJson::Geometry(geometry) => geometry,
        GeoJson::Feature(feature) => feature.geometry?,
        GeoJson::FeatureCollection(collection) => {
            collection.features.into_iter().find_map(|f| f.geometry)?
        }
    };

    let geometry: geo::Geometry<f64> = geometry.try_into().ok()?;
    match geometry {
        geo::Geometry::Polygon(polygon) => Some(polygon),
        geo::Geometry::MultiPolygon(multi) => multi
            .0
            .into_iter()
            .max_by(|a, b| a.unsigned_area().total_cmp(&b.unsigned_area())),
        _ => None,
    }
}

/// Serialises a polygon as a `GeoJSON` geometry string.
#[must_use]
pub fn polygon_to_geojson(polygon: &geo::Polygon<f64>) -> String {
    geojson::Geometry::new(geojson::Value::from(polygon)).to_string()
}
