#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! API request and response types for the georisk server.
//!
//! These types are serialized to JSON for the REST API. They are separate
//! from the store's model types so the API contract can evolve on its own.

use chrono::{DateTime, NaiveDate, Utc};
use georisk_monitor_models::{
    MonitoredArea, ProcessingRun, RiskEvent, RunMetadata, RunStatus, RunTrigger, ScheduleUpdate,
};
use georisk_risk_models::{RiskLevel, ScoringFactor};
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHealth {
    /// Whether the service is healthy.
    pub healthy: bool,
    /// Service version.
    pub version: String,
}

/// Error body returned with every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub error: String,
    /// Id of the run that blocked the request, for `409` responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_run_id: Option<String>,
}

impl ApiError {
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            active_run_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Areas
// ---------------------------------------------------------------------------

/// A monitored area as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiArea {
    pub id: String,
    pub name: String,
    /// Boundary as a `GeoJSON` geometry.
    pub boundary: serde_json::Value,
    pub schedule_cron: Option<String>,
    pub schedule_enabled: bool,
    /// Maximum acceptable cloud cover, percent.
    pub max_cloud_cover: f64,
    pub lookback_days: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// The area's non-terminal run, if any.
    pub active_run: Option<ApiRun>,
}

impl ApiArea {
    #[must_use]
    pub fn new(area: MonitoredArea, active_run: Option<ProcessingRun>) -> Self {
        let boundary =
            serde_json::from_str(&area.boundary_geojson).unwrap_or(serde_json::Value::Null);
        Self {
            id: area.id,
            name: area.name,
            boundary,
            schedule_cron: area.schedule_cron,
            schedule_enabled: area.schedule_enabled,
            max_cloud_cover: area.max_cloud_cover,
            lookback_days: area.lookback_days,
            last_checked_at: area.last_checked_at,
            last_processed_at: area.last_processed_at,
            created_at: area.created_at,
            active_run: active_run.map(ApiRun::from),
        }
    }
}

/// Body of `PATCH /api/areas/{id}/schedule`. Absent fields are unchanged;
/// an empty `scheduleCron` clears the schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleUpdateRequest {
    pub schedule_cron: Option<String>,
    pub schedule_enabled: Option<bool>,
    pub max_cloud_cover: Option<f64>,
    pub lookback_days: Option<u32>,
}

impl From<ScheduleUpdateRequest> for ScheduleUpdate {
    fn from(request: ScheduleUpdateRequest) -> Self {
        Self {
            schedule_cron: request.schedule_cron,
            schedule_enabled: request.schedule_enabled,
            max_cloud_cover: request.max_cloud_cover,
            lookback_days: request.lookback_days,
        }
    }
}

/// Result of `POST /api/areas/{id}/check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTickResult {
    /// `triggered`, `skipped`, `no_new_data`, `already_ticking`,
    /// `check_failed` or `timed_out`.
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiTickResult {
    #[must_use]
    pub fn outcome(outcome: &str) -> Self {
        Self {
            outcome: outcome.to_string(),
            run_id: None,
            before_date: None,
            after_date: None,
            message: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// A processing run as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRun {
    pub id: String,
    pub area_id: String,
    pub status: RunStatus,
    pub trigger: Option<RunTrigger>,
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

impl From<ProcessingRun> for ApiRun {
    fn from(run: ProcessingRun) -> Self {
        Self {
            trigger: run.trigger(),
            id: run.id,
            area_id: run.area_id,
            status: run.status,
            before_date: run.before_date,
            after_date: run.after_date,
            before_scene_id: run.before_scene_id,
            after_scene_id: run.after_scene_id,
            started_at: run.started_at,
            completed_at: run.completed_at,
            error_message: run.error_message,
            metadata: run.metadata,
            created_at: run.created_at,
        }
    }
}

/// Body of `POST /api/areas/{id}/runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualRunRequest {
    pub before_date: NaiveDate,
    pub after_date: NaiveDate,
    pub before_scene_id: Option<String>,
    pub after_scene_id: Option<String>,
}

/// Query parameters for run listings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunsQueryParams {
    /// Maximum number of runs, newest first. Defaults to 20.
    pub limit: Option<u32>,
}

// ---------------------------------------------------------------------------
// Risk events
// ---------------------------------------------------------------------------

/// A scored risk event as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRiskEvent {
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

impl From<RiskEvent> for ApiRiskEvent {
    fn from(event: RiskEvent) -> Self {
        Self {
            id: event.id,
            change_polygon_id: event.change_polygon_id,
            asset_id: event.asset_id,
            distance_m: event.distance_m,
            score: event.score,
            level: event.level,
            factors: event.factors,
            created_at: event.created_at,
            acknowledged_by: event.acknowledged_by,
            acknowledged_at: event.acknowledged_at,
            dismissed: event.dismissed,
            dismissed_reason: event.dismissed_reason,
        }
    }
}

/// Query parameters for risk event listings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskEventsQueryParams {
    /// Include dismissed events. Defaults to `false`.
    #[serde(default)]
    pub include_dismissed: bool,
}

/// Body of `POST /api/events/{id}/acknowledge`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgeRequest {
    pub acknowledged_by: String,
}

/// Body of `POST /api/events/{id}/dismiss`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DismissRequest {
    pub reason: Option<String>,
}
