//! The in-process scoring pipeline.
//!
//! Picks up a run the state machine has moved to `FETCHING_IMAGERY` and
//! drives it through `CALCULATING_NDVI`, `DETECTING_CHANGES` and
//! `SCORING_RISK` to `COMPLETED`, persisting change polygons and one risk
//! event per (polygon, nearby asset) pair.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use geo::{BoundingRect, Point, Rect};
use georisk_database as db;
use georisk_monitor_models::{
    Asset, ChangePolygonRecord, RiskEvent, RunMetadata, RunStatus, metadata_keys,
    polygon_to_geojson,
};
use georisk_risk::{AssetIndex, AssetPoint, RiskScorer, scoring_context, search_bounds};
use serde_json::Value;
use switchy_database::Database;
use tokio_util::sync::CancellationToken;

use crate::{ChangeDetector, DetectedChange, ExecutionRequest, PipelineError, RasterPipeline};

/// Detection, proximity analysis and scoring for one run.
pub struct ScoringPipeline<D: ChangeDetector> {
    db: Arc<dyn Database>,
    detector: D,
    scorer: RiskScorer,
}

impl<D: ChangeDetector> ScoringPipeline<D> {
    #[must_use]
    pub fn new(db: Arc<dyn Database>, detector: D, scorer: RiskScorer) -> Self {
        Self {
            db,
            detector,
            scorer,
        }
    }

    async fn transition(
        &self,
        request: &ExecutionRequest,
        status: RunStatus,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if !db::update_run_status(self.db.as_ref(), &request.run_id, status).await? {
            return Err(PipelineError::TransitionRejected {
                run_id: request.run_id.clone(),
                status: status.to_string(),
            });
        }
        log::info!("Run {} -> {status}", request.run_id);
        Ok(())
    }

    async fn persist_polygons(
        &self,
        run_id: &str,
        changes: &[DetectedChange],
    ) -> Result<Vec<String>, PipelineError> {
        let mut ids = Vec::with_capacity(changes.len());
        for change in changes {
            let record = ChangePolygonRecord {
                id: uuid::Uuid::new_v4().to_string(),
                run_id: run_id.to_string(),
                geometry_geojson: polygon_to_geojson(&change.geometry),
                area_m2: change.area_m2,
                mean_ndvi_delta: change.mean_ndvi_delta,
                max_ndvi_delta: change.max_ndvi_delta,
                change_type: change.change_type,
                mean_slope_degrees: change.mean_slope_degrees,
                mean_aspect_degrees: change.mean_aspect_degrees,
                mean_elevation_m: change.mean_elevation_m,
                land_cover: change.land_cover,
                ml_confidence: change.ml_confidence,
                ml_model_version: change.ml_model_version.clone(),
            };
            db::insert_change_polygon(self.db.as_ref(), &record).await?;
            ids.push(record.id);
        }
        Ok(ids)
    }

    /// Scores every polygon against the assets within the scoring radius
    /// and returns the number of risk events written.
    async fn score_changes(
        &self,
        changes: &[DetectedChange],
        polygon_ids: &[String],
    ) -> Result<usize, PipelineError> {
        let radius_m = self.scorer.config().distance.max_radius_m;
        let Some(extent) = detection_extent(changes) else {
            return Ok(0);
        };
        let bounds = search_bounds(extent, radius_m);

        let assets = db::list_assets(
            self.db.as_ref(),
            Some((bounds.min().x, bounds.min().y, bounds.max().x, bounds.max().y)),
        )
        .await?;
        let index = AssetIndex::new(assets.into_iter().map(asset_point));
        log::debug!("Scoring against {} indexed assets", index.len());

        let mut written = 0;
        for (change, polygon_id) in changes.iter().zip(polygon_ids) {
            let features = change.features();
            for nearby in index.within(&change.geometry, radius_m) {
                let context = scoring_context(&change.geometry, change.mean_elevation_m, &nearby);
                let score = self.scorer.score(
                    &features,
                    nearby.asset.criticality,
                    nearby.distance_m,
                    &context,
                );

                let event = RiskEvent {
                    id: uuid::Uuid::new_v4().to_string(),
                    change_polygon_id: polygon_id.clone(),
                    asset_id: nearby.asset.id.clone(),
                    distance_m: nearby.distance_m,
                    score: score.score,
                    level: score.level,
                    factors: score.factors,
                    created_at: Utc::now(),
                    acknowledged_by: None,
                    acknowledged_at: None,
                    dismissed: false,
                    dismissed_reason: None,
                };

                if db::insert_risk_event(self.db.as_ref(), &event).await? {
                    written += 1;
                } else {
                    log::debug!(
                        "Risk event for polygon {polygon_id} and asset {} already exists",
                        nearby.asset.id
                    );
                }
            }
        }

        Ok(written)
    }
}

#[async_trait]
impl<D: ChangeDetector> RasterPipeline for ScoringPipeline<D> {
    async fn run(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let area = db::get_area(self.db.as_ref(), &request.area_id)
            .await?
            .ok_or_else(|| PipelineError::AreaNotFound(request.area_id.clone()))?;

        self.transition(request, RunStatus::CalculatingNdvi, cancel)
            .await?;
        let changes = self
            .detector
            .detect(&area, request.before_date, request.after_date)
            .await?;

        self.transition(request, RunStatus::DetectingChanges, cancel)
            .await?;
        let polygon_ids = self.persist_polygons(&request.run_id, &changes).await?;
        log::info!(
            "Run {}: {} change polygons",
            request.run_id,
            polygon_ids.len()
        );

        self.transition(request, RunStatus::ScoringRisk, cancel)
            .await?;
        let events = self.score_changes(&changes, &polygon_ids).await?;
        log::info!("Run {}: {events} risk events", request.run_id);

        db::merge_run_metadata(
            self.db.as_ref(),
            &request.run_id,
            &run_summary(&changes, events),
        )
        .await?;

        self.transition(request, RunStatus::Completed, cancel)
            .await?;

        Ok(())
    }
}

fn run_summary(changes: &[DetectedChange], events: usize) -> RunMetadata {
    let mut summary = RunMetadata::new();
    summary.insert(metadata_keys::POLYGON_COUNT.to_string(), changes.len().into());
    summary.insert(metadata_keys::RISK_EVENT_COUNT.to_string(), events.into());
    summary.insert(
        metadata_keys::HAS_TERRAIN.to_string(),
        Value::Bool(changes.iter().any(DetectedChange::has_terrain)),
    );
    summary.insert(
        metadata_keys::HAS_LAND_COVER.to_string(),
        Value::Bool(changes.iter().any(|c| c.land_cover.is_some())),
    );
    if let Some(version) = changes.iter().find_map(|c| c.ml_model_version.as_deref()) {
        summary.insert(
            metadata_keys::MODEL_VERSION.to_string(),
            Value::String(version.to_string()),
        );
    }
    summary
}

fn detection_extent(changes: &[DetectedChange]) -> Option<Rect<f64>> {
    changes
        .iter()
        .filter_map(|c| c.geometry.bounding_rect())
        .reduce(|a, b| {
            Rect::new(
                geo::coord! { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
                geo::coord! { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
            )
        })
}

fn asset_point(asset: Asset) -> AssetPoint {
    AssetPoint {
        location: Point::new(asset.longitude, asset.latitude),
        id: asset.id,
        name: asset.name,
        asset_type: asset.asset_type,
        criticality: asset.criticality,
        elevation_m: asset.elevation_m,
    }
}
