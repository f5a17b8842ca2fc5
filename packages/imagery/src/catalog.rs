//! Catalog-backed imagery check with new-scene selection.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use geo::BoundingRect;
use georisk_database as db;
use georisk_monitor_models::{ImageryCheckResult, MonitoredArea, ProcessingRun};
use serde::{Deserialize, Serialize};
use switchy_database::Database;

use crate::{ImageryCheck, ProtocolError};

/// Search window used when an area has no completed run.
pub const DEFAULT_SEARCH_DAYS: u64 = 30;

/// A scene known to the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    #[serde(alias = "id")]
    pub scene_id: String,
    pub datetime: DateTime<Utc>,
    #[serde(default)]
    pub cloud_cover: f64,
    /// `[min_lon, min_lat, max_lon, max_lat]`. A scene without a footprint
    /// matches every query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
}

impl Scene {
    #[must_use]
    pub fn date(&self) -> NaiveDate {
        self.datetime.date_naive()
    }

    fn intersects(&self, bbox: [f64; 4]) -> bool {
        self.bbox.is_none_or(|[min_x, min_y, max_x, max_y]| {
            min_x <= bbox[2] && max_x >= bbox[0] && min_y <= bbox[3] && max_y >= bbox[1]
        })
    }
}

/// A catalog search.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneQuery {
    pub bbox: [f64; 4],
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub max_cloud_cover: f64,
}

impl SceneQuery {
    #[must_use]
    pub fn matches(&self, scene: &Scene) -> bool {
        let date = scene.date();
        date >= self.start
            && date <= self.end
            && scene.cloud_cover <= self.max_cloud_cover
            && scene.intersects(self.bbox)
    }
}

/// Source of candidate scenes.
#[async_trait]
pub trait SceneCatalog: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ProtocolError::Catalog`] if the catalog cannot be searched.
    async fn search(&self, query: &SceneQuery) -> Result<Vec<Scene>, ProtocolError>;
}

/// A catalog stored as a JSON array of [`Scene`]s.
#[derive(Debug, Clone)]
pub struct JsonSceneCatalog {
    path: PathBuf,
}

impl JsonSceneCatalog {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SceneCatalog for JsonSceneCatalog {
    async fn search(&self, query: &SceneQuery) -> Result<Vec<Scene>, ProtocolError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Scene catalog {} does not exist", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let scenes: Vec<Scene> = serde_json::from_str(&contents).map_err(|e| {
            ProtocolError::Catalog(format!("{}: {e}", self.path.display()))
        })?;

        Ok(scenes.into_iter().filter(|s| query.matches(s)).collect())
    }
}

/// Picks the newest scene that is clear enough and not already processed.
#[must_use]
pub fn select_new_scene<'a>(
    scenes: &'a [Scene],
    max_cloud_cover: f64,
    processed_scene_ids: &[&str],
) -> Option<&'a Scene> {
    scenes
        .iter()
        .filter(|s| s.cloud_cover <= max_cloud_cover)
        .filter(|s| !processed_scene_ids.contains(&s.scene_id.as_str()))
        .max_by_key(|s| s.datetime)
}

/// Imagery check that searches a [`SceneCatalog`] directly.
///
/// The search window starts the day after the last completed run's
/// after-date, or [`DEFAULT_SEARCH_DAYS`] back when there is none. Scenes
/// the last completed run already compared are skipped.
pub struct CatalogImageryCheck<C: SceneCatalog> {
    db: Arc<dyn Database>,
    catalog: C,
    since: Option<NaiveDate>,
}

impl<C: SceneCatalog> CatalogImageryCheck<C> {
    #[must_use]
    pub fn new(db: Arc<dyn Database>, catalog: C) -> Self {
        Self {
            db,
            catalog,
            since: None,
        }
    }

    /// Searches from a fixed date instead of the last completed run. The
    /// run history is then not consulted at all.
    #[must_use]
    pub fn with_since(mut self, since: Option<NaiveDate>) -> Self {
        self.since = since;
        self
    }

    /// Runs the check as of `today`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the area has no boundary, the run
    /// history cannot be read or the catalog search fails.
    pub async fn check_as_of(
        &self,
        area: &MonitoredArea,
        max_cloud_cover: f64,
        today: NaiveDate,
    ) -> Result<ImageryCheckResult, ProtocolError> {
        let rect = area
            .boundary()
            .and_then(|polygon| polygon.bounding_rect())
            .ok_or_else(|| ProtocolError::InvalidArea(area.id.clone()))?;

        let last_run = match self.since {
            Some(_) => None,
            None => db::latest_completed_run(self.db.as_ref(), &area.id).await?,
        };

        let start = self
            .since
            .or_else(|| {
                last_run
                    .as_ref()
                    .and_then(|r| r.after_date.checked_add_days(Days::new(1)))
            })
            .or_else(|| today.checked_sub_days(Days::new(DEFAULT_SEARCH_DAYS)))
            .unwrap_or(today);

        let query = SceneQuery {
            bbox: [rect.min().x, rect.min().y, rect.max().x, rect.max().y],
            start,
            end: today,
            max_cloud_cover,
        };
        let scenes = self.catalog.search(&query).await?;
        log::debug!(
            "Area {}: {} candidate scenes between {start} and {today}",
            area.id,
            scenes.len()
        );

        let processed = processed_scene_ids(last_run.as_ref());
        let Some(scene) = select_new_scene(&scenes, max_cloud_cover, &processed) else {
            log::info!("Area {}: no new imagery since {start}", area.id);
            return Ok(ImageryCheckResult::no_new_data());
        };

        let scene_date = scene.date();
        let before = last_run.as_ref().map_or_else(
            || {
                scene_date
                    .checked_sub_days(Days::new(u64::from(area.lookback_days)))
                    .unwrap_or(scene_date)
            },
            |r| r.after_date,
        );

        log::info!(
            "Area {}: new scene {} from {scene_date} ({:.1}% cloud)",
            area.id,
            scene.scene_id,
            scene.cloud_cover
        );

        Ok(ImageryCheckResult {
            new_data: true,
            scene_id: Some(scene.scene_id.clone()),
            scene_date: Some(scene_date),
            cloud_cover: Some(scene.cloud_cover),
            recommended_before_date: Some(before),
            recommended_after_date: Some(scene_date),
        })
    }
}

#[async_trait]
impl<C: SceneCatalog> ImageryCheck for CatalogImageryCheck<C> {
    async fn check(
        &self,
        area: &MonitoredArea,
        max_cloud_cover: f64,
    ) -> Result<ImageryCheckResult, ProtocolError> {
        self.check_as_of(area, max_cloud_cover, Utc::now().date_naive())
            .await
    }
}

fn processed_scene_ids(run: Option<&ProcessingRun>) -> Vec<&str> {
    run.map(|r| {
        [r.before_scene_id.as_deref(), r.after_scene_id.as_deref()]
            .into_iter()
            .flatten()
            .collect()
    })
    .unwrap_or_default()
}
