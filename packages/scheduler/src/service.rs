//! Keeps trigger registrations in step with the schedules stored on
//! areas.

use std::collections::BTreeSet;
use std::sync::Arc;

use georisk_database::{self as db, DbError};
use georisk_monitor_models::{AreaSchedule, MonitoredArea, ScheduleUpdate, ValidationError};
use switchy_database::Database;

use crate::schedule::ScheduleExpression;
use crate::trigger::{TriggerAdapter, TriggerError};

/// Errors from [`ScheduleService::apply_update`].
#[derive(Debug, thiserror::Error)]
pub enum ScheduleServiceError {
    #[error("Area {0} not found")]
    AreaNotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Database(#[from] DbError),
}

/// Result of [`sync_schedules`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub registered: Vec<String>,
    pub deregistered: Vec<String>,
    /// Areas whose schedule could not be registered, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Registers every active schedule and removes registrations for areas
/// that no longer have one.
///
/// A schedule that fails to parse or register is logged and reported;
/// the remaining areas are still registered.
///
/// # Errors
///
/// Returns [`DbError`] if the areas cannot be listed.
pub async fn sync_schedules(
    db: &dyn Database,
    adapter: &dyn TriggerAdapter,
) -> Result<SyncReport, DbError> {
    let areas = db::list_areas(db).await?;
    let mut report = SyncReport::default();
    let mut wanted = BTreeSet::new();

    for area in &areas {
        let Some(expression) = area.active_schedule() else {
            continue;
        };
        let registered = ScheduleExpression::parse(expression)
            .map_err(TriggerError::from)
            .and_then(|expr| adapter.register(&area.id, &expr));

        match registered {
            Ok(()) => {
                wanted.insert(area.id.clone());
                report.registered.push(area.id.clone());
            }
            Err(e) => {
                log::error!("Could not register schedule for area {}: {e}", area.id);
                report.failed.push((area.id.clone(), e.to_string()));
            }
        }
    }

    for (area_id, _) in adapter.registered() {
        if !wanted.contains(&area_id) && adapter.deregister(&area_id) {
            report.deregistered.push(area_id);
        }
    }

    log::info!(
        "Schedules synced with the {} trigger: {} registered, {} removed, {} failed",
        adapter.name(),
        report.registered.len(),
        report.deregistered.len(),
        report.failed.len()
    );
    Ok(report)
}

/// The schedule configuration surface of an area.
pub struct ScheduleService {
    db: Arc<dyn Database>,
    adapter: Arc<dyn TriggerAdapter>,
}

impl std::fmt::Debug for ScheduleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleService")
            .field("adapter", &self.adapter.name())
            .finish_non_exhaustive()
    }
}

impl ScheduleService {
    #[must_use]
    pub fn new(db: Arc<dyn Database>, adapter: Arc<dyn TriggerAdapter>) -> Self {
        Self { db, adapter }
    }

    #[must_use]
    pub fn adapter(&self) -> &dyn TriggerAdapter {
        self.adapter.as_ref()
    }

    /// Validates and stores a partial schedule update, then registers or
    /// removes the area's trigger to match.
    ///
    /// Nothing is written when validation fails.
    ///
    /// # Errors
    ///
    /// * [`ScheduleServiceError::AreaNotFound`] if the area does not exist.
    /// * [`ScheduleServiceError::Validation`] for out-of-range thresholds,
    ///   enabling without an expression or a malformed expression.
    /// * [`ScheduleServiceError::Trigger`] if the active adapter cannot
    ///   fire the expression.
    pub async fn apply_update(
        &self,
        area_id: &str,
        update: &ScheduleUpdate,
    ) -> Result<MonitoredArea, ScheduleServiceError> {
        let area = db::get_area(self.db.as_ref(), area_id)
            .await?
            .ok_or_else(|| ScheduleServiceError::AreaNotFound(area_id.to_string()))?;

        let next = update.apply_to(&AreaSchedule::from(&area))?;
        let expression = next
            .schedule_cron
            .as_deref()
            .map(ScheduleExpression::parse)
            .transpose()
            .map_err(ValidationError::from)?;
        if next.schedule_enabled {
            if let Some(expression) = &expression {
                self.adapter.supports(expression)?;
            }
        }

        if !db::update_area_schedule(self.db.as_ref(), area_id, &next).await? {
            return Err(ScheduleServiceError::AreaNotFound(area_id.to_string()));
        }
        let area = db::get_area(self.db.as_ref(), area_id)
            .await?
            .ok_or_else(|| ScheduleServiceError::AreaNotFound(area_id.to_string()))?;

        match expression.filter(|_| area.active_schedule().is_some()) {
            Some(expression) => self.adapter.register(area_id, &expression)?,
            None => {
                if self.adapter.deregister(area_id) {
                    log::info!("Area {area_id} is no longer scheduled");
                }
            }
        }

        Ok(area)
    }
}
