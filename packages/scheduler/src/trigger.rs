//! Recurring trigger adapters.
//!
//! An adapter turns an area's schedule expression into calls of
//! [`TickHandler::on_tick`]. [`CronTriggerAdapter`] does that in-process with
//! one task per area. [`ExternalTriggerAdapter`] leaves firing to the host
//! scheduler and renders the crontab that invokes `georisk tick`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::guard::TickHandler;
use crate::schedule::{ScheduleError, ScheduleExpression};

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// The expression is valid but this adapter cannot fire it.
    #[error("The {adapter} trigger cannot run '{expression}': {reason}")]
    Unsupported {
        adapter: &'static str,
        expression: String,
        reason: String,
    },

    #[error("Trigger adapter is shut down")]
    ShutDown,
}

/// Registers and removes per-area schedules.
///
/// Registering an area that is already registered replaces its schedule.
pub trait TriggerAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Checks whether this adapter can fire `expression`.
    ///
    /// # Errors
    ///
    /// Returns [`TriggerError::Unsupported`] if it cannot.
    fn supports(&self, expression: &ScheduleExpression) -> Result<(), TriggerError>;

    /// # Errors
    ///
    /// Returns [`TriggerError`] if the schedule cannot be registered.
    fn register(&self, area_id: &str, expression: &ScheduleExpression)
    -> Result<(), TriggerError>;

    /// Returns `false` if the area was not registered.
    fn deregister(&self, area_id: &str) -> bool;

    /// Registered area ids with their expressions, ordered by area id.
    fn registered(&self) -> Vec<(String, String)>;
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

struct Job {
    expression: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Fires ticks from tokio tasks, one per registered area.
///
/// A job waits for its tick to finish before computing the next fire time,
/// so fires that fall inside a running tick are dropped rather than
/// queued.
pub struct CronTriggerAdapter {
    handler: Arc<dyn TickHandler>,
    shutdown: CancellationToken,
    jobs: Mutex<BTreeMap<String, Job>>,
}

impl std::fmt::Debug for CronTriggerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronTriggerAdapter")
            .field("registered", &self.registered())
            .finish_non_exhaustive()
    }
}

impl CronTriggerAdapter {
    /// Must be created inside a tokio runtime; jobs are spawned on it.
    #[must_use]
    pub fn new(handler: Arc<dyn TickHandler>, shutdown: CancellationToken) -> Self {
        Self {
            handler,
            shutdown,
            jobs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Cancels every job and waits for running ticks to return.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let jobs = std::mem::take(&mut *self.jobs.lock().unwrap_or_else(PoisonError::into_inner));
        for (area_id, job) in jobs {
            if let Err(e) = job.handle.await {
                log::error!("Schedule task for area {area_id} panicked: {e}");
            }
        }
    }
}

impl TriggerAdapter for CronTriggerAdapter {
    fn name(&self) -> &'static str {
        "in_process"
    }

    fn supports(&self, expression: &ScheduleExpression) -> Result<(), TriggerError> {
        if expression.next_after(Utc::now()).is_none() {
            return Err(TriggerError::Unsupported {
                adapter: self.name(),
                expression: expression.to_string(),
                reason: "the expression never fires again".to_string(),
            });
        }
        Ok(())
    }

    fn register(
        &self,
        area_id: &str,
        expression: &ScheduleExpression,
    ) -> Result<(), TriggerError> {
        if self.shutdown.is_cancelled() {
            return Err(TriggerError::ShutDown);
        }
        self.supports(expression)?;

        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs
            .get(area_id)
            .is_some_and(|job| job.expression == expression.as_str() && !job.handle.is_finished())
        {
            return Ok(());
        }

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(run_job(
            self.handler.clone(),
            area_id.to_string(),
            expression.clone(),
            cancel.clone(),
        ));
        let job = Job {
            expression: expression.as_str().to_string(),
            cancel,
            handle,
        };
        if let Some(previous) = jobs.insert(area_id.to_string(), job) {
            previous.cancel.cancel();
        }

        log::info!("Registered schedule '{expression}' for area {area_id}");
        Ok(())
    }

    fn deregister(&self, area_id: &str) -> bool {
        let removed = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(area_id);
        removed.is_some_and(|job| {
            job.cancel.cancel();
            log::info!("Deregistered schedule for area {area_id}");
            true
        })
    }

    fn registered(&self) -> Vec<(String, String)> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, job)| (id.clone(), job.expression.clone()))
            .collect()
    }
}

async fn run_job(
    handler: Arc<dyn TickHandler>,
    area_id: String,
    expression: ScheduleExpression,
    cancel: CancellationToken,
) {
    loop {
        let now = Utc::now();
        let Some(next) = expression.next_after(now) else {
            log::info!("Schedule '{expression}' for area {area_id} has no further fire times");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(wait) => {}
        }

        // A started tick always runs to the end so a claimed run is launched.
        let outcome = handler.on_tick(&area_id).await;
        log::debug!("Scheduled tick for area {area_id}: {outcome:?}");
    }
}

// ---------------------------------------------------------------------------
// External
// ---------------------------------------------------------------------------

/// Keeps the schedule table for a host scheduler such as cron.
///
/// Each entry fires `<program> tick --area-id <id>`, so expressions must
/// be expressible in five-field crontab form.
#[derive(Debug)]
pub struct ExternalTriggerAdapter {
    command: String,
    entries: Mutex<BTreeMap<String, String>>,
}

impl ExternalTriggerAdapter {
    /// `command` is the command line that starts the binary, including
    /// any global options such as `--config`.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Renders the registered schedules as a crontab.
    #[must_use]
    pub fn render_crontab(&self) -> String {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::from("# georisk monitored area schedules (times are UTC)\n");
        for (area_id, schedule) in entries.iter() {
            let _ = writeln!(
                out,
                "{schedule} {} tick --area-id {}",
                self.command,
                shell_quote(area_id)
            );
        }
        out
    }
}

impl TriggerAdapter for ExternalTriggerAdapter {
    fn name(&self) -> &'static str {
        "external"
    }

    fn supports(&self, expression: &ScheduleExpression) -> Result<(), TriggerError> {
        expression
            .to_crontab()
            .map(|_| ())
            .ok_or_else(|| TriggerError::Unsupported {
                adapter: self.name(),
                expression: expression.to_string(),
                reason: "crontab needs a seconds field of 0 and no year".to_string(),
            })
    }

    fn register(
        &self,
        area_id: &str,
        expression: &ScheduleExpression,
    ) -> Result<(), TriggerError> {
        let line = expression
            .to_crontab()
            .ok_or_else(|| TriggerError::Unsupported {
                adapter: self.name(),
                expression: expression.to_string(),
                reason: "crontab needs a seconds field of 0 and no year".to_string(),
            })?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(area_id.to_string(), line);
        Ok(())
    }

    fn deregister(&self, area_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(area_id)
            .is_some()
    }

    fn registered(&self) -> Vec<(String, String)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, line)| (id.clone(), line.clone()))
            .collect()
    }
}

/// Quotes `value` for a POSIX shell when it contains anything beyond
/// `[A-Za-z0-9._-]`.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
