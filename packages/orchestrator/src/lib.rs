#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Processing run state machine.
//!
//! ```text
//! PENDING -> FETCHING_IMAGERY -> CALCULATING_NDVI -> DETECTING_CHANGES
//!         -> SCORING_RISK -> COMPLETED
//!
//! FAILED is reachable from every non-terminal state.
//! ```
//!
//! [`RunStateMachine::execute`] writes `FETCHING_IMAGERY` and hands the run
//! to a [`PipelineExecutor`], which owns every transition after that. Once
//! the executor returns, the state machine makes sure the run ended up in
//! a terminal state, forcing `FAILED` when it did not.

use std::sync::Arc;

use georisk_database::{self as db, DbError};
use georisk_executor::{ExecutionRequest, ExecutorError, ExecutorExit, PipelineExecutor};
use georisk_monitor_models::{ProcessingRun, RunMetadata, RunStatus, metadata_keys};
use switchy_database::Database;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Longest error message stored on a failed run.
const MAX_ERROR_MESSAGE_CHARS: usize = 4_000;

/// Errors returned by [`RunStateMachine`].
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Database(#[from] DbError),

    /// The executor was cancelled. The run is left in whatever state the
    /// executor last wrote.
    #[error("Run {0} cancelled")]
    Cancelled(String),
}

/// How a call to [`RunStateMachine::execute`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// No run with that id exists.
    NotFound,
    /// The run was already terminal, so nothing was executed.
    AlreadyTerminal(RunStatus),
    /// The executor recorded `COMPLETED`.
    Completed,
    /// The run ended `FAILED`, either written by the executor or forced.
    Failed { message: String },
}

/// Drives processing runs through a [`PipelineExecutor`].
#[derive(Clone)]
pub struct RunStateMachine {
    db: Arc<dyn Database>,
    executor: Arc<dyn PipelineExecutor>,
}

impl std::fmt::Debug for RunStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStateMachine").finish_non_exhaustive()
    }
}

impl RunStateMachine {
    #[must_use]
    pub fn new(db: Arc<dyn Database>, executor: Arc<dyn PipelineExecutor>) -> Self {
        Self { db, executor }
    }

    /// Executes one run to a terminal state.
    ///
    /// A missing run is logged and reported as [`RunOutcome::NotFound`].
    ///
    /// # Errors
    ///
    /// * [`RunError::Cancelled`] if `cancel` fired while the executor was
    ///   running. No terminal state is written; see [`Self::fail_run`].
    /// * [`RunError::Database`] if the store could not be read or written.
    pub async fn execute(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let Some(run) = db::get_run(self.db.as_ref(), run_id).await? else {
            log::warn!("Run {run_id} not found, nothing to execute");
            return Ok(RunOutcome::NotFound);
        };

        if run.status.is_terminal() {
            log::info!("Run {run_id} is already {}, skipping", run.status);
            return Ok(RunOutcome::AlreadyTerminal(run.status));
        }

        if !db::update_run_status(self.db.as_ref(), run_id, RunStatus::FetchingImagery).await? {
            return self.current_outcome(run_id).await;
        }
        log::info!(
            "Run {run_id} (area {}) -> {}",
            run.area_id,
            RunStatus::FetchingImagery
        );

        let request = ExecutionRequest {
            area_id: run.area_id.clone(),
            before_date: run.before_date,
            after_date: run.after_date,
            run_id: run.id.clone(),
        };

        match self.executor.execute(&request, cancel).await {
            Ok(exit) if exit.is_success() => self.close_after_success(&run).await,
            Ok(exit) => {
                self.record_exit_code(run_id, exit.code).await;
                self.force_failed(run_id, &failure_message(&exit)).await
            }
            Err(ExecutorError::Cancelled) => {
                log::warn!("Run {run_id} cancelled while executing");
                Err(RunError::Cancelled(run_id.to_string()))
            }
            Err(e) => {
                log::error!("Executor for run {run_id} failed: {e}");
                self.force_failed(run_id, &format!("Executor error: {e}"))
                    .await
            }
        }
    }

    /// Spawns [`Self::execute`] on the runtime. Errors are logged.
    pub fn spawn(&self, run_id: String, cancel: CancellationToken) -> JoinHandle<()> {
        let machine = self.clone();
        tokio::spawn(async move {
            match machine.execute(&run_id, &cancel).await {
                Ok(outcome) => log::debug!("Run {run_id} finished: {outcome:?}"),
                Err(RunError::Cancelled(_)) => {
                    log::warn!("Run {run_id} left unfinished after cancellation");
                }
                Err(e) => log::error!("Run {run_id} could not be executed: {e}"),
            }
        })
    }

    /// Forces an in-flight run to `FAILED`. Returns `false` if the run is
    /// missing or already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Database`] if the store write fails.
    pub async fn fail_run(&self, run_id: &str, message: &str) -> Result<bool, RunError> {
        let failed = db::fail_run(self.db.as_ref(), run_id, &truncate(message)).await?;
        if failed {
            log::warn!("Run {run_id} -> FAILED: {message}");
        }
        Ok(failed)
    }

    /// The executor reported success: trust whatever terminal state it
    /// wrote, and close the run if it wrote none.
    async fn close_after_success(&self, run: &ProcessingRun) -> Result<RunOutcome, RunError> {
        let current = db::get_run(self.db.as_ref(), &run.id).await?;
        match current {
            None => {
                log::warn!("Run {} disappeared while executing", run.id);
                Ok(RunOutcome::NotFound)
            }
            Some(current) if current.status.is_terminal() => {
                log::info!("Run {} finished as {}", run.id, current.status);
                Ok(outcome_of(&current))
            }
            Some(current) => {
                log::error!(
                    "Executor for run {} exited cleanly but left it in {}",
                    run.id,
                    current.status
                );
                self.force_failed(
                    &run.id,
                    &format!(
                        "Executor exited without recording completion (last status {})",
                        current.status
                    ),
                )
                .await
            }
        }
    }

    async fn force_failed(&self, run_id: &str, message: &str) -> Result<RunOutcome, RunError> {
        if self.fail_run(run_id, message).await? {
            return Ok(RunOutcome::Failed {
                message: truncate(message),
            });
        }
        // Someone else closed the run first.
        self.current_outcome(run_id).await
    }

    async fn current_outcome(&self, run_id: &str) -> Result<RunOutcome, RunError> {
        Ok(match db::get_run(self.db.as_ref(), run_id).await? {
            None => RunOutcome::NotFound,
            Some(run) if run.status.is_terminal() => RunOutcome::AlreadyTerminal(run.status),
            Some(run) => {
                log::warn!("Run {run_id} is unexpectedly still {}", run.status);
                RunOutcome::AlreadyTerminal(run.status)
            }
        })
    }

    async fn record_exit_code(&self, run_id: &str, code: i32) {
        let mut entries = RunMetadata::new();
        entries.insert(metadata_keys::EXIT_CODE.to_string(), code.into());
        if let Err(e) = db::merge_run_metadata(self.db.as_ref(), run_id, &entries).await {
            log::warn!("Failed to record exit code for run {run_id}: {e}");
        }
    }
}

fn outcome_of(run: &ProcessingRun) -> RunOutcome {
    match run.status {
        RunStatus::Failed => RunOutcome::Failed {
            message: run.error_message.clone().unwrap_or_default(),
        },
        _ => RunOutcome::Completed,
    }
}

fn failure_message(exit: &ExecutorExit) -> String {
    match exit.stderr_tail.as_deref().map(str::trim) {
        Some(tail) if !tail.is_empty() => {
            format!("Executor exited with code {}: {tail}", exit.code)
        }
        _ => format!("Executor exited with code {}", exit.code),
    }
}

/// Keeps the end of the message, where the actual error usually is.
fn truncate(message: &str) -> String {
    let count = message.chars().count();
    if count <= MAX_ERROR_MESSAGE_CHARS {
        return message.to_string();
    }
    let tail: String = message
        .chars()
        .skip(count - MAX_ERROR_MESSAGE_CHARS)
        .collect();
    format!("...{tail}")
}
