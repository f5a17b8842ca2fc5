#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! The raster pipeline executor boundary.
//!
//! The run state machine hands a run to a [`PipelineExecutor`] as one
//! blocking, cancellable call and only looks at how it ended. The executor
//! writes its own intermediate status transitions to the store.
//!
//! Two implementations are provided:
//!
//! * [`ProcessExecutor`] spawns an external worker process per run.
//! * [`InProcessExecutor`] runs a [`RasterPipeline`] on the current
//!   runtime, for single-binary deployments.

pub mod detector;
pub mod in_process;
pub mod pipeline;
pub mod process;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use detector::{ChangeDetector, DetectedChange, DetectorError, GeoJsonChangeDetector};
pub use in_process::{InProcessExecutor, PipelineError, RasterPipeline};
pub use pipeline::ScoringPipeline;
pub use process::{ProcessExecutor, ProcessExecutorConfig};

/// Inputs of one executor invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub area_id: String,
    pub before_date: NaiveDate,
    pub after_date: NaiveDate,
    pub run_id: String,
}

/// How an executor invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorExit {
    /// Process exit code. Death by signal `n` is reported as `128 + n`.
    pub code: i32,
    /// Last lines of diagnostic output, if any.
    pub stderr_tail: Option<String>,
}

impl ExecutorExit {
    #[must_use]
    pub const fn success() -> Self {
        Self {
            code: 0,
            stderr_tail: None,
        }
    }

    #[must_use]
    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            stderr_tail: Some(message.into()),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Errors that prevent an executor from reporting an exit code.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The worker could not be started.
    #[error("Failed to spawn executor: {0}")]
    Spawn(#[source] std::io::Error),

    /// Waiting on the worker failed.
    #[error("Executor I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The invocation was cancelled and the worker terminated.
    #[error("Executor cancelled")]
    Cancelled,

    /// The executor is misconfigured.
    #[error("Executor configuration error: {0}")]
    Config(String),
}

/// Runs the raster pipeline for one processing run.
#[async_trait]
pub trait PipelineExecutor: Send + Sync {
    /// Executes the pipeline and reports how it ended.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Cancelled`] once `cancel` fires and the
    /// worker has been terminated, or another [`ExecutorError`] if the
    /// worker could not be run at all.
    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutorExit, ExecutorError>;
}

#[async_trait]
impl<T: PipelineExecutor + ?Sized> PipelineExecutor for std::sync::Arc<T> {
    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutorExit, ExecutorError> {
        (**self).execute(request, cancel).await
    }
}
