//! In-process executor for single-binary deployments.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{ExecutionRequest, ExecutorError, ExecutorExit, PipelineExecutor};

/// Exit code reported when the pipeline returns an error.
pub const PIPELINE_FAILURE_CODE: i32 = 1;

/// Exit code reported when the pipeline task panics.
pub const PIPELINE_PANIC_CODE: i32 = 101;

/// Errors raised by an in-process [`RasterPipeline`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Database(#[from] georisk_database::DbError),

    #[error(transparent)]
    Detector(#[from] crate::DetectorError),

    #[error("Area not found: {0}")]
    AreaNotFound(String),

    /// A status write was rejected, meaning the run moved on without us.
    #[error("Run {run_id} rejected transition to {status}")]
    TransitionRejected { run_id: String, status: String },

    #[error("Pipeline cancelled")]
    Cancelled,
}

/// The stages of a run that execute after `FETCHING_IMAGERY`.
///
/// Implementations write their own status transitions, exactly like an
/// external worker would.
#[async_trait]
pub trait RasterPipeline: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns [`PipelineError`] if any stage fails.
    async fn run(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError>;
}

/// Runs a [`RasterPipeline`] on a spawned task and reports it with the
/// same exit-code contract as an external worker.
pub struct InProcessExecutor<P: RasterPipeline> {
    pipeline: Arc<P>,
}

impl<P: RasterPipeline> InProcessExecutor<P> {
    #[must_use]
    pub fn new(pipeline: P) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }

    #[must_use]
    pub const fn from_arc(pipeline: Arc<P>) -> Self {
        Self { pipeline }
    }
}

impl<P: RasterPipeline> Clone for InProcessExecutor<P> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
        }
    }
}

#[async_trait]
impl<P: RasterPipeline> PipelineExecutor for InProcessExecutor<P> {
    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutorExit, ExecutorError> {
        let pipeline = Arc::clone(&self.pipeline);
        let task_request = request.clone();
        let task_cancel = cancel.child_token();

        let mut handle =
            tokio::spawn(async move { pipeline.run(&task_request, &task_cancel).await });

        let joined = tokio::select! {
            joined = &mut handle => joined,
            () = cancel.cancelled() => {
                log::warn!("Cancelling in-process pipeline for run {}", request.run_id);
                handle.abort();
                return Err(ExecutorError::Cancelled);
            }
        };

        match joined {
            Ok(Ok(())) => Ok(ExecutorExit::success()),
            Ok(Err(PipelineError::Cancelled)) => Err(ExecutorError::Cancelled),
            Ok(Err(e)) => {
                log::error!("Pipeline for run {} failed: {e}", request.run_id);
                Ok(ExecutorExit::failure(PIPELINE_FAILURE_CODE, e.to_string()))
            }
            Err(e) if e.is_panic() => {
                log::error!("Pipeline for run {} panicked", request.run_id);
                Ok(ExecutorExit::failure(PIPELINE_PANIC_CODE, "pipeline panicked"))
            }
            Err(_) => Err(ExecutorError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use chrono::NaiveDate;

    use super::*;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            area_id: "a".to_string(),
            before_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            after_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            run_id: "r".to_string(),
        }
    }

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        Hang,
    }

    struct Fake {
        behaviour: Behaviour,
        finished: Arc<AtomicBool>,
    }

    impl Fake {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                finished: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl RasterPipeline for Fake {
        async fn run(
            &self,
            _request: &ExecutionRequest,
            _cancel: &CancellationToken,
        ) -> Result<(), PipelineError> {
            match self.behaviour {
                Behaviour::Succeed => {}
                Behaviour::Fail => return Err(PipelineError::AreaNotFound("a".to_string())),
                Behaviour::Panic => panic!("boom"),
                Behaviour::Hang => tokio::time::sleep(Duration::from_secs(30)).await,
            }
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn success_maps_to_exit_zero() {
        let executor = InProcessExecutor::new(Fake::new(Behaviour::Succeed));
        let exit = executor
            .execute(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(exit.is_success());
    }

    #[tokio::test]
    async fn error_maps_to_exit_one_with_message() {
        let executor = InProcessExecutor::new(Fake::new(Behaviour::Fail));
        let exit = executor
            .execute(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit.code, PIPELINE_FAILURE_CODE);
        assert_eq!(exit.stderr_tail.as_deref(), Some("Area not found: a"));
    }

    #[tokio::test]
    async fn panic_maps_to_exit_101() {
        let executor = InProcessExecutor::new(Fake::new(Behaviour::Panic));
        let exit = executor
            .execute(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit.code, PIPELINE_PANIC_CODE);
    }

    #[tokio::test]
    async fn cancellation_aborts_task() {
        let fake = Fake::new(Behaviour::Hang);
        let finished = Arc::clone(&fake.finished);
        let executor = InProcessExecutor::new(fake);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = executor.execute(&request(), &cancel).await;
        assert!(matches!(result, Err(ExecutorError::Cancelled)));
        assert!(!finished.load(Ordering::SeqCst));
    }
}
