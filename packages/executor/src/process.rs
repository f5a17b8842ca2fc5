//! Out-of-process executor: one worker process per run.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{ExecutionRequest, ExecutorError, ExecutorExit, PipelineExecutor};

/// Exit code reported when the worker's exit status carries neither a code
/// nor a signal.
const UNKNOWN_EXIT_CODE: i32 = -1;

/// How to launch the worker process.
///
/// Every argument may contain the placeholders `{area_id}`, `{before}`,
/// `{after}` and `{run_id}`. Dates are rendered as `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessExecutorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Number of trailing stderr lines kept for the run's error message.
    pub stderr_tail_lines: usize,
}

impl Default for ProcessExecutorConfig {
    fn default() -> Self {
        Self {
            program: "georisk".to_string(),
            args: [
                "process",
                "--area-id",
                "{area_id}",
                "--before",
                "{before}",
                "--after",
                "{after}",
                "--run-id",
                "{run_id}",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            working_dir: None,
            env: BTreeMap::new(),
            stderr_tail_lines: 20,
        }
    }
}

impl ProcessExecutorConfig {
    /// Substitutes the request into the argument template.
    #[must_use]
    pub fn render_args(&self, request: &ExecutionRequest) -> Vec<String> {
        let before = request.before_date.format("%Y-%m-%d").to_string();
        let after = request.after_date.format("%Y-%m-%d").to_string();

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{area_id}", &request.area_id)
                    .replace("{before}", &before)
                    .replace("{after}", &after)
                    .replace("{run_id}", &request.run_id)
            })
            .collect()
    }
}

/// Runs each request as a child process in its own process group.
///
/// Cancellation kills the whole group, so helpers the worker spawned do
/// not outlive the run.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    config: ProcessExecutorConfig,
}

impl ProcessExecutor {
    #[must_use]
    pub const fn new(config: ProcessExecutorConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &ProcessExecutorConfig {
        &self.config
    }

    fn command(&self, request: &ExecutionRequest) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.config.render_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

#[async_trait]
impl PipelineExecutor for ProcessExecutor {
    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutorExit, ExecutorError> {
        if self.config.program.trim().is_empty() {
            return Err(ExecutorError::Config("executor program is empty".to_string()));
        }

        log::info!(
            "Spawning executor '{}' for run {} (area {}, {} -> {})",
            self.config.program,
            request.run_id,
            request.area_id,
            request.before_date,
            request.after_date,
        );

        let mut child = self.command(request).spawn().map_err(ExecutorError::Spawn)?;
        let pid = child.id();

        let run_id = request.run_id.clone();
        let stdout_task = tokio::spawn(forward_stdout(child.stdout.take(), run_id));
        let stderr_task = tokio::spawn(read_tail(
            child.stderr.take(),
            self.config.stderr_tail_lines,
        ));

        let status = tokio::select! {
            status = child.wait() => status?,
            () = cancel.cancelled() => {
                log::warn!("Cancelling executor for run {}", request.run_id);
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                // Reap the direct child; the group kill above covers the rest.
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(ExecutorError::Cancelled);
            }
        };

        let _ = stdout_task.await;
        let tail = stderr_task.await.unwrap_or_default();
        let code = exit_code(status);

        log::info!("Executor for run {} exited with code {code}", request.run_id);

        Ok(ExecutorExit {
            code,
            stderr_tail: (!tail.is_empty()).then_some(tail),
        })
    }
}

/// Maps an exit status to a shell-style code: death by signal `n` is
/// `128 + n`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    UNKNOWN_EXIT_CODE
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: `kill` has no memory-safety preconditions. The child was
    // spawned with `process_group(0)`, so its pid is the group id.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        log::debug!(
            "Failed to kill process group {pgid}: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
const fn kill_process_group(_pid: u32) {}

async fn forward_stdout<R: AsyncRead + Unpin + Send>(handle: Option<R>, run_id: String) {
    let Some(handle) = handle else {
        return;
    };
    let mut lines = BufReader::new(handle).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::debug!("[run {run_id}] {line}");
    }
}

/// Reads a stream to the end, keeping only its last `keep` lines.
async fn read_tail<R: AsyncRead + Unpin + Send>(handle: Option<R>, keep: usize) -> String {
    let Some(handle) = handle else {
        return String::new();
    };

    let mut tail = VecDeque::with_capacity(keep);
    let mut lines = BufReader::new(handle).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if keep == 0 {
            continue;
        }
        if tail.len() == keep {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    tail.into_iter().collect::<Vec<_>>().join("\n")
}
