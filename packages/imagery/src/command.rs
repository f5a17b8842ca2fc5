//! Imagery check run as an external command.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use georisk_monitor_models::{ImageryCheckResult, MonitoredArea};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::{ImageryCheck, ProtocolError, interpret_exit};

/// How to launch the check command. Arguments may contain `{area_id}` and
/// `{max_cloud}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandImageryCheckConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout_secs: u64,
}

impl Default for CommandImageryCheckConfig {
    fn default() -> Self {
        Self {
            program: "georisk".to_string(),
            args: [
                "check",
                "--area-id",
                "{area_id}",
                "--max-cloud",
                "{max_cloud}",
                "--json",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            env: BTreeMap::new(),
            timeout_secs: 300,
        }
    }
}

/// Runs the configured command and interprets its exit code.
#[derive(Debug, Clone)]
pub struct CommandImageryCheck {
    config: CommandImageryCheckConfig,
}

impl CommandImageryCheck {
    #[must_use]
    pub const fn new(config: CommandImageryCheckConfig) -> Self {
        Self { config }
    }

    fn render_args(&self, area_id: &str, max_cloud_cover: f64) -> Vec<String> {
        let max_cloud = max_cloud_cover.to_string();
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{area_id}", area_id)
                    .replace("{max_cloud}", &max_cloud)
            })
            .collect()
    }
}

#[async_trait]
impl ImageryCheck for CommandImageryCheck {
    async fn check(
        &self,
        area: &MonitoredArea,
        max_cloud_cover: f64,
    ) -> Result<ImageryCheckResult, ProtocolError> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.render_args(&area.id, max_cloud_cover))
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!(
            "Running imagery check '{}' for area {}",
            self.config.program,
            area.id
        );

        // On timeout the future is dropped, which kills the child.
        let output = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            cmd.output(),
        )
        .await
        .map_err(|_| ProtocolError::Timeout(self.config.timeout_secs))??;

        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        log::debug!("Imagery check for area {} exited with {code}", area.id);
        interpret_exit(code, &stdout, &stderr)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use chrono::Utc;

    use super::*;

    fn area() -> MonitoredArea {
        MonitoredArea {
            id: "a1".to_string(),
            name: "A1".to_string(),
            boundary_geojson: String::new(),
            schedule_cron: None,
            schedule_enabled: false,
            max_cloud_cover: 20.0,
            lookback_days: 90,
            last_checked_at: None,
            last_processed_at: None,
            created_at: Utc::now(),
        }
    }

    fn shell(script: &str) -> CommandImageryCheck {
        CommandImageryCheck::new(CommandImageryCheckConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                script.to_string(),
                "sh".to_string(),
                "{area_id}".to_string(),
                "{max_cloud}".to_string(),
            ],
            timeout_secs: 5,
            ..CommandImageryCheckConfig::default()
        })
    }

    #[tokio::test]
    async fn exit_one_is_no_data() {
        let result = shell("exit 1").check(&area(), 25.0).await.unwrap();
        assert!(!result.new_data);
    }

    #[tokio::test]
    async fn payload_is_read_from_stdout() {
        let script = r#"test "$1" = a1 && test "$2" = 25 || exit 3
echo '{"new_data":true,"scene_id":"S","scene_date":"2018-12-01","cloud_cover":5.0,"recommended_before_date":"2018-09-02","recommended_after_date":"2018-12-01"}'"#;
        let result = shell(script).check(&area(), 25.0).await.unwrap();
        assert!(result.new_data);
        assert_eq!(result.scene_id.as_deref(), Some("S"));
    }

    #[tokio::test]
    async fn error_exit_surfaces_message() {
        let err = shell("echo 'catalog down' >&2; exit 2")
            .check(&area(), 25.0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("catalog down"));
    }

    #[tokio::test]
    async fn slow_check_times_out() {
        let mut check = shell("sleep 10");
        check.config.timeout_secs = 1;
        let err = check.check(&area(), 25.0).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(1)));
    }
}
