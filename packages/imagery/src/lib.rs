#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Imagery-check protocol.
//!
//! A check answers "is there new acceptable imagery for this area?" with an
//! [`ImageryCheckResult`]. Over a process boundary the answer is framed by
//! exit code:
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0    | New data; stdout carries the JSON payload |
//! | 1    | No new data; not an error |
//! | 2+   | Check failed; the message is surfaced and the tick aborted |
//!
//! A payload claiming new data without both recommended dates is itself a
//! protocol error and never produces a run.

pub mod catalog;
pub mod command;

use async_trait::async_trait;
use georisk_monitor_models::{ImageryCheckResult, MonitoredArea};

pub use catalog::{CatalogImageryCheck, JsonSceneCatalog, Scene, SceneCatalog, SceneQuery};
pub use command::{CommandImageryCheck, CommandImageryCheckConfig};

/// Exit code for "new imagery available".
pub const EXIT_NEW_DATA: i32 = 0;

/// Exit code for "no new imagery".
pub const EXIT_NO_DATA: i32 = 1;

/// Exit code for a failed check.
pub const EXIT_ERROR: i32 = 2;

/// Errors raised by an imagery check.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The check reported failure (exit code 2 or higher).
    #[error("Imagery check failed with code {code}: {message}")]
    Failed { code: i32, message: String },

    /// The check answered with a malformed or inconsistent payload.
    #[error("Invalid imagery check payload: {0}")]
    InvalidPayload(String),

    /// The check did not answer in time.
    #[error("Imagery check timed out after {0}s")]
    Timeout(u64),

    #[error("Imagery check I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scene catalog error: {0}")]
    Catalog(String),

    #[error("Area {0} has no usable boundary")]
    InvalidArea(String),

    #[error(transparent)]
    Database(#[from] georisk_database::DbError),
}

/// Asks whether new acceptable imagery exists for an area.
#[async_trait]
pub trait ImageryCheck: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the check fails or answers with an
    /// invalid payload. "No new data" is not an error.
    async fn check(
        &self,
        area: &MonitoredArea,
        max_cloud_cover: f64,
    ) -> Result<ImageryCheckResult, ProtocolError>;
}

/// Interprets the exit code and output of a check run as a separate process.
///
/// # Errors
///
/// * [`ProtocolError::Failed`] for any code other than 0 or 1.
/// * [`ProtocolError::InvalidPayload`] if code 0 comes with unparseable or
///   incomplete JSON.
pub fn interpret_exit(
    code: i32,
    stdout: &str,
    stderr: &str,
) -> Result<ImageryCheckResult, ProtocolError> {
    match code {
        EXIT_NEW_DATA => parse_payload(stdout),
        EXIT_NO_DATA => Ok(ImageryCheckResult::no_new_data()),
        _ => Err(ProtocolError::Failed {
            code,
            message: last_line(stderr)
                .or_else(|| last_line(stdout))
                .unwrap_or("no diagnostic output")
                .to_string(),
        }),
    }
}

/// Parses and validates a success payload.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidPayload`] if the JSON is malformed or
/// claims new data without both recommended dates.
pub fn parse_payload(stdout: &str) -> Result<ImageryCheckResult, ProtocolError> {
    let result: ImageryCheckResult = serde_json::from_str(stdout.trim())
        .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
    result
        .validate()
        .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
    Ok(result)
}

/// Exit code a check command should end with for a given answer.
#[must_use]
pub const fn exit_code_for(result: &ImageryCheckResult) -> i32 {
    if result.new_data {
        EXIT_NEW_DATA
    } else {
        EXIT_NO_DATA
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|l| !l.is_empty())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    const PAYLOAD: &str = r#"{
        "new_data": true,
        "scene_id": "S2B_20181201",
        "scene_date": "2018-12-01",
        "cloud_cover": 12.5,
        "recommended_before_date": "2018-09-02",
        "recommended_after_date": "2018-12-01"
    }"#;

    #[test]
    fn exit_zero_parses_payload() {
        let result = interpret_exit(0, PAYLOAD, "").unwrap();
        assert!(result.new_data);
        assert_eq!(result.scene_id.as_deref(), Some("S2B_20181201"));
        assert_eq!(
            result.recommended_before_date,
            NaiveDate::from_ymd_opt(2018, 9, 2)
        );
        assert_eq!(exit_code_for(&result), EXIT_NEW_DATA);
    }

    #[test]
    fn exit_one_is_no_data_even_with_noise() {
        let result = interpret_exit(1, "not json", "warning: slow catalog").unwrap();
        assert!(!result.new_data);
        assert_eq!(exit_code_for(&result), EXIT_NO_DATA);
    }

    #[test]
    fn exit_two_surfaces_last_stderr_line() {
        let err = interpret_exit(2, "", "connecting...\ncatalog unreachable\n\n").unwrap_err();
        match err {
            ProtocolError::Failed { code, message } => {
                assert_eq!(code, 2);
                assert_eq!(message, "catalog unreachable");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn negative_codes_are_failures() {
        assert!(matches!(
            interpret_exit(-1, "", ""),
            Err(ProtocolError::Failed { code: -1, .. })
        ));
    }

    #[test]
    fn new_data_without_dates_is_protocol_error() {
        let err = interpret_exit(0, r#"{"new_data": true, "scene_id": "x"}"#, "").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
    }

    #[test]
    fn malformed_payload_is_protocol_error() {
        assert!(matches!(
            interpret_exit(0, "{", ""),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }

    #[test]
    fn no_data_payload_omits_optional_keys() {
        let json = serde_json::to_value(ImageryCheckResult::no_new_data()).unwrap();
        assert_eq!(json, serde_json::json!({ "new_data": false }));
    }
}
