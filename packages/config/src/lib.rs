#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Service configuration.
//!
//! Settings come from a TOML file (default `georisk.toml`, overridden by
//! `GEORISK_CONFIG` or `--config`) with a handful of environment
//! overrides applied on top. A missing file means "all defaults".
//!
//! ```toml
//! [database]
//! path = "data/georisk.sqlite"
//!
//! [server]
//! bind_addr = "0.0.0.0"
//! port = 8080
//!
//! [scheduler]
//! trigger_mode = "in_process"
//! tick_timeout_secs = 600
//!
//! [executor]
//! mode = "process"
//!
//! [imagery]
//! mode = "catalog"
//! catalog_path = "data/scenes.json"
//!
//! [scoring.distance]
//! max_radius_m = 2500.0
//! ```

use std::path::{Path, PathBuf};

use georisk_executor::ProcessExecutorConfig;
use georisk_imagery::CommandImageryCheckConfig;
use georisk_risk::{ScoringConfig, ScoringConfigError};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Config file used when neither `--config` nor `GEORISK_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "georisk.toml";

pub const CONFIG_PATH_ENV: &str = "GEORISK_CONFIG";
pub const DB_PATH_ENV: &str = "GEORISK_DB_PATH";
pub const BIND_ADDR_ENV: &str = "BIND_ADDR";
pub const PORT_ENV: &str = "PORT";
pub const TRIGGER_MODE_ENV: &str = "GEORISK_TRIGGER_MODE";
pub const EXECUTOR_MODE_ENV: &str = "GEORISK_EXECUTOR_MODE";
pub const IMAGERY_MODE_ENV: &str = "GEORISK_IMAGERY_MODE";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// An environment override has a value that cannot be used.
    #[error("Invalid value '{value}' for {name}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Scoring(#[from] ScoringConfigError),
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

/// Where schedule fires come from.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggerMode {
    /// Tokio tasks inside `georisk serve`.
    #[default]
    InProcess,
    /// A host crontab running `georisk tick`.
    External,
}

/// How the raster pipeline is run for a processing run.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutorMode {
    /// A child process per run (`georisk process` by default).
    #[default]
    Process,
    /// Inside the calling process.
    InProcess,
}

/// How new imagery is discovered.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ImageryMode {
    /// An external command speaking the exit-code protocol.
    Command,
    /// A scene catalog file searched in-process.
    #[default]
    Catalog,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/georisk.sqlite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub trigger_mode: TriggerMode,
    /// Upper bound on the check phase of one tick.
    pub tick_timeout_secs: u64,
    /// Command line the external crontab uses to reach this binary.
    pub tick_command: String,
    /// Resolve runs left in flight by a previous process on startup.
    pub recover_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            trigger_mode: TriggerMode::default(),
            tick_timeout_secs: 600,
            tick_command: "georisk".to_string(),
            recover_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub mode: ExecutorMode,
    pub process: ProcessExecutorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageryConfig {
    pub mode: ImageryMode,
    pub command: CommandImageryCheckConfig,
    /// Scene catalog used in `catalog` mode.
    pub catalog_path: PathBuf,
}

impl Default for ImageryConfig {
    fn default() -> Self {
        Self {
            mode: ImageryMode::default(),
            command: CommandImageryCheckConfig::default(),
            catalog_path: PathBuf::from("data/scenes.json"),
        }
    }
}

/// Where the in-process pipeline reads precomputed change detections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionsConfig {
    pub dir: PathBuf,
}

impl Default for DetectionsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/detections"),
        }
    }
}

/// All service settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoriskConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub imagery: ImageryConfig,
    pub detections: DetectionsConfig,
    pub scoring: ScoringConfig,
}

impl GeoriskConfig {
    /// Parses TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the text is not a valid config.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::de::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Reads a config file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or
    /// parsed.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                log::debug!("Loading config from {}", path.display());
                Self::from_toml(&text, path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Applies environment overrides read through `var`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] for an unparseable port or mode.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(path) = var(DB_PATH_ENV) {
            self.database.path = PathBuf::from(path);
        }
        if let Some(addr) = var(BIND_ADDR_ENV) {
            self.server.bind_addr = addr;
        }
        if let Some(port) = var(PORT_ENV) {
            self.server.port = parse_env(PORT_ENV, &port)?;
        }
        if let Some(mode) = var(TRIGGER_MODE_ENV) {
            self.scheduler.trigger_mode = parse_env(TRIGGER_MODE_ENV, &mode)?;
        }
        if let Some(mode) = var(EXECUTOR_MODE_ENV) {
            self.executor.mode = parse_env(EXECUTOR_MODE_ENV, &mode)?;
        }
        if let Some(mode) = var(IMAGERY_MODE_ENV) {
            self.imagery.mode = parse_env(IMAGERY_MODE_ENV, &mode)?;
        }
        Ok(())
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a value cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.tick_timeout_secs must be positive".to_string(),
            ));
        }
        if self.executor.mode == ExecutorMode::Process && self.executor.process.program.is_empty() {
            return Err(ConfigError::Invalid(
                "executor.process.program is required in process mode".to_string(),
            ));
        }
        if self.imagery.mode == ImageryMode::Command && self.imagery.command.program.is_empty() {
            return Err(ConfigError::Invalid(
                "imagery.command.program is required in command mode".to_string(),
            ));
        }
        self.scoring.validate()?;
        Ok(())
    }

    /// Loads the config the way the binaries do: explicit path, else
    /// `GEORISK_CONFIG`, else [`DEFAULT_CONFIG_PATH`], then environment
    /// overrides and validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if loading, an override or validation fails.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let path = explicit.map_or_else(
            || PathBuf::from(env(CONFIG_PATH_ENV).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())),
            Path::to_path_buf,
        );
        let mut config = Self::load_file(&path)?;
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name,
        value: value.to_string(),
    })
}

/// Installs the process-wide logger, filtered by `RUST_LOG`.
pub fn init_logger() {
    if std::env::var_os("RUST_LOG").is_none() {
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Info)
            .init();
    } else {
        pretty_env_logger::init_custom_env("RUST_LOG");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = GeoriskConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.scheduler.trigger_mode, TriggerMode::InProcess);
        assert_eq!(config.executor.mode, ExecutorMode::Process);
        assert_eq!(config.imagery.mode, ImageryMode::Catalog);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = GeoriskConfig::from_toml(
            r#"
            [server]
            port = 9000

            [scheduler]
            trigger_mode = "external"

            [executor]
            mode = "in_process"

            [executor.process]
            program = "/opt/georisk/bin/pipeline"

            [scoring.distance]
            max_radius_m = 5000.0
            "#,
            Path::new("test.toml"),
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind_addr, "127.0.0.1");
        assert_eq!(config.scheduler.trigger_mode, TriggerMode::External);
        assert_eq!(config.scheduler.tick_timeout_secs, 600);
        assert_eq!(config.executor.mode, ExecutorMode::InProcess);
        assert_eq!(config.executor.process.program, "/opt/georisk/bin/pipeline");
        assert_eq!(
            config.executor.process.args,
            ProcessExecutorConfig::default().args
        );
        assert!((config.scoring.distance.max_radius_m - 5000.0).abs() < f64::EPSILON);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_mode_is_a_parse_error() {
        let err = GeoriskConfig::from_toml(
            "[imagery]\nmode = \"satellite\"\n",
            Path::new("bad.toml"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = GeoriskConfig::default();
        config
            .apply_env(env(&[
                (DB_PATH_ENV, "/var/lib/georisk/db.sqlite"),
                (BIND_ADDR_ENV, "0.0.0.0"),
                (PORT_ENV, "3000"),
                (TRIGGER_MODE_ENV, "external"),
                (EXECUTOR_MODE_ENV, "in_process"),
                (IMAGERY_MODE_ENV, "command"),
            ]))
            .unwrap();

        assert_eq!(
            config.database.path,
            PathBuf::from("/var/lib/georisk/db.sqlite")
        );
        assert_eq!(config.server.bind_addr, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.scheduler.trigger_mode, TriggerMode::External);
        assert_eq!(config.executor.mode, ExecutorMode::InProcess);
        assert_eq!(config.imagery.mode, ImageryMode::Command);
    }

    #[test]
    fn bad_override_names_the_variable() {
        let mut config = GeoriskConfig::default();
        let err = config.apply_env(env(&[(PORT_ENV, "eighty")])).unwrap_err();
        assert!(err.to_string().contains(PORT_ENV));

        let err = config
            .apply_env(env(&[(EXECUTOR_MODE_ENV, "remote")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                name: EXECUTOR_MODE_ENV,
                ..
            }
        ));
    }

    #[test]
    fn missing_file_means_defaults() {
        let path = std::env::temp_dir().join(format!(
            "georisk_config_missing_{}.toml",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        assert_eq!(
            GeoriskConfig::load_file(&path).unwrap(),
            GeoriskConfig::default()
        );
    }

    #[test]
    fn zero_tick_timeout_is_rejected() {
        let mut config = GeoriskConfig::default();
        config.scheduler.tick_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
