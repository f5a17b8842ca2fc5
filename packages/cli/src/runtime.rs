//! Builds the long-lived services from a loaded [`GeoriskConfig`].

use std::path::Path;
use std::sync::Arc;

use georisk_config::{CONFIG_PATH_ENV, ExecutorMode, GeoriskConfig, ImageryMode};
use georisk_database::DbError;
use georisk_executor::{
    GeoJsonChangeDetector, InProcessExecutor, PipelineExecutor, ProcessExecutor, ScoringPipeline,
};
use georisk_imagery::{CatalogImageryCheck, CommandImageryCheck, ImageryCheck, JsonSceneCatalog};
use georisk_orchestrator::RunStateMachine;
use georisk_risk::RiskScorer;
use georisk_scheduler::{MonitorScheduler, RunLauncher, StateMachineLauncher};
use switchy_database::Database;
use tokio_util::sync::CancellationToken;

/// Opens the configured database, creating the schema on first use.
pub async fn open_db(config: &GeoriskConfig) -> Result<Arc<dyn Database>, DbError> {
    let db = georisk_database::open_db(&config.database.path).await?;
    Ok(Arc::from(db))
}

/// The in-process pipeline: stored detections scored against assets.
pub fn scoring_pipeline(
    config: &GeoriskConfig,
    db: Arc<dyn Database>,
) -> ScoringPipeline<GeoJsonChangeDetector> {
    ScoringPipeline::new(
        db,
        GeoJsonChangeDetector::new(&config.detections.dir),
        RiskScorer::new(config.scoring.clone()),
    )
}

/// The configured executor. Child processes inherit an explicit config
/// path so they see the same settings as the parent.
pub fn executor(
    config: &GeoriskConfig,
    config_path: Option<&Path>,
    db: Arc<dyn Database>,
) -> Arc<dyn PipelineExecutor> {
    match config.executor.mode {
        ExecutorMode::Process => {
            let mut process = config.executor.process.clone();
            if let Some(path) = config_path {
                process
                    .env
                    .entry(CONFIG_PATH_ENV.to_string())
                    .or_insert_with(|| path.display().to_string());
            }
            Arc::new(ProcessExecutor::new(process))
        }
        ExecutorMode::InProcess => Arc::new(InProcessExecutor::new(scoring_pipeline(config, db))),
    }
}

/// The configured imagery check.
pub fn imagery(
    config: &GeoriskConfig,
    config_path: Option<&Path>,
    db: Arc<dyn Database>,
) -> Arc<dyn ImageryCheck> {
    match config.imagery.mode {
        ImageryMode::Command => {
            let mut command = config.imagery.command.clone();
            if let Some(path) = config_path {
                command
                    .env
                    .entry(CONFIG_PATH_ENV.to_string())
                    .or_insert_with(|| path.display().to_string());
            }
            Arc::new(CommandImageryCheck::new(command))
        }
        ImageryMode::Catalog => Arc::new(CatalogImageryCheck::new(
            db,
            JsonSceneCatalog::new(&config.imagery.catalog_path),
        )),
    }
}

/// Command line written into crontab entries.
pub fn tick_command(config: &GeoriskConfig, config_path: Option<&Path>) -> String {
    config_path.map_or_else(
        || config.scheduler.tick_command.clone(),
        |path| {
            format!(
                "{} --config {}",
                config.scheduler.tick_command,
                georisk_scheduler::shell_quote(&path.display().to_string())
            )
        },
    )
}

/// Everything needed to tick areas and run what the ticks trigger.
pub struct Runtime {
    pub db: Arc<dyn Database>,
    pub machine: RunStateMachine,
    pub launcher: Arc<StateMachineLauncher>,
    pub scheduler: Arc<MonitorScheduler>,
    pub shutdown: CancellationToken,
}

impl Runtime {
    pub async fn build(config: &GeoriskConfig, config_path: Option<&Path>) -> Result<Self, DbError> {
        let db = open_db(config).await?;
        let shutdown = CancellationToken::new();
        let machine = RunStateMachine::new(db.clone(), executor(config, config_path, db.clone()));
        let launcher = Arc::new(StateMachineLauncher::new(machine.clone(), shutdown.clone()));
        let run_launcher: Arc<dyn RunLauncher> = launcher.clone();
        let scheduler = MonitorScheduler::new(
            db.clone(),
            imagery(config, config_path, db.clone()),
            run_launcher,
        )
        .with_tick_timeout(std::time::Duration::from_secs(
            config.scheduler.tick_timeout_secs,
        ));

        Ok(Self {
            db,
            machine,
            launcher,
            scheduler: Arc::new(scheduler),
            shutdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn tick_command_forwards_explicit_config() {
        let config = GeoriskConfig::default();
        assert_eq!(tick_command(&config, None), "georisk");
        assert_eq!(
            tick_command(&config, Some(&PathBuf::from("/etc/georisk/prod config.toml"))),
            "georisk --config '/etc/georisk/prod config.toml'"
        );
    }
}
