#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Command-line entry point for georisk.
//!
//! `serve` runs the API together with the in-process scheduler. The other
//! subcommands are the pieces a deployment wires together around it:
//! `tick` for external schedulers, `process` as the pipeline worker the
//! process executor spawns, `check` as the imagery check command, plus
//! imports and status reporting.

mod import;
mod runtime;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use georisk_config::{GeoriskConfig, TriggerMode};
use georisk_database as db;
use georisk_executor::{ExecutionRequest, RasterPipeline};
use georisk_imagery::{CatalogImageryCheck, EXIT_ERROR, ImageryCheck, JsonSceneCatalog};
use georisk_monitor_models::{NewRun, RunTrigger};
use georisk_orchestrator::{RunError, RunOutcome};
use georisk_scheduler::{
    CronTriggerAdapter, ExternalTriggerAdapter, ScheduleService, TickOutcome, TriggerAdapter,
    sync_schedules,
};
use georisk_server::AppState;
use tokio_util::sync::CancellationToken;

use crate::runtime::Runtime;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

// ---------------------------------------------------------------------------
// CLI definitions
// ---------------------------------------------------------------------------

/// Satellite change monitoring and infrastructure risk scoring.
#[derive(Parser)]
#[command(name = "georisk")]
#[command(about = "Satellite change monitoring and infrastructure risk scoring")]
struct Cli {
    /// Path to the TOML config file. Defaults to `GEORISK_CONFIG`, then
    /// `georisk.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema.
    Migrate,

    /// Run the API server and the in-process scheduler.
    Serve,

    /// Tick one area (or every scheduled area) once and wait for the
    /// runs it triggers.
    Tick {
        /// Area to tick.
        #[arg(long, required_unless_present = "all", conflicts_with = "all")]
        area_id: Option<String>,

        /// Tick every area with an active schedule.
        #[arg(long)]
        all: bool,
    },

    /// Drive one run through its lifecycle in the foreground.
    Run {
        /// Existing run to resume.
        #[arg(long, conflicts_with = "area_id")]
        run_id: Option<String>,

        /// Create a manual run for this area.
        #[arg(long, requires_all = ["before", "after"])]
        area_id: Option<String>,

        /// Baseline date (`YYYY-MM-DD`).
        #[arg(long)]
        before: Option<NaiveDate>,

        /// Comparison date (`YYYY-MM-DD`).
        #[arg(long)]
        after: Option<NaiveDate>,
    },

    /// Pipeline worker: detect and score changes for one run.
    Process {
        #[arg(long)]
        area_id: String,

        #[arg(long)]
        before: NaiveDate,

        #[arg(long)]
        after: NaiveDate,

        #[arg(long)]
        run_id: String,
    },

    /// Imagery check: exits 0 with new data, 1 without, 2 on error.
    Check {
        #[arg(long)]
        area_id: String,

        /// Maximum cloud cover percentage. Defaults to the area's.
        #[arg(long)]
        max_cloud: Option<f64>,

        /// Only consider scenes after this date.
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Create or update a monitored area from a `GeoJSON` boundary.
    ImportArea {
        #[arg(long)]
        id: String,

        #[arg(long)]
        name: Option<String>,

        /// `GeoJSON` file holding a Polygon or `MultiPolygon`.
        #[arg(long)]
        boundary: PathBuf,

        /// Schedule expression; an empty string clears the schedule.
        #[arg(long)]
        schedule: Option<String>,

        #[arg(long)]
        max_cloud: Option<f64>,

        #[arg(long)]
        lookback_days: Option<u32>,
    },

    /// Load infrastructure assets from a `GeoJSON` feature collection.
    ImportAssets {
        /// `GeoJSON` file of asset features.
        #[arg(long)]
        file: PathBuf,
    },

    /// Show areas and their recent runs.
    Status {
        /// Restrict to one area.
        #[arg(long)]
        area_id: Option<String>,

        /// Runs shown per area.
        #[arg(long, default_value_t = 5)]
        limit: u32,
    },

    /// Print crontab entries for every scheduled area.
    Crontab,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    georisk_config::init_logger();
    let cli = Cli::parse();

    let config_path = cli.config.as_deref();
    let config = GeoriskConfig::load(config_path)?;

    let code = match cli.command {
        Commands::Migrate => cmd_migrate(&config).await?,
        Commands::Serve => cmd_serve(&config, config_path).await?,
        Commands::Tick { area_id, all } => cmd_tick(&config, config_path, area_id, all).await?,
        Commands::Run {
            run_id,
            area_id,
            before,
            after,
        } => cmd_run(&config, config_path, run_id, area_id, before, after).await?,
        Commands::Process {
            area_id,
            before,
            after,
            run_id,
        } => {
            let request = ExecutionRequest {
                area_id,
                before_date: before,
                after_date: after,
                run_id,
            };
            cmd_process(&config, &request).await?
        }
        Commands::Check {
            area_id,
            max_cloud,
            since,
            json,
        } => cmd_check(&config, &area_id, max_cloud, since, json).await?,
        Commands::ImportArea {
            id,
            name,
            boundary,
            schedule,
            max_cloud,
            lookback_days,
        } => {
            let request = import::AreaImport {
                id,
                name,
                schedule_cron: schedule,
                max_cloud_cover: max_cloud,
                lookback_days,
            };
            cmd_import_area(&config, &request, &boundary).await?
        }
        Commands::ImportAssets { file } => cmd_import_assets(&config, &file).await?,
        Commands::Status { area_id, limit } => {
            cmd_status(&config, area_id.as_deref(), limit).await?
        }
        Commands::Crontab => cmd_crontab(&config, config_path).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Service commands
// ---------------------------------------------------------------------------

async fn cmd_migrate(config: &GeoriskConfig) -> CliResult<i32> {
    runtime::open_db(config).await?;
    log::info!("Schema ready at {}", config.database.path.display());
    Ok(0)
}

async fn cmd_serve(config: &GeoriskConfig, config_path: Option<&Path>) -> CliResult<i32> {
    let Runtime {
        db,
        launcher,
        scheduler,
        shutdown,
        ..
    } = Runtime::build(config, config_path).await?;

    if config.scheduler.recover_on_start {
        let report = scheduler.recover_interrupted_runs().await?;
        if !report.relaunched.is_empty() || !report.failed.is_empty() {
            log::info!(
                "Recovered interrupted runs: {} relaunched, {} failed",
                report.relaunched.len(),
                report.failed.len()
            );
        }
    }

    let (adapter, cron): (Arc<dyn TriggerAdapter>, Option<Arc<CronTriggerAdapter>>) =
        match config.scheduler.trigger_mode {
            TriggerMode::InProcess => {
                let cron = Arc::new(CronTriggerAdapter::new(
                    scheduler.clone(),
                    shutdown.clone(),
                ));
                (cron.clone(), Some(cron))
            }
            TriggerMode::External => {
                log::info!(
                    "External trigger mode: install the output of `georisk crontab` to schedule ticks"
                );
                (
                    Arc::new(ExternalTriggerAdapter::new(runtime::tick_command(
                        config,
                        config_path,
                    ))),
                    None,
                )
            }
        };

    let report = sync_schedules(db.as_ref(), adapter.as_ref()).await?;
    log::info!(
        "Registered {} schedule(s) with the {} trigger",
        report.registered.len(),
        adapter.name()
    );
    for (area_id, message) in &report.failed {
        log::warn!("Schedule of area {area_id} not registered: {message}");
    }

    let state = AppState {
        db: db.clone(),
        scheduler,
        schedules: Arc::new(ScheduleService::new(db, adapter)),
        launcher: launcher.clone(),
    };
    let bind_addr = config.server.bind_addr.clone();
    let port = config.server.port;

    // The server uses actix-web's runtime, so we need to run it in a
    // blocking task to avoid nesting tokio runtimes.
    let served = tokio::task::spawn_blocking(move || {
        actix_web::rt::System::new().block_on(georisk_server::run_server(state, &bind_addr, port))
    })
    .await?;

    log::info!("Server stopped, waiting for in-flight runs");
    shutdown.cancel();
    if let Some(cron) = cron {
        cron.shutdown().await;
    }
    launcher.join_all().await;

    served?;
    Ok(0)
}

async fn cmd_tick(
    config: &GeoriskConfig,
    config_path: Option<&Path>,
    area_id: Option<String>,
    all: bool,
) -> CliResult<i32> {
    let runtime = Runtime::build(config, config_path).await?;

    let outcomes = if all {
        runtime.scheduler.tick_scheduled().await?
    } else {
        let area_id = area_id.ok_or("--area-id or --all is required")?;
        let outcome = runtime.scheduler.on_tick(&area_id).await;
        vec![(area_id, outcome)]
    };

    let mut code = 0;
    let mut triggered = Vec::new();
    for (area_id, outcome) in &outcomes {
        match outcome {
            TickOutcome::Triggered {
                run_id,
                before_date,
                after_date,
            } => {
                println!("{area_id}: triggered run {run_id} ({before_date} -> {after_date})");
                triggered.push(run_id.clone());
            }
            TickOutcome::Skipped { active_run_id } => println!(
                "{area_id}: skipped, run {} in flight",
                active_run_id.as_deref().unwrap_or("(unknown)")
            ),
            TickOutcome::NoNewData => println!("{area_id}: no new imagery"),
            TickOutcome::AlreadyTicking => println!("{area_id}: already ticking"),
            TickOutcome::AreaNotFound => {
                eprintln!("{area_id}: area not found");
                code = 1;
            }
            TickOutcome::CheckFailed { message } => {
                eprintln!("{area_id}: imagery check failed: {message}");
                code = 1;
            }
            TickOutcome::TimedOut => {
                eprintln!("{area_id}: tick timed out");
                code = 1;
            }
        }
    }

    if triggered.is_empty() {
        return Ok(code);
    }

    let interrupt = runtime.shutdown.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling triggered runs");
            interrupt.cancel();
        }
    });
    runtime.launcher.join_all().await;
    watcher.abort();

    if runtime.shutdown.is_cancelled() {
        for run_id in &triggered {
            runtime.machine.fail_run(run_id, "Cancelled by user").await?;
        }
        return Ok(130);
    }

    for run_id in &triggered {
        if let Some(run) = db::get_run(runtime.db.as_ref(), run_id).await? {
            println!("run {run_id}: {}", run.status);
            if let Some(error) = &run.error_message {
                eprintln!("  {error}");
                code = 1;
            }
        }
    }

    Ok(code)
}

async fn cmd_run(
    config: &GeoriskConfig,
    config_path: Option<&Path>,
    run_id: Option<String>,
    area_id: Option<String>,
    before: Option<NaiveDate>,
    after: Option<NaiveDate>,
) -> CliResult<i32> {
    let runtime = Runtime::build(config, config_path).await?;

    let run_id = match (run_id, area_id, before, after) {
        (Some(run_id), ..) => run_id,
        (None, Some(area_id), Some(before), Some(after)) => {
            if db::get_area(runtime.db.as_ref(), &area_id).await?.is_none() {
                eprintln!("Area {area_id} not found");
                return Ok(1);
            }
            let new_run = NewRun::new(&area_id, before, after, RunTrigger::Manual);
            new_run.validate()?;
            let Some(run) = db::claim_run(runtime.db.as_ref(), &new_run).await? else {
                let active = db::find_active_run(runtime.db.as_ref(), &area_id).await?;
                eprintln!(
                    "Area {area_id} already has run {} in flight",
                    active.map_or_else(|| "(unknown)".to_string(), |r| r.id)
                );
                return Ok(1);
            };
            log::info!("Created manual run {} for area {area_id}", run.id);
            run.id
        }
        _ => return Err("either --run-id or --area-id with --before and --after is required".into()),
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let result = runtime.machine.execute(&run_id, &cancel).await;
    watcher.abort();

    match result {
        Ok(RunOutcome::Completed) => {
            println!("run {run_id}: COMPLETED");
            Ok(0)
        }
        Ok(RunOutcome::Failed { message }) => {
            eprintln!("run {run_id}: FAILED: {message}");
            Ok(1)
        }
        Ok(RunOutcome::AlreadyTerminal(status)) => {
            println!("run {run_id} has already finished: {status}");
            Ok(0)
        }
        Ok(RunOutcome::NotFound) => {
            eprintln!("Run {run_id} not found");
            Ok(1)
        }
        Err(RunError::Cancelled(_)) => {
            runtime.machine.fail_run(&run_id, "Cancelled by user").await?;
            eprintln!("run {run_id}: cancelled");
            Ok(130)
        }
        Err(e) => Err(e.into()),
    }
}

/// Exit code 0 on success. On failure the last stderr line carries the
/// message the executor stores on the run.
async fn cmd_process(config: &GeoriskConfig, request: &ExecutionRequest) -> CliResult<i32> {
    let db = runtime::open_db(config).await?;
    let pipeline = runtime::scoring_pipeline(config, db);

    match pipeline.run(request, &CancellationToken::new()).await {
        Ok(()) => Ok(0),
        Err(e) => {
            log::error!("Pipeline failed for run {}: {e}", request.run_id);
            eprintln!("{e}");
            Ok(1)
        }
    }
}

async fn cmd_check(
    config: &GeoriskConfig,
    area_id: &str,
    max_cloud: Option<f64>,
    since: Option<NaiveDate>,
    json: bool,
) -> CliResult<i32> {
    let db = runtime::open_db(config).await?;
    let Some(area) = db::get_area(db.as_ref(), area_id).await? else {
        eprintln!("Area {area_id} not found");
        return Ok(EXIT_ERROR);
    };

    let check = CatalogImageryCheck::new(db, JsonSceneCatalog::new(&config.imagery.catalog_path))
        .with_since(since);

    let result = match check
        .check(&area, max_cloud.unwrap_or(area.max_cloud_cover))
        .await
    {
        Ok(result) => result,
        Err(e) => {
            eprintln!("{e}");
            return Ok(EXIT_ERROR);
        }
    };

    if json {
        println!("{}", serde_json::to_string(&result)?);
    } else if let (true, Some(before), Some(after)) = (
        result.new_data,
        result.recommended_before_date,
        result.recommended_after_date,
    ) {
        println!(
            "New scene {} ({}, {:.1}% cloud): compare {before} -> {after}",
            result.scene_id.as_deref().unwrap_or("(unnamed)"),
            result
                .scene_date
                .map_or_else(|| "undated".to_string(), |d| d.to_string()),
            result.cloud_cover.unwrap_or_default(),
        );
    } else {
        println!("No new imagery for {area_id}");
    }

    Ok(georisk_imagery::exit_code_for(&result))
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

async fn cmd_import_area(
    config: &GeoriskConfig,
    request: &import::AreaImport,
    boundary: &Path,
) -> CliResult<i32> {
    let text = std::fs::read_to_string(boundary)?;
    let db = runtime::open_db(config).await?;

    let existing = db::get_area(db.as_ref(), &request.id).await?;
    let is_new = existing.is_none();
    let area = import::build_area(request, &text, existing, Utc::now())?;
    db::upsert_area(db.as_ref(), &area).await?;

    println!(
        "{} area {} ({}), schedule: {}",
        if is_new { "Created" } else { "Updated" },
        area.id,
        area.name,
        area.active_schedule().unwrap_or("none"),
    );

    Ok(0)
}

async fn cmd_import_assets(config: &GeoriskConfig, file: &Path) -> CliResult<i32> {
    let text = std::fs::read_to_string(file)?;
    let (assets, skipped) = import::parse_assets(&text)?;

    for reason in &skipped {
        log::warn!("Skipped {reason}");
    }

    let db = runtime::open_db(config).await?;
    for asset in &assets {
        db::upsert_asset(db.as_ref(), asset).await?;
    }

    println!(
        "Imported {} asset(s), skipped {}",
        assets.len(),
        skipped.len()
    );

    Ok(0)
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

async fn cmd_status(config: &GeoriskConfig, area_id: Option<&str>, limit: u32) -> CliResult<i32> {
    let db = runtime::open_db(config).await?;

    let areas = match area_id {
        Some(id) => {
            let Some(area) = db::get_area(db.as_ref(), id).await? else {
                eprintln!("Area {id} not found");
                return Ok(1);
            };
            vec![area]
        }
        None => db::list_areas(db.as_ref()).await?,
    };

    if areas.is_empty() {
        println!("No monitored areas.");
        return Ok(0);
    }

    let timestamp = |t: Option<chrono::DateTime<Utc>>| {
        t.map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string())
    };

    for area in &areas {
        println!("=== {} ({}) ===", area.name, area.id);
        println!(
            "Schedule:       {}",
            area.active_schedule().map_or_else(
                || match &area.schedule_cron {
                    Some(expr) => format!("{expr} (disabled)"),
                    None => "none".to_string(),
                },
                String::from,
            )
        );
        println!(
            "Thresholds:     {}% cloud, {} day lookback",
            area.max_cloud_cover, area.lookback_days
        );
        println!("Last checked:   {}", timestamp(area.last_checked_at));
        println!("Last processed: {}", timestamp(area.last_processed_at));

        let runs = db::list_runs(db.as_ref(), &area.id, limit).await?;
        if runs.is_empty() {
            println!("No runs.");
        } else {
            println!();
            println!(
                "{:<38} {:<18} {:<10} {:<23} STARTED",
                "RUN", "STATUS", "TRIGGER", "WINDOW"
            );
            for run in &runs {
                let window = format!("{} -> {}", run.before_date, run.after_date);
                println!(
                    "{:<38} {:<18} {:<10} {window:<23} {}",
                    run.id,
                    run.status,
                    run.trigger().map_or("-", RunTrigger::as_str),
                    timestamp(run.started_at),
                );
                if let Some(error) = &run.error_message {
                    println!("    error: {error}");
                }
            }
        }
        println!();
    }

    Ok(0)
}

async fn cmd_crontab(config: &GeoriskConfig, config_path: Option<&Path>) -> CliResult<i32> {
    let db = runtime::open_db(config).await?;
    let adapter = ExternalTriggerAdapter::new(runtime::tick_command(config, config_path));

    let report = sync_schedules(db.as_ref(), &adapter).await?;
    for (area_id, message) in &report.failed {
        eprintln!("# {area_id}: {message}");
    }

    print!("{}", adapter.render_crontab());

    Ok(i32::from(!report.failed.is_empty()))
}
