//! Per-area tick handling: the single-flight guard, the imagery check and
//! the continuity chain that decides each new run's date range.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use georisk_database::{self as db, DbError};
use georisk_imagery::{ImageryCheck, ProtocolError};
use georisk_monitor_models::{
    ImageryCheckResult, MonitoredArea, NewRun, ProcessingRun, RunStatus, RunTrigger,
    metadata_keys,
};
use georisk_orchestrator::RunStateMachine;
use serde_json::Value;
use switchy_database::Database;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default bound on the check phase of a tick.
pub const DEFAULT_TICK_TIMEOUT: Duration = Duration::from_secs(600);

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    AreaNotFound,
    /// A previous tick for the same area is still running in this process.
    AlreadyTicking,
    /// The area already has a non-terminal run.
    Skipped { active_run_id: Option<String> },
    NoNewData,
    CheckFailed { message: String },
    TimedOut,
    Triggered {
        run_id: String,
        before_date: NaiveDate,
        after_date: NaiveDate,
    },
}

impl TickOutcome {
    #[must_use]
    pub const fn is_triggered(&self) -> bool {
        matches!(self, Self::Triggered { .. })
    }
}

/// Receives schedule fires.
#[async_trait]
pub trait TickHandler: Send + Sync + 'static {
    async fn on_tick(&self, area_id: &str) -> TickOutcome;
}

/// Hands a freshly claimed run to whatever executes it.
pub trait RunLauncher: Send + Sync {
    fn launch(&self, run_id: String);
}

/// Launches runs as background tasks on a [`RunStateMachine`].
pub struct StateMachineLauncher {
    machine: RunStateMachine,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl StateMachineLauncher {
    #[must_use]
    pub const fn new(machine: RunStateMachine, shutdown: CancellationToken) -> Self {
        Self {
            machine,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Waits for every launched run to finish.
    pub async fn join_all(&self) {
        let handles = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("Run task panicked: {e}");
            }
        }
    }
}

impl RunLauncher for StateMachineLauncher {
    fn launch(&self, run_id: String) {
        let handle = self.machine.spawn(run_id, self.shutdown.child_token());
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }
}

/// Counts from [`MonitorScheduler::recover_interrupted_runs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub relaunched: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
enum TickError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Database(#[from] DbError),
}

enum Decision {
    Done(TickOutcome),
    Launch(NewRun),
}

/// Marks an area as ticking for as long as it is alive.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    area_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.area_id);
    }
}

/// The scheduling guard and continuity controller.
pub struct MonitorScheduler {
    db: Arc<dyn Database>,
    imagery: Arc<dyn ImageryCheck>,
    launcher: Arc<dyn RunLauncher>,
    tick_timeout: Duration,
    in_flight: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for MonitorScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorScheduler")
            .field("tick_timeout", &self.tick_timeout)
            .finish_non_exhaustive()
    }
}

impl MonitorScheduler {
    #[must_use]
    pub fn new(
        db: Arc<dyn Database>,
        imagery: Arc<dyn ImageryCheck>,
        launcher: Arc<dyn RunLauncher>,
    ) -> Self {
        Self {
            db,
            imagery,
            launcher,
            tick_timeout: DEFAULT_TICK_TIMEOUT,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub const fn with_tick_timeout(mut self, timeout: Duration) -> Self {
        self.tick_timeout = timeout;
        self
    }

    /// Handles one schedule fire for an area.
    ///
    /// The area lookup, guard, imagery check and continuity decision are
    /// bounded by the tick timeout. Claiming and launching the run is not,
    /// so a run is either fully created and launched or not created.
    pub async fn on_tick(&self, area_id: &str) -> TickOutcome {
        let Some(_in_flight) = self.enter(area_id) else {
            log::warn!("Tick for area {area_id} skipped: previous tick still running");
            return TickOutcome::AlreadyTicking;
        };

        let decision = tokio::time::timeout(self.tick_timeout, self.decide(area_id)).await;

        match decision {
            Ok(Ok(Decision::Done(outcome))) => outcome,
            Ok(Ok(Decision::Launch(new_run))) => self.trigger(new_run).await,
            Ok(Err(e)) => {
                log::error!("Tick for area {area_id} failed: {e}");
                self.touch_best_effort(area_id).await;
                TickOutcome::CheckFailed {
                    message: e.to_string(),
                }
            }
            Err(_) => {
                log::error!(
                    "Tick for area {area_id} timed out after {}s",
                    self.tick_timeout.as_secs()
                );
                self.touch_best_effort(area_id).await;
                TickOutcome::TimedOut
            }
        }
    }

    /// Ticks every area with an active schedule, one after another.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the areas cannot be listed.
    pub async fn tick_scheduled(&self) -> Result<Vec<(String, TickOutcome)>, DbError> {
        let areas = db::list_scheduled_areas(self.db.as_ref()).await?;
        let mut outcomes = Vec::with_capacity(areas.len());
        for area in areas {
            let outcome = self.on_tick(&area.id).await;
            outcomes.push((area.id, outcome));
        }
        Ok(outcomes)
    }

    /// Resolves runs left non-terminal by a previous process.
    ///
    /// `PENDING` runs never reached the executor and are launched again.
    /// Runs in any later stage lost their executor and are failed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the database operation fails.
    pub async fn recover_interrupted_runs(&self) -> Result<RecoveryReport, DbError> {
        let mut report = RecoveryReport::default();

        for run in db::list_active_runs(self.db.as_ref()).await? {
            if run.status == RunStatus::Pending {
                log::info!("Relaunching pending run {} for area {}", run.id, run.area_id);
                self.launcher.launch(run.id.clone());
                report.relaunched.push(run.id);
            } else {
                let message = format!("Interrupted by restart while {}", run.status);
                if db::fail_run(self.db.as_ref(), &run.id, &message).await? {
                    log::warn!("Run {} for area {}: {message}", run.id, run.area_id);
                    report.failed.push(run.id);
                }
            }
        }

        Ok(report)
    }

    fn enter(&self, area_id: &str) -> Option<InFlight<'_>> {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        set.insert(area_id.to_string()).then(|| InFlight {
            set: &self.in_flight,
            area_id: area_id.to_string(),
        })
    }

    async fn decide(&self, area_id: &str) -> Result<Decision, TickError> {
        let Some(area) = db::get_area(self.db.as_ref(), area_id).await? else {
            log::error!("Tick for unknown area {area_id}");
            return Ok(Decision::Done(TickOutcome::AreaNotFound));
        };

        if let Some(active) = db::find_active_run(self.db.as_ref(), area_id).await? {
            log::info!(
                "Area {area_id} skipped: run {} is still {}",
                active.id,
                active.status
            );
            db::touch_last_checked(self.db.as_ref(), area_id, Utc::now()).await?;
            return Ok(Decision::Done(TickOutcome::Skipped {
                active_run_id: Some(active.id),
            }));
        }

        let check = self.imagery.check(&area, area.max_cloud_cover).await?;
        check
            .validate()
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;

        if !check.new_data {
            log::info!("No new imagery for area {area_id}");
            db::touch_last_checked(self.db.as_ref(), area_id, Utc::now()).await?;
            return Ok(Decision::Done(TickOutcome::NoNewData));
        }

        let previous = db::latest_completed_run(self.db.as_ref(), area_id).await?;
        if let Some(new_run) = plan_run(&area, &check, previous.as_ref()) {
            return Ok(Decision::Launch(new_run));
        }

        log::info!(
            "Imagery for area {area_id} dated {:?} is not newer than the last completed run",
            check.discovered_date()
        );
        db::touch_last_checked(self.db.as_ref(), area_id, Utc::now()).await?;
        Ok(Decision::Done(TickOutcome::NoNewData))
    }

    async fn trigger(&self, new_run: NewRun) -> TickOutcome {
        let area_id = new_run.area_id.clone();

        let run = match db::claim_run(self.db.as_ref(), &new_run).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                log::info!("Area {area_id} skipped: another run was claimed first");
                let active_run_id = db::find_active_run(self.db.as_ref(), &area_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|run| run.id);
                self.touch_best_effort(&area_id).await;
                return TickOutcome::Skipped { active_run_id };
            }
            Err(e) => {
                log::error!("Could not create run for area {area_id}: {e}");
                self.touch_best_effort(&area_id).await;
                return TickOutcome::CheckFailed {
                    message: e.to_string(),
                };
            }
        };

        let now = Utc::now();
        if let Err(e) = db::touch_last_checked(self.db.as_ref(), &area_id, now).await {
            log::warn!("Could not update last check time of area {area_id}: {e}");
        }
        if let Err(e) = db::set_last_processed(self.db.as_ref(), &area_id, now).await {
            log::warn!("Could not update last processed time of area {area_id}: {e}");
        }

        log::info!(
            "Triggered run {} for area {area_id}: {} -> {}",
            run.id,
            run.before_date,
            run.after_date
        );
        self.launcher.launch(run.id.clone());

        TickOutcome::Triggered {
            run_id: run.id,
            before_date: run.before_date,
            after_date: run.after_date,
        }
    }

    /// Updates the last check time after a failure, re-reading the area so
    /// a stale in-memory copy is never written back.
    async fn touch_best_effort(&self, area_id: &str) {
        match db::get_area(self.db.as_ref(), area_id).await {
            Ok(Some(area)) => {
                if let Err(e) = db::touch_last_checked(self.db.as_ref(), &area.id, Utc::now()).await
                {
                    log::warn!("Could not update last check time of area {area_id}: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Could not reload area {area_id}: {e}"),
        }
    }
}

#[async_trait]
impl TickHandler for MonitorScheduler {
    async fn on_tick(&self, area_id: &str) -> TickOutcome {
        Self::on_tick(self, area_id).await
    }
}

/// Builds the next run in an area's continuity chain.
///
/// The after-date is the discovered scene's date. The before-date is the
/// after-date of the last completed run, or the after-date minus the
/// area's lookback when there is none. Returns `None` when there is no
/// discovered date or the range would be empty.
#[must_use]
pub fn plan_run(
    area: &MonitoredArea,
    check: &ImageryCheckResult,
    previous: Option<&ProcessingRun>,
) -> Option<NewRun> {
    let after = check.discovered_date()?;
    let before = match previous {
        Some(run) => run.after_date,
        None => after.checked_sub_days(Days::new(u64::from(area.lookback_days)))?,
    };
    if before >= after {
        return None;
    }

    let mut run = NewRun::new(&area.id, before, after, RunTrigger::Scheduled);
    run.before_scene_id = previous.and_then(|r| r.after_scene_id.clone());
    run.after_scene_id.clone_from(&check.scene_id);

    if let Some(scene_id) = &check.scene_id {
        run.metadata.insert(
            metadata_keys::SCENE_ID.to_string(),
            Value::String(scene_id.clone()),
        );
    }
    if let Some(date) = check.scene_date {
        run.metadata.insert(
            metadata_keys::SCENE_DATE.to_string(),
            Value::String(date.to_string()),
        );
    }
    if let Some(cloud) = check.cloud_cover {
        run.metadata
            .insert(metadata_keys::CLOUD_COVER.to_string(), Value::from(cloud));
    }

    Some(run)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use georisk_executor::{ExecutionRequest, ExecutorError, ExecutorExit, PipelineExecutor};

    use super::*;

    struct Store {
        db: Arc<dyn Database>,
        path: PathBuf,
    }

    impl Store {
        async fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "georisk_scheduler_guard_{name}_{}.sqlite",
                std::process::id()
            ));
            let _ = std::fs::remove_file(&path);
            let db: Arc<dyn Database> = Arc::from(db::open_db(&path).await.unwrap());
            Self { db, path }
        }

        async fn add_area(&self, id: &str, max_cloud_cover: f64, lookback_days: u32) {
            db::upsert_area(
                self.db.as_ref(),
                &MonitoredArea {
                    id: id.to_string(),
                    name: id.to_uppercase(),
                    boundary_geojson:
                        r#"{"type":"Polygon","coordinates":[[[7,46],[7.1,46],[7.1,46.1],[7,46]]]}"#
                            .to_string(),
                    schedule_cron: Some("0 6 * * *".to_string()),
                    schedule_enabled: true,
                    max_cloud_cover,
                    lookback_days,
                    last_checked_at: None,
                    last_processed_at: None,
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        }

        async fn area(&self, id: &str) -> MonitoredArea {
            db::get_area(self.db.as_ref(), id).await.unwrap().unwrap()
        }
    }

    impl Drop for Store {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    #[derive(Clone)]
    enum Answer {
        NoData,
        Scene(&'static str, &'static str, f64),
        Fail,
        Hang,
    }

    #[derive(Default)]
    struct FakeImagery {
        answers: BTreeMap<String, Answer>,
        calls: Mutex<Vec<(String, f64)>>,
    }

    impl FakeImagery {
        fn with(mut self, area_id: &str, answer: Answer) -> Self {
            self.answers.insert(area_id.to_string(), answer);
            self
        }

        fn calls(&self) -> Vec<(String, f64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ImageryCheck for FakeImagery {
        async fn check(
            &self,
            area: &MonitoredArea,
            max_cloud_cover: f64,
        ) -> Result<ImageryCheckResult, ProtocolError> {
            self.calls
                .lock()
                .unwrap()
                .push((area.id.clone(), max_cloud_cover));
            match self.answers.get(&area.id).cloned().unwrap_or(Answer::NoData) {
                Answer::NoData => Ok(ImageryCheckResult::no_new_data()),
                Answer::Scene(id, date, cloud) => {
                    let date = date.parse().unwrap();
                    Ok(ImageryCheckResult {
                        new_data: true,
                        scene_id: Some(id.to_string()),
                        scene_date: Some(date),
                        cloud_cover: Some(cloud),
                        recommended_before_date: Some(date),
                        recommended_after_date: Some(date),
                    })
                }
                Answer::Fail => Err(ProtocolError::Failed {
                    code: 2,
                    message: "catalog unreachable".to_string(),
                }),
                Answer::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(ImageryCheckResult::no_new_data())
                }
            }
        }
    }

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<String>>,
    }

    impl RecordingLauncher {
        fn launched(&self) -> Vec<String> {
            self.launched.lock().unwrap().clone()
        }
    }

    impl RunLauncher for RecordingLauncher {
        fn launch(&self, run_id: String) {
            self.launched.lock().unwrap().push(run_id);
        }
    }

    fn scheduler(
        store: &Store,
        imagery: FakeImagery,
    ) -> (MonitorScheduler, Arc<FakeImagery>, Arc<RecordingLauncher>) {
        let imagery = Arc::new(imagery);
        let launcher = Arc::new(RecordingLauncher::default());
        let scheduler = MonitorScheduler::new(store.db.clone(), imagery.clone(), launcher.clone());
        (scheduler, imagery, launcher)
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn first_run_looks_back_from_discovered_scene() {
        let store = Store::new("first_run").await;
        store.add_area("a1", 25.0, 90).await;
        let (scheduler, imagery, launcher) = scheduler(
            &store,
            FakeImagery::default().with("a1", Answer::Scene("S2A_20181201", "2018-12-01", 7.5)),
        );

        let outcome = scheduler.on_tick("a1").await;

        let TickOutcome::Triggered {
            run_id,
            before_date,
            after_date,
        } = outcome
        else {
            panic!("expected a run, got {outcome:?}");
        };
        assert_eq!(before_date, date("2018-09-02"));
        assert_eq!(after_date, date("2018-12-01"));
        assert_eq!(imagery.calls(), vec![("a1".to_string(), 25.0)]);
        assert_eq!(launcher.launched(), vec![run_id.clone()]);

        let run = db::get_run(store.db.as_ref(), &run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.trigger(), Some(RunTrigger::Scheduled));
        assert_eq!(run.after_scene_id.as_deref(), Some("S2A_20181201"));
        assert_eq!(run.metadata[metadata_keys::SCENE_ID], "S2A_20181201");
        assert_eq!(run.metadata[metadata_keys::CLOUD_COVER], 7.5);

        let area = store.area("a1").await;
        assert!(area.last_checked_at.is_some());
        assert!(area.last_processed_at.is_some());
    }

    #[tokio::test]
    async fn next_run_starts_where_last_completed_run_ended() {
        let store = Store::new("chain").await;
        store.add_area("a1", 20.0, 90).await;

        let mut previous = NewRun::new(
            "a1",
            date("2024-03-01"),
            date("2024-06-01"),
            RunTrigger::Scheduled,
        );
        previous.after_scene_id = Some("S_0601".to_string());
        let previous = db::claim_run(store.db.as_ref(), &previous)
            .await
            .unwrap()
            .unwrap();
        db::complete_run(store.db.as_ref(), &previous.id).await.unwrap();

        let (scheduler, _, _) = scheduler(
            &store,
            FakeImagery::default().with("a1", Answer::Scene("S_0620", "2024-06-20", 3.0)),
        );
        let TickOutcome::Triggered {
            run_id,
            before_date,
            after_date,
        } = scheduler.on_tick("a1").await
        else {
            panic!("expected a run");
        };
        assert_eq!(before_date, date("2024-06-01"));
        assert_eq!(after_date, date("2024-06-20"));

        let run = db::get_run(store.db.as_ref(), &run_id).await.unwrap().unwrap();
        assert_eq!(run.before_scene_id.as_deref(), Some("S_0601"));
    }

    #[tokio::test]
    async fn scene_not_newer_than_chain_end_is_no_data() {
        let store = Store::new("stale_scene").await;
        store.add_area("a1", 20.0, 90).await;
        let previous = db::claim_run(
            store.db.as_ref(),
            &NewRun::new(
                "a1",
                date("2024-03-01"),
                date("2024-06-01"),
                RunTrigger::Scheduled,
            ),
        )
        .await
        .unwrap()
        .unwrap();
        db::complete_run(store.db.as_ref(), &previous.id).await.unwrap();

        let (scheduler, _, launcher) = scheduler(
            &store,
            FakeImagery::default().with("a1", Answer::Scene("S", "2024-06-01", 3.0)),
        );
        assert_eq!(scheduler.on_tick("a1").await, TickOutcome::NoNewData);
        assert!(launcher.launched().is_empty());
    }

    #[tokio::test]
    async fn no_new_imagery_only_touches_last_checked() {
        let store = Store::new("no_data").await;
        store.add_area("a1", 20.0, 90).await;
        let (scheduler, _, launcher) = scheduler(&store, FakeImagery::default());

        assert_eq!(scheduler.on_tick("a1").await, TickOutcome::NoNewData);

        let area = store.area("a1").await;
        assert!(area.last_checked_at.is_some());
        assert!(area.last_processed_at.is_none());
        assert!(launcher.launched().is_empty());
        assert!(
            db::list_runs(store.db.as_ref(), "a1", 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn in_flight_area_is_skipped_while_others_proceed() {
        let store = Store::new("guard").await;
        store.add_area("x", 20.0, 90).await;
        store.add_area("y", 20.0, 90).await;
        let busy = db::claim_run(
            store.db.as_ref(),
            &NewRun::new("x", date("2024-01-01"), date("2024-02-01"), RunTrigger::Manual),
        )
        .await
        .unwrap()
        .unwrap();
        db::update_run_status(store.db.as_ref(), &busy.id, RunStatus::DetectingChanges)
            .await
            .unwrap();

        let (scheduler, imagery, launcher) = scheduler(
            &store,
            FakeImagery::default()
                .with("x", Answer::Scene("SX", "2024-03-01", 1.0))
                .with("y", Answer::Scene("SY", "2024-03-01", 1.0)),
        );

        assert_eq!(
            scheduler.on_tick("x").await,
            TickOutcome::Skipped {
                active_run_id: Some(busy.id.clone())
            }
        );
        assert!(store.area("x").await.last_checked_at.is_some());
        assert!(store.area("x").await.last_processed_at.is_none());

        assert!(scheduler.on_tick("y").await.is_triggered());
        assert_eq!(imagery.calls(), vec![("y".to_string(), 20.0)]);
        assert_eq!(launcher.launched().len(), 1);

        let active = db::list_active_runs(store.db.as_ref()).await.unwrap();
        assert_eq!(active.iter().filter(|r| r.area_id == "x").count(), 1);
    }

    #[tokio::test]
    async fn check_failure_creates_no_run_and_touches_area() {
        let store = Store::new("check_failed").await;
        store.add_area("a1", 20.0, 90).await;
        let (scheduler, _, launcher) =
            scheduler(&store, FakeImagery::default().with("a1", Answer::Fail));

        let outcome = scheduler.on_tick("a1").await;
        let TickOutcome::CheckFailed { message } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(message.contains("catalog unreachable"));
        assert!(store.area("a1").await.last_checked_at.is_some());
        assert!(launcher.launched().is_empty());
        assert!(
            db::list_runs(store.db.as_ref(), "a1", 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn slow_check_times_out() {
        let store = Store::new("timeout").await;
        store.add_area("a1", 20.0, 90).await;
        let (scheduler, _, launcher) =
            scheduler(&store, FakeImagery::default().with("a1", Answer::Hang));
        let scheduler = scheduler.with_tick_timeout(Duration::from_millis(50));

        assert_eq!(scheduler.on_tick("a1").await, TickOutcome::TimedOut);
        assert!(store.area("a1").await.last_checked_at.is_some());
        assert!(launcher.launched().is_empty());
    }

    #[tokio::test]
    async fn overlapping_tick_is_rejected() {
        let store = Store::new("reentrant").await;
        store.add_area("a1", 20.0, 90).await;
        let (scheduler, imagery, _) = scheduler(&store, FakeImagery::default());

        let held = scheduler.enter("a1").unwrap();
        assert_eq!(scheduler.on_tick("a1").await, TickOutcome::AlreadyTicking);
        assert!(imagery.calls().is_empty());

        drop(held);
        assert_eq!(scheduler.on_tick("a1").await, TickOutcome::NoNewData);
    }

    #[tokio::test]
    async fn unknown_area_is_a_no_op() {
        let store = Store::new("unknown").await;
        let (scheduler, imagery, _) = scheduler(&store, FakeImagery::default());
        assert_eq!(scheduler.on_tick("missing").await, TickOutcome::AreaNotFound);
        assert!(imagery.calls().is_empty());
    }

    #[tokio::test]
    async fn recovery_relaunches_pending_and_fails_started_runs() {
        let store = Store::new("recovery").await;
        store.add_area("a1", 20.0, 90).await;
        store.add_area("a2", 20.0, 90).await;
        let pending = db::claim_run(
            store.db.as_ref(),
            &NewRun::new("a1", date("2024-01-01"), date("2024-02-01"), RunTrigger::Scheduled),
        )
        .await
        .unwrap()
        .unwrap();
        let started = db::claim_run(
            store.db.as_ref(),
            &NewRun::new("a2", date("2024-01-01"), date("2024-02-01"), RunTrigger::Scheduled),
        )
        .await
        .unwrap()
        .unwrap();
        db::update_run_status(store.db.as_ref(), &started.id, RunStatus::ScoringRisk)
            .await
            .unwrap();

        let (scheduler, _, launcher) = scheduler(&store, FakeImagery::default());
        let report = scheduler.recover_interrupted_runs().await.unwrap();

        assert_eq!(report.relaunched, vec![pending.id.clone()]);
        assert_eq!(report.failed, vec![started.id.clone()]);
        assert_eq!(launcher.launched(), vec![pending.id]);

        let failed = db::get_run(store.db.as_ref(), &started.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.error_message.unwrap().contains("restart"));
    }

    struct CompletingExecutor {
        db: Arc<dyn Database>,
    }

    #[async_trait]
    impl PipelineExecutor for CompletingExecutor {
        async fn execute(
            &self,
            request: &ExecutionRequest,
            _cancel: &CancellationToken,
        ) -> Result<ExecutorExit, ExecutorError> {
            for status in [
                RunStatus::CalculatingNdvi,
                RunStatus::DetectingChanges,
                RunStatus::ScoringRisk,
                RunStatus::Completed,
            ] {
                db::update_run_status(self.db.as_ref(), &request.run_id, status)
                    .await
                    .unwrap();
            }
            Ok(ExecutorExit::success())
        }
    }

    #[tokio::test]
    async fn launched_runs_complete_and_extend_the_chain() {
        let store = Store::new("launch").await;
        store.add_area("a1", 20.0, 90).await;

        let machine = RunStateMachine::new(
            store.db.clone(),
            Arc::new(CompletingExecutor {
                db: store.db.clone(),
            }),
        );
        let launcher = Arc::new(StateMachineLauncher::new(machine, CancellationToken::new()));
        let first = MonitorScheduler::new(
            store.db.clone(),
            Arc::new(FakeImagery::default().with("a1", Answer::Scene("S1", "2024-05-01", 2.0))),
            launcher.clone(),
        );
        let TickOutcome::Triggered { run_id, .. } = first.on_tick("a1").await else {
            panic!("expected a run");
        };
        launcher.join_all().await;

        let run = db::get_run(store.db.as_ref(), &run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());

        let second = MonitorScheduler::new(
            store.db.clone(),
            Arc::new(FakeImagery::default().with("a1", Answer::Scene("S2", "2024-05-11", 2.0))),
            launcher.clone(),
        );
        let outcome = second.on_tick("a1").await;
        launcher.join_all().await;
        assert!(matches!(
            outcome,
            TickOutcome::Triggered { before_date, after_date, .. }
                if before_date == date("2024-05-01") && after_date == date("2024-05-11")
        ));
    }

    #[test]
    fn plan_requires_a_discovered_date() {
        let area = MonitoredArea {
            id: "a1".to_string(),
            name: "A1".to_string(),
            boundary_geojson: String::new(),
            schedule_cron: None,
            schedule_enabled: false,
            max_cloud_cover: 20.0,
            lookback_days: 30,
            last_checked_at: None,
            last_processed_at: None,
            created_at: Utc::now(),
        };
        let mut check = ImageryCheckResult {
            new_data: true,
            ..ImageryCheckResult::default()
        };
        assert!(plan_run(&area, &check, None).is_none());

        check.recommended_after_date = Some(date("2024-05-31"));
        let run = plan_run(&area, &check, None).unwrap();
        assert_eq!(run.before_date, date("2024-05-01"));
        assert!(!run.metadata.contains_key(metadata_keys::SCENE_ID));
    }
}
