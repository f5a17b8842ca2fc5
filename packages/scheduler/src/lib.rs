#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Scheduling for monitored areas.
//!
//! A schedule fire becomes a call to [`MonitorScheduler::on_tick`], which
//! skips areas that still have a run in flight, asks the imagery check for
//! new data and, when there is some, claims the next run in the area's
//! continuity chain and launches it.
//!
//! Fires come from a [`TriggerAdapter`]: in-process tasks
//! ([`CronTriggerAdapter`]) or a host crontab that runs `georisk tick`
//! ([`ExternalTriggerAdapter`]). The guard logic is the same for both.

pub mod guard;
pub mod schedule;
pub mod service;
pub mod trigger;

pub use guard::{
    DEFAULT_TICK_TIMEOUT, MonitorScheduler, RecoveryReport, RunLauncher, StateMachineLauncher,
    TickHandler, TickOutcome, plan_run,
};
pub use schedule::{ScheduleError, ScheduleExpression};
pub use service::{ScheduleService, ScheduleServiceError, SyncReport, sync_schedules};
pub use trigger::{
    CronTriggerAdapter, ExternalTriggerAdapter, TriggerAdapter, TriggerError, shell_quote,
};
