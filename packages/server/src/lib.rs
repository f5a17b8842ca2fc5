#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server for georisk.
//!
//! Exposes schedule configuration of monitored areas, on-demand imagery
//! checks, manual processing runs and the status and risk events of
//! runs. Scheduling itself is owned by the caller; the server only holds
//! handles to it.
//!
//! | Method | Path | |
//! |--------|------|-|
//! | GET    | `/api/health` | liveness |
//! | GET    | `/api/areas` | all areas |
//! | GET    | `/api/areas/{id}` | one area with its active run |
//! | PATCH  | `/api/areas/{id}/schedule` | partial schedule update |
//! | POST   | `/api/areas/{id}/check` | tick the area now |
//! | GET    | `/api/areas/{id}/runs` | recent runs |
//! | POST   | `/api/areas/{id}/runs` | manual run, `409` while one is in flight |
//! | GET    | `/api/runs/{id}` | one run |
//! | GET    | `/api/runs/{id}/events` | risk events of a run |
//! | POST   | `/api/events/{id}/acknowledge` | acknowledge an event |
//! | POST   | `/api/events/{id}/dismiss` | dismiss an event |

mod handlers;

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use georisk_scheduler::{MonitorScheduler, RunLauncher, ScheduleService};
use switchy_database::Database;

/// Shared application state.
pub struct AppState {
    pub db: Arc<dyn Database>,
    /// Guard used by on-demand checks.
    pub scheduler: Arc<MonitorScheduler>,
    /// Schedule configuration and trigger registration.
    pub schedules: Arc<ScheduleService>,
    /// Starts manually requested runs.
    pub launcher: Arc<dyn RunLauncher>,
}

/// Registers every API route under `/api`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(handlers::health))
            .route("/areas", web::get().to(handlers::list_areas))
            .route("/areas/{id}", web::get().to(handlers::get_area))
            .route(
                "/areas/{id}/schedule",
                web::patch().to(handlers::update_schedule),
            )
            .route("/areas/{id}/check", web::post().to(handlers::check_area))
            .route("/areas/{id}/runs", web::get().to(handlers::list_runs))
            .route("/areas/{id}/runs", web::post().to(handlers::create_run))
            .route("/runs/{id}", web::get().to(handlers::get_run))
            .route("/runs/{id}/events", web::get().to(handlers::run_events))
            .route(
                "/events/{id}/acknowledge",
                web::post().to(handlers::acknowledge_event),
            )
            .route("/events/{id}/dismiss", web::post().to(handlers::dismiss_event)),
    );
}

/// Starts the API server and runs until it is stopped.
///
/// This is a regular async function; the caller provides the actix
/// runtime (e.g. `actix_web::rt::System::new().block_on(..)`).
///
/// # Errors
///
/// Returns an `std::io::Result` error if the HTTP server fails to bind or
/// encounters a runtime error.
#[allow(clippy::future_not_send)]
pub async fn run_server(state: AppState, bind_addr: &str, port: u16) -> std::io::Result<()> {
    let state = web::Data::new(state);

    log::info!("Starting server on {bind_addr}:{port}");

    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(configure)
    })
    .bind((bind_addr, port))?
    .run()
    .await
}
