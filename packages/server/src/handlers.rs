//! HTTP handler functions for the georisk API.

use actix_web::{HttpResponse, web};
use chrono::Utc;
use georisk_database as db;
use georisk_monitor_models::{NewRun, RunTrigger};
use georisk_scheduler::{ScheduleServiceError, TickOutcome};
use georisk_server_models::{
    AcknowledgeRequest, ApiArea, ApiError, ApiHealth, ApiRiskEvent, ApiRun, ApiTickResult,
    DismissRequest, ManualRunRequest, RiskEventsQueryParams, RunsQueryParams,
    ScheduleUpdateRequest,
};

use crate::AppState;

const DEFAULT_RUN_LIMIT: u32 = 20;
const MAX_RUN_LIMIT: u32 = 500;

fn internal_error(context: &str, e: &dyn std::fmt::Display) -> HttpResponse {
    log::error!("{context}: {e}");
    HttpResponse::InternalServerError().json(ApiError::new(context))
}

fn not_found(message: String) -> HttpResponse {
    HttpResponse::NotFound().json(ApiError::new(message))
}

/// `GET /api/health`
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(ApiHealth {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `GET /api/areas`
pub async fn list_areas(state: web::Data<AppState>) -> HttpResponse {
    match db::list_areas(state.db.as_ref()).await {
        Ok(areas) => {
            let areas: Vec<ApiArea> = areas
                .into_iter()
                .map(|area| ApiArea::new(area, None))
                .collect();
            HttpResponse::Ok().json(areas)
        }
        Err(e) => internal_error("Failed to list areas", &e),
    }
}

/// `GET /api/areas/{id}`
pub async fn get_area(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let area_id = path.into_inner();

    let area = match db::get_area(state.db.as_ref(), &area_id).await {
        Ok(Some(area)) => area,
        Ok(None) => return not_found(format!("Area {area_id} not found")),
        Err(e) => return internal_error("Failed to load area", &e),
    };

    match db::find_active_run(state.db.as_ref(), &area_id).await {
        Ok(active) => HttpResponse::Ok().json(ApiArea::new(area, active)),
        Err(e) => internal_error("Failed to load active run", &e),
    }
}

/// `PATCH /api/areas/{id}/schedule`
///
/// Validation failures are `400`; nothing is stored in that case.
pub async fn update_schedule(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ScheduleUpdateRequest>,
) -> HttpResponse {
    let area_id = path.into_inner();
    let update = body.into_inner().into();

    match state.schedules.apply_update(&area_id, &update).await {
        Ok(area) => {
            log::info!(
                "Schedule of area {area_id} updated: cron={:?} enabled={}",
                area.schedule_cron,
                area.schedule_enabled
            );
            HttpResponse::Ok().json(ApiArea::new(area, None))
        }
        Err(ScheduleServiceError::AreaNotFound(_)) => {
            not_found(format!("Area {area_id} not found"))
        }
        Err(e @ (ScheduleServiceError::Validation(_) | ScheduleServiceError::Trigger(_))) => {
            HttpResponse::BadRequest().json(ApiError::new(e.to_string()))
        }
        Err(e @ ScheduleServiceError::Database(_)) => {
            internal_error("Failed to update schedule", &e)
        }
    }
}

/// `POST /api/areas/{id}/check`
///
/// Runs one tick for the area right away. Every outcome other than an
/// unknown area is a `200` describing what happened.
pub async fn check_area(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let area_id = path.into_inner();

    let result = match state.scheduler.on_tick(&area_id).await {
        TickOutcome::AreaNotFound => return not_found(format!("Area {area_id} not found")),
        TickOutcome::AlreadyTicking => ApiTickResult::outcome("already_ticking"),
        TickOutcome::Skipped { active_run_id } => ApiTickResult {
            run_id: active_run_id,
            ..ApiTickResult::outcome("skipped")
        },
        TickOutcome::NoNewData => ApiTickResult::outcome("no_new_data"),
        TickOutcome::CheckFailed { message } => ApiTickResult {
            message: Some(message),
            ..ApiTickResult::outcome("check_failed")
        },
        TickOutcome::TimedOut => ApiTickResult::outcome("timed_out"),
        TickOutcome::Triggered {
            run_id,
            before_date,
            after_date,
        } => ApiTickResult {
            run_id: Some(run_id),
            before_date: Some(before_date),
            after_date: Some(after_date),
            ..ApiTickResult::outcome("triggered")
        },
    };

    HttpResponse::Ok().json(result)
}

/// `GET /api/areas/{id}/runs`
pub async fn list_runs(
    state: web::Data<AppState>,
    path: web::Path<String>,
    params: web::Query<RunsQueryParams>,
) -> HttpResponse {
    let area_id = path.into_inner();
    let limit = params
        .limit
        .unwrap_or(DEFAULT_RUN_LIMIT)
        .clamp(1, MAX_RUN_LIMIT);

    match db::list_runs(state.db.as_ref(), &area_id, limit).await {
        Ok(runs) => {
            let runs: Vec<ApiRun> = runs.into_iter().map(ApiRun::from).collect();
            HttpResponse::Ok().json(runs)
        }
        Err(e) => internal_error("Failed to list runs", &e),
    }
}

/// `POST /api/areas/{id}/runs`
///
/// Creates a manual run and starts it. Answers `409` with the blocking
/// run's id while the area has a run in flight.
pub async fn create_run(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ManualRunRequest>,
) -> HttpResponse {
    let area_id = path.into_inner();
    let request = body.into_inner();

    match db::get_area(state.db.as_ref(), &area_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(format!("Area {area_id} not found")),
        Err(e) => return internal_error("Failed to load area", &e),
    }

    let mut new_run = NewRun::new(
        &area_id,
        request.before_date,
        request.after_date,
        RunTrigger::Manual,
    );
    new_run.before_scene_id = request.before_scene_id;
    new_run.after_scene_id = request.after_scene_id;
    if let Err(e) = new_run.validate() {
        return HttpResponse::BadRequest().json(ApiError::new(e.to_string()));
    }

    match db::claim_run(state.db.as_ref(), &new_run).await {
        Ok(Some(run)) => {
            log::info!(
                "Manual run {} created for area {area_id}: {} -> {}",
                run.id,
                run.before_date,
                run.after_date
            );
            state.launcher.launch(run.id.clone());
            HttpResponse::Accepted().json(ApiRun::from(run))
        }
        Ok(None) => {
            let active_run_id = db::find_active_run(state.db.as_ref(), &area_id)
                .await
                .ok()
                .flatten()
                .map(|run| run.id);
            HttpResponse::Conflict().json(ApiError {
                error: format!("Area {area_id} already has a run in progress"),
                active_run_id,
            })
        }
        Err(e) => internal_error("Failed to create run", &e),
    }
}

/// `GET /api/runs/{id}`
pub async fn get_run(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let run_id = path.into_inner();
    match db::get_run(state.db.as_ref(), &run_id).await {
        Ok(Some(run)) => HttpResponse::Ok().json(ApiRun::from(run)),
        Ok(None) => not_found(format!("Run {run_id} not found")),
        Err(e) => internal_error("Failed to load run", &e),
    }
}

/// `GET /api/runs/{id}/events`
///
/// Risk events of a run, highest score first. Dismissed events are left
/// out unless `includeDismissed=true`.
pub async fn run_events(
    state: web::Data<AppState>,
    path: web::Path<String>,
    params: web::Query<RiskEventsQueryParams>,
) -> HttpResponse {
    let run_id = path.into_inner();

    match db::get_run(state.db.as_ref(), &run_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(format!("Run {run_id} not found")),
        Err(e) => return internal_error("Failed to load run", &e),
    }

    match db::list_risk_events_for_run(state.db.as_ref(), &run_id, params.include_dismissed).await
    {
        Ok(events) => {
            let events: Vec<ApiRiskEvent> = events.into_iter().map(ApiRiskEvent::from).collect();
            HttpResponse::Ok().json(events)
        }
        Err(e) => internal_error("Failed to list risk events", &e),
    }
}

/// `POST /api/events/{id}/acknowledge`
pub async fn acknowledge_event(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<AcknowledgeRequest>,
) -> HttpResponse {
    let event_id = path.into_inner();
    let by = body.acknowledged_by.trim();
    if by.is_empty() {
        return HttpResponse::BadRequest().json(ApiError::new("acknowledgedBy is required"));
    }

    match db::acknowledge_risk_event(state.db.as_ref(), &event_id, by, Utc::now()).await {
        Ok(true) => event_response(&state, &event_id).await,
        Ok(false) => not_found(format!("Risk event {event_id} not found")),
        Err(e) => internal_error("Failed to acknowledge risk event", &e),
    }
}

/// `POST /api/events/{id}/dismiss`
pub async fn dismiss_event(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<DismissRequest>,
) -> HttpResponse {
    let event_id = path.into_inner();
    let reason = body
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty());

    match db::dismiss_risk_event(state.db.as_ref(), &event_id, reason).await {
        Ok(true) => event_response(&state, &event_id).await,
        Ok(false) => not_found(format!("Risk event {event_id} not found")),
        Err(e) => internal_error("Failed to dismiss risk event", &e),
    }
}

async fn event_response(state: &AppState, event_id: &str) -> HttpResponse {
    match db::get_risk_event(state.db.as_ref(), event_id).await {
        Ok(Some(event)) => HttpResponse::Ok().json(ApiRiskEvent::from(event)),
        Ok(None) => not_found(format!("Risk event {event_id} not found")),
        Err(e) => internal_error("Failed to load risk event", &e),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use actix_web::{App, http::StatusCode, test};
    use async_trait::async_trait;
    use georisk_imagery::{ImageryCheck, ProtocolError};
    use georisk_monitor_models::{ImageryCheckResult, MonitoredArea, RunStatus};
    use georisk_scheduler::{
        ExternalTriggerAdapter, MonitorScheduler, RunLauncher, ScheduleService, TriggerAdapter,
    };
    use switchy_database::Database;

    use super::*;

    struct Store {
        db: Arc<dyn Database>,
        path: PathBuf,
    }

    impl Store {
        async fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "georisk_server_{name}_{}.sqlite",
                std::process::id()
            ));
            let _ = std::fs::remove_file(&path);
            let db: Arc<dyn Database> = Arc::from(db::open_db(&path).await.unwrap());
            db::upsert_area(
                db.as_ref(),
                &MonitoredArea {
                    id: "ridge".to_string(),
                    name: "Ridge".to_string(),
                    boundary_geojson:
                        r#"{"type":"Polygon","coordinates":[[[7,46],[7.1,46],[7.1,46.1],[7,46]]]}"#
                            .to_string(),
                    schedule_cron: None,
                    schedule_enabled: false,
                    max_cloud_cover: 20.0,
                    lookback_days: 90,
                    last_checked_at: None,
                    last_processed_at: None,
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();
            Self { db, path }
        }
    }

    impl Drop for Store {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    struct SceneOnDec1;

    #[async_trait]
    impl ImageryCheck for SceneOnDec1 {
        async fn check(
            &self,
            _area: &MonitoredArea,
            _max_cloud_cover: f64,
        ) -> Result<ImageryCheckResult, ProtocolError> {
            let date = "2018-12-01".parse().ok();
            Ok(ImageryCheckResult {
                new_data: true,
                scene_id: Some("S2B_20181201".to_string()),
                scene_date: date,
                cloud_cover: Some(4.0),
                recommended_before_date: date,
                recommended_after_date: date,
            })
        }
    }

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<String>>,
    }

    impl RunLauncher for RecordingLauncher {
        fn launch(&self, run_id: String) {
            self.launched.lock().unwrap().push(run_id);
        }
    }

    struct Harness {
        store: Store,
        adapter: Arc<ExternalTriggerAdapter>,
        launcher: Arc<RecordingLauncher>,
    }

    impl Harness {
        async fn new(name: &str) -> Self {
            Self {
                store: Store::new(name).await,
                adapter: Arc::new(ExternalTriggerAdapter::new("georisk")),
                launcher: Arc::new(RecordingLauncher::default()),
            }
        }

        fn state(&self) -> web::Data<AppState> {
            let db = self.store.db.clone();
            web::Data::new(AppState {
                scheduler: Arc::new(MonitorScheduler::new(
                    db.clone(),
                    Arc::new(SceneOnDec1),
                    self.launcher.clone(),
                )),
                schedules: Arc::new(ScheduleService::new(db.clone(), self.adapter.clone())),
                launcher: self.launcher.clone(),
                db,
            })
        }
    }

    macro_rules! app {
        ($harness:expr) => {
            test::init_service(
                App::new()
                    .app_data($harness.state())
                    .configure(crate::configure),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn health_reports_version() {
        let harness = Harness::new("health").await;
        let app = app!(harness);
        let request = test::TestRequest::get().uri("/api/health").to_request();
        let body: ApiHealth = test::call_and_read_body_json(&app, request).await;
        assert!(body.healthy);
    }

    #[actix_web::test]
    async fn schedule_patch_registers_and_rejects_bad_input() {
        let harness = Harness::new("schedule").await;
        let app = app!(harness);

        let response = test::call_service(
            &app,
            test::TestRequest::patch()
                .uri("/api/areas/ridge/schedule")
                .set_json(serde_json::json!({
                    "scheduleCron": "0 6 * * *",
                    "scheduleEnabled": true,
                    "maxCloudCover": 25.0
                }))
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let area: ApiArea = test::read_body_json(response).await;
        assert_eq!(area.schedule_cron.as_deref(), Some("0 6 * * *"));
        assert_eq!(harness.adapter.registered().len(), 1);

        for body in [
            serde_json::json!({ "maxCloudCover": 101.0 }),
            serde_json::json!({ "lookbackDays": 401 }),
            serde_json::json!({ "scheduleCron": "bogus" }),
        ] {
            let response = test::call_service(
                &app,
                test::TestRequest::patch()
                    .uri("/api/areas/ridge/schedule")
                    .set_json(&body)
                    .to_request(),
            )
            .await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        }

        let response = test::call_service(
            &app,
            test::TestRequest::patch()
                .uri("/api/areas/ridge/schedule")
                .set_json(serde_json::json!({ "scheduleCron": "" }))
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(harness.adapter.registered().is_empty());

        let response = test::call_service(
            &app,
            test::TestRequest::patch()
                .uri("/api/areas/nowhere/schedule")
                .set_json(serde_json::json!({}))
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn check_triggers_a_chained_run() {
        let harness = Harness::new("check").await;
        let app = app!(harness);

        let result: ApiTickResult = test::call_and_read_body_json(
            &app,
            test::TestRequest::post()
                .uri("/api/areas/ridge/check")
                .to_request(),
        )
        .await;
        assert_eq!(result.outcome, "triggered");
        assert_eq!(result.before_date, "2018-09-02".parse().ok());
        assert_eq!(result.after_date, "2018-12-01".parse().ok());

        let again: ApiTickResult = test::call_and_read_body_json(
            &app,
            test::TestRequest::post()
                .uri("/api/areas/ridge/check")
                .to_request(),
        )
        .await;
        assert_eq!(again.outcome, "skipped");
        assert_eq!(again.run_id, result.run_id);

        let area: ApiArea = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/api/areas/ridge").to_request(),
        )
        .await;
        assert_eq!(area.active_run.map(|r| r.id), result.run_id);
    }

    #[actix_web::test]
    async fn manual_run_conflicts_while_one_is_in_flight() {
        let harness = Harness::new("manual").await;
        let app = app!(harness);
        let body = serde_json::json!({ "beforeDate": "2024-01-01", "afterDate": "2024-02-01" });

        let response = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/areas/ridge/runs")
                .set_json(&body)
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let run: ApiRun = test::read_body_json(response).await;
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.trigger, Some(RunTrigger::Manual));
        assert_eq!(harness.launcher.launched.lock().unwrap().clone(), vec![run.id.clone()]);

        let response = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/areas/ridge/runs")
                .set_json(&body)
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let error: ApiError = test::read_body_json(response).await;
        assert_eq!(error.active_run_id, Some(run.id.clone()));

        let fetched: ApiRun = test::call_and_read_body_json(
            &app,
            test::TestRequest::get()
                .uri(&format!("/api/runs/{}", run.id))
                .to_request(),
        )
        .await;
        assert_eq!(fetched.id, run.id);

        let runs: Vec<ApiRun> = test::call_and_read_body_json(
            &app,
            test::TestRequest::get()
                .uri("/api/areas/ridge/runs?limit=5")
                .to_request(),
        )
        .await;
        assert_eq!(runs.len(), 1);
    }

    #[actix_web::test]
    async fn manual_run_rejects_inverted_dates() {
        let harness = Harness::new("manual_dates").await;
        let app = app!(harness);
        let response = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/areas/ridge/runs")
                .set_json(serde_json::json!({ "beforeDate": "2024-02-01", "afterDate": "2024-02-01" }))
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(harness.launcher.launched.lock().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn unknown_ids_are_not_found() {
        let harness = Harness::new("not_found").await;
        let app = app!(harness);
        for (method, uri) in [
            ("GET", "/api/areas/nowhere"),
            ("POST", "/api/areas/nowhere/check"),
            ("GET", "/api/runs/nothing"),
            ("GET", "/api/runs/nothing/events"),
        ] {
            let request = if method == "GET" {
                test::TestRequest::get()
            } else {
                test::TestRequest::post()
            };
            let response = test::call_service(&app, request.uri(uri).to_request()).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method} {uri}");
        }

        let response = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/events/nothing/dismiss")
                .set_json(serde_json::json!({ "reason": "duplicate" }))
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
