//! Run control: start, inspect and stop runs; manual resets

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde::Deserialize;
use std::time::Duration;

use crate::error::SchedulerError;
use crate::middleware::control_auth::validate_request;
use crate::remote::Destination;
use crate::scheduler::SyncMode;
use crate::AppState;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/runs")
            .route("", web::get().to(list_runs))
            .route("/discovery", web::post().to(start_discovery))
            .route("/inventory", web::post().to(start_inventory))
            .route("/sync", web::post().to(start_sync))
            .route("/forward", web::post().to(start_forward))
            .route("/{id}", web::get().to(get_run))
            .route("/{id}/wait", web::get().to(wait_run))
            .route("/{id}/stop", web::post().to(stop_run)),
    );
    cfg.service(web::resource("/api/credentials/reset-usage").route(web::post().to(reset_usage)));
    cfg.service(web::resource("/api/credentials/{id}/reset").route(web::post().to(reset_credential)));
    cfg.service(web::resource("/api/routes/{id}/reset").route(web::post().to(reset_route)));
}

#[derive(Debug, Deserialize)]
pub struct DiscoveryRequest {
    #[serde(default)]
    seeds: Vec<String>,
    max_depth: Option<u32>,
    /// Continue from stored, never-expanded targets instead of seeds
    #[serde(default)]
    resume: bool,
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    /// Explicit targets; the stored graph by priority when absent
    targets: Option<Vec<String>>,
    mode: Option<SyncMode>,
    limit: Option<usize>,
    min_priority: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ForwardRequest {
    /// Single origin (selective mode). Ignored when `total` is set.
    origin: Option<String>,
    destination: Option<Destination>,
    #[serde(default)]
    total: bool,
}

#[derive(Debug, Deserialize)]
pub struct WaitParams {
    timeout_secs: Option<u64>,
}

/// Longest a client may block on `/wait`
const MAX_WAIT_SECS: u64 = 300;

fn error_response(e: SchedulerError) -> HttpResponse {
    let body = serde_json::json!({ "error": e.to_string() });
    match e {
        SchedulerError::UnknownRun(_) | SchedulerError::UnknownCredential(_) => HttpResponse::NotFound().json(body),
        SchedulerError::NothingToDo | SchedulerError::NoDestination => HttpResponse::BadRequest().json(body),
        SchedulerError::Store(ref inner) => {
            log::error!("[API] store failure: {}", inner);
            HttpResponse::InternalServerError().json(body)
        }
    }
}

fn started(result: Result<String, SchedulerError>) -> HttpResponse {
    match result {
        Ok(run_id) => HttpResponse::Accepted().json(serde_json::json!({
            "success": true,
            "run_id": run_id,
        })),
        Err(e) => error_response(e),
    }
}

async fn list_runs(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }
    HttpResponse::Ok().json(state.scheduler.list_runs())
}

async fn start_discovery(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<DiscoveryRequest>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }
    let body = body.into_inner();
    if body.resume {
        started(state.scheduler.resume_discovery(body.max_depth))
    } else {
        started(state.scheduler.start_discovery(body.seeds, body.max_depth))
    }
}

async fn start_inventory(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }
    started(state.scheduler.start_inventory())
}

async fn start_sync(state: web::Data<AppState>, req: HttpRequest, body: web::Json<SyncRequest>) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }
    let body = body.into_inner();
    let mode = body.mode.unwrap_or(SyncMode::Incremental);
    match body.targets {
        Some(targets) => started(state.scheduler.start_sync(targets, mode)),
        None if mode == SyncMode::Incremental => started(
            state
                .scheduler
                .start_sync_from_graph(body.limit.unwrap_or(100), body.min_priority.unwrap_or(0.0)),
        ),
        None => HttpResponse::BadRequest().json(serde_json::json!({
            "error": "edit passes need explicit targets"
        })),
    }
}

async fn start_forward(state: web::Data<AppState>, req: HttpRequest, body: web::Json<ForwardRequest>) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }
    let body = body.into_inner();
    if body.total {
        return started(state.scheduler.start_total_forward(body.destination));
    }
    match body.origin {
        Some(origin) => started(state.scheduler.start_forward(&origin, body.destination)),
        None => HttpResponse::BadRequest().json(serde_json::json!({
            "error": "origin is required unless total is set"
        })),
    }
}

async fn get_run(state: web::Data<AppState>, req: HttpRequest, path: web::Path<String>) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }

    let run_id = path.into_inner();
    let Some(summary) = state.scheduler.run_summary(&run_id) else {
        return error_response(SchedulerError::UnknownRun(run_id));
    };
    let tasks = state.db.list_task_runs(&run_id).unwrap_or_else(|e| {
        log::error!("[API] failed to load task journal for {}: {}", run_id, e);
        Vec::new()
    });
    HttpResponse::Ok().json(serde_json::json!({
        "run": summary,
        "tasks": tasks,
    }))
}

/// Block until the run finishes or the timeout passes, then report it
async fn wait_run(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    query: web::Query<WaitParams>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }

    let run_id = path.into_inner();
    let timeout = Duration::from_secs(query.timeout_secs.unwrap_or(30).min(MAX_WAIT_SECS));
    let waited = tokio::time::timeout(timeout, state.scheduler.wait_for_run(&run_id)).await;
    match waited {
        Ok(Ok(summary)) => HttpResponse::Ok().json(summary),
        Ok(Err(e)) => error_response(e),
        Err(_) => match state.scheduler.run_summary(&run_id) {
            Some(summary) => HttpResponse::Accepted().json(summary),
            None => error_response(SchedulerError::UnknownRun(run_id)),
        },
    }
}

async fn stop_run(state: web::Data<AppState>, req: HttpRequest, path: web::Path<String>) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }
    match state.scheduler.stop_run(&path.into_inner()) {
        Ok(summary) => HttpResponse::Ok().json(summary),
        Err(e) => error_response(e),
    }
}

async fn reset_credential(state: web::Data<AppState>, req: HttpRequest, path: web::Path<String>) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }
    match state.scheduler.reset_credential(&path.into_inner()) {
        Ok(status) => HttpResponse::Ok().json(status),
        Err(e) => error_response(e),
    }
}

/// Zero usage counters so rotation starts level again
async fn reset_usage(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }
    match state.scheduler.reset_usage() {
        Ok(statuses) => HttpResponse::Ok().json(serde_json::json!({ "reset": statuses })),
        Err(e) => error_response(e),
    }
}

async fn reset_route(state: web::Data<AppState>, req: HttpRequest, path: web::Path<String>) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }
    let route_id = path.into_inner();
    if state.scheduler.reset_route(&route_id) {
        HttpResponse::Ok().json(serde_json::json!({ "success": true, "route": route_id }))
    } else {
        HttpResponse::NotFound().json(serde_json::json!({
            "error": format!("unknown route '{}'", route_id)
        }))
    }
}
