//! Scheduler status and per-target views

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde::Deserialize;

use crate::middleware::control_auth::validate_request;
use crate::AppState;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/status").route(web::get().to(get_status)));
    cfg.service(
        web::scope("/api/targets")
            .route("", web::get().to(list_targets))
            .route("/{key}", web::get().to(get_target))
            .route("/{key}/messages", web::get().to(list_messages))
            .route("/{key}/messages/{id}", web::get().to(get_message))
            .route("/{key}/verify", web::get().to(verify_target))
            .route("/{key}/reset", web::post().to(reset_target)),
    );
}

#[derive(Debug, Deserialize)]
pub struct TargetParams {
    limit: Option<usize>,
    min_priority: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct MessageParams {
    after: Option<i64>,
    limit: Option<usize>,
}

fn internal_error(context: &str, e: rusqlite::Error) -> HttpResponse {
    log::error!("[API] {}: {}", context, e);
    HttpResponse::InternalServerError().json(serde_json::json!({
        "error": "Internal server error"
    }))
}

async fn get_status(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }
    HttpResponse::Ok().json(state.scheduler.status())
}

/// Targets by descending priority, unreachable ones excluded
async fn list_targets(
    state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<TargetParams>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }

    let limit = query.limit.unwrap_or(100).min(10_000);
    let min_priority = query.min_priority.unwrap_or(0.0);
    match state.db.priority_targets(limit, min_priority) {
        Ok(targets) => HttpResponse::Ok().json(serde_json::json!({
            "count": targets.len(),
            "targets": targets,
        })),
        Err(e) => internal_error("failed to list targets", e),
    }
}

async fn get_target(state: web::Data<AppState>, req: HttpRequest, path: web::Path<String>) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }

    let key = path.into_inner();
    let target = match state.db.get_target(&key) {
        Ok(Some(target)) => target,
        Ok(None) => {
            return HttpResponse::NotFound().json(serde_json::json!({
                "error": format!("unknown target '{}'", key)
            }));
        }
        Err(e) => return internal_error("failed to load target", e),
    };

    let archive = match state.db.archive_stats(&key) {
        Ok(stats) => stats,
        Err(e) => return internal_error("failed to load archive stats", e),
    };
    let access = match state.db.access_for_target(&key) {
        Ok(records) => records,
        Err(e) => return internal_error("failed to load access records", e),
    };

    HttpResponse::Ok().json(serde_json::json!({
        "target": target,
        "archive": archive,
        "access": access,
    }))
}

/// Archived messages of one target in id order
async fn list_messages(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    query: web::Query<MessageParams>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }

    let key = path.into_inner();
    let limit = query.limit.unwrap_or(100).min(1000);
    match state.db.list_messages(&key, query.after.unwrap_or(0), limit) {
        Ok(messages) => HttpResponse::Ok().json(serde_json::json!({
            "target": key,
            "count": messages.len(),
            "messages": messages,
        })),
        Err(e) => internal_error("failed to list messages", e),
    }
}

async fn get_message(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<(String, i64)>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }

    let (key, id) = path.into_inner();
    match state.db.get_message(&key, id) {
        Ok(Some(message)) => HttpResponse::Ok().json(message),
        Ok(None) => HttpResponse::NotFound().json(serde_json::json!({
            "error": format!("no message {} in '{}'", id, key)
        })),
        Err(e) => internal_error("failed to load message", e),
    }
}

async fn verify_target(state: web::Data<AppState>, req: HttpRequest, path: web::Path<String>) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }

    match state.scheduler.verify_checksums(&path.into_inner()) {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => internal_error("checksum verification failed", e),
    }
}

/// Clear an unreachable mark so the target is crawled again
async fn reset_target(state: web::Data<AppState>, req: HttpRequest, path: web::Path<String>) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }

    let key = path.into_inner();
    match state.scheduler.reset_target(&key) {
        Ok(true) => {
            log::info!("[API] target '{}' reset", key);
            HttpResponse::Ok().json(serde_json::json!({ "success": true, "target": key }))
        }
        Ok(false) => HttpResponse::NotFound().json(serde_json::json!({
            "error": format!("unknown target '{}'", key)
        })),
        Err(e) => {
            log::error!("[API] failed to reset target '{}': {}", key, e);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "Internal server error"
            }))
        }
    }
}
