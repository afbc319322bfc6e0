//! Liveness for load balancers; no token required

use actix_web::{web, HttpResponse, Responder};

use crate::models::CredentialHealth;
use crate::AppState;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/health").route(web::get().to(health_check)));
    cfg.service(web::resource("/api/version").route(web::get().to(get_version)));
}

/// `stopped` once the worker pool is down, `degraded` when no credential
/// can take work right now
async fn health_check(state: web::Data<AppState>) -> impl Responder {
    let status = state.scheduler.status();
    let usable = status
        .credentials
        .iter()
        .filter(|c| c.health != CredentialHealth::Disabled)
        .count();

    let label = if !status.running {
        "stopped"
    } else if usable == 0 {
        "degraded"
    } else {
        "ok"
    };

    let body = serde_json::json!({
        "status": label,
        "version": VERSION,
        "workers": status.workers,
        "usable_credentials": usable,
        "active_runs": status.active_runs,
        "queued": status.queue.ready + status.queue.delayed,
    });
    if status.running {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

async fn get_version() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": VERSION,
    }))
}
