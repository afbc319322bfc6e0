//! Whole-store views: the discovery graph, archive totals, relay logs

use actix_web::{web, HttpRequest, HttpResponse, Responder};

use crate::middleware::control_auth::validate_request;
use crate::models::Checkpoint;
use crate::AppState;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/graph").route(web::get().to(get_graph)));
    cfg.service(web::resource("/api/archive").route(web::get().to(get_archive)));
    cfg.service(web::resource("/api/relays/{destination}").route(web::get().to(get_relays)));
}

fn internal_error(context: &str, e: rusqlite::Error) -> HttpResponse {
    log::error!("[API] {}: {}", context, e);
    HttpResponse::InternalServerError().json(serde_json::json!({
        "error": "Internal server error"
    }))
}

/// Every known target and reference edge
async fn get_graph(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }

    let targets = match state.db.list_targets() {
        Ok(targets) => targets,
        Err(e) => return internal_error("failed to list targets", e),
    };
    match state.db.list_edges() {
        Ok(edges) => HttpResponse::Ok().json(serde_json::json!({
            "targets": targets,
            "edges": edges,
        })),
        Err(e) => internal_error("failed to list edges", e),
    }
}

/// Sync checkpoints per target and the media count
async fn get_archive(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }

    let checkpoints = match state.db.list_checkpoints(&Checkpoint::sync_context("")) {
        Ok(checkpoints) => checkpoints,
        Err(e) => return internal_error("failed to list checkpoints", e),
    };
    match state.db.count_media() {
        Ok(media) => HttpResponse::Ok().json(serde_json::json!({
            "targets": checkpoints.len(),
            "media": media,
            "checkpoints": checkpoints,
        })),
        Err(e) => internal_error("failed to count media", e),
    }
}

/// Items relayed to one destination and the per-origin progress
async fn get_relays(state: web::Data<AppState>, req: HttpRequest, path: web::Path<String>) -> impl Responder {
    if let Err(resp) = validate_request(&state.config, &req) {
        return resp;
    }

    let destination = path.into_inner();
    let relayed = match state.db.count_relays(&destination) {
        Ok(count) => count,
        Err(e) => return internal_error("failed to count relays", e),
    };
    let suffix = format!("->{}", destination);
    match state.db.list_checkpoints("forward:") {
        Ok(checkpoints) => {
            let streams: Vec<Checkpoint> = checkpoints
                .into_iter()
                .filter(|c| c.context.ends_with(&suffix))
                .collect();
            HttpResponse::Ok().json(serde_json::json!({
                "destination": destination,
                "relayed": relayed,
                "streams": streams,
            }))
        }
        Err(e) => internal_error("failed to list checkpoints", e),
    }
}
