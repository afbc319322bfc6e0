//! Bearer-token check for the control API
//!
//! When `CONTROL_TOKEN` is unset every request is accepted.

use actix_web::{HttpRequest, HttpResponse};

use crate::config::Config;

pub fn extract_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim_start_matches("Bearer ").trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn validate_request(config: &Config, req: &HttpRequest) -> Result<(), HttpResponse> {
    let Some(expected) = config.control_token.as_deref() else {
        return Ok(());
    };

    let token = extract_token(req).ok_or_else(|| {
        HttpResponse::Unauthorized().json(serde_json::json!({
            "error": "No authorization token provided"
        }))
    })?;

    if token == expected {
        Ok(())
    } else {
        log::warn!("[API] rejected control request to {}", req.path());
        Err(HttpResponse::Unauthorized().json(serde_json::json!({
            "error": "Invalid control token"
        })))
    }
}
