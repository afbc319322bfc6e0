//! HTTP bridge client
//!
//! Production `RemoteClient`. The remote service is reached through a
//! bridge that exposes the crawler's calls as JSON POSTs; each egress
//! route gets its own `reqwest::Client` configured with that proxy.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use super::{AccessibleEntity, EntityRef, RelayRequest, RemoteClient, RemoteItem, Session};
use crate::error::FetchFailure;
use crate::models::EgressRoute;

/// Pause applied when the remote rate-limits without saying for how long
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

const USER_AGENT: &str = concat!("spectra-backend/", env!("CARGO_PKG_VERSION"));

/// Error body returned by the bridge
#[derive(Debug, Default, Deserialize)]
struct BridgeError {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Deserialize)]
struct ItemsResponse {
    items: Vec<RemoteItem>,
}

#[derive(Deserialize)]
struct EntitiesResponse<T> {
    entities: Vec<T>,
}

#[derive(Serialize)]
struct SessionBody<'a> {
    name: &'a str,
    api_id: i64,
    api_hash: &'a str,
    phone: Option<&'a str>,
}

pub struct HttpRemoteClient {
    endpoint: String,
    timeout: Duration,
    clients: DashMap<String, reqwest::Client>,
}

impl HttpRemoteClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout,
            clients: DashMap::new(),
        }
    }

    fn client_for(&self, route: &EgressRoute) -> Result<reqwest::Client, FetchFailure> {
        if let Some(client) = self.clients.get(&route.id) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT);

        if !route.is_direct() {
            let mut proxy = reqwest::Proxy::all(route.display_endpoint())
                .map_err(|e| FetchFailure::Unknown(format!("invalid proxy {}: {}", route.id, e)))?;
            if let (Some(user), Some(password)) = (&route.username, &route.password) {
                proxy = proxy.basic_auth(user, password);
            }
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| FetchFailure::Unknown(format!("failed to build client for {}: {}", route.id, e)))?;
        self.clients.insert(route.id.clone(), client.clone());
        Ok(client)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        session: Session<'_>,
        op: &str,
        args: serde_json::Value,
    ) -> Result<T, FetchFailure> {
        let client = self.client_for(session.route)?;
        let body = json!({
            "session": SessionBody {
                name: &session.credential.id,
                api_id: session.credential.api_id,
                api_hash: &session.credential.api_hash,
                phone: session.credential.phone.as_deref(),
            },
            "args": args,
        });

        let response = client
            .post(format!("{}/v1/{}", self.endpoint, op))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| FetchFailure::Unknown(format!("invalid {} response: {}", op, e)));
        }

        let header_retry = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let error: BridgeError = response.json().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), header_retry, &error))
    }
}

/// Map a bridge HTTP status to a failure class
fn classify_status(status: u16, header_retry: Option<u64>, error: &BridgeError) -> FetchFailure {
    let message = error
        .error
        .clone()
        .unwrap_or_else(|| format!("HTTP {}", status));
    let code = error.code.as_deref().unwrap_or("").to_ascii_lowercase();
    let auth_code = code.contains("auth") || code.contains("session") || code.contains("revoked");

    match status {
        420 | 429 => FetchFailure::RateLimited {
            retry_after: Duration::from_secs(
                error
                    .retry_after
                    .or(header_retry)
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS),
            ),
        },
        401 => FetchFailure::AuthInvalid(message),
        403 if auth_code => FetchFailure::AuthInvalid(message),
        403 | 404 | 410 => FetchFailure::TargetUnreachable(message),
        408 | 500..=599 => FetchFailure::TransientNetwork(message),
        _ => FetchFailure::Unknown(message),
    }
}

fn classify_transport_error(err: &reqwest::Error) -> FetchFailure {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        FetchFailure::TransientNetwork(err.to_string())
    } else {
        FetchFailure::Unknown(err.to_string())
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn list_entity_content(
        &self,
        session: Session<'_>,
        entity: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RemoteItem>, FetchFailure> {
        let response: ItemsResponse = self
            .call(
                session,
                "list_entity_content",
                json!({ "entity": entity, "after_id": after_id, "limit": limit }),
            )
            .await?;
        Ok(response.items)
    }

    async fn get_items(&self, session: Session<'_>, entity: &str, ids: &[i64]) -> Result<Vec<RemoteItem>, FetchFailure> {
        let response: ItemsResponse = self
            .call(session, "get_items", json!({ "entity": entity, "ids": ids }))
            .await?;
        Ok(response.items)
    }

    async fn resolve_references(
        &self,
        session: Session<'_>,
        candidates: &[String],
    ) -> Result<Vec<EntityRef>, FetchFailure> {
        let response: EntitiesResponse<EntityRef> = self
            .call(session, "resolve_references", json!({ "candidates": candidates }))
            .await?;
        Ok(response.entities)
    }

    async fn relay(&self, session: Session<'_>, request: &RelayRequest) -> Result<(), FetchFailure> {
        let _: serde_json::Value = self
            .call(session, "relay", serde_json::to_value(request).unwrap_or_default())
            .await?;
        Ok(())
    }

    async fn list_accessible_entities(&self, session: Session<'_>) -> Result<Vec<AccessibleEntity>, FetchFailure> {
        let response: EntitiesResponse<AccessibleEntity> = self
            .call(session, "list_accessible_entities", json!({}))
            .await?;
        Ok(response.entities)
    }
}
