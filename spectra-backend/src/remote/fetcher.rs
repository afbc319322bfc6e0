//! Fetcher: one remote call under one credential + route, with a deadline
//!
//! The fetcher never retries. It checks the run's cancellation token before
//! each call, bounds the call with a timeout and hands the classified
//! failure back to the scheduler.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{AccessibleEntity, EntityRef, RelayRequest, RemoteClient, RemoteItem, Session};
use crate::error::{CrawlError, CrawlResult, FetchFailure};
use crate::models::{Credential, EgressRoute};

/// What a running task holds: its checked-out pair and its run's token
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub credential: Arc<Credential>,
    pub route: Arc<EgressRoute>,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn session(&self) -> Session<'_> {
        Session {
            credential: &self.credential,
            route: &self.route,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Clone)]
pub struct Fetcher {
    client: Arc<dyn RemoteClient>,
    call_timeout: Duration,
}

impl Fetcher {
    pub fn new(client: Arc<dyn RemoteClient>, call_timeout: Duration) -> Self {
        Self { client, call_timeout }
    }

    async fn guarded<T, F>(&self, ctx: &TaskContext, op: &str, call: F) -> CrawlResult<T>
    where
        F: Future<Output = Result<T, FetchFailure>>,
    {
        if ctx.is_cancelled() {
            return Err(CrawlError::Cancelled);
        }

        // Once started, a call runs to completion or to its deadline
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => {
                log::debug!(
                    "[FETCHER] {} failed for task {} on '{}' ({}, retryable: {}): {}",
                    op,
                    ctx.task_id,
                    ctx.credential.id,
                    failure.kind(),
                    failure.is_retryable(),
                    failure
                );
                Err(failure.into())
            }
            Err(_) => {
                log::debug!("[FETCHER] {} timed out for task {}", op, ctx.task_id);
                Err(FetchFailure::TransientNetwork(format!(
                    "{} timed out after {}s",
                    op,
                    self.call_timeout.as_secs()
                ))
                .into())
            }
        }
    }

    pub async fn list_entity_content(
        &self,
        ctx: &TaskContext,
        entity: &str,
        after_id: i64,
        limit: usize,
    ) -> CrawlResult<Vec<RemoteItem>> {
        self.guarded(
            ctx,
            "list_entity_content",
            self.client.list_entity_content(ctx.session(), entity, after_id, limit),
        )
        .await
    }

    pub async fn get_items(&self, ctx: &TaskContext, entity: &str, ids: &[i64]) -> CrawlResult<Vec<RemoteItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.guarded(ctx, "get_items", self.client.get_items(ctx.session(), entity, ids))
            .await
    }

    /// Resolve candidates; no remote call when there is nothing to resolve
    pub async fn resolve_references(&self, ctx: &TaskContext, candidates: &[String]) -> CrawlResult<Vec<EntityRef>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        self.guarded(
            ctx,
            "resolve_references",
            self.client.resolve_references(ctx.session(), candidates),
        )
        .await
    }

    pub async fn relay(&self, ctx: &TaskContext, request: &RelayRequest) -> CrawlResult<()> {
        self.guarded(ctx, "relay", self.client.relay(ctx.session(), request))
            .await
    }

    pub async fn list_accessible_entities(&self, ctx: &TaskContext) -> CrawlResult<Vec<AccessibleEntity>> {
        self.guarded(
            ctx,
            "list_accessible_entities",
            self.client.list_accessible_entities(ctx.session()),
        )
        .await
    }
}
