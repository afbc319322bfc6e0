//! Discovery engine: expand one target into references, edges and access

use serde::Serialize;
use std::sync::Arc;

use crate::db::Database;
use crate::error::CrawlResult;
use crate::models::TargetStatus;
use crate::remote::references::extract_from_items;
use crate::remote::{AccessibleEntity, EntityRef, Fetcher, TaskContext};

/// What expanding one target produced
#[derive(Debug, Clone, Serialize)]
pub struct Expansion {
    pub target: String,
    pub depth: u32,
    pub sampled: usize,
    pub candidates: usize,
    /// Resolved referenced keys, deduplicated, excluding the target itself
    pub referenced: Vec<String>,
    pub new_targets: usize,
    pub new_edges: usize,
}

pub struct DiscoveryEngine {
    db: Arc<Database>,
    fetcher: Fetcher,
    sample_limit: usize,
}

impl DiscoveryEngine {
    pub fn new(db: Arc<Database>, fetcher: Fetcher, sample_limit: usize) -> Self {
        Self {
            db,
            fetcher,
            sample_limit: sample_limit.max(1),
        }
    }

    /// Register seed targets at depth 0
    pub fn register_seeds(&self, seeds: &[String]) -> rusqlite::Result<()> {
        for seed in seeds {
            self.db.upsert_target(&EntityRef::new(seed.as_str()), 0)?;
        }
        Ok(())
    }

    /// Fetch a content sample of `target`, resolve the references in it and
    /// record them. Returns `None` for targets already marked unreachable.
    pub async fn expand(&self, ctx: &TaskContext, run_id: &str, target: &str, depth: u32) -> CrawlResult<Option<Expansion>> {
        if let Some(known) = self.db.get_target(target)? {
            if known.status == TargetStatus::Unreachable {
                log::debug!("[DISCOVERY] skipping unreachable '{}'", target);
                return Ok(None);
            }
        } else {
            self.db.upsert_target(&EntityRef::new(target), depth)?;
        }

        let sample = self
            .fetcher
            .list_entity_content(ctx, target, 0, self.sample_limit)
            .await?;
        let candidates = extract_from_items(&sample);
        let resolved = self.fetcher.resolve_references(ctx, &candidates).await?;

        let summary = self.db.record_expansion(run_id, target, depth, &resolved)?;
        self.db.upsert_access(
            &ctx.credential.id,
            &[AccessibleEntity {
                entity: EntityRef::new(target),
                access_handle: None,
            }],
        )?;

        log::info!(
            "[DISCOVERY] expanded '{}' at depth {}: {} items, {} references ({} new targets, {} new edges)",
            target,
            depth,
            sample.len(),
            summary.referenced.len(),
            summary.new_targets,
            summary.new_edges
        );

        Ok(Some(Expansion {
            target: target.to_string(),
            depth,
            sampled: sample.len(),
            candidates: candidates.len(),
            referenced: summary.referenced,
            new_targets: summary.new_targets,
            new_edges: summary.new_edges,
        }))
    }

    /// Record everything the task's credential can reach
    pub async fn inventory(&self, ctx: &TaskContext) -> CrawlResult<usize> {
        let entities = self.fetcher.list_accessible_entities(ctx).await?;
        let count = self.db.upsert_access(&ctx.credential.id, &entities)?;
        log::info!("[DISCOVERY] '{}' can reach {} entities", ctx.credential.id, count);
        Ok(count)
    }

    pub fn mark_unreachable(&self, target: &str, reason: &str) -> rusqlite::Result<()> {
        log::warn!("[DISCOVERY] '{}' unreachable: {}", target, reason);
        self.db.mark_target_unreachable(target, reason)
    }
}
