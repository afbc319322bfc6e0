//! Forwarding engine: paced relay of archived content between entities
//!
//! A stream relays one origin to one destination from a per-pair
//! checkpoint. Every relay is logged per destination, so an item reaches a
//! destination at most once no matter how many credentials can see it.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::db::Database;
use crate::error::{CrawlError, CrawlResult};
use crate::models::Checkpoint;
use crate::remote::{Destination, Fetcher, RelayRequest, RemoteItem, TaskContext};

#[derive(Debug, Clone)]
pub struct ForwardSettings {
    /// Pause between two relays of one stream
    pub relay_interval: Duration,
    /// Prefix provenance when not relaying into a topic
    pub prepend_origin_info: bool,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ForwardReport {
    pub origin: String,
    pub destination: String,
    pub relayed: usize,
    pub skipped: usize,
    pub last_item: i64,
}

pub struct ForwardingEngine {
    db: Arc<Database>,
    fetcher: Fetcher,
    settings: ForwardSettings,
}

impl ForwardingEngine {
    pub fn new(db: Arc<Database>, fetcher: Fetcher, settings: ForwardSettings) -> Self {
        Self { db, fetcher, settings }
    }

    /// Relay everything from `origin` to `destination` that this
    /// destination has not received yet. Ids of items relayed for the
    /// first time are pushed to `fanout` so personal-archive copies can be
    /// scheduled even if the stream stops early.
    pub async fn relay_stream(
        &self,
        ctx: &TaskContext,
        origin: &str,
        destination: &Destination,
        fanout: &mut Vec<i64>,
    ) -> CrawlResult<ForwardReport> {
        let dest_key = destination.log_key(&ctx.credential.id);
        let context = Checkpoint::forward_context(origin, &dest_key);
        let mut marker = self.db.checkpoint_marker(&context)?;
        let title = self.origin_title(origin)?;
        let mut report = ForwardReport {
            origin: origin.to_string(),
            destination: dest_key.clone(),
            last_item: marker,
            ..Default::default()
        };

        loop {
            let mut items = self
                .fetcher
                .list_entity_content(ctx, origin, marker, self.settings.batch_size.max(1))
                .await?;
            items.retain(|item| item.id > marker);
            items.sort_by_key(|item| item.id);
            if items.is_empty() {
                break;
            }

            for item in &items {
                if self.db.has_relayed(&dest_key, origin, item.id)? {
                    report.skipped += 1;
                } else {
                    let request = RelayRequest {
                        origin: origin.to_string(),
                        item_id: item.id,
                        destination: destination.clone(),
                        text_override: self.provenance(&title, origin, destination, item),
                    };
                    self.fetcher.relay(ctx, &request).await?;
                    self.db.record_relay(&dest_key, origin, item.id, &ctx.credential.id)?;
                    report.relayed += 1;
                    fanout.push(item.id);
                    self.pace(ctx).await?;
                }

                self.db.advance_checkpoint(&context, item.id)?;
                marker = item.id;
                report.last_item = item.id;
            }
        }

        log::info!(
            "[FORWARD] {} -> {}: {} relayed, {} already present",
            origin,
            dest_key,
            report.relayed,
            report.skipped
        );
        Ok(report)
    }

    /// Relay one item into the task credential's personal archive.
    /// Returns false if it was already there.
    pub async fn relay_personal(&self, ctx: &TaskContext, origin: &str, item_id: i64) -> CrawlResult<bool> {
        let destination = Destination::Personal;
        let dest_key = destination.log_key(&ctx.credential.id);
        if self.db.has_relayed(&dest_key, origin, item_id)? {
            return Ok(false);
        }

        // Personal copies are plain forwards; the remote keeps their origin
        let request = RelayRequest {
            origin: origin.to_string(),
            item_id,
            destination,
            text_override: None,
        };
        self.fetcher.relay(ctx, &request).await?;
        self.db.record_relay(&dest_key, origin, item_id, &ctx.credential.id)?;
        log::debug!("[FORWARD] {}#{} saved to '{}'", origin, item_id, ctx.credential.id);
        Ok(true)
    }

    fn origin_title(&self, origin: &str) -> rusqlite::Result<String> {
        Ok(self
            .db
            .get_target(origin)?
            .and_then(|t| t.title)
            .unwrap_or_else(|| origin.to_string()))
    }

    fn provenance(&self, title: &str, origin: &str, destination: &Destination, item: &RemoteItem) -> Option<String> {
        if !self.settings.prepend_origin_info || destination.topic_id().is_some() {
            return None;
        }
        Some(format!(
            "{}{}",
            provenance_header(title, origin),
            item.text.as_deref().unwrap_or("")
        ))
    }

    async fn pace(&self, ctx: &TaskContext) -> CrawlResult<()> {
        if self.settings.relay_interval.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(self.settings.relay_interval) => Ok(()),
            _ = ctx.cancel.cancelled() => Err(CrawlError::Cancelled),
        }
    }
}

fn provenance_header(title: &str, origin: &str) -> String {
    format!("[Forwarded from {} (ID: {})]\n", title, origin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::temp_db;
    use crate::error::FetchFailure;
    use crate::remote::mock::{test_context, ScriptedRemote};
    use crate::remote::EntityRef;

    fn engine(db: Arc<Database>, remote: Arc<ScriptedRemote>, prepend: bool) -> ForwardingEngine {
        ForwardingEngine::new(
            db,
            Fetcher::new(remote, Duration::from_secs(5)),
            ForwardSettings {
                relay_interval: Duration::ZERO,
                prepend_origin_info: prepend,
                batch_size: 2,
            },
        )
    }

    #[tokio::test]
    async fn stream_relays_each_item_once_with_provenance() {
        let (_dir, db) = temp_db();
        let db = Arc::new(db);
        let remote = Arc::new(ScriptedRemote::new());
        remote.add_items("origin", 1..=3);
        db.upsert_target(
            &EntityRef {
                title: Some("Origin Chat".into()),
                ..EntityRef::new("origin")
            },
            0,
        )
        .unwrap();

        let forward = engine(db.clone(), remote.clone(), true);
        let mut fanout = Vec::new();
        let report = forward
            .relay_stream(&test_context("alpha"), "origin", &Destination::entity("archive"), &mut fanout)
            .await
            .unwrap();

        assert_eq!(report.relayed, 3);
        assert_eq!(fanout, vec![1, 2, 3]);
        let relays = remote.relays();
        assert_eq!(
            relays[0].request.text_override.as_deref(),
            Some("[Forwarded from Origin Chat (ID: origin)]\nmessage 1 in origin")
        );

        // A second credential resuming the same stream relays nothing new
        let again = forward
            .relay_stream(&test_context("beta"), "origin", &Destination::entity("archive"), &mut Vec::new())
            .await
            .unwrap();
        assert_eq!(again.relayed, 0);
        assert_eq!(remote.relays().len(), 3);
    }

    #[tokio::test]
    async fn topic_destination_gets_no_header() {
        let (_dir, db) = temp_db();
        let db = Arc::new(db);
        let remote = Arc::new(ScriptedRemote::new());
        remote.add_items("origin", 1..=1);

        let destination = Destination::Entity {
            key: "archive".into(),
            topic_id: Some(42),
        };
        engine(db, remote.clone(), true)
            .relay_stream(&test_context("alpha"), "origin", &destination, &mut Vec::new())
            .await
            .unwrap();
        assert!(remote.relays()[0].request.text_override.is_none());
    }

    #[tokio::test]
    async fn rate_limited_stream_resumes_where_it_stopped() {
        let (_dir, db) = temp_db();
        let db = Arc::new(db);
        let remote = Arc::new(ScriptedRemote::new());
        remote.add_items("origin", 1..=3);
        let forward = engine(db.clone(), remote.clone(), false);
        let ctx = test_context("alpha");

        let mut fanout = Vec::new();
        remote.fail_next("relay", "origin", FetchFailure::RateLimited { retry_after: Duration::from_secs(1) });
        let err = forward
            .relay_stream(&ctx, "origin", &Destination::entity("archive"), &mut fanout)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Fetch(FetchFailure::RateLimited { .. })));
        assert!(fanout.is_empty());

        let report = forward
            .relay_stream(&ctx, "origin", &Destination::entity("archive"), &mut fanout)
            .await
            .unwrap();
        assert_eq!(report.relayed, 3);
        assert_eq!(db.count_relays("archive").unwrap(), 3);
    }

    #[tokio::test]
    async fn personal_archive_is_per_credential() {
        let (_dir, db) = temp_db();
        let db = Arc::new(db);
        let remote = Arc::new(ScriptedRemote::new());
        let forward = engine(db.clone(), remote.clone(), true);

        assert!(forward.relay_personal(&test_context("alpha"), "origin", 5).await.unwrap());
        assert!(!forward.relay_personal(&test_context("alpha"), "origin", 5).await.unwrap());
        assert!(forward.relay_personal(&test_context("beta"), "origin", 5).await.unwrap());

        let relays = remote.relays();
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[1].request.destination, Destination::Personal);
        assert!(relays[1].request.text_override.is_none());
        assert_eq!(db.count_relays("personal:alpha").unwrap(), 1);
    }
}
