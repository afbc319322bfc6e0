//! Incremental per-target archive loop and the secondary edit pass

use rusqlite::Result as SqliteResult;
use serde::Serialize;
use std::sync::Arc;

use super::checksum::{stored_checksum, to_archive_row};
use crate::db::Database;
use crate::error::{CrawlError, CrawlResult};
use crate::models::{ArchiveRow, BatchOutcome, Checkpoint};
use crate::remote::{Fetcher, TaskContext};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub target: String,
    pub start_marker: i64,
    pub end_marker: i64,
    pub batches: usize,
    pub inserted: usize,
    pub unchanged: usize,
    pub edited: usize,
}

impl SyncReport {
    fn absorb(&mut self, outcome: BatchOutcome) {
        self.batches += 1;
        self.inserted += outcome.inserted;
        self.unchanged += outcome.unchanged;
        self.edited += outcome.edited;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub target: String,
    pub checked: usize,
    pub mismatched: Vec<i64>,
}

pub struct ArchiveSync {
    db: Arc<Database>,
    fetcher: Fetcher,
    batch_size: usize,
}

impl ArchiveSync {
    pub fn new(db: Arc<Database>, fetcher: Fetcher, batch_size: usize) -> Self {
        Self {
            db,
            fetcher,
            batch_size: batch_size.max(1),
        }
    }

    /// Archive everything newer than the target's checkpoint.
    ///
    /// Batches are committed in ascending id order, each together with the
    /// checkpoint advance. Stops when a fetched batch holds nothing new.
    pub async fn sync_target(&self, ctx: &TaskContext, target: &str) -> CrawlResult<SyncReport> {
        let context = Checkpoint::sync_context(target);
        let start = self.db.checkpoint_marker(&context)?;
        let mut report = SyncReport {
            target: target.to_string(),
            start_marker: start,
            end_marker: start,
            ..Default::default()
        };

        loop {
            let marker = report.end_marker;
            let mut items = self
                .fetcher
                .list_entity_content(ctx, target, marker, self.batch_size)
                .await?;

            // Never re-emit committed ids, whatever the remote returns
            items.retain(|item| item.id > marker);
            items.sort_by_key(|item| item.id);
            items.dedup_by_key(|item| item.id);

            let Some(last_id) = items.last().map(|item| item.id) else {
                break;
            };

            let rows: Vec<ArchiveRow> = items.iter().map(|item| to_archive_row(target, item)).collect();
            let outcome = self.db.commit_batch(target, &rows, Some((&context, last_id)))?;
            report.absorb(outcome);
            report.end_marker = last_id;

            log::info!(
                "[SYNC] {}: batch of {} committed ({} new), checkpoint {} -> {}",
                target,
                rows.len(),
                outcome.inserted,
                marker,
                last_id
            );

            if ctx.is_cancelled() {
                return Err(CrawlError::Cancelled);
            }
        }

        log::info!(
            "[SYNC] {}: caught up at {} ({} new messages)",
            target,
            report.end_marker,
            report.inserted
        );
        Ok(report)
    }

    /// Re-fetch archived ids and apply newer edits. Only ids at or below
    /// the checkpoint are visited, and the checkpoint is never written.
    pub async fn edit_pass(&self, ctx: &TaskContext, target: &str) -> CrawlResult<SyncReport> {
        let ceiling = self.db.checkpoint_marker(&Checkpoint::sync_context(target))?;
        let mut report = SyncReport {
            target: target.to_string(),
            start_marker: ceiling,
            end_marker: ceiling,
            ..Default::default()
        };

        let mut after = 0;
        loop {
            let ids: Vec<i64> = self
                .db
                .message_ids(target, after, self.batch_size)?
                .into_iter()
                .filter(|id| *id <= ceiling)
                .collect();
            let Some(&last) = ids.last() else {
                break;
            };

            let fetched = self.fetcher.get_items(ctx, target, &ids).await?;
            let rows: Vec<ArchiveRow> = fetched
                .iter()
                .filter(|item| ids.binary_search(&item.id).is_ok())
                .map(|item| to_archive_row(target, item))
                .collect();
            let outcome = self.db.commit_batch(target, &rows, None)?;
            report.absorb(outcome);
            after = last;

            if outcome.edited > 0 {
                log::info!("[SYNC] {}: {} edits applied up to id {}", target, outcome.edited, last);
            }
        }

        Ok(report)
    }

    /// Recompute checksums of stored messages and list the ids that disagree
    pub fn verify_checksums(&self, target: &str) -> SqliteResult<IntegrityReport> {
        let mut report = IntegrityReport {
            target: target.to_string(),
            ..Default::default()
        };
        let mut after = 0;
        loop {
            let page = self.db.list_messages(target, after, self.batch_size)?;
            let Some(last) = page.last().map(|m| m.id) else {
                break;
            };
            for message in &page {
                report.checked += 1;
                if stored_checksum(message) != message.checksum {
                    report.mismatched.push(message.id);
                }
            }
            after = last;
        }

        if !report.mismatched.is_empty() {
            log::error!(
                "[SYNC] {}: {} of {} stored messages fail checksum verification",
                target,
                report.mismatched.len(),
                report.checked
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::temp_db;
    use crate::error::FetchFailure;
    use crate::remote::mock::{test_context, ScriptedRemote};
    use std::time::Duration;

    fn engine(db: Arc<Database>, remote: Arc<ScriptedRemote>, batch: usize) -> ArchiveSync {
        ArchiveSync::new(db, Fetcher::new(remote, Duration::from_secs(5)), batch)
    }

    #[tokio::test]
    async fn resumes_from_checkpoint_and_archives_only_newer_ids() {
        let (_dir, db) = temp_db();
        let db = Arc::new(db);
        let remote = Arc::new(ScriptedRemote::new());
        remote.add_items("t", 1..=105);
        db.advance_checkpoint("sync:t", 100).unwrap();

        let sync = engine(db.clone(), remote, 500);
        let report = sync.sync_target(&test_context("a"), "t").await.unwrap();

        assert_eq!(report.start_marker, 100);
        assert_eq!(report.end_marker, 105);
        assert_eq!(report.inserted, 5);
        assert_eq!(db.checkpoint_marker("sync:t").unwrap(), 105);
        assert_eq!(db.count_messages("t").unwrap(), 5);
        assert!(db.get_message("t", 100).unwrap().is_none());
    }

    #[tokio::test]
    async fn interrupted_sync_resumes_without_duplicates() {
        let (_dir, db) = temp_db();
        let db = Arc::new(db);
        let remote = Arc::new(ScriptedRemote::new());
        remote.add_items("t", 1..=25);
        // First page fails before anything is committed
        remote.fail_next("list_entity_content", "t", FetchFailure::TransientNetwork("reset".into()));

        let sync = engine(db.clone(), remote.clone(), 10);
        let ctx = test_context("a");
        let err = sync.sync_target(&ctx, "t").await.unwrap_err();
        assert!(matches!(err, CrawlError::Fetch(FetchFailure::TransientNetwork(_))));
        assert_eq!(db.checkpoint_marker("sync:t").unwrap(), 0);

        let first = sync.sync_target(&ctx, "t").await.unwrap();
        assert_eq!(first.end_marker, 25);
        assert_eq!(first.batches, 3);

        remote.add_items("t", 26..=30);
        let second = sync.sync_target(&ctx, "t").await.unwrap();
        assert_eq!(second.start_marker, 25);
        assert_eq!(second.inserted, 5);
        assert_eq!(second.unchanged, 0);
        assert_eq!(db.count_messages("t").unwrap(), 30);
    }

    #[tokio::test]
    async fn edit_pass_updates_content_without_touching_checkpoint() {
        let (_dir, db) = temp_db();
        let db = Arc::new(db);
        let remote = Arc::new(ScriptedRemote::new());
        remote.add_items("t", 1..=4);

        let sync = engine(db.clone(), remote.clone(), 2);
        let ctx = test_context("a");
        sync.sync_target(&ctx, "t").await.unwrap();

        remote.edit_item("t", 3, "corrected text", 30);
        remote.add_items("t", 5..=6);

        let report = sync.edit_pass(&ctx, "t").await.unwrap();
        assert_eq!(report.edited, 1);
        assert_eq!(report.unchanged, 3);
        assert_eq!(db.checkpoint_marker("sync:t").unwrap(), 4);
        assert!(db.get_message("t", 5).unwrap().is_none());

        let edited = db.get_message("t", 3).unwrap().unwrap();
        assert_eq!(edited.content.as_deref(), Some("corrected text"));
        assert!(edited.edit_date.is_some());

        let integrity = sync.verify_checksums("t").unwrap();
        assert_eq!(integrity.checked, 4);
        assert!(integrity.mismatched.is_empty());
    }

    #[tokio::test]
    async fn silent_remote_mutation_is_a_hard_error() {
        let (_dir, db) = temp_db();
        let db = Arc::new(db);
        let remote = Arc::new(ScriptedRemote::new());
        remote.add_items("t", 1..=3);

        let sync = engine(db.clone(), remote.clone(), 10);
        let ctx = test_context("a");
        sync.sync_target(&ctx, "t").await.unwrap();

        // Content changed with no edit marker
        remote.add_item(
            "t",
            crate::remote::RemoteItem {
                id: 2,
                date: crate::remote::mock::base_date() + chrono::Duration::minutes(2),
                edit_date: None,
                text: Some("rewritten".into()),
                sender: None,
                media: None,
                reply_to: None,
            },
        );

        let err = sync.edit_pass(&ctx, "t").await.unwrap_err();
        assert!(matches!(err, CrawlError::IntegrityMismatch { item_id: 2, .. }));
    }
}
