//! Worker loop: check out a credential + route pair, run one task, classify
//! the result and put both resources back.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::backoff::jittered;
use super::runs::{RunHandle, TargetOutcome};
use super::task::{DiscoverJob, ForwardJob, SyncMode, Task, TaskEnvelope};
use super::SchedulerInner;
use crate::error::{CrawlError, CrawlResult, FetchFailure};
use crate::models::{Checkpoint, Credential, TargetStatus};
use crate::pool::{Acquire, Outcome};
use crate::remote::TaskContext;

/// Requeue delay for a task whose pinned credential or route is busy
const BUSY_RETRY: Duration = Duration::from_millis(250);
/// Floor for waits on a cooldown that is about to expire
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Why a task was handed back before it ran
enum Deferral {
    Retry(Duration),
    Terminal(TargetOutcome),
}

/// What happens to a task after an attempt
enum Next {
    Done,
    Terminal(TargetOutcome),
    Retry {
        delay: Duration,
        /// Counts against `max_retries`
        counted: bool,
        reason: String,
    },
}

struct Verdict {
    credential: Outcome,
    route: Outcome,
    next: Next,
}

impl SchedulerInner {
    pub(super) async fn worker_loop(&self, index: usize) {
        log::debug!("[WORKER {}] started", index);
        while let Some(envelope) = self.queue.pop(&self.shutdown).await {
            let Some(run) = self.runs.get(&envelope.run_id) else {
                log::warn!(
                    "[WORKER {}] dropping task {} of unknown run {}",
                    index,
                    envelope.id,
                    envelope.run_id
                );
                continue;
            };
            if run.is_cancelled() {
                self.finish(&run, &envelope, TargetOutcome::Cancelled);
                continue;
            }
            self.dispatch(index, &run, envelope).await;
        }
        log::debug!("[WORKER {}] stopped", index);
    }

    async fn dispatch(&self, index: usize, run: &Arc<RunHandle>, mut envelope: TaskEnvelope) {
        let credential = match self.checkout_credential(run, &mut envelope).await {
            Ok(credential) => credential,
            Err(deferral) => return self.defer(run, envelope, deferral),
        };

        let route = match self.egress.acquire(&credential.id) {
            Acquire::Granted(route) => route,
            Acquire::Blocked { retry_in } => {
                self.credentials.cancel_checkout(&credential.id);
                return self.defer(run, envelope, Deferral::Retry(retry_in.unwrap_or(BUSY_RETRY)));
            }
            Acquire::Unavailable => {
                self.credentials.cancel_checkout(&credential.id);
                let outcome = TargetOutcome::Failed("no usable egress route".to_string());
                return self.defer(run, envelope, Deferral::Terminal(outcome));
            }
        };

        let held = self.pairs_checked_out.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_pairs_checked_out.fetch_max(held, Ordering::SeqCst);

        let subject = envelope.task.subject();
        if let Err(e) = self.db.record_task_start(
            &envelope.id,
            &run.id,
            envelope.task.kind().as_str(),
            &subject,
            Some(&credential.id),
            Some(&route.id),
            envelope.attempts,
        ) {
            log::error!("[DB] failed to journal task {}: {}", envelope.id, e);
        }
        log::debug!(
            "[WORKER {}] {} '{}' on '{}' via {}",
            index,
            envelope.task.kind().as_str(),
            subject,
            credential.id,
            route.display_endpoint()
        );

        let ctx = TaskContext {
            task_id: envelope.id.clone(),
            credential: credential.clone(),
            route: route.clone(),
            cancel: run.cancel.clone(),
        };
        let result = self.execute(run, &envelope, &ctx).await;
        let verdict = self.classify(&subject, result);

        if let Some(status) = self.credentials.release(&credential.id, verdict.credential) {
            if let Err(e) = self.db.save_credential_status(&status) {
                log::error!("[DB] failed to persist status of '{}': {}", credential.id, e);
            }
        }
        self.egress.release(&route.id, &credential.id, &verdict.route);
        self.pairs_checked_out.fetch_sub(1, Ordering::SeqCst);

        match verdict.next {
            Next::Done => {
                self.backoff.record_success(&subject);
                self.finish(run, &envelope, TargetOutcome::Done);
            }
            Next::Terminal(outcome) => {
                if let TargetOutcome::Unreachable(reason) = &outcome {
                    self.mark_unreachable(&envelope.task, reason);
                }
                self.finish(run, &envelope, outcome);
            }
            Next::Retry { delay, counted, reason } => {
                if run.is_cancelled() {
                    return self.finish(run, &envelope, TargetOutcome::Cancelled);
                }
                if counted {
                    envelope.attempts += 1;
                    if envelope.attempts >= self.settings.max_retries.max(1) {
                        log::error!(
                            "[WORKER {}] '{}' gave up after {} attempts: {}",
                            index,
                            subject,
                            envelope.attempts,
                            reason
                        );
                        return self.give_up(run, &envelope, reason);
                    }
                }
                run.task_retried(!counted);
                log::warn!(
                    "[WORKER {}] retrying '{}' in {}ms: {}",
                    index,
                    subject,
                    delay.as_millis(),
                    reason
                );
                self.queue.requeue(envelope, jittered(delay));
            }
        }
    }

    /// Pinned tasks are requeued while their credential is busy; any-credential
    /// tasks wait here for the next release.
    async fn checkout_credential(
        &self,
        run: &RunHandle,
        envelope: &mut TaskEnvelope,
    ) -> Result<Arc<Credential>, Deferral> {
        loop {
            match envelope.task.required_credential().map(str::to_string) {
                Some(id) => match self.credentials.acquire_specific(&id) {
                    Acquire::Granted(credential) => return Ok(credential),
                    Acquire::Blocked { retry_in } => {
                        return Err(Deferral::Retry(retry_in.unwrap_or(BUSY_RETRY).max(MIN_WAIT)));
                    }
                    Acquire::Unavailable => {
                        if !self.reassign(envelope, &id) {
                            let reason = format!("credential '{}' is disabled", id);
                            return Err(Deferral::Terminal(TargetOutcome::Failed(reason)));
                        }
                    }
                },
                None => match self.credentials.acquire() {
                    Acquire::Granted(credential) => return Ok(credential),
                    Acquire::Blocked { retry_in } => {
                        let policy = self.backoff.policy();
                        let wait = jittered(retry_in.unwrap_or(policy.min).clamp(MIN_WAIT, policy.max));
                        tokio::select! {
                            _ = self.credentials.wait_for_release(wait) => {}
                            _ = run.cancel.cancelled() => {
                                return Err(Deferral::Terminal(TargetOutcome::Cancelled));
                            }
                        }
                    }
                    Acquire::Unavailable => {
                        let reason = "every credential is disabled".to_string();
                        return Err(Deferral::Terminal(TargetOutcome::Failed(reason)));
                    }
                },
            }
        }
    }

    /// Move a stream off a disabled credential, to another credential
    /// known to reach the origin or else to any credential
    fn reassign(&self, envelope: &mut TaskEnvelope, disabled: &str) -> bool {
        let Task::Forward(ForwardJob::Stream { origin, credential, .. }) = &mut envelope.task else {
            return false;
        };
        let holders = self.db.access_for_target(origin).unwrap_or_else(|e| {
            log::error!("[DB] access lookup for '{}' failed: {}", origin, e);
            Vec::new()
        });
        let next = holders
            .into_iter()
            .map(|record| record.credential_id)
            .find(|id| id != disabled && self.credentials.is_usable(id));
        log::info!(
            "[SCHEDULER] '{}' moved from disabled '{}' to {}",
            origin,
            disabled,
            next.as_deref().unwrap_or("any credential")
        );
        *credential = next;
        true
    }

    fn defer(&self, run: &RunHandle, envelope: TaskEnvelope, deferral: Deferral) {
        match deferral {
            Deferral::Retry(delay) => self.queue.requeue(envelope, jittered(delay)),
            Deferral::Terminal(outcome) => self.finish(run, &envelope, outcome),
        }
    }

    async fn execute(&self, run: &RunHandle, envelope: &TaskEnvelope, ctx: &TaskContext) -> CrawlResult<()> {
        match &envelope.task {
            Task::Discover(DiscoverJob::Expand { target, depth }) => {
                let Some(expansion) = self.discovery.expand(ctx, &run.id, target, *depth).await? else {
                    return Ok(());
                };
                let next_depth = depth + 1;
                for key in &expansion.referenced {
                    if run.admit(key, next_depth) {
                        self.enqueue_expand(run, key, next_depth);
                    }
                }
                let expanded = self.db.count_discovery_sources(&run.id)?;
                self.db
                    .advance_checkpoint(&Checkpoint::discovery_context(&run.id), expanded)?;
                Ok(())
            }
            Task::Discover(DiscoverJob::Inventory { .. }) => self.discovery.inventory(ctx).await.map(drop),
            Task::Sync(job) => {
                self.ensure_reachable(&job.target)?;
                match job.mode {
                    SyncMode::Incremental => self.archive.sync_target(ctx, &job.target).await.map(drop),
                    SyncMode::Edits => self.archive.edit_pass(ctx, &job.target).await.map(drop),
                }
            }
            Task::Forward(ForwardJob::Stream {
                origin,
                destination,
                personal_fanout,
                ..
            }) => {
                self.ensure_reachable(origin)?;
                let mut fanout = Vec::new();
                let result = self
                    .forwarding
                    .relay_stream(ctx, origin, destination, &mut fanout)
                    .await;
                // Items that reached the primary destination get their copies
                // even when the stream stopped early
                if *personal_fanout && !run.is_cancelled() {
                    self.enqueue_personal(run, self.personal_copies(origin, &fanout));
                }
                result.map(drop)
            }
            Task::Forward(ForwardJob::Personal { origin, item_id, .. }) => {
                self.forwarding.relay_personal(ctx, origin, *item_id).await.map(drop)
            }
        }
    }

    /// One copy per (item, usable credential), items in relay order
    fn personal_copies(&self, origin: &str, items: &[i64]) -> Vec<Task> {
        let ids: Vec<String> = self
            .credentials
            .ids()
            .into_iter()
            .filter(|id| self.credentials.is_usable(id))
            .collect();
        items
            .iter()
            .flat_map(|item_id| {
                ids.iter().map(move |credential| {
                    Task::Forward(ForwardJob::Personal {
                        origin: origin.to_string(),
                        item_id: *item_id,
                        credential: credential.clone(),
                    })
                })
            })
            .collect()
    }

    fn ensure_reachable(&self, key: &str) -> CrawlResult<()> {
        match self.db.get_target(key)? {
            Some(target) if target.status == TargetStatus::Unreachable => Err(FetchFailure::TargetUnreachable(
                target
                    .last_error
                    .unwrap_or_else(|| "marked unreachable".to_string()),
            )
            .into()),
            _ => Ok(()),
        }
    }

    fn classify(&self, subject: &str, result: CrawlResult<()>) -> Verdict {
        let verdict = |credential, route, next| Verdict { credential, route, next };
        let err = match result {
            Ok(()) => return verdict(Outcome::Success, Outcome::Success, Next::Done),
            Err(err) => err,
        };
        let reason = err.to_string();

        match err {
            CrawlError::Fetch(FetchFailure::RateLimited { retry_after }) => verdict(
                Outcome::RateLimited(retry_after),
                Outcome::Neutral,
                Next::Retry {
                    delay: Duration::ZERO,
                    counted: false,
                    reason,
                },
            ),
            CrawlError::Fetch(FetchFailure::TransientNetwork(msg)) => verdict(
                Outcome::Failure(msg.clone()),
                Outcome::Failure(msg),
                Next::Retry {
                    delay: self.backoff.record_error(subject),
                    counted: true,
                    reason,
                },
            ),
            // The network path worked; only the target is gone
            CrawlError::Fetch(FetchFailure::TargetUnreachable(msg)) => verdict(
                Outcome::Neutral,
                Outcome::Success,
                Next::Terminal(TargetOutcome::Unreachable(msg)),
            ),
            CrawlError::Fetch(FetchFailure::AuthInvalid(msg)) => verdict(
                Outcome::Revoked(msg),
                Outcome::Neutral,
                Next::Retry {
                    delay: Duration::ZERO,
                    counted: true,
                    reason,
                },
            ),
            CrawlError::Fetch(FetchFailure::Unknown(msg)) => verdict(
                Outcome::Failure(msg),
                Outcome::Neutral,
                Next::Retry {
                    delay: self.backoff.record_error(subject),
                    counted: true,
                    reason,
                },
            ),
            CrawlError::IntegrityMismatch { .. } => {
                log::error!("[ARCHIVE] {}", reason);
                verdict(
                    Outcome::Success,
                    Outcome::Success,
                    Next::Terminal(TargetOutcome::Failed(reason)),
                )
            }
            CrawlError::Store(_) => verdict(
                Outcome::Neutral,
                Outcome::Neutral,
                Next::Retry {
                    delay: self.backoff.record_error(subject),
                    counted: true,
                    reason,
                },
            ),
            CrawlError::Cancelled => verdict(
                Outcome::Neutral,
                Outcome::Neutral,
                Next::Terminal(TargetOutcome::Cancelled),
            ),
        }
    }

    /// Out of retries. A target discovery cannot expand is recorded as
    /// unreachable; everything else fails.
    fn give_up(&self, run: &RunHandle, envelope: &TaskEnvelope, reason: String) {
        let outcome = match &envelope.task {
            Task::Discover(DiscoverJob::Expand { .. }) => {
                self.mark_unreachable(&envelope.task, &reason);
                TargetOutcome::Unreachable(reason)
            }
            _ => TargetOutcome::Failed(reason),
        };
        self.finish(run, envelope, outcome);
    }

    fn mark_unreachable(&self, task: &Task, reason: &str) {
        let key = match task {
            Task::Discover(DiscoverJob::Expand { target, .. }) => target,
            Task::Sync(job) => &job.target,
            Task::Forward(ForwardJob::Stream { origin, .. }) => origin,
            _ => return,
        };
        match self.db.get_target(key) {
            Ok(Some(target)) if target.status == TargetStatus::Unreachable => {}
            Ok(_) => {
                if let Err(e) = self.discovery.mark_unreachable(key, reason) {
                    log::error!("[DB] failed to mark '{}' unreachable: {}", key, e);
                }
            }
            Err(e) => log::error!("[DB] target lookup for '{}' failed: {}", key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{BackoffPolicy, RunState, Scheduler, SchedulerSettings};
    use super::*;
    use crate::db::{temp_db, Database};
    use crate::forwarding::ForwardSettings;
    use crate::models::CredentialHealth;
    use crate::pool::{CredentialPool, EgressPool};
    use crate::remote::mock::{credential, ScriptedRemote};
    use crate::remote::{Destination, Fetcher};
    use crate::scheduler::RunSummary;
    use tempfile::TempDir;

    fn settings(workers: usize) -> SchedulerSettings {
        SchedulerSettings {
            workers,
            max_retries: 3,
            max_depth: 2,
            sample_limit: 100,
            batch_size: 50,
            backoff: BackoffPolicy {
                min: Duration::from_millis(5),
                max: Duration::from_millis(40),
                reset_after: Duration::from_secs(1),
            },
            default_destination: Some(Destination::entity("archive_dest")),
            personal_fanout: false,
            forward: ForwardSettings {
                relay_interval: Duration::ZERO,
                prepend_origin_info: true,
                batch_size: 50,
            },
        }
    }

    fn harness(
        remote: &Arc<ScriptedRemote>,
        credential_ids: &[&str],
        settings: SchedulerSettings,
    ) -> (TempDir, Arc<Database>, Scheduler) {
        let (dir, db) = temp_db();
        let db = Arc::new(db);
        let fetcher = Fetcher::new(remote.clone(), Duration::from_secs(5));
        let pool = CredentialPool::new(credential_ids.iter().map(|id| credential(id)).collect(), 10);
        let scheduler = Scheduler::new(
            db.clone(),
            fetcher,
            Arc::new(pool),
            Arc::new(EgressPool::new(Vec::new(), 3)),
            settings,
        );
        scheduler.start();
        (dir, db, scheduler)
    }

    async fn wait(scheduler: &Scheduler, run_id: &str) -> RunSummary {
        tokio::time::timeout(Duration::from_secs(10), scheduler.wait_for_run(run_id))
            .await
            .expect("run did not finish in time")
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn discovery_stops_at_max_depth() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.link("chan_a", &["chan_b", "chan_c"]);
        remote.link("chan_b", &["chan_d"]);
        remote.link("chan_d", &["chan_e"]);
        let (_dir, db, scheduler) = harness(&remote, &["alpha", "beta"], settings(2));

        let run_id = scheduler.start_discovery(vec!["chan_a".into()], Some(2)).unwrap();
        let summary = wait(&scheduler, &run_id).await;

        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.done, 3);
        assert_eq!(db.get_target("chan_d").unwrap().unwrap().depth, 2);
        assert!(db.get_target("chan_e").unwrap().is_none());
        assert_eq!(remote.calls_for("list_entity_content", "chan_d"), 0);
        assert_eq!(db.list_edges().unwrap().len(), 3);

        let marker = db.checkpoint_marker(&Checkpoint::discovery_context(&run_id)).unwrap();
        assert_eq!(marker, 3);
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn resumed_discovery_expands_the_stored_frontier() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.link("chan_a", &["chan_b", "chan_c"]);
        remote.link("chan_b", &["chan_d"]);
        remote.link("chan_d", &["chan_e"]);
        let (_dir, db, scheduler) = harness(&remote, &["alpha"], settings(2));

        let first = scheduler.start_discovery(vec!["chan_a".into()], Some(1)).unwrap();
        wait(&scheduler, &first).await;
        assert_eq!(remote.calls_for("list_entity_content", "chan_b"), 0);

        let second = scheduler.resume_discovery(Some(3)).unwrap();
        let summary = wait(&scheduler, &second).await;

        assert_eq!(summary.state, RunState::Done);
        assert_eq!(remote.calls_for("list_entity_content", "chan_a"), 1);
        assert_eq!(remote.calls_for("list_entity_content", "chan_d"), 1);
        assert_eq!(db.get_target("chan_e").unwrap().unwrap().depth, 3);
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded_by_worker_count() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_latency(Duration::from_millis(5));
        let targets: Vec<String> = (0..8).map(|i| format!("chan_{}", i)).collect();
        for target in &targets {
            remote.add_items(target, 1..=20);
        }
        let mut config = settings(2);
        config.batch_size = 5;
        let (_dir, db, scheduler) = harness(&remote, &["alpha", "beta", "gamma", "delta"], config);

        let run_id = scheduler.start_sync(targets.clone(), SyncMode::Incremental).unwrap();
        let summary = wait(&scheduler, &run_id).await;

        assert_eq!(summary.done, 8);
        assert!(remote.high_water() <= 2);
        assert!(!remote.credential_was_shared());
        assert!(scheduler.status().max_pairs_checked_out <= 2);
        for target in &targets {
            assert_eq!(db.count_messages(target).unwrap(), 20);
        }
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rate_limits_are_retried_without_using_the_retry_budget() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.add_items("chan_a", 1..=4);
        for _ in 0..5 {
            remote.fail_next(
                "list_entity_content",
                "chan_a",
                FetchFailure::RateLimited {
                    retry_after: Duration::from_millis(20),
                },
            );
        }
        let (_dir, db, scheduler) = harness(&remote, &["alpha"], settings(1));

        let run_id = scheduler.start_sync(vec!["chan_a".into()], SyncMode::Incremental).unwrap();
        let summary = wait(&scheduler, &run_id).await;

        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.rate_limited, 5);
        assert_eq!(db.count_messages("chan_a").unwrap(), 4);
        let status = &scheduler.credential_health()[0];
        assert_eq!(status.rate_limit_count, 5);
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn persistent_transient_failure_fails_only_that_target() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.add_items("chan_a", 1..=3);
        remote.add_items("chan_b", 1..=3);
        remote.fail_always(
            "list_entity_content",
            "chan_b",
            FetchFailure::TransientNetwork("connection reset".into()),
        );
        let (_dir, db, scheduler) = harness(&remote, &["alpha"], settings(1));

        let run_id = scheduler
            .start_sync(vec!["chan_a".into(), "chan_b".into()], SyncMode::Incremental)
            .unwrap();
        let summary = wait(&scheduler, &run_id).await;

        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.targets["chan_a"], TargetOutcome::Done);
        assert!(matches!(summary.targets["chan_b"], TargetOutcome::Failed(_)));
        assert_eq!(remote.calls_for("list_entity_content", "chan_b"), 3);
        assert_eq!(db.count_messages("chan_a").unwrap(), 3);
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreachable_target_does_not_fail_discovery() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.link("chan_a", &["chan_b", "chan_c"]);
        remote.fail_always(
            "list_entity_content",
            "chan_b",
            FetchFailure::TargetUnreachable("private".into()),
        );
        let (_dir, db, scheduler) = harness(&remote, &["alpha"], settings(2));

        let run_id = scheduler.start_discovery(vec!["chan_a".into()], None).unwrap();
        let summary = wait(&scheduler, &run_id).await;

        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.unreachable, 1);
        assert_eq!(remote.calls_for("list_entity_content", "chan_b"), 1);
        let chan_b = db.get_target("chan_b").unwrap().unwrap();
        assert_eq!(chan_b.status, TargetStatus::Unreachable);

        // Stays skipped until reset
        let sync = scheduler.start_sync(vec!["chan_b".into()], SyncMode::Incremental).unwrap();
        let summary = wait(&scheduler, &sync).await;
        assert_eq!(summary.unreachable, 1);
        assert_eq!(remote.calls_for("list_entity_content", "chan_b"), 1);
        assert!(scheduler.reset_target("chan_b").unwrap());
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn revoked_credential_is_disabled_and_work_moves_on() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.add_items("chan_a", 1..=3);
        remote.fail_next(
            "list_entity_content",
            "chan_a",
            FetchFailure::AuthInvalid("session revoked".into()),
        );
        let (_dir, db, scheduler) = harness(&remote, &["alpha", "beta"], settings(1));

        let run_id = scheduler.start_sync(vec!["chan_a".into()], SyncMode::Incremental).unwrap();
        let summary = wait(&scheduler, &run_id).await;

        assert_eq!(summary.state, RunState::Done);
        assert_eq!(db.count_messages("chan_a").unwrap(), 3);
        let disabled: Vec<_> = scheduler
            .credential_health()
            .into_iter()
            .filter(|s| s.health == CredentialHealth::Disabled)
            .collect();
        assert_eq!(disabled.len(), 1);

        let stored = db.load_credential_statuses().unwrap();
        assert!(stored.iter().any(|s| s.health == CredentialHealth::Disabled));

        let reset = scheduler.reset_credential(&disabled[0].credential_id).unwrap();
        assert_eq!(reset.health, CredentialHealth::Healthy);
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn total_forward_relays_each_item_once() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.grant_access("alpha", &["chan_a", "chan_b"]);
        remote.grant_access("beta", &["chan_a"]);
        remote.add_items("chan_a", 1..=3);
        remote.add_items("chan_b", 1..=2);
        let (_dir, _db, scheduler) = harness(&remote, &["alpha", "beta"], settings(2));

        let inventory = scheduler.start_inventory().unwrap();
        assert_eq!(wait(&scheduler, &inventory).await.done, 2);

        let forward = scheduler.start_total_forward(None).unwrap();
        let summary = wait(&scheduler, &forward).await;
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.done, 2);
        assert_eq!(remote.relays().len(), 5);

        let mut seen: Vec<(String, i64)> = remote
            .relays()
            .into_iter()
            .map(|r| (r.request.origin, r.request.item_id))
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 5);

        // A second pass finds nothing new
        let again = scheduler.start_total_forward(None).unwrap();
        wait(&scheduler, &again).await;
        assert_eq!(remote.relays().len(), 5);
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn personal_fanout_reaches_every_credential() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.add_items("chan_a", 1..=3);
        let mut config = settings(2);
        config.personal_fanout = true;
        let (_dir, _db, scheduler) = harness(&remote, &["alpha", "beta"], config);

        let run_id = scheduler.start_forward("chan_a", None).unwrap();
        let summary = wait(&scheduler, &run_id).await;
        assert_eq!(summary.state, RunState::Done);

        let relays = remote.relays();
        let primary = relays
            .iter()
            .filter(|r| r.request.destination == Destination::entity("archive_dest"))
            .count();
        assert_eq!(primary, 3);
        for id in ["alpha", "beta"] {
            let personal = relays
                .iter()
                .filter(|r| r.request.destination == Destination::Personal && r.credential_id == id)
                .count();
            assert_eq!(personal, 3, "personal copies for {}", id);
        }
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopped_run_ends_cancelled() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_latency(Duration::from_millis(30));
        let targets: Vec<String> = (0..6).map(|i| format!("chan_{}", i)).collect();
        for target in &targets {
            remote.add_items(target, 1..=3);
        }
        let (_dir, _db, scheduler) = harness(&remote, &["alpha"], settings(1));

        let run_id = scheduler.start_sync(targets, SyncMode::Incremental).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.stop_run(&run_id).unwrap();
        let summary = wait(&scheduler, &run_id).await;

        assert_eq!(summary.state, RunState::Cancelled);
        assert!(summary.cancelled >= 4);
        assert_eq!(summary.outstanding, 0);
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_seed_does_not_let_a_deeper_level_claim_shared_targets() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.link("chan_a", &["chan_c"]);
        remote.link("chan_c", &["chan_y"]);
        remote.link("chan_b", &["chan_y"]);
        remote.link("chan_y", &["chan_z"]);
        remote.link("chan_z", &["chan_q"]);
        remote.delay_subject("chan_b", Duration::from_millis(400));
        let (_dir, db, scheduler) = harness(&remote, &["alpha", "beta"], settings(2));

        let run_id = scheduler
            .start_discovery(vec!["chan_a".into(), "chan_b".into()], Some(3))
            .unwrap();
        let summary = wait(&scheduler, &run_id).await;

        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.done, 5);
        assert_eq!(db.get_target("chan_y").unwrap().unwrap().depth, 1);
        let chan_z = db.get_target("chan_z").unwrap().unwrap();
        assert_eq!(chan_z.depth, 2);
        assert_eq!(remote.calls_for("list_entity_content", "chan_y"), 1);
        assert_eq!(remote.calls_for("list_entity_content", "chan_z"), 1);
        assert_eq!(db.get_target("chan_q").unwrap().unwrap().depth, 3);
        assert_eq!(remote.calls_for("list_entity_content", "chan_q"), 0);
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn personal_copies_are_relayed_one_at_a_time() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_latency(Duration::from_millis(20));
        remote.grant_access("alpha", &["chan_a", "chan_b"]);
        remote.add_items("chan_a", 1..=3);
        remote.add_items("chan_b", 1..=3);
        let mut config = settings(3);
        config.personal_fanout = true;
        let (_dir, _db, scheduler) = harness(&remote, &["alpha", "beta", "gamma"], config);

        let inventory = scheduler.start_inventory().unwrap();
        wait(&scheduler, &inventory).await;
        let run_id = scheduler.start_total_forward(None).unwrap();
        let summary = wait(&scheduler, &run_id).await;

        assert_eq!(summary.state, RunState::Done);
        let personal: Vec<_> = remote
            .relays()
            .into_iter()
            .filter(|r| r.request.destination == Destination::Personal)
            .collect();
        assert_eq!(personal.len(), 18);
        assert_eq!(remote.personal_high_water(), 1);

        // Every credential gets an item before the next item starts
        let first_item: Vec<_> = personal[..3].iter().map(|r| r.request.item_id).collect();
        assert!(first_item.iter().all(|id| *id == first_item[0]));
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn graph_sync_starts_with_the_most_referenced_target() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.link("chan_s1", &["chan_hub", "chan_mid"]);
        remote.link("chan_s2", &["chan_hub", "chan_mid"]);
        remote.link("chan_s3", &["chan_hub"]);
        remote.add_items("chan_hub", 1..=2);
        remote.add_items("chan_mid", 1..=2);
        let (_dir, db, scheduler) = harness(&remote, &["alpha"], settings(1));

        let discovery = scheduler
            .start_discovery(vec!["chan_s1".into(), "chan_s2".into(), "chan_s3".into()], Some(1))
            .unwrap();
        wait(&scheduler, &discovery).await;
        assert_eq!(db.get_target("chan_hub").unwrap().unwrap().in_degree, 3);
        assert_eq!(db.get_target("chan_mid").unwrap().unwrap().in_degree, 2);

        let before = remote.call_order("list_entity_content").len();
        let sync = scheduler.start_sync_from_graph(10, 0.0).unwrap();
        let summary = wait(&scheduler, &sync).await;
        assert_eq!(summary.done, 5);

        let order = remote.call_order("list_entity_content")[before..].to_vec();
        let position = |key: &str| order.iter().position(|s| s == key).unwrap();
        assert_eq!(position("chan_hub"), 0);
        assert!(position("chan_mid") < position("chan_s1"));
        assert!(position("chan_mid") < position("chan_s3"));
        assert_eq!(db.count_messages("chan_hub").unwrap(), 2);
        scheduler.shutdown().await;
    }

    #[test]
    fn forward_without_destination_is_rejected() {
        let remote = Arc::new(ScriptedRemote::new());
        let (_dir, db) = temp_db();
        let mut config = settings(1);
        config.default_destination = None;
        let scheduler = Scheduler::new(
            Arc::new(db),
            Fetcher::new(remote, Duration::from_secs(1)),
            Arc::new(CredentialPool::new(vec![credential("alpha")], 3)),
            Arc::new(EgressPool::new(Vec::new(), 3)),
            config,
        );
        assert!(matches!(
            scheduler.start_forward("chan_a", None),
            Err(crate::error::SchedulerError::NoDestination)
        ));
        assert!(matches!(
            scheduler.start_discovery(vec!["  ".into()], None),
            Err(crate::error::SchedulerError::NothingToDo)
        ));
    }
}
