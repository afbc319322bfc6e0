//! Scheduler / worker pool
//!
//! A fixed pool of W tokio workers pulls tasks from one priority queue.
//! Each task runs under exactly one checked-out credential + route pair,
//! so at most W pairs are ever held. Runs group tasks: a run finishes when
//! its last outstanding task reaches a terminal state.

pub mod backoff;
pub mod queue;
pub mod runs;
pub mod task;
mod worker;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::archive::{ArchiveSync, IntegrityReport};
use crate::crawler::DiscoveryEngine;
use crate::db::Database;
use crate::error::SchedulerError;
use crate::forwarding::{ForwardSettings, ForwardingEngine};
use crate::models::{CredentialStatus, RouteStatus};
use crate::pool::{CredentialPool, EgressPool};
use crate::remote::{Destination, Fetcher};

pub use backoff::{BackoffPolicy, RetryBackoff};
pub use queue::{QueueSnapshot, WorkQueue};
pub use runs::{RunHandle, RunKind, RunRegistry, RunState, RunSummary, TargetOutcome};
pub use task::{DiscoverJob, ForwardJob, SyncJob, SyncMode, Task, TaskEnvelope, TaskKind};

/// Edit passes run after everything else that is ready
const EDIT_PASS_PRIORITY_OFFSET: i64 = -1_000_000;
/// Finished runs stay visible to the control API this long
const RUN_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub max_retries: u32,
    pub max_depth: u32,
    pub sample_limit: usize,
    pub batch_size: usize,
    pub backoff: BackoffPolicy,
    pub default_destination: Option<Destination>,
    pub personal_fanout: bool,
    pub forward: ForwardSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub workers: usize,
    pub running: bool,
    pub pairs_checked_out: usize,
    pub max_pairs_checked_out: usize,
    pub credentials_in_use: usize,
    pub routes_in_use: usize,
    pub active_runs: usize,
    pub queue: QueueSnapshot,
    pub credentials: Vec<CredentialStatus>,
    pub routes: Vec<RouteStatus>,
    pub direct_egress: bool,
    pub runs: Vec<RunSummary>,
}

pub(crate) struct SchedulerInner {
    db: Arc<Database>,
    credentials: Arc<CredentialPool>,
    egress: Arc<EgressPool>,
    queue: WorkQueue,
    runs: RunRegistry,
    discovery: DiscoveryEngine,
    archive: ArchiveSync,
    forwarding: ForwardingEngine,
    backoff: RetryBackoff,
    settings: SchedulerSettings,
    shutdown: CancellationToken,
    pairs_checked_out: AtomicUsize,
    max_pairs_checked_out: AtomicUsize,
}

/// Cheap to clone; all clones drive the same worker pool
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn new(
        db: Arc<Database>,
        fetcher: Fetcher,
        credentials: Arc<CredentialPool>,
        egress: Arc<EgressPool>,
        settings: SchedulerSettings,
    ) -> Self {
        let inner = SchedulerInner {
            discovery: DiscoveryEngine::new(db.clone(), fetcher.clone(), settings.sample_limit),
            archive: ArchiveSync::new(db.clone(), fetcher.clone(), settings.batch_size),
            forwarding: ForwardingEngine::new(db.clone(), fetcher, settings.forward.clone()),
            backoff: RetryBackoff::new(settings.backoff),
            db,
            credentials,
            egress,
            queue: WorkQueue::new(),
            runs: RunRegistry::new(),
            settings,
            shutdown: CancellationToken::new(),
            pairs_checked_out: AtomicUsize::new(0),
            max_pairs_checked_out: AtomicUsize::new(0),
        };

        Self {
            inner: Arc::new(inner),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn the worker pool. Calling it again is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        let count = self.inner.settings.workers.max(1);
        for index in 0..count {
            let inner = self.inner.clone();
            workers.push(tokio::spawn(async move { inner.worker_loop(index).await }));
        }
        log::info!("[SCHEDULER] started {} workers", count);
    }

    /// Cancel every run and wait for workers to drain their current task
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("[SCHEDULER] worker ended abnormally: {}", e);
            }
        }
        log::info!("[SCHEDULER] stopped");
    }

    /// Breadth-first discovery from `seeds` down to `max_depth`
    /// (configured depth when `None`)
    pub fn start_discovery(&self, seeds: Vec<String>, max_depth: Option<u32>) -> Result<String, SchedulerError> {
        let seeds: Vec<String> = seeds
            .into_iter()
            .map(|s| s.trim().trim_start_matches('@').to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        if seeds.is_empty() {
            return Err(SchedulerError::NothingToDo);
        }

        let depth = max_depth.unwrap_or(self.inner.settings.max_depth);
        self.inner.discovery.register_seeds(&seeds)?;
        let run = self.inner.new_run(RunKind::Discovery, Some(depth));
        for seed in &seeds {
            if run.admit(seed, 0) {
                self.inner.enqueue_expand(&run, seed, 0);
            }
        }
        log::info!(
            "[DISCOVERY] run {} started with {} seeds, max depth {}",
            run.id,
            seeds.len(),
            depth
        );
        self.inner.complete_if_idle(&run);
        Ok(run.id.clone())
    }

    /// Continue discovery from the stored graph: every known target that
    /// was never expanded and is shallower than `max_depth`
    pub fn resume_discovery(&self, max_depth: Option<u32>) -> Result<String, SchedulerError> {
        let depth = max_depth.unwrap_or(self.inner.settings.max_depth);
        let frontier = self.inner.db.frontier_targets(depth)?;
        if frontier.is_empty() {
            return Err(SchedulerError::NothingToDo);
        }

        let run = self.inner.new_run(RunKind::Discovery, Some(depth));
        for target in &frontier {
            if run.admit(&target.key, target.depth) {
                self.inner.enqueue_expand(&run, &target.key, target.depth);
            }
        }
        log::info!(
            "[DISCOVERY] run {} resumed {} frontier targets, max depth {}",
            run.id,
            frontier.len(),
            depth
        );
        self.inner.complete_if_idle(&run);
        Ok(run.id.clone())
    }

    /// List every credential's reachable entities into access records
    pub fn start_inventory(&self) -> Result<String, SchedulerError> {
        let ids = self.inner.credentials.ids();
        if ids.is_empty() {
            return Err(SchedulerError::NothingToDo);
        }
        let run = self.inner.new_run(RunKind::Inventory, None);
        for credential in ids {
            self.inner.enqueue(&run, Task::Discover(DiscoverJob::Inventory { credential }), 0);
        }
        Ok(run.id.clone())
    }

    pub fn start_sync(&self, targets: Vec<String>, mode: SyncMode) -> Result<String, SchedulerError> {
        if targets.is_empty() {
            return Err(SchedulerError::NothingToDo);
        }
        let run = self.inner.new_run(RunKind::Sync, None);
        for target in targets {
            let mut priority = match self.inner.db.get_target(&target)? {
                Some(known) => (known.priority * 1000.0) as i64,
                None => 0,
            };
            if mode == SyncMode::Edits {
                priority += EDIT_PASS_PRIORITY_OFFSET;
            }
            self.inner.enqueue(&run, Task::Sync(SyncJob { target, mode }), priority);
        }
        log::info!("[SYNC] run {} started ({} targets)", run.id, run.outstanding());
        Ok(run.id.clone())
    }

    /// Sync the stored graph's highest-priority targets first
    pub fn start_sync_from_graph(&self, limit: usize, min_priority: f64) -> Result<String, SchedulerError> {
        let targets = self.inner.db.priority_targets(limit, min_priority)?;
        self.start_sync(targets.into_iter().map(|t| t.key).collect(), SyncMode::Incremental)
    }

    /// Relay one origin to `destination` (configured default when `None`)
    pub fn start_forward(&self, origin: &str, destination: Option<Destination>) -> Result<String, SchedulerError> {
        let destination = self.inner.destination(destination)?;
        let run = self.inner.new_run(RunKind::Forward, None);
        self.inner.enqueue(
            &run,
            Task::Forward(ForwardJob::Stream {
                origin: origin.to_string(),
                destination,
                credential: None,
                personal_fanout: self.inner.settings.personal_fanout,
            }),
            0,
        );
        Ok(run.id.clone())
    }

    /// Relay every target some credential can reach. Each target gets one
    /// stream, run by a credential known to reach it.
    pub fn start_total_forward(&self, destination: Option<Destination>) -> Result<String, SchedulerError> {
        let destination = self.inner.destination(destination)?;
        let mut by_target: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in self.inner.db.list_access_records()? {
            by_target.entry(record.target_key).or_default().push(record.credential_id);
        }
        if by_target.is_empty() {
            return Err(SchedulerError::NothingToDo);
        }

        let run = self.inner.new_run(RunKind::Forward, None);
        for (origin, holders) in by_target {
            let credential = holders.into_iter().find(|c| self.inner.credentials.is_usable(c));
            self.inner.enqueue(
                &run,
                Task::Forward(ForwardJob::Stream {
                    origin,
                    destination: destination.clone(),
                    credential,
                    personal_fanout: self.inner.settings.personal_fanout,
                }),
                0,
            );
        }
        log::info!("[FORWARD] total run {} started ({} origins)", run.id, run.outstanding());
        Ok(run.id.clone())
    }

    /// Cancel a run: queued tasks are dropped, running tasks stop before
    /// their next remote call
    pub fn stop_run(&self, run_id: &str) -> Result<RunSummary, SchedulerError> {
        let run = self
            .inner
            .runs
            .get(run_id)
            .ok_or_else(|| SchedulerError::UnknownRun(run_id.to_string()))?;
        run.cancel.cancel();
        for envelope in self.inner.queue.purge_run(run_id) {
            self.inner.finish(&run, &envelope, TargetOutcome::Cancelled);
        }
        log::info!("[SCHEDULER] run {} cancelled", run_id);
        Ok(run.summary())
    }

    pub fn run_summary(&self, run_id: &str) -> Option<RunSummary> {
        self.inner.runs.get(run_id).map(|r| r.summary())
    }

    pub fn list_runs(&self) -> Vec<RunSummary> {
        self.inner.runs.summaries()
    }

    /// Wait until a run reaches a terminal state
    pub async fn wait_for_run(&self, run_id: &str) -> Result<RunSummary, SchedulerError> {
        let run = self
            .inner
            .runs
            .get(run_id)
            .ok_or_else(|| SchedulerError::UnknownRun(run_id.to_string()))?;
        let mut rx = run.subscribe();
        // The sender lives in the run handle we hold, so this cannot close
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        Ok(run.summary())
    }

    /// Recompute stored checksums of one target's archive
    pub fn verify_checksums(&self, target: &str) -> rusqlite::Result<IntegrityReport> {
        self.inner.archive.verify_checksums(target)
    }

    pub fn credential_health(&self) -> Vec<CredentialStatus> {
        self.inner.credentials.snapshot()
    }

    pub fn route_health(&self) -> Vec<RouteStatus> {
        self.inner.egress.snapshot()
    }

    /// Zero the usage counters of every credential that is not disabled
    pub fn reset_usage(&self) -> Result<Vec<CredentialStatus>, SchedulerError> {
        let statuses = self.inner.credentials.reset_usage();
        for status in &statuses {
            self.inner.db.save_credential_status(status)?;
        }
        Ok(statuses)
    }

    pub fn reset_credential(&self, credential_id: &str) -> Result<CredentialStatus, SchedulerError> {
        let status = self
            .inner
            .credentials
            .reset(credential_id)
            .ok_or_else(|| SchedulerError::UnknownCredential(credential_id.to_string()))?;
        self.inner.db.save_credential_status(&status)?;
        Ok(status)
    }

    /// Manually re-enable an egress route. Returns false if unknown.
    pub fn reset_route(&self, route_id: &str) -> bool {
        self.inner.egress.reset(route_id)
    }

    pub fn reset_target(&self, key: &str) -> Result<bool, SchedulerError> {
        Ok(self.inner.db.reset_target(key)?)
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            workers: self.inner.settings.workers.max(1),
            running: !self.workers.lock().is_empty() && !self.inner.shutdown.is_cancelled(),
            pairs_checked_out: self.inner.pairs_checked_out.load(Ordering::SeqCst),
            max_pairs_checked_out: self.inner.max_pairs_checked_out.load(Ordering::SeqCst),
            credentials_in_use: self.inner.credentials.in_use_count(),
            routes_in_use: self.inner.egress.in_use_count(),
            active_runs: self.inner.runs.active().len(),
            queue: self.inner.queue.snapshot(),
            credentials: self.credential_health(),
            routes: self.route_health(),
            direct_egress: self.inner.egress.is_direct(),
            runs: self.list_runs(),
        }
    }
}

impl SchedulerInner {
    fn new_run(&self, kind: RunKind, max_depth: Option<u32>) -> Arc<RunHandle> {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(RUN_RETENTION_HOURS);
        let evicted = self.runs.evict_finished(cutoff);
        if evicted > 0 {
            log::debug!("[SCHEDULER] forgot {} finished runs", evicted);
        }
        let run = Arc::new(RunHandle::new(kind, &self.shutdown, max_depth));
        self.runs.insert(run.clone());
        run
    }

    fn destination(&self, requested: Option<Destination>) -> Result<Destination, SchedulerError> {
        requested
            .or_else(|| self.settings.default_destination.clone())
            .ok_or(SchedulerError::NoDestination)
    }

    /// Count the task against its run, then queue it
    fn enqueue(&self, run: &RunHandle, task: Task, priority: i64) {
        run.task_added();
        self.queue.push(TaskEnvelope::new(&run.id, task, priority));
    }

    /// Expand tasks deeper than the level in progress are held by the run
    /// until that level drains, so traversal stays breadth-first
    fn enqueue_expand(&self, run: &RunHandle, target: &str, depth: u32) {
        run.task_added();
        let envelope = TaskEnvelope::new(
            &run.id,
            Task::Discover(DiscoverJob::Expand {
                target: target.to_string(),
                depth,
            }),
            -(depth as i64),
        );
        if let Some(envelope) = run.hold_expand(depth, envelope) {
            self.queue.push(envelope);
        }
    }

    /// Queue personal copies on the run's lane; at most one is in flight
    fn enqueue_personal(&self, run: &RunHandle, copies: Vec<Task>) {
        if let Some(first) = run.queue_personal(copies) {
            self.enqueue(run, first, 0);
        }
    }

    fn complete_if_idle(&self, run: &RunHandle) {
        if run.outstanding() == 0 && !run.state().is_terminal() {
            self.complete_run(run);
        }
    }

    /// Record a task's terminal outcome and close the run if it was the last
    fn finish(&self, run: &RunHandle, envelope: &TaskEnvelope, outcome: TargetOutcome) {
        let (state, error) = match &outcome {
            TargetOutcome::Done => ("done", None),
            TargetOutcome::Unreachable(reason) => ("unreachable", Some(reason.as_str())),
            TargetOutcome::Failed(reason) => ("failed", Some(reason.as_str())),
            TargetOutcome::Cancelled => ("cancelled", None),
        };
        if let Err(e) = self.db.record_task_finish(&envelope.id, state, error) {
            log::error!("[DB] failed to journal task {}: {}", envelope.id, e);
        }

        match &envelope.task {
            Task::Discover(DiscoverJob::Expand { depth, .. }) => {
                for released in run.expand_finished(*depth) {
                    if run.is_cancelled() {
                        self.finish(run, &released, TargetOutcome::Cancelled);
                    } else {
                        self.queue.push(released);
                    }
                }
            }
            // Successor goes in before this task is counted out
            Task::Forward(ForwardJob::Personal { .. }) => {
                if let Some(next) = run.personal_finished() {
                    if !run.is_cancelled() {
                        self.enqueue(run, next, envelope.priority);
                    }
                }
            }
            _ => {}
        }

        if run.task_finished(&envelope.task.subject(), outcome) {
            self.complete_run(run);
        }
    }

    fn complete_run(&self, run: &RunHandle) {
        if run.kind == RunKind::Discovery && !run.is_cancelled() {
            if let Err(e) = self.db.recompute_priorities(chrono::Utc::now()) {
                log::error!("[DISCOVERY] priority recomputation failed: {}", e);
            }
        }
        let state = run.finalize();
        let summary = run.summary();
        log::info!(
            "[SCHEDULER] {} run {} finished {:?}: {} done, {} unreachable, {} failed, {} cancelled",
            run.kind.as_str(),
            run.id,
            state,
            summary.done,
            summary.unreachable,
            summary.failed,
            summary.cancelled
        );
    }
}
