//! Run bookkeeping: state machine, outstanding tasks, per-target outcomes

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::task::{Task, TaskEnvelope};
use crate::crawler::Frontier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Discovery,
    Inventory,
    Sync,
    Forward,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Discovery => "discovery",
            RunKind::Inventory => "inventory",
            RunKind::Sync => "sync",
            RunKind::Forward => "forward",
        }
    }
}

/// `Pending -> InProgress -> Done | Failed | Cancelled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    InProgress,
    Done,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed | RunState::Cancelled)
    }
}

/// Terminal state of one task subject within a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TargetOutcome {
    Done,
    Unreachable(String),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Default)]
struct RunCounters {
    done: AtomicU64,
    unreachable: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
    rate_limited: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub kind: RunKind,
    pub state: RunState,
    pub max_depth: Option<u32>,
    pub admitted: Option<usize>,
    pub outstanding: usize,
    pub done: u64,
    pub unreachable: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub rate_limited: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub targets: BTreeMap<String, TargetOutcome>,
}

/// Expand tasks by depth. Only the shallowest unfinished level is in the
/// queue; deeper tasks wait here until it drains.
#[derive(Debug, Default)]
struct Levels {
    open: Option<u32>,
    unfinished: BTreeMap<u32, usize>,
    parked: BTreeMap<u32, Vec<TaskEnvelope>>,
}

/// Personal-archive copies of one run, relayed one at a time
#[derive(Debug, Default)]
struct PersonalLane {
    in_flight: bool,
    backlog: VecDeque<Task>,
}

pub struct RunHandle {
    pub id: String,
    pub kind: RunKind,
    pub cancel: CancellationToken,
    state: watch::Sender<RunState>,
    outstanding: AtomicUsize,
    frontier: Option<Mutex<Frontier>>,
    levels: Mutex<Levels>,
    personal: Mutex<PersonalLane>,
    outcomes: DashMap<String, TargetOutcome>,
    counters: RunCounters,
    started_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl RunHandle {
    pub fn new(kind: RunKind, parent: &CancellationToken, max_depth: Option<u32>) -> Self {
        let (state, _) = watch::channel(RunState::Pending);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            cancel: parent.child_token(),
            state,
            outstanding: AtomicUsize::new(0),
            frontier: max_depth.map(|d| Mutex::new(Frontier::new(d))),
            levels: Mutex::new(Levels::default()),
            personal: Mutex::new(PersonalLane::default()),
            outcomes: DashMap::new(),
            counters: RunCounters::default(),
            started_at: Utc::now(),
            finished_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Admit a discovery target for expansion at `depth`
    pub fn admit(&self, key: &str, depth: u32) -> bool {
        match &self.frontier {
            Some(frontier) => frontier.lock().admit(key, depth),
            None => false,
        }
    }

    pub fn max_depth(&self) -> Option<u32> {
        self.frontier.as_ref().map(|f| f.lock().max_depth())
    }

    /// Targets admitted for expansion so far
    pub fn admitted(&self) -> Option<usize> {
        self.frontier.as_ref().map(|f| f.lock().visited())
    }

    /// Register an Expand task at `depth`. Returns it back when it may be
    /// queued now; otherwise it is held until shallower levels finish.
    pub fn hold_expand(&self, depth: u32, envelope: TaskEnvelope) -> Option<TaskEnvelope> {
        let mut levels = self.levels.lock();
        *levels.unfinished.entry(depth).or_insert(0) += 1;
        let open = levels.open;
        match open {
            Some(open) if depth > open => {
                levels.parked.entry(depth).or_default().push(envelope);
                None
            }
            Some(_) => Some(envelope),
            None => {
                levels.open = Some(depth);
                Some(envelope)
            }
        }
    }

    /// An Expand task at `depth` reached a terminal state. Returns the next
    /// level's tasks once every shallower task is done.
    pub fn expand_finished(&self, depth: u32) -> Vec<TaskEnvelope> {
        let mut levels = self.levels.lock();
        if let Some(count) = levels.unfinished.get_mut(&depth) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                levels.unfinished.remove(&depth);
            }
        }

        let open = levels.open.unwrap_or(0);
        if levels.unfinished.range(..=open).next().is_some() {
            return Vec::new();
        }
        let next = levels.unfinished.keys().next().copied();
        levels.open = next;
        match next {
            Some(depth) => levels.parked.remove(&depth).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Add personal copies to the lane. Returns the one to start now when
    /// nothing is in flight.
    pub fn queue_personal(&self, copies: Vec<Task>) -> Option<Task> {
        let mut lane = self.personal.lock();
        lane.backlog.extend(copies);
        if lane.in_flight {
            return None;
        }
        let next = lane.backlog.pop_front();
        lane.in_flight = next.is_some();
        next
    }

    /// The copy in flight reached a terminal state; hand out the next one
    pub fn personal_finished(&self) -> Option<Task> {
        let mut lane = self.personal.lock();
        let next = lane.backlog.pop_front();
        lane.in_flight = next.is_some();
        next
    }

    /// Count a task that is about to be queued. Follow-ups must be counted
    /// before their parent finishes.
    pub fn task_added(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.state.send_if_modified(|state| {
            if *state == RunState::Pending {
                *state = RunState::InProgress;
                true
            } else {
                false
            }
        });
    }

    pub fn task_retried(&self, rate_limited: bool) {
        if rate_limited {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a task's terminal outcome. Returns true when it was the
    /// run's last outstanding task.
    pub fn task_finished(&self, subject: &str, outcome: TargetOutcome) -> bool {
        let counter = match &outcome {
            TargetOutcome::Done => &self.counters.done,
            TargetOutcome::Unreachable(_) => &self.counters.unreachable,
            TargetOutcome::Failed(_) => &self.counters.failed,
            TargetOutcome::Cancelled => &self.counters.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.outcomes.insert(subject.to_string(), outcome);
        self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Move to a terminal state. Single-target failures never fail a run;
    /// only a run where every task failed does.
    pub fn finalize(&self) -> RunState {
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let final_state = if self.is_cancelled() {
            RunState::Cancelled
        } else if failed > 0 && self.outcomes.iter().all(|e| matches!(e.value(), TargetOutcome::Failed(_))) {
            RunState::Failed
        } else {
            RunState::Done
        };

        *self.finished_at.lock() = Some(Utc::now());
        self.state.send_replace(final_state);
        final_state
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.lock()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            kind: self.kind,
            state: self.state(),
            max_depth: self.max_depth(),
            admitted: self.admitted(),
            outstanding: self.outstanding(),
            done: self.counters.done.load(Ordering::Relaxed),
            unreachable: self.counters.unreachable.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            started_at: self.started_at,
            finished_at: *self.finished_at.lock(),
            targets: self
                .outcomes
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }
}

/// All runs started in this process
#[derive(Default)]
pub struct RunRegistry {
    runs: DashMap<String, Arc<RunHandle>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, run: Arc<RunHandle>) {
        self.runs.insert(run.id.clone(), run);
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.runs.get(run_id).map(|r| r.value().clone())
    }

    pub fn summaries(&self) -> Vec<RunSummary> {
        let mut summaries: Vec<RunSummary> = self.runs.iter().map(|r| r.value().summary()).collect();
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        summaries
    }

    /// Forget terminal runs that finished before `cutoff`
    pub fn evict_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.runs.len();
        self.runs.retain(|_, run| {
            !(run.state().is_terminal() && run.finished_at().is_some_and(|at| at < cutoff))
        });
        before - self.runs.len()
    }

    pub fn active(&self) -> Vec<Arc<RunHandle>> {
        self.runs
            .iter()
            .filter(|r| !r.value().state().is_terminal())
            .map(|r| r.value().clone())
            .collect()
    }
}
