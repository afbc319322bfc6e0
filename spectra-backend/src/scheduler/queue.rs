//! Priority work queue with delayed requeues
//!
//! Ready tasks pop highest priority first, FIFO within a priority, which
//! makes discovery breadth-first. Requeued tasks can carry a `not_before`
//! instant and stay parked until then.

use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::task::TaskEnvelope;

/// Upper bound on how long an idle worker sleeps between queue checks
const IDLE_POLL: Duration = Duration::from_millis(250);

struct Ready(TaskEnvelope);

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then(Reverse(self.0.seq).cmp(&Reverse(other.0.seq)))
    }
}

struct Delayed(Instant, TaskEnvelope);

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // Earliest due first in a max-heap
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.0.cmp(&self.0).then(other.1.seq.cmp(&self.1.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    ready: BinaryHeap<Ready>,
    delayed: BinaryHeap<Delayed>,
}

impl QueueInner {
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.0 <= now) {
            if let Some(Delayed(_, mut envelope)) = self.delayed.pop() {
                envelope.not_before = None;
                self.ready.push(Ready(envelope));
            }
        }
    }
}

/// Statistics for the work queue
#[derive(Debug, Default)]
pub struct QueueStats {
    pub enqueued: AtomicU64,
    pub dequeued: AtomicU64,
    /// Tasks put back after a retryable failure or a busy credential
    pub requeued: AtomicU64,
    pub purged: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub ready: usize,
    pub delayed: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub requeued: u64,
    pub purged: u64,
}

pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    next_seq: AtomicU64,
    stats: QueueStats,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            next_seq: AtomicU64::new(0),
            stats: QueueStats::default(),
        }
    }

    pub fn push(&self, envelope: TaskEnvelope) {
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.insert(envelope);
    }

    /// Put a task back, runnable after `delay`
    pub fn requeue(&self, mut envelope: TaskEnvelope, delay: Duration) {
        self.stats.requeued.fetch_add(1, Ordering::Relaxed);
        envelope.not_before = (!delay.is_zero()).then(|| Instant::now() + delay);
        self.insert(envelope);
    }

    fn insert(&self, mut envelope: TaskEnvelope) {
        envelope.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock();
            match envelope.not_before {
                Some(at) if at > Instant::now() => inner.delayed.push(Delayed(at, envelope)),
                _ => inner.ready.push(Ready(envelope)),
            }
        }
        self.notify.notify_one();
    }

    /// Next runnable task. Waits while the queue is empty; `None` once
    /// `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<TaskEnvelope> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let wait = {
                let mut inner = self.inner.lock();
                let now = Instant::now();
                inner.promote_due(now);
                if let Some(Ready(envelope)) = inner.ready.pop() {
                    self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
                    return Some(envelope);
                }
                inner
                    .delayed
                    .peek()
                    .map(|d| d.0.saturating_duration_since(now).min(IDLE_POLL))
                    .unwrap_or(IDLE_POLL)
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Remove every queued task of a run
    pub fn purge_run(&self, run_id: &str) -> Vec<TaskEnvelope> {
        let mut inner = self.inner.lock();
        let mut removed = Vec::new();

        let ready = std::mem::take(&mut inner.ready);
        for Ready(envelope) in ready.into_vec() {
            if envelope.run_id == run_id {
                removed.push(envelope);
            } else {
                inner.ready.push(Ready(envelope));
            }
        }

        let delayed = std::mem::take(&mut inner.delayed);
        for Delayed(at, envelope) in delayed.into_vec() {
            if envelope.run_id == run_id {
                removed.push(envelope);
            } else {
                inner.delayed.push(Delayed(at, envelope));
            }
        }

        self.stats.purged.fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.ready.len() + inner.delayed.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let (ready, delayed) = {
            let inner = self.inner.lock();
            (inner.ready.len(), inner.delayed.len())
        };
        QueueSnapshot {
            ready,
            delayed,
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            dequeued: self.stats.dequeued.load(Ordering::Relaxed),
            requeued: self.stats.requeued.load(Ordering::Relaxed),
            purged: self.stats.purged.load(Ordering::Relaxed),
        }
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{DiscoverJob, Task};

    fn expand(run: &str, target: &str, priority: i64) -> TaskEnvelope {
        TaskEnvelope::new(
            run,
            Task::Discover(DiscoverJob::Expand {
                target: target.into(),
                depth: 0,
            }),
            priority,
        )
    }

    fn subject(envelope: &TaskEnvelope) -> String {
        envelope.task.subject()
    }

    #[tokio::test]
    async fn pops_by_priority_then_fifo() {
        let queue = WorkQueue::new();
        let cancel = CancellationToken::new();
        queue.push(expand("r", "low-1", 0));
        queue.push(expand("r", "high", 5));
        queue.push(expand("r", "low-2", 0));

        let order: Vec<String> = vec![
            subject(&queue.pop(&cancel).await.unwrap()),
            subject(&queue.pop(&cancel).await.unwrap()),
            subject(&queue.pop(&cancel).await.unwrap()),
        ];
        assert_eq!(order, vec!["high", "low-1", "low-2"]);
    }

    #[tokio::test]
    async fn delayed_task_waits_for_its_time() {
        let queue = WorkQueue::new();
        let cancel = CancellationToken::new();
        queue.requeue(expand("r", "later", 10), Duration::from_millis(60));
        queue.push(expand("r", "now", 0));

        let started = Instant::now();
        assert_eq!(subject(&queue.pop(&cancel).await.unwrap()), "now");
        assert_eq!(subject(&queue.pop(&cancel).await.unwrap()), "later");
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(queue.snapshot().requeued, 1);
    }

    #[tokio::test]
    async fn cancelled_pop_returns_none() {
        let queue = std::sync::Arc::new(WorkQueue::new());
        let cancel = CancellationToken::new();
        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.pop(&cancel).await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn purge_removes_only_that_run() {
        let queue = WorkQueue::new();
        queue.push(expand("a", "x", 0));
        queue.push(expand("b", "y", 0));
        queue.requeue(expand("a", "z", 0), Duration::from_secs(60));

        let removed = queue.purge_run("a");
        assert_eq!(removed.len(), 2);
        assert_eq!(queue.len(), 1);
    }
}
