//! Scheduled work: a closed set of task variants with explicit payloads

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::remote::Destination;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum DiscoverJob {
    /// Fetch a sample of `target` and follow its references
    Expand { target: String, depth: u32 },
    /// List everything `credential` can reach
    Inventory { credential: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Incremental,
    /// Re-fetch archived ids for edits
    Edits,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncJob {
    pub target: String,
    pub mode: SyncMode,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum ForwardJob {
    Stream {
        origin: String,
        destination: Destination,
        /// Credential known to reach `origin`, if any
        credential: Option<String>,
        personal_fanout: bool,
    },
    /// One item into one credential's personal archive. A run relays its
    /// personal copies one at a time, in item then credential order.
    Personal {
        origin: String,
        item_id: i64,
        credential: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    Discover(DiscoverJob),
    Sync(SyncJob),
    Forward(ForwardJob),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Discover,
    Sync,
    Forward,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Discover => "discover",
            TaskKind::Sync => "sync",
            TaskKind::Forward => "forward",
        }
    }
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Discover(_) => TaskKind::Discover,
            Task::Sync(_) => TaskKind::Sync,
            Task::Forward(_) => TaskKind::Forward,
        }
    }

    /// Credential this task must run under, if any
    pub fn required_credential(&self) -> Option<&str> {
        match self {
            Task::Discover(DiscoverJob::Inventory { credential }) => Some(credential.as_str()),
            Task::Forward(ForwardJob::Stream { credential, .. }) => credential.as_deref(),
            Task::Forward(ForwardJob::Personal { credential, .. }) => Some(credential.as_str()),
            _ => None,
        }
    }

    /// Key for per-target outcomes and backoff
    pub fn subject(&self) -> String {
        match self {
            Task::Discover(DiscoverJob::Expand { target, .. }) => target.clone(),
            Task::Discover(DiscoverJob::Inventory { credential }) => format!("inventory:{}", credential),
            Task::Sync(job) => match job.mode {
                SyncMode::Incremental => job.target.clone(),
                SyncMode::Edits => format!("{}:edits", job.target),
            },
            Task::Forward(ForwardJob::Stream { origin, .. }) => origin.clone(),
            Task::Forward(ForwardJob::Personal {
                origin,
                item_id,
                credential,
            }) => format!("{}#{}@{}", origin, item_id, credential),
        }
    }
}

/// A task as it sits in the queue
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    pub id: String,
    pub run_id: String,
    pub task: Task,
    /// Attempts that counted against the retry budget
    pub attempts: u32,
    /// Higher runs first
    pub priority: i64,
    pub not_before: Option<Instant>,
    pub(crate) seq: u64,
}

impl TaskEnvelope {
    pub fn new(run_id: &str, task: Task, priority: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            task,
            attempts: 0,
            priority,
            not_before: None,
            seq: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn personal_copy_is_pinned_to_its_credential() {
        let copy = Task::Forward(ForwardJob::Personal {
            origin: "o".into(),
            item_id: 9,
            credential: "b".into(),
        });
        assert_eq!(copy.required_credential(), Some("b"));
        assert_eq!(copy.subject(), "o#9@b");
        assert_eq!(copy.kind(), TaskKind::Forward);
    }

    #[test]
    fn only_pinned_tasks_require_a_credential() {
        let expand = Task::Discover(DiscoverJob::Expand {
            target: "t".into(),
            depth: 0,
        });
        assert_eq!(expand.required_credential(), None);
        assert_eq!(expand.kind(), TaskKind::Discover);

        let stream = Task::Forward(ForwardJob::Stream {
            origin: "o".into(),
            destination: Destination::entity("d"),
            credential: None,
            personal_fanout: false,
        });
        assert_eq!(stream.required_credential(), None);
    }
}
