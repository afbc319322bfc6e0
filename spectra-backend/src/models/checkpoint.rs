use chrono::{DateTime, Utc};
use serde::Serialize;

/// Durable progress marker of one resumable stream
#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    pub context: String,
    pub marker: i64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Incremental archive stream of one target
    pub fn sync_context(target: &str) -> String {
        format!("sync:{}", target)
    }

    /// Count of targets expanded by one discovery run
    pub fn discovery_context(run_id: &str) -> String {
        format!("discovery:{}", run_id)
    }

    /// Last item relayed from `origin` to `destination`
    pub fn forward_context(origin: &str, destination: &str) -> String {
        format!("forward:{}->{}", origin, destination)
    }
}
