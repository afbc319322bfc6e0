use chrono::{DateTime, Utc};
use serde::Serialize;

/// Journal entry for one scheduled task
#[derive(Debug, Clone, Serialize)]
pub struct TaskRunRecord {
    pub task_id: String,
    pub run_id: String,
    pub kind: String,
    pub subject: String,
    pub credential_id: Option<String>,
    pub route_id: Option<String>,
    pub attempts: u32,
    pub state: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
