use chrono::{DateTime, Utc};
use serde::Serialize;

/// A message row as stored in the archive
#[derive(Debug, Clone, Serialize)]
pub struct ArchivedMessage {
    pub target_key: String,
    pub id: i64,
    pub date: DateTime<Utc>,
    pub edit_date: Option<DateTime<Utc>>,
    pub content: Option<String>,
    pub reply_to: Option<i64>,
    pub user_id: Option<i64>,
    pub media_checksum: Option<String>,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchivedUser {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Attachment metadata, deduplicated by checksum
#[derive(Debug, Clone, Serialize)]
pub struct ArchivedMedia {
    pub checksum: String,
    pub kind: String,
    pub file_ref: String,
    pub file_name: Option<String>,
    pub size: i64,
}

/// Everything one remote item contributes to the archive
#[derive(Debug, Clone)]
pub struct ArchiveRow {
    pub message: ArchivedMessage,
    pub user: Option<ArchivedUser>,
    pub media: Option<ArchivedMedia>,
}

/// What a committed batch did to the messages table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub unchanged: usize,
    pub edited: usize,
}

/// Per-target archive counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct TargetArchiveStats {
    pub messages: i64,
    pub first_id: Option<i64>,
    pub last_id: Option<i64>,
    pub edited: i64,
}
