//! Integrity checksums for archived content

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::models::{ArchiveRow, ArchivedMedia, ArchivedMessage, ArchivedUser};
use crate::remote::{RemoteItem, RemoteMedia};

const FIELD_SEP: u8 = 0x1f;

struct Canonical(Sha256);

impl Canonical {
    fn new() -> Self {
        Canonical(Sha256::new())
    }

    fn field(mut self, value: Option<&str>) -> Self {
        match value {
            Some(v) => {
                self.0.update(b"s");
                self.0.update(v.as_bytes());
            }
            None => self.0.update(b"n"),
        }
        self.0.update([FIELD_SEP]);
        self
    }

    fn int(self, value: Option<i64>) -> Self {
        let text = value.map(|v| v.to_string());
        self.field(text.as_deref())
    }

    fn finish(self) -> String {
        hex::encode(self.0.finalize())
    }
}

pub fn media_checksum(media: &RemoteMedia) -> String {
    Canonical::new()
        .field(Some(&media.kind))
        .field(Some(&media.file_ref))
        .field(media.file_name.as_deref())
        .int(Some(media.size))
        .finish()
}

#[allow(clippy::too_many_arguments)]
fn message_checksum(
    target: &str,
    id: i64,
    date: DateTime<Utc>,
    edit_date: Option<DateTime<Utc>>,
    content: Option<&str>,
    reply_to: Option<i64>,
    user_id: Option<i64>,
    media_checksum: Option<&str>,
) -> String {
    Canonical::new()
        .field(Some(target))
        .int(Some(id))
        .int(Some(date.timestamp()))
        .int(edit_date.map(|d| d.timestamp()))
        .field(content)
        .int(reply_to)
        .int(user_id)
        .field(media_checksum)
        .finish()
}

/// Checksum of a stored message, recomputed from its columns
pub fn stored_checksum(message: &ArchivedMessage) -> String {
    message_checksum(
        &message.target_key,
        message.id,
        message.date,
        message.edit_date,
        message.content.as_deref(),
        message.reply_to,
        message.user_id,
        message.media_checksum.as_deref(),
    )
}

/// Convert a fetched item into the rows it contributes
pub fn to_archive_row(target: &str, item: &RemoteItem) -> ArchiveRow {
    let media = item.media.as_ref().map(|m| ArchivedMedia {
        checksum: media_checksum(m),
        kind: m.kind.clone(),
        file_ref: m.file_ref.clone(),
        file_name: m.file_name.clone(),
        size: m.size,
    });
    let user = item.sender.as_ref().map(|u| ArchivedUser {
        id: u.id,
        username: u.username.clone(),
        first_name: u.first_name.clone(),
        last_name: u.last_name.clone(),
    });

    let mut message = ArchivedMessage {
        target_key: target.to_string(),
        id: item.id,
        date: item.date,
        edit_date: item.edit_date,
        content: item.text.clone(),
        reply_to: item.reply_to,
        user_id: user.as_ref().map(|u| u.id),
        media_checksum: media.as_ref().map(|m| m.checksum.clone()),
        checksum: String::new(),
    };
    message.checksum = stored_checksum(&message);

    ArchiveRow { message, user, media }
}
