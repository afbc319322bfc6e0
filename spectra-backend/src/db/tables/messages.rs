//! Archive content: users, media, messages

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Result as SqliteResult, Row};

use super::super::{parse_ts, Database};
use crate::error::{CrawlError, CrawlResult};
use crate::models::{ArchiveRow, ArchivedMessage, BatchOutcome, TargetArchiveStats};

impl Database {
    /// Commit one batch of archive rows and, optionally, advance a
    /// checkpoint, in a single transaction.
    ///
    /// Re-processing an id with an identical checksum is a no-op. A
    /// different checksum is accepted only as an edit whose `edit_date`
    /// is newer than the stored one; anything else aborts the whole batch
    /// with `IntegrityMismatch`.
    pub fn commit_batch(
        &self,
        target: &str,
        rows: &[ArchiveRow],
        checkpoint: Option<(&str, i64)>,
    ) -> CrawlResult<BatchOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut outcome = BatchOutcome::default();

        for row in rows {
            if let Some(user) = &row.user {
                tx.execute(
                    "INSERT INTO users (id, username, first_name, last_name, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                        username = COALESCE(excluded.username, users.username),
                        first_name = COALESCE(excluded.first_name, users.first_name),
                        last_name = COALESCE(excluded.last_name, users.last_name),
                        updated_at = excluded.updated_at",
                    params![user.id, &user.username, &user.first_name, &user.last_name, &now],
                )?;
            }

            if let Some(media) = &row.media {
                tx.execute(
                    "INSERT OR IGNORE INTO media (checksum, kind, file_ref, file_name, size, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![&media.checksum, &media.kind, &media.file_ref, &media.file_name, media.size, &now],
                )?;
            }

            let msg = &row.message;
            let stored: Option<(String, Option<String>)> = tx
                .query_row(
                    "SELECT checksum, edit_date FROM messages WHERE target_key = ?1 AND id = ?2",
                    params![target, msg.id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            match stored {
                None => {
                    tx.execute(
                        "INSERT INTO messages (target_key, id, date, edit_date, content, reply_to, user_id, media_checksum, checksum, archived_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        params![
                            target,
                            msg.id,
                            msg.date.to_rfc3339(),
                            msg.edit_date.map(|d| d.to_rfc3339()),
                            &msg.content,
                            msg.reply_to,
                            msg.user_id,
                            &msg.media_checksum,
                            &msg.checksum,
                            &now,
                        ],
                    )?;
                    outcome.inserted += 1;
                }
                Some((checksum, _)) if checksum == msg.checksum => {
                    outcome.unchanged += 1;
                }
                Some((checksum, stored_edit)) => {
                    let stored_edit = stored_edit.as_deref().and_then(parse_ts);
                    let newer = match (msg.edit_date, stored_edit) {
                        (Some(incoming), Some(stored)) => incoming > stored,
                        (Some(_), None) => true,
                        (None, _) => false,
                    };
                    if !newer {
                        return Err(CrawlError::IntegrityMismatch {
                            target: target.to_string(),
                            item_id: msg.id,
                            stored: checksum,
                            computed: msg.checksum.clone(),
                        });
                    }
                    tx.execute(
                        "UPDATE messages SET edit_date = ?3, content = ?4, reply_to = ?5,
                            media_checksum = ?6, checksum = ?7
                         WHERE target_key = ?1 AND id = ?2",
                        params![
                            target,
                            msg.id,
                            msg.edit_date.map(|d| d.to_rfc3339()),
                            &msg.content,
                            msg.reply_to,
                            &msg.media_checksum,
                            &msg.checksum,
                        ],
                    )?;
                    outcome.edited += 1;
                }
            }
        }

        if let Some((context, marker)) = checkpoint {
            Self::advance_checkpoint_in(&tx, context, marker)?;
        }

        tx.commit()?;
        Ok(outcome)
    }

    pub fn get_message(&self, target: &str, id: i64) -> SqliteResult<Option<ArchivedMessage>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT target_key, id, date, edit_date, content, reply_to, user_id, media_checksum, checksum
             FROM messages WHERE target_key = ?1 AND id = ?2",
            params![target, id],
            Self::row_to_message,
        )
        .optional()
    }

    /// Stored messages of a target with id > `after_id`, ascending
    pub fn list_messages(&self, target: &str, after_id: i64, limit: usize) -> SqliteResult<Vec<ArchivedMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT target_key, id, date, edit_date, content, reply_to, user_id, media_checksum, checksum
             FROM messages WHERE target_key = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
        )?;
        let messages = stmt
            .query_map(params![target, after_id, limit as i64], Self::row_to_message)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(messages)
    }

    pub fn message_ids(&self, target: &str, after_id: i64, limit: usize) -> SqliteResult<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM messages WHERE target_key = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
        )?;
        let ids = stmt
            .query_map(params![target, after_id, limit as i64], |row| row.get(0))?
            .collect::<SqliteResult<Vec<i64>>>()?;
        Ok(ids)
    }

    #[cfg(test)]
    pub fn count_messages(&self, target: &str) -> SqliteResult<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE target_key = ?1",
            [target],
            |row| row.get(0),
        )
    }

    pub fn count_media(&self) -> SqliteResult<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM media", [], |row| row.get(0))
    }

    pub fn archive_stats(&self, target: &str) -> SqliteResult<TargetArchiveStats> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*), MIN(id), MAX(id), COUNT(edit_date) FROM messages WHERE target_key = ?1",
            [target],
            |row| {
                Ok(TargetArchiveStats {
                    messages: row.get(0)?,
                    first_id: row.get(1)?,
                    last_id: row.get(2)?,
                    edited: row.get(3)?,
                })
            },
        )
    }

    fn row_to_message(row: &Row) -> SqliteResult<ArchivedMessage> {
        let date: String = row.get(2)?;
        let edit_date: Option<String> = row.get(3)?;
        Ok(ArchivedMessage {
            target_key: row.get(0)?,
            id: row.get(1)?,
            date: parse_ts(&date).unwrap_or_else(Utc::now),
            edit_date: edit_date.as_deref().and_then(parse_ts),
            content: row.get(4)?,
            reply_to: row.get(5)?,
            user_id: row.get(6)?,
            media_checksum: row.get(7)?,
            checksum: row.get(8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use crate::db::temp_db;
    use crate::error::CrawlError;
    use crate::models::{ArchiveRow, ArchivedMessage, ArchivedUser};

    fn row(id: i64, checksum: &str, edit_minutes: Option<i64>) -> ArchiveRow {
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        ArchiveRow {
            message: ArchivedMessage {
                target_key: "t".into(),
                id,
                date,
                edit_date: edit_minutes.map(|m| date + Duration::minutes(m)),
                content: Some(format!("body {}", checksum)),
                reply_to: None,
                user_id: Some(7),
                media_checksum: None,
                checksum: checksum.into(),
            },
            user: Some(ArchivedUser {
                id: 7,
                username: Some("someone".into()),
                first_name: None,
                last_name: None,
            }),
            media: None,
        }
    }

    #[test]
    fn replaying_a_batch_is_a_no_op() {
        let (_dir, db) = temp_db();
        let rows = vec![row(1, "a", None), row(2, "b", None)];

        let first = db.commit_batch("t", &rows, Some(("sync:t", 2))).unwrap();
        assert_eq!(first.inserted, 2);

        let replay = db.commit_batch("t", &rows, Some(("sync:t", 2))).unwrap();
        assert_eq!(replay.inserted, 0);
        assert_eq!(replay.unchanged, 2);
        assert_eq!(db.count_messages("t").unwrap(), 2);
        assert_eq!(db.checkpoint_marker("sync:t").unwrap(), 2);
    }

    #[test]
    fn differing_checksum_without_newer_edit_aborts_batch() {
        let (_dir, db) = temp_db();
        db.commit_batch("t", &[row(1, "a", None)], Some(("sync:t", 1))).unwrap();

        let err = db
            .commit_batch("t", &[row(2, "b", None), row(1, "tampered", None)], Some(("sync:t", 2)))
            .unwrap_err();
        assert!(matches!(err, CrawlError::IntegrityMismatch { item_id: 1, .. }));

        // Whole batch rolled back, checkpoint untouched
        assert_eq!(db.count_messages("t").unwrap(), 1);
        assert_eq!(db.checkpoint_marker("sync:t").unwrap(), 1);
    }

    #[test]
    fn newer_edit_replaces_content() {
        let (_dir, db) = temp_db();
        db.commit_batch("t", &[row(1, "a", Some(1))], None).unwrap();

        let outcome = db.commit_batch("t", &[row(1, "a2", Some(5))], None).unwrap();
        assert_eq!(outcome.edited, 1);

        let stored = db.get_message("t", 1).unwrap().unwrap();
        assert_eq!(stored.checksum, "a2");
        assert_eq!(stored.content.as_deref(), Some("body a2"));

        // An older edit is a mismatch
        assert!(db.commit_batch("t", &[row(1, "a3", Some(2))], None).is_err());
        assert_eq!(db.archive_stats("t").unwrap().edited, 1);
    }
}
