//! Checkpoint store: durable, monotonic progress markers

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};

use super::super::{parse_ts, Database};
use crate::models::Checkpoint;

impl Database {
    pub fn get_checkpoint(&self, context: &str) -> SqliteResult<Option<Checkpoint>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT context, marker, updated_at FROM checkpoints WHERE context = ?1",
            [context],
            |row| {
                let updated_at: String = row.get(2)?;
                Ok(Checkpoint {
                    context: row.get(0)?,
                    marker: row.get(1)?,
                    updated_at: parse_ts(&updated_at).unwrap_or_else(Utc::now),
                })
            },
        )
        .optional()
    }

    /// Marker of `context`, or 0 when the stream never advanced
    pub fn checkpoint_marker(&self, context: &str) -> SqliteResult<i64> {
        Ok(self.get_checkpoint(context)?.map(|c| c.marker).unwrap_or(0))
    }

    /// Move a checkpoint forward. Returns false if `marker` is not beyond
    /// the stored one; the stored marker is then left untouched.
    pub fn advance_checkpoint(&self, context: &str, marker: i64) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        Self::advance_checkpoint_in(&conn, context, marker)
    }

    pub(super) fn advance_checkpoint_in(conn: &Connection, context: &str, marker: i64) -> SqliteResult<bool> {
        let changed = conn.execute(
            "INSERT INTO checkpoints (context, marker, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(context) DO UPDATE SET marker = excluded.marker, updated_at = excluded.updated_at
             WHERE excluded.marker > checkpoints.marker",
            params![context, marker, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    pub fn list_checkpoints(&self, prefix: &str) -> SqliteResult<Vec<Checkpoint>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT context, marker, updated_at FROM checkpoints WHERE context LIKE ?1 || '%' ORDER BY context",
        )?;
        let checkpoints = stmt
            .query_map([prefix], |row| {
                let updated_at: String = row.get(2)?;
                Ok(Checkpoint {
                    context: row.get(0)?,
                    marker: row.get(1)?,
                    updated_at: parse_ts(&updated_at).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::temp_db;

    #[test]
    fn checkpoint_never_regresses() {
        let (_dir, db) = temp_db();
        assert_eq!(db.checkpoint_marker("sync:t").unwrap(), 0);

        assert!(db.advance_checkpoint("sync:t", 100).unwrap());
        assert!(!db.advance_checkpoint("sync:t", 40).unwrap());
        assert!(!db.advance_checkpoint("sync:t", 100).unwrap());
        assert_eq!(db.checkpoint_marker("sync:t").unwrap(), 100);

        assert!(db.advance_checkpoint("sync:t", 105).unwrap());
        assert_eq!(db.get_checkpoint("sync:t").unwrap().unwrap().marker, 105);
        assert_eq!(db.list_checkpoints("sync:").unwrap().len(), 1);
    }
}
