//! Relay log: each item reaches each destination at most once

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Result as SqliteResult};

use super::super::Database;

impl Database {
    pub fn has_relayed(&self, destination: &str, origin: &str, item_id: i64) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM relays WHERE destination = ?1 AND origin = ?2 AND item_id = ?3",
                params![destination, origin, item_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns false if the relay was already recorded
    pub fn record_relay(&self, destination: &str, origin: &str, item_id: i64, credential_id: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO relays (destination, origin, item_id, credential_id, relayed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![destination, origin, item_id, credential_id, Utc::now().to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    pub fn count_relays(&self, destination: &str) -> SqliteResult<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM relays WHERE destination = ?1",
            [destination],
            |row| row.get(0),
        )
    }
}
