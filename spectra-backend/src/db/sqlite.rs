//! SQLite database - schema definitions and connection management
//!
//! This file contains:
//! - Database struct definition
//! - Connection management (new, init)
//! - Schema creation
//!
//! All table operations are in the tables/ subdirectory.

use parking_lot::Mutex;
use rusqlite::{Connection, Result as SqliteResult};
use std::path::Path;

/// Content and checkpoint store. One connection, serialized by a mutex;
/// every multi-row write runs inside a transaction.
pub struct Database {
    pub(crate) conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and initialize the schema
    pub fn new(database_url: &str) -> SqliteResult<Self> {
        if let Some(parent) = Path::new(database_url).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }

        let conn = Connection::open(database_url)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqliteResult<()> {
        let conn = self.conn.lock();

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Discovery graph nodes
        conn.execute(
            "CREATE TABLE IF NOT EXISTS targets (
                key TEXT PRIMARY KEY,
                title TEXT,
                kind TEXT NOT NULL DEFAULT 'unknown',
                depth INTEGER NOT NULL,
                priority REAL NOT NULL DEFAULT 0,
                in_degree INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'discovered',
                last_error TEXT,
                discovered_at TEXT NOT NULL,
                last_referenced_at TEXT,
                expanded_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_targets_priority ON targets(priority DESC)",
            [],
        )?;

        // Append-only graph edges
        conn.execute(
            "CREATE TABLE IF NOT EXISTS edges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL REFERENCES targets(key),
                destination TEXT NOT NULL REFERENCES targets(key),
                run_id TEXT,
                discovered_at TEXT NOT NULL,
                UNIQUE(source, destination)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS discovery_sources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                target_key TEXT NOT NULL REFERENCES targets(key),
                depth INTEGER NOT NULL,
                references_found INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Which credential reaches which target
        conn.execute(
            "CREATE TABLE IF NOT EXISTS access_records (
                credential_id TEXT NOT NULL,
                target_key TEXT NOT NULL REFERENCES targets(key),
                title TEXT,
                access_handle TEXT,
                last_seen TEXT NOT NULL,
                PRIMARY KEY (credential_id, target_key)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                context TEXT PRIMARY KEY,
                marker INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT,
                first_name TEXT,
                last_name TEXT,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS media (
                checksum TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                file_ref TEXT NOT NULL,
                file_name TEXT,
                size INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                target_key TEXT NOT NULL,
                id INTEGER NOT NULL,
                date TEXT NOT NULL,
                edit_date TEXT,
                content TEXT,
                reply_to INTEGER,
                user_id INTEGER REFERENCES users(id),
                media_checksum TEXT REFERENCES media(checksum),
                checksum TEXT NOT NULL,
                archived_at TEXT NOT NULL,
                PRIMARY KEY (target_key, id)
            )",
            [],
        )?;

        // Persisted credential pool state
        conn.execute(
            "CREATE TABLE IF NOT EXISTS credential_stats (
                credential_id TEXT PRIMARY KEY,
                health TEXT NOT NULL,
                cooldown_until TEXT,
                usage_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                rate_limit_count INTEGER NOT NULL DEFAULT 0,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_used TEXT,
                last_error TEXT,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS task_runs (
                task_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                subject TEXT NOT NULL,
                credential_id TEXT,
                route_id TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                error TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_runs_run ON task_runs(run_id)",
            [],
        )?;

        // At most one relay per (destination, origin, item)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS relays (
                destination TEXT NOT NULL,
                origin TEXT NOT NULL,
                item_id INTEGER NOT NULL,
                credential_id TEXT NOT NULL,
                relayed_at TEXT NOT NULL,
                PRIMARY KEY (destination, origin, item_id)
            )",
            [],
        )?;

        log::debug!("[DB] schema ready");
        Ok(())
    }
}

/// Parse an RFC 3339 column, tolerating legacy or malformed values
pub(crate) fn parse_ts(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

#[cfg(test)]
pub(crate) fn temp_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spectra.db");
    let db = Database::new(path.to_str().unwrap()).unwrap();
    (dir, db)
}
