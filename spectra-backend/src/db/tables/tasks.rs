//! Task journal

use chrono::Utc;
use rusqlite::{params, Result as SqliteResult};

use super::super::{parse_ts, Database};
use crate::models::TaskRunRecord;

impl Database {
    /// Record an attempt starting. Re-attempts overwrite the previous row.
    #[allow(clippy::too_many_arguments)]
    pub fn record_task_start(
        &self,
        task_id: &str,
        run_id: &str,
        kind: &str,
        subject: &str,
        credential_id: Option<&str>,
        route_id: Option<&str>,
        attempts: u32,
    ) -> SqliteResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO task_runs (task_id, run_id, kind, subject, credential_id, route_id, attempts, state, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'running', ?8)
             ON CONFLICT(task_id) DO UPDATE SET
                credential_id = excluded.credential_id,
                route_id = excluded.route_id,
                attempts = excluded.attempts,
                state = 'running',
                error = NULL,
                started_at = excluded.started_at,
                finished_at = NULL",
            params![task_id, run_id, kind, subject, credential_id, route_id, attempts, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn record_task_finish(&self, task_id: &str, state: &str, error: Option<&str>) -> SqliteResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE task_runs SET state = ?2, error = ?3, finished_at = ?4 WHERE task_id = ?1",
            params![task_id, state, error, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn list_task_runs(&self, run_id: &str) -> SqliteResult<Vec<TaskRunRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT task_id, run_id, kind, subject, credential_id, route_id, attempts, state, error, started_at, finished_at
             FROM task_runs WHERE run_id = ?1 ORDER BY started_at, task_id",
        )?;
        let records = stmt
            .query_map([run_id], |row| {
                let started_at: String = row.get(9)?;
                let finished_at: Option<String> = row.get(10)?;
                Ok(TaskRunRecord {
                    task_id: row.get(0)?,
                    run_id: row.get(1)?,
                    kind: row.get(2)?,
                    subject: row.get(3)?,
                    credential_id: row.get(4)?,
                    route_id: row.get(5)?,
                    attempts: row.get(6)?,
                    state: row.get(7)?,
                    error: row.get(8)?,
                    started_at: parse_ts(&started_at).unwrap_or_else(Utc::now),
                    finished_at: finished_at.as_deref().and_then(parse_ts),
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(records)
    }
}
