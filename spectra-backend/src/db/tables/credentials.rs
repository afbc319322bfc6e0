//! Persisted credential pool state

use chrono::Utc;
use rusqlite::{params, Result as SqliteResult};

use super::super::{parse_ts, Database};
use crate::models::{CredentialHealth, CredentialStatus};

impl Database {
    pub fn save_credential_status(&self, status: &CredentialStatus) -> SqliteResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO credential_stats (credential_id, health, cooldown_until, usage_count, success_count,
                rate_limit_count, consecutive_failures, last_used, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(credential_id) DO UPDATE SET
                health = excluded.health,
                cooldown_until = excluded.cooldown_until,
                usage_count = excluded.usage_count,
                success_count = excluded.success_count,
                rate_limit_count = excluded.rate_limit_count,
                consecutive_failures = excluded.consecutive_failures,
                last_used = excluded.last_used,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
            params![
                &status.credential_id,
                status.health.as_str(),
                status.cooldown_until.map(|t| t.to_rfc3339()),
                status.usage_count,
                status.success_count,
                status.rate_limit_count,
                status.consecutive_failures,
                status.last_used.map(|t| t.to_rfc3339()),
                &status.last_error,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_credential_statuses(&self) -> SqliteResult<Vec<CredentialStatus>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT credential_id, health, cooldown_until, usage_count, success_count, rate_limit_count,
                consecutive_failures, last_used, last_error
             FROM credential_stats ORDER BY credential_id",
        )?;
        let statuses = stmt
            .query_map([], |row| {
                let health: String = row.get(1)?;
                let cooldown_until: Option<String> = row.get(2)?;
                let last_used: Option<String> = row.get(7)?;
                Ok(CredentialStatus {
                    credential_id: row.get(0)?,
                    health: CredentialHealth::from_str(&health).unwrap_or_default(),
                    cooldown_until: cooldown_until.as_deref().and_then(parse_ts),
                    in_use: false,
                    usage_count: row.get(3)?,
                    recent_usage: 0,
                    success_count: row.get(4)?,
                    rate_limit_count: row.get(5)?,
                    consecutive_failures: row.get(6)?,
                    last_used: last_used.as_deref().and_then(parse_ts),
                    last_error: row.get(8)?,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::db::temp_db;
    use crate::models::{CredentialHealth, CredentialStatus};

    #[test]
    fn credential_state_survives_reload() {
        let (_dir, db) = temp_db();
        let mut status = CredentialStatus::new("alpha");
        status.health = CredentialHealth::CoolingDown;
        status.cooldown_until = Some(Utc::now() + Duration::seconds(60));
        status.rate_limit_count = 2;
        db.save_credential_status(&status).unwrap();

        status.rate_limit_count = 3;
        db.save_credential_status(&status).unwrap();

        let loaded = db.load_credential_statuses().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].health, CredentialHealth::CoolingDown);
        assert_eq!(loaded[0].rate_limit_count, 3);
        assert!(loaded[0].cooldown_until.is_some());
    }
}
