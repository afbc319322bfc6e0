//! Access records: which credential reaches which target

use chrono::Utc;
use rusqlite::{params, Result as SqliteResult, Row};

use super::super::{parse_ts, Database};
use crate::models::AccessRecord;
use crate::remote::AccessibleEntity;

impl Database {
    /// Record that `credential_id` can reach each entity. Unknown entities
    /// become depth-0 targets first.
    pub fn upsert_access(&self, credential_id: &str, entities: &[AccessibleEntity]) -> SqliteResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        for accessible in entities {
            tx.execute(
                "INSERT INTO targets (key, title, kind, depth, status, discovered_at)
                 VALUES (?1, ?2, ?3, 0, 'discovered', ?4)
                 ON CONFLICT(key) DO UPDATE SET title = COALESCE(targets.title, excluded.title)",
                params![&accessible.entity.key, &accessible.entity.title, accessible.entity.kind.as_str(), &now],
            )?;
            tx.execute(
                "INSERT INTO access_records (credential_id, target_key, title, access_handle, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(credential_id, target_key) DO UPDATE SET
                    title = COALESCE(excluded.title, access_records.title),
                    access_handle = COALESCE(excluded.access_handle, access_records.access_handle),
                    last_seen = excluded.last_seen",
                params![credential_id, &accessible.entity.key, &accessible.entity.title, &accessible.access_handle, &now],
            )?;
        }

        tx.commit()?;
        Ok(entities.len())
    }

    /// All access records, grouped by target
    pub fn list_access_records(&self) -> SqliteResult<Vec<AccessRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT credential_id, target_key, title, access_handle, last_seen
             FROM access_records ORDER BY target_key, last_seen DESC, credential_id",
        )?;
        let records = stmt
            .query_map([], Self::row_to_access)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(records)
    }

    pub fn access_for_target(&self, target_key: &str) -> SqliteResult<Vec<AccessRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT credential_id, target_key, title, access_handle, last_seen
             FROM access_records WHERE target_key = ?1 ORDER BY last_seen DESC, credential_id",
        )?;
        let records = stmt
            .query_map([target_key], Self::row_to_access)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(records)
    }

    fn row_to_access(row: &Row) -> SqliteResult<AccessRecord> {
        let last_seen: String = row.get(4)?;
        Ok(AccessRecord {
            credential_id: row.get(0)?,
            target_key: row.get(1)?,
            title: row.get(2)?,
            access_handle: row.get(3)?,
            last_seen: parse_ts(&last_seen).unwrap_or_else(Utc::now),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::db::temp_db;
    use crate::remote::{AccessibleEntity, EntityRef};

    fn reachable(key: &str, handle: Option<&str>) -> AccessibleEntity {
        AccessibleEntity {
            entity: EntityRef::new(key),
            access_handle: handle.map(String::from),
        }
    }

    #[test]
    fn access_is_keyed_by_credential_and_target() {
        let (_dir, db) = temp_db();
        db.upsert_access("alpha", &[reachable("t1", Some("h1")), reachable("t2", None)]).unwrap();
        db.upsert_access("beta", &[reachable("t1", Some("h2"))]).unwrap();
        db.upsert_access("alpha", &[reachable("t1", None)]).unwrap();

        let records = db.list_access_records().unwrap();
        assert_eq!(records.len(), 3);

        let t1 = db.access_for_target("t1").unwrap();
        assert_eq!(t1.len(), 2);
        let alpha = t1.iter().find(|r| r.credential_id == "alpha").unwrap();
        assert_eq!(alpha.access_handle.as_deref(), Some("h1"));
        assert_eq!(db.get_target("t2").unwrap().unwrap().depth, 0);
    }
}
