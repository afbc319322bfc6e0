//! Discovery graph operations: targets, edges, discovery provenance

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Result as SqliteResult, Row};
use std::collections::HashSet;

use super::super::{parse_ts, Database};
use crate::models::{priority_score, Edge, Target, TargetKind, TargetStatus};
use crate::remote::EntityRef;

/// Result of recording one target's expansion
#[derive(Debug, Clone, Default)]
pub struct ReferenceSummary {
    /// Distinct referenced keys, self-references removed
    pub referenced: Vec<String>,
    pub new_targets: usize,
    pub new_edges: usize,
}

const TARGET_COLUMNS: &str = "key, title, kind, depth, priority, in_degree, status, discovered_at, last_referenced_at, expanded_at, last_error";

impl Database {
    /// Insert a target or lower its recorded depth. Existing titles are kept.
    pub fn upsert_target(&self, entity: &EntityRef, depth: u32) -> SqliteResult<()> {
        let conn = self.conn.lock();
        Self::upsert_target_in(&conn, entity, depth, &Utc::now().to_rfc3339())?;
        Ok(())
    }

    /// Returns true when the row was created
    fn upsert_target_in(
        conn: &rusqlite::Connection,
        entity: &EntityRef,
        depth: u32,
        now: &str,
    ) -> SqliteResult<bool> {
        let existed: bool = conn
            .query_row("SELECT 1 FROM targets WHERE key = ?1", [&entity.key], |_| Ok(()))
            .optional()?
            .is_some();

        conn.execute(
            "INSERT INTO targets (key, title, kind, depth, status, discovered_at)
             VALUES (?1, ?2, ?3, ?4, 'discovered', ?5)
             ON CONFLICT(key) DO UPDATE SET
                title = COALESCE(targets.title, excluded.title),
                kind = CASE WHEN targets.kind = 'unknown' THEN excluded.kind ELSE targets.kind END,
                depth = MIN(targets.depth, excluded.depth)",
            params![&entity.key, &entity.title, entity.kind.as_str(), depth, now],
        )?;

        Ok(!existed)
    }

    /// Record the references found while expanding `source`.
    ///
    /// Referenced targets are upserted at `source_depth + 1` before their
    /// edges, edges are deduplicated on (source, destination), and each new
    /// edge bumps the destination's in-degree and priority. The source is
    /// marked expanded and a provenance row is written. All of it commits
    /// in one transaction.
    pub fn record_expansion(
        &self,
        run_id: &str,
        source: &str,
        source_depth: u32,
        references: &[EntityRef],
    ) -> SqliteResult<ReferenceSummary> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut summary = ReferenceSummary::default();
        let mut seen = HashSet::new();

        for entity in references {
            if entity.key == source || !seen.insert(entity.key.clone()) {
                continue;
            }

            if Self::upsert_target_in(&tx, entity, source_depth + 1, &now)? {
                summary.new_targets += 1;
            }

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO edges (source, destination, run_id, discovered_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![source, &entity.key, run_id, &now],
            )?;

            if inserted == 1 {
                summary.new_edges += 1;
                // Right-hand side sees the pre-update in_degree
                tx.execute(
                    "UPDATE targets SET in_degree = in_degree + 1,
                        priority = in_degree + 2.0,
                        last_referenced_at = ?2
                     WHERE key = ?1",
                    params![&entity.key, &now],
                )?;
            }

            summary.referenced.push(entity.key.clone());
        }

        tx.execute(
            "INSERT INTO discovery_sources (run_id, target_key, depth, references_found, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, source, source_depth, summary.referenced.len() as i64, &now],
        )?;

        tx.execute(
            "UPDATE targets SET status = 'expanded', expanded_at = ?2
             WHERE key = ?1 AND status != 'unreachable'",
            params![source, &now],
        )?;

        tx.commit()?;
        Ok(summary)
    }

    pub fn get_target(&self, key: &str) -> SqliteResult<Option<Target>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM targets WHERE key = ?1", TARGET_COLUMNS),
            [key],
            Self::row_to_target,
        )
        .optional()
    }

    pub fn list_targets(&self) -> SqliteResult<Vec<Target>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM targets ORDER BY depth, key", TARGET_COLUMNS))?;
        let targets = stmt
            .query_map([], Self::row_to_target)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Reachable targets by descending priority, ties broken by in-degree
    pub fn priority_targets(&self, limit: usize, min_priority: f64) -> SqliteResult<Vec<Target>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets
             WHERE status != 'unreachable' AND priority >= ?1
             ORDER BY priority DESC, in_degree DESC, key
             LIMIT ?2",
            TARGET_COLUMNS
        ))?;
        let targets = stmt
            .query_map(params![min_priority, limit as i64], Self::row_to_target)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Known targets never expanded, shallower than `max_depth`
    pub fn frontier_targets(&self, max_depth: u32) -> SqliteResult<Vec<Target>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets
             WHERE status = 'discovered' AND depth < ?1
             ORDER BY depth, priority DESC, key",
            TARGET_COLUMNS
        ))?;
        let targets = stmt
            .query_map([max_depth], Self::row_to_target)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(targets)
    }

    pub fn mark_target_unreachable(&self, key: &str, reason: &str) -> SqliteResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE targets SET status = 'unreachable', last_error = ?2 WHERE key = ?1",
            params![key, reason],
        )?;
        Ok(())
    }

    /// Manual reset of an unreachable target. Returns false if unknown.
    pub fn reset_target(&self, key: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE targets SET status = CASE WHEN expanded_at IS NULL THEN 'discovered' ELSE 'expanded' END,
                last_error = NULL
             WHERE key = ?1",
            [key],
        )?;
        Ok(updated > 0)
    }

    /// Recompute every target's priority from in-degree and freshness
    pub fn recompute_priorities(&self, now: DateTime<Utc>) -> SqliteResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let rows: Vec<(String, i64, Option<String>)> = {
            let mut stmt = tx.prepare("SELECT key, in_degree, last_referenced_at FROM targets")?;
            let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            mapped.collect::<SqliteResult<Vec<_>>>()?
        };

        {
            let mut update = tx.prepare("UPDATE targets SET priority = ?2 WHERE key = ?1")?;
            for (key, in_degree, last_referenced) in &rows {
                let score = priority_score(*in_degree, last_referenced.as_deref().and_then(parse_ts), now);
                update.execute(params![key, score])?;
            }
        }

        tx.commit()?;
        log::info!("[DISCOVERY] recomputed priority for {} targets", rows.len());
        Ok(rows.len())
    }

    pub fn list_edges(&self) -> SqliteResult<Vec<Edge>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT source, destination, discovered_at FROM edges ORDER BY id")?;
        let edges = stmt
            .query_map([], |row| {
                let discovered_at: String = row.get(2)?;
                Ok(Edge {
                    source: row.get(0)?,
                    destination: row.get(1)?,
                    discovered_at: parse_ts(&discovered_at).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(edges)
    }

    /// Number of expansions a run has recorded
    pub fn count_discovery_sources(&self, run_id: &str) -> SqliteResult<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM discovery_sources WHERE run_id = ?1",
            [run_id],
            |row| row.get(0),
        )
    }

    fn row_to_target(row: &Row) -> SqliteResult<Target> {
        let kind: String = row.get(2)?;
        let status: String = row.get(6)?;
        let discovered_at: String = row.get(7)?;
        let last_referenced_at: Option<String> = row.get(8)?;
        let expanded_at: Option<String> = row.get(9)?;

        Ok(Target {
            key: row.get(0)?,
            title: row.get(1)?,
            kind: TargetKind::from_str(&kind),
            depth: row.get(3)?,
            priority: row.get(4)?,
            in_degree: row.get(5)?,
            status: TargetStatus::from_str(&status).unwrap_or_default(),
            discovered_at: parse_ts(&discovered_at).unwrap_or_else(Utc::now),
            last_referenced_at: last_referenced_at.as_deref().and_then(parse_ts),
            expanded_at: expanded_at.as_deref().and_then(parse_ts),
            last_error: row.get(10)?,
        })
    }
}
