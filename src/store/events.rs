//! Operation-event provenance log.
//!
//! Every structural rewrite (compress, reorganize, import, merge) writes a
//! single event plus source/result commit associations. The log is the
//! origin-of-record for any commit produced by a rewrite; it is queried by
//! audit tooling and never consulted during compile.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::HashSet;

use crate::errors::Result;
use crate::store::{ts_from_sql, ts_to_sql};

/// One operation event.
#[derive(Debug, Clone)]
pub struct OperationEventRow {
    pub event_id: String,
    pub tract_id: String,
    pub event_type: String,
    pub branch_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub params_json: Option<Value>,
}

impl OperationEventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let params: Option<String> = row.get(7)?;
        Ok(OperationEventRow {
            event_id: row.get(0)?,
            tract_id: row.get(1)?,
            event_type: row.get(2)?,
            branch_name: row.get(3)?,
            created_at: ts_from_sql(&row.get::<_, String>(4)?),
            original_tokens: row.get::<_, i64>(5)? as usize,
            compressed_tokens: row.get::<_, i64>(6)? as usize,
            params_json: params.and_then(|s| serde_json::from_str(&s).ok()),
        })
    }
}

pub struct EventStore<'a> {
    conn: &'a Connection,
}

impl<'a> EventStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn save_event(&self, event: &OperationEventRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO operation_events
               (event_id, tract_id, event_type, branch_name, created_at,
                original_tokens, compressed_tokens, params_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.event_id,
                event.tract_id,
                event.event_type,
                event.branch_name,
                ts_to_sql(&event.created_at),
                event.original_tokens as i64,
                event.compressed_tokens as i64,
                event
                    .params_json
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
            ],
        )?;
        Ok(())
    }

    pub fn add_commit(
        &self,
        event_id: &str,
        commit_hash: &str,
        role: &str,
        position: usize,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO operation_commits (event_id, commit_hash, role, position)
             VALUES (?1, ?2, ?3, ?4)",
            params![event_id, commit_hash, role, position as i64],
        )?;
        Ok(())
    }

    pub fn get_event(&self, event_id: &str) -> Result<Option<OperationEventRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT event_id, tract_id, event_type, branch_name, created_at,
                        original_tokens, compressed_tokens, params_json
                 FROM operation_events WHERE event_id = ?1",
                [event_id],
                OperationEventRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Source or result hashes for an event, in position order.
    pub fn commits_for(&self, event_id: &str, role: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT commit_hash FROM operation_commits
             WHERE event_id = ?1 AND role = ?2 ORDER BY position",
        )?;
        let rows = stmt.query_map([event_id, role], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Whether a commit appears as a rewrite source anywhere.
    pub fn is_source(&self, commit_hash: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM operation_commits WHERE commit_hash = ?1 AND role = 'source' LIMIT 1",
                [commit_hash],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// All source hashes for a tract across every event.
    pub fn source_hashes(&self, tract_id: &str) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT oc.commit_hash FROM operation_commits oc
             JOIN operation_events oe ON oc.event_id = oe.event_id
             WHERE oe.tract_id = ?1 AND oc.role = 'source'",
        )?;
        let rows = stmt.query_map([tract_id], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
    }

    /// All event ids for a tract, oldest first.
    pub fn all_ids(&self, tract_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id FROM operation_events WHERE tract_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([tract_id], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
