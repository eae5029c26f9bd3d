//! Append-only commit storage.
//!
//! Commits are immutable once written; `save` is idempotent on the commit
//! hash because two commits with the same hash are bit-identical by
//! construction. The first parent lives on the commit row for the linear
//! fast path; merge parents live in `commit_parents` with position 0
//! mirroring the row's `parent_hash`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::errors::{Result, TractError};
use crate::models::CommitOperation;
use crate::store::{ts_from_sql, ts_to_sql};

/// One commit row.
#[derive(Debug, Clone)]
pub struct CommitRow {
    pub commit_hash: String,
    pub tract_id: String,
    pub parent_hash: Option<String>,
    pub content_hash: String,
    pub content_type: String,
    pub operation: CommitOperation,
    pub edit_target: Option<String>,
    pub message: Option<String>,
    pub token_count: usize,
    pub metadata_json: Option<Value>,
    pub generation_config_json: Option<Value>,
    pub tags_json: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl CommitRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let operation: String = row.get(5)?;
        let metadata: Option<String> = row.get(9)?;
        let generation_config: Option<String> = row.get(10)?;
        let tags: Option<String> = row.get(11)?;
        Ok(CommitRow {
            commit_hash: row.get(0)?,
            tract_id: row.get(1)?,
            parent_hash: row.get(2)?,
            content_hash: row.get(3)?,
            content_type: row.get(4)?,
            operation: operation
                .parse()
                .unwrap_or_else(|e| panic!("corrupt commit row: {e}")),
            edit_target: row.get(6)?,
            message: row.get(7)?,
            token_count: row.get::<_, i64>(8)? as usize,
            metadata_json: metadata.and_then(|s| serde_json::from_str(&s).ok()),
            generation_config_json: generation_config.and_then(|s| serde_json::from_str(&s).ok()),
            tags_json: tags
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            created_at: ts_from_sql(&row.get::<_, String>(12)?),
        })
    }
}

const COMMIT_COLUMNS: &str = "commit_hash, tract_id, parent_hash, content_hash, content_type, \
     operation, edit_target, message, token_count, metadata_json, \
     generation_config_json, tags_json, created_at";

/// One JSON-path condition for `get_by_config`.
#[derive(Debug, Clone)]
pub struct ConfigCondition {
    /// Field name inside the generation config, e.g. `temperature`.
    pub json_path: String,
    /// One of `=, !=, <, <=, >, >=, in, not in, between, not between`.
    pub operator: String,
    /// Scalar for comparison operators; array for list operators.
    pub value: Value,
}

impl ConfigCondition {
    pub fn new(json_path: impl Into<String>, operator: impl Into<String>, value: Value) -> Self {
        Self {
            json_path: json_path.into(),
            operator: operator.into(),
            value,
        }
    }
}

pub struct CommitStore<'a> {
    conn: &'a Connection,
}

impl<'a> CommitStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, commit_hash: &str) -> Result<Option<CommitRow>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {COMMIT_COLUMNS} FROM commits WHERE commit_hash = ?1"),
                [commit_hash],
                CommitRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Insert a commit. Idempotent on duplicate hashes.
    pub fn save(&self, commit: &CommitRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO commits (commit_hash, tract_id, parent_hash, content_hash,
                content_type, operation, edit_target, message, token_count,
                metadata_json, generation_config_json, tags_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(commit_hash) DO NOTHING",
            params![
                commit.commit_hash,
                commit.tract_id,
                commit.parent_hash,
                commit.content_hash,
                commit.content_type,
                commit.operation.as_str(),
                commit.edit_target,
                commit.message,
                commit.token_count as i64,
                commit
                    .metadata_json
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
                commit
                    .generation_config_json
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
                serde_json::to_string(&commit.tags_json)?,
                ts_to_sql(&commit.created_at),
            ],
        )?;
        Ok(())
    }

    /// Walk the first-parent chain from `commit_hash` back to the root.
    ///
    /// Returns newest first. Rather than one query per ancestor, this
    /// fetches the starting commit to learn its tract, batch-loads that
    /// tract's commits into a map, and walks the chain in memory: two
    /// queries total.
    ///
    /// With `op_filter` set, the walk continues through non-matching
    /// commits but only emits matching ones, so all ancestors of the
    /// requested operation are found regardless of interleaving.
    pub fn get_ancestors(
        &self,
        commit_hash: &str,
        limit: Option<usize>,
        op_filter: Option<CommitOperation>,
    ) -> Result<Vec<CommitRow>> {
        let Some(start) = self.get(commit_hash)? else {
            return Ok(Vec::new());
        };
        let all = self.get_all(&start.tract_id)?;
        let by_hash: HashMap<String, CommitRow> =
            all.into_iter().map(|c| (c.commit_hash.clone(), c)).collect();

        let mut ancestors = Vec::new();
        let mut current = Some(commit_hash.to_string());
        while let Some(hash) = current {
            if limit.is_some_and(|l| ancestors.len() >= l) {
                break;
            }
            let Some(commit) = by_hash.get(&hash) else {
                break;
            };
            current = commit.parent_hash.clone();
            if op_filter.is_none_or(|op| commit.operation == op) {
                ancestors.push(commit.clone());
            }
        }
        Ok(ancestors)
    }

    /// All commits for a tract, oldest first.
    pub fn get_all(&self, tract_id: &str) -> Result<Vec<CommitRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COMMIT_COLUMNS} FROM commits WHERE tract_id = ?1
             ORDER BY created_at, commit_hash"
        ))?;
        let rows = stmt.query_map([tract_id], CommitRow::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_by_type(&self, tract_id: &str, content_type: &str) -> Result<Vec<CommitRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COMMIT_COLUMNS} FROM commits
             WHERE tract_id = ?1 AND content_type = ?2
             ORDER BY created_at, commit_hash"
        ))?;
        let rows = stmt.query_map([tract_id, content_type], CommitRow::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Commits whose first parent is `commit_hash`.
    pub fn get_children(&self, commit_hash: &str) -> Result<Vec<CommitRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COMMIT_COLUMNS} FROM commits WHERE parent_hash = ?1
             ORDER BY created_at, commit_hash"
        ))?;
        let rows = stmt.query_map([commit_hash], CommitRow::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Resolve a hash prefix (>= 4 hex chars) to a commit.
    ///
    /// Returns None for no match; `AmbiguousPrefix` for several.
    pub fn get_by_prefix(&self, prefix: &str, tract_id: Option<&str>) -> Result<Option<CommitRow>> {
        if prefix.len() < 4 {
            return Err(TractError::ContentValidation(
                "Commit hash prefix must be at least 4 characters".to_string(),
            ));
        }
        let pattern = format!("{}%", prefix.replace('%', "").replace('_', ""));
        let mut sql = format!("SELECT {COMMIT_COLUMNS} FROM commits WHERE commit_hash LIKE ?1");
        if tract_id.is_some() {
            sql.push_str(" AND tract_id = ?2");
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows: Vec<CommitRow> = match tract_id {
            Some(t) => stmt
                .query_map(params![pattern, t], CommitRow::from_row)?
                .collect::<rusqlite::Result<_>>()?,
            None => stmt
                .query_map([pattern], CommitRow::from_row)?
                .collect::<rusqlite::Result<_>>()?,
        };
        match rows.len() {
            0 => Ok(None),
            1 => Ok(Some(rows.into_iter().next().unwrap())),
            _ => Err(TractError::AmbiguousPrefix {
                prefix: prefix.to_string(),
                candidates: rows.into_iter().map(|r| r.commit_hash).collect(),
            }),
        }
    }

    /// Query commits by generation-config JSON values, as a conjunction.
    ///
    /// Values are cast to boolean/integer/float/string by sampling the
    /// first bound so SQLite's json_extract results compare with the
    /// expected affinity.
    pub fn get_by_config(
        &self,
        tract_id: &str,
        conditions: &[ConfigCondition],
    ) -> Result<Vec<CommitRow>> {
        let mut sql = format!(
            "SELECT {COMMIT_COLUMNS} FROM commits WHERE tract_id = ?1
             AND generation_config_json IS NOT NULL"
        );
        let mut bind: Vec<SqlValue> = vec![SqlValue::Text(tract_id.to_string())];

        for cond in conditions {
            let extract = format!(
                "json_extract(generation_config_json, '$.{}')",
                cond.json_path.replace('\'', "")
            );
            let clause = match cond.operator.as_str() {
                "=" | "!=" | "<" | "<=" | ">" | ">=" => {
                    bind.push(scalar_to_sql(&cond.value)?);
                    format!("{extract} {} ?{}", cond.operator, bind.len())
                }
                "in" | "not in" => {
                    let items = list_values(&cond.value)?;
                    let mut holes = Vec::with_capacity(items.len());
                    for item in items {
                        bind.push(item);
                        holes.push(format!("?{}", bind.len()));
                    }
                    let negate = if cond.operator == "not in" { "NOT " } else { "" };
                    format!("{extract} {negate}IN ({})", holes.join(", "))
                }
                "between" | "not between" => {
                    let items = list_values(&cond.value)?;
                    if items.len() != 2 {
                        return Err(TractError::ContentValidation(
                            "`between` requires exactly two bounds".to_string(),
                        ));
                    }
                    let mut it = items.into_iter();
                    bind.push(it.next().unwrap());
                    let low = bind.len();
                    bind.push(it.next().unwrap());
                    let high = bind.len();
                    let negate = if cond.operator == "not between" { "NOT " } else { "" };
                    format!("{extract} {negate}BETWEEN ?{low} AND ?{high}")
                }
                other => {
                    return Err(TractError::ContentValidation(format!(
                        "Unsupported operator: {other}. Use one of: =, !=, <, <=, >, >=, \
                         in, not in, between, not between"
                    )))
                }
            };
            sql.push_str(" AND ");
            sql.push_str(&clause);
        }
        sql.push_str(" ORDER BY created_at, commit_hash");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(bind), CommitRow::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The commit itself plus all EDITs targeting it, oldest first.
    pub fn get_edits_for(&self, commit_hash: &str, tract_id: &str) -> Result<Vec<CommitRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COMMIT_COLUMNS} FROM commits
             WHERE tract_id = ?1 AND (commit_hash = ?2 OR edit_target = ?2)
             ORDER BY created_at, commit_hash"
        ))?;
        let rows = stmt.query_map([tract_id, commit_hash], CommitRow::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Remove a commit, nullifying foreign references first: children's
    /// parent_hash and edit_target are set NULL; parent-table rows, priority
    /// and tag annotations, operation-commit rows, and refs pointing at the
    /// commit are deleted.
    pub fn delete(&self, commit_hash: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM commit_parents WHERE commit_hash = ?1 OR parent_hash = ?1",
            [commit_hash],
        )?;
        self.conn
            .execute("DELETE FROM annotations WHERE target_hash = ?1", [commit_hash])?;
        self.conn.execute(
            "DELETE FROM tag_annotations WHERE target_hash = ?1",
            [commit_hash],
        )?;
        self.conn.execute(
            "DELETE FROM operation_commits WHERE commit_hash = ?1",
            [commit_hash],
        )?;
        self.conn.execute(
            "DELETE FROM refs WHERE commit_hash = ?1 AND symbolic_target IS NULL",
            [commit_hash],
        )?;
        self.conn.execute(
            "UPDATE commits SET parent_hash = NULL WHERE parent_hash = ?1",
            [commit_hash],
        )?;
        self.conn.execute(
            "UPDATE commits SET edit_target = NULL WHERE edit_target = ?1",
            [commit_hash],
        )?;
        self.conn
            .execute("DELETE FROM commits WHERE commit_hash = ?1", [commit_hash])?;
        Ok(())
    }

    /// Record merge parents. Position 0 must equal the row's parent_hash.
    pub fn add_parents(&self, commit_hash: &str, parent_hashes: &[String]) -> Result<()> {
        for (position, parent) in parent_hashes.iter().enumerate() {
            self.conn.execute(
                "INSERT INTO commit_parents (commit_hash, parent_hash, position)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(commit_hash, position) DO NOTHING",
                params![commit_hash, parent, position as i64],
            )?;
        }
        Ok(())
    }

    /// Merge parents for a commit, in position order. Empty for non-merge
    /// commits.
    pub fn get_parents(&self, commit_hash: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT parent_hash FROM commit_parents WHERE commit_hash = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map([commit_hash], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Distinct tract ids present in the store, with commit counts and the
    /// latest activity timestamp.
    pub fn tract_summaries(&self) -> Result<Vec<(String, usize, DateTime<Utc>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT tract_id, COUNT(*), MAX(created_at) FROM commits GROUP BY tract_id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)? as usize,
                r.get::<_, String>(2)?,
            ))
        })?;
        Ok(rows
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|(t, n, ts)| (t, n, ts_from_sql(&ts)))
            .collect())
    }

    /// All commits across every tract, chronological.
    pub fn timeline(&self, limit: Option<usize>) -> Result<Vec<CommitRow>> {
        let mut sql = format!(
            "SELECT {COMMIT_COLUMNS} FROM commits ORDER BY created_at, commit_hash"
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], CommitRow::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Commits whose blob payload matches a LIKE pattern (wildcards in the
    /// term are escaped by the caller-facing search API).
    pub fn search_payloads(&self, pattern: &str, tract_id: Option<&str>) -> Result<Vec<CommitRow>> {
        let mut sql = format!(
            "SELECT {COMMIT_COLUMNS} FROM commits
             WHERE content_hash IN
               (SELECT content_hash FROM blobs WHERE payload_json LIKE ?1 ESCAPE '\\')"
        );
        if tract_id.is_some() {
            sql.push_str(" AND tract_id = ?2");
        }
        sql.push_str(" ORDER BY created_at, commit_hash");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows: Vec<CommitRow> = match tract_id {
            Some(t) => stmt
                .query_map(params![pattern, t], CommitRow::from_row)?
                .collect::<rusqlite::Result<_>>()?,
            None => stmt
                .query_map([pattern], CommitRow::from_row)?
                .collect::<rusqlite::Result<_>>()?,
        };
        Ok(rows)
    }
}

fn scalar_to_sql(value: &Value) -> Result<SqlValue> {
    match value {
        Value::Bool(b) => Ok(SqlValue::Integer(*b as i64)),
        Value::Number(n) if n.is_i64() => Ok(SqlValue::Integer(n.as_i64().unwrap())),
        Value::Number(n) => Ok(SqlValue::Real(n.as_f64().unwrap_or_default())),
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        other => Err(TractError::ContentValidation(format!(
            "Unsupported config query value: {other}"
        ))),
    }
}

fn list_values(value: &Value) -> Result<Vec<SqlValue>> {
    let items = value.as_array().ok_or_else(|| {
        TractError::ContentValidation("list operator requires an array value".to_string())
    })?;
    items.iter().map(scalar_to_sql).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;

    fn commit(hash: &str, tract: &str, parent: Option<&str>, offset_us: i64) -> CommitRow {
        CommitRow {
            commit_hash: hash.to_string(),
            tract_id: tract.to_string(),
            parent_hash: parent.map(str::to_owned),
            content_hash: format!("blob-{hash}"),
            content_type: "dialogue".to_string(),
            operation: CommitOperation::Append,
            edit_target: None,
            message: None,
            token_count: 10,
            metadata_json: None,
            generation_config_json: None,
            tags_json: vec![],
            created_at: ts_from_sql("2026-01-01T00:00:00.000000Z")
                + chrono::Duration::microseconds(offset_us),
        }
    }

    #[test]
    fn ancestors_walk_first_parent_chain() {
        let store = Store::open(":memory:").unwrap();
        let commits = store.commits();
        commits.save(&commit("c1", "t", None, 0)).unwrap();
        commits.save(&commit("c2", "t", Some("c1"), 1)).unwrap();
        commits.save(&commit("c3", "t", Some("c2"), 2)).unwrap();

        let ancestors = commits.get_ancestors("c3", None, None).unwrap();
        let hashes: Vec<&str> = ancestors.iter().map(|c| c.commit_hash.as_str()).collect();
        assert_eq!(hashes, ["c3", "c2", "c1"]);

        let limited = commits.get_ancestors("c3", Some(2), None).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn ancestors_op_filter_walks_through_nonmatching() {
        let store = Store::open(":memory:").unwrap();
        let commits = store.commits();
        commits.save(&commit("c1", "t", None, 0)).unwrap();
        let mut edit = commit("c2", "t", Some("c1"), 1);
        edit.operation = CommitOperation::Edit;
        edit.edit_target = Some("c1".into());
        commits.save(&edit).unwrap();
        commits.save(&commit("c3", "t", Some("c2"), 2)).unwrap();

        let edits = commits
            .get_ancestors("c3", None, Some(CommitOperation::Edit))
            .unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].commit_hash, "c2");
    }

    #[test]
    fn prefix_lookup_enforces_length_and_ambiguity() {
        let store = Store::open(":memory:").unwrap();
        let commits = store.commits();
        commits.save(&commit("abcd1111", "t", None, 0)).unwrap();
        commits
            .save(&commit("abcd2222", "t", Some("abcd1111"), 1))
            .unwrap();

        assert!(commits.get_by_prefix("abc", None).is_err());
        assert!(matches!(
            commits.get_by_prefix("abcd", None),
            Err(TractError::AmbiguousPrefix { .. })
        ));
        let found = commits.get_by_prefix("abcd1", None).unwrap().unwrap();
        assert_eq!(found.commit_hash, "abcd1111");
        assert!(commits.get_by_prefix("ffff", None).unwrap().is_none());
    }

    #[test]
    fn config_query_casts_by_sample() {
        let store = Store::open(":memory:").unwrap();
        let commits = store.commits();
        let mut a = commit("c1", "t", None, 0);
        a.generation_config_json = Some(json!({"temperature": 0.2, "model": "alpha"}));
        let mut b = commit("c2", "t", Some("c1"), 1);
        b.generation_config_json = Some(json!({"temperature": 0.9, "model": "beta"}));
        commits.save(&a).unwrap();
        commits.save(&b).unwrap();

        let hot = commits
            .get_by_config("t", &[ConfigCondition::new("temperature", ">", json!(0.5))])
            .unwrap();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].commit_hash, "c2");

        let named = commits
            .get_by_config(
                "t",
                &[ConfigCondition::new("model", "in", json!(["alpha", "gamma"]))],
            )
            .unwrap();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].commit_hash, "c1");

        let ranged = commits
            .get_by_config(
                "t",
                &[ConfigCondition::new("temperature", "between", json!([0.0, 0.5]))],
            )
            .unwrap();
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].commit_hash, "c1");
    }

    #[test]
    fn delete_nullifies_references() {
        let store = Store::open(":memory:").unwrap();
        let commits = store.commits();
        commits.save(&commit("c1", "t", None, 0)).unwrap();
        commits.save(&commit("c2", "t", Some("c1"), 1)).unwrap();
        let mut edit = commit("c3", "t", Some("c2"), 2);
        edit.operation = CommitOperation::Edit;
        edit.edit_target = Some("c1".into());
        commits.save(&edit).unwrap();

        commits.delete("c1").unwrap();
        assert!(commits.get("c1").unwrap().is_none());
        assert!(commits.get("c2").unwrap().unwrap().parent_hash.is_none());
        assert!(commits.get("c3").unwrap().unwrap().edit_target.is_none());
    }

    #[test]
    fn merge_parents_round_trip() {
        let store = Store::open(":memory:").unwrap();
        let commits = store.commits();
        commits
            .add_parents("m1", &["p0".to_string(), "p1".to_string()])
            .unwrap();
        assert_eq!(commits.get_parents("m1").unwrap(), ["p0", "p1"]);
        assert!(commits.get_parents("p0").unwrap().is_empty());
    }
}
