//! Append-only priority and tag annotations plus the tag registry.
//!
//! Annotations never mutate commits: the newest row per target wins, and
//! earlier rows remain as history. Rows are strictly appended, so the
//! AUTOINCREMENT id follows created_at order and serves as the tiebreak.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{HashMap, HashSet};

use crate::errors::Result;
use crate::models::{Priority, PriorityAnnotation, RetentionCriteria};
use crate::store::{ts_from_sql, ts_to_sql};

/// Tags every registry starts with.
pub const BASE_TAGS: &[&str] = &[
    "instruction",
    "tool_call",
    "tool_result",
    "reasoning",
    "revision",
    "observation",
    "decision",
    "summary",
];

/// One tag registry entry.
#[derive(Debug, Clone)]
pub struct TagRegistryEntry {
    pub name: String,
    pub description: Option<String>,
    pub auto_created: bool,
}

pub struct AnnotationStore<'a> {
    conn: &'a Connection,
}

fn annotation_from_row(row: &Row<'_>) -> rusqlite::Result<PriorityAnnotation> {
    let priority: String = row.get(3)?;
    let retention: Option<String> = row.get(4)?;
    Ok(PriorityAnnotation {
        id: row.get(0)?,
        tract_id: row.get(1)?,
        target_hash: row.get(2)?,
        priority: priority
            .parse()
            .unwrap_or_else(|e| panic!("corrupt annotation row: {e}")),
        retention: retention.and_then(|s| serde_json::from_str(&s).ok()),
        reason: row.get(5)?,
        created_at: ts_from_sql(&row.get::<_, String>(6)?),
    })
}

const ANNOTATION_COLUMNS: &str =
    "id, tract_id, target_hash, priority, retention_json, reason, created_at";

impl<'a> AnnotationStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    // ------------------------------------------------------------------
    // Priority annotations
    // ------------------------------------------------------------------

    /// Append a priority annotation and return the stored row.
    pub fn save(
        &self,
        tract_id: &str,
        target_hash: &str,
        priority: Priority,
        retention: Option<&RetentionCriteria>,
        reason: Option<&str>,
    ) -> Result<PriorityAnnotation> {
        let created_at = Utc::now();
        self.conn.execute(
            "INSERT INTO annotations (tract_id, target_hash, priority, retention_json, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tract_id,
                target_hash,
                priority.as_str(),
                retention.map(|r| serde_json::to_string(r).unwrap_or_default()),
                reason,
                ts_to_sql(&created_at),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(PriorityAnnotation {
            id,
            tract_id: tract_id.to_string(),
            target_hash: target_hash.to_string(),
            priority,
            retention: retention.cloned(),
            reason: reason.map(str::to_owned),
            created_at,
        })
    }

    /// The newest annotation for a target, if any.
    pub fn latest(&self, target_hash: &str) -> Result<Option<PriorityAnnotation>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {ANNOTATION_COLUMNS} FROM annotations
                     WHERE target_hash = ?1 ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                [target_hash],
                annotation_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Full annotation history for a target, oldest first.
    pub fn history(&self, target_hash: &str) -> Result<Vec<PriorityAnnotation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotations
             WHERE target_hash = ?1 ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([target_hash], annotation_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Latest annotation per target in one query (GROUP BY max id), so
    /// compiling long chains avoids the N+1 pattern.
    pub fn batch_latest(
        &self,
        target_hashes: &[String],
    ) -> Result<HashMap<String, PriorityAnnotation>> {
        if target_hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let holes = (1..=target_hashes.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotations
             WHERE id IN (
                 SELECT MAX(id) FROM annotations
                 WHERE target_hash IN ({holes})
                 GROUP BY target_hash
             )"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(target_hashes.iter()),
            annotation_from_row,
        )?;
        let mut map = HashMap::new();
        for row in rows {
            let row = row?;
            map.insert(row.target_hash.clone(), row);
        }
        Ok(map)
    }

    /// Hashes in a tract whose latest annotation is one of `priorities`.
    /// Used by GC pin protection.
    pub fn targets_with_latest(
        &self,
        tract_id: &str,
        priorities: &[Priority],
    ) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotations
             WHERE id IN (
                 SELECT MAX(id) FROM annotations WHERE tract_id = ?1 GROUP BY target_hash
             )"
        ))?;
        let rows = stmt.query_map([tract_id], annotation_from_row)?;
        let mut out = HashSet::new();
        for row in rows {
            let row = row?;
            if priorities.contains(&row.priority) {
                out.insert(row.target_hash);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Tag annotations
    // ------------------------------------------------------------------

    /// Record a tag add (`removed = false`) or untag (`removed = true`)
    /// event.
    pub fn save_tag_event(
        &self,
        tract_id: &str,
        target_hash: &str,
        tag_name: &str,
        removed: bool,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO tag_annotations (tract_id, target_hash, tag_name, removed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tract_id,
                target_hash,
                tag_name,
                removed as i64,
                ts_to_sql(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Currently active mutable tags for a commit: per tag name, the latest
    /// event wins and untag events hide the tag.
    pub fn active_tags(&self, target_hash: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT tag_name, removed FROM tag_annotations
             WHERE target_hash = ?1
               AND id IN (
                   SELECT MAX(id) FROM tag_annotations
                   WHERE target_hash = ?1 GROUP BY tag_name
               )
             ORDER BY tag_name",
        )?;
        let rows = stmt.query_map([target_hash], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0))
        })?;
        Ok(rows
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter_map(|(name, removed)| (!removed).then_some(name))
            .collect())
    }

    /// Targets in a tract currently carrying `tag_name` as a mutable tag.
    pub fn targets_with_tag(&self, tract_id: &str, tag_name: &str) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT target_hash, removed FROM tag_annotations
             WHERE tract_id = ?1 AND tag_name = ?2
               AND id IN (
                   SELECT MAX(id) FROM tag_annotations
                   WHERE tract_id = ?1 AND tag_name = ?2 GROUP BY target_hash
               )",
        )?;
        let rows = stmt.query_map([tract_id, tag_name], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0))
        })?;
        Ok(rows
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter_map(|(hash, removed)| (!removed).then_some(hash))
            .collect())
    }

    // ------------------------------------------------------------------
    // Tag registry
    // ------------------------------------------------------------------

    /// Insert the base tags if missing. Idempotent.
    pub fn seed_registry(&self, tract_id: &str) -> Result<()> {
        for tag in BASE_TAGS {
            self.conn.execute(
                "INSERT INTO tag_registry (tract_id, name, description, auto_created)
                 VALUES (?1, ?2, NULL, 0)
                 ON CONFLICT(tract_id, name) DO NOTHING",
                [tract_id, tag],
            )?;
        }
        Ok(())
    }

    pub fn register_tag(
        &self,
        tract_id: &str,
        name: &str,
        description: Option<&str>,
        auto_created: bool,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO tag_registry (tract_id, name, description, auto_created)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(tract_id, name) DO UPDATE SET description = excluded.description",
            params![tract_id, name, description, auto_created as i64],
        )?;
        Ok(())
    }

    pub fn is_registered(&self, tract_id: &str, name: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM tag_registry WHERE tract_id = ?1 AND name = ?2",
                [tract_id, name],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list_registry(&self, tract_id: &str) -> Result<Vec<TagRegistryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, description, auto_created FROM tag_registry
             WHERE tract_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map([tract_id], |r| {
            Ok(TagRegistryEntry {
                name: r.get(0)?,
                description: r.get(1)?,
                auto_created: r.get::<_, i64>(2)? != 0,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn latest_wins_per_target() {
        let store = Store::open(":memory:").unwrap();
        let ann = store.annotations();
        ann.save("t", "c1", Priority::Normal, None, None).unwrap();
        ann.save("t", "c1", Priority::Pinned, None, Some("keep"))
            .unwrap();

        let latest = ann.latest("c1").unwrap().unwrap();
        assert_eq!(latest.priority, Priority::Pinned);
        assert_eq!(latest.reason.as_deref(), Some("keep"));
        assert_eq!(ann.history("c1").unwrap().len(), 2);
    }

    #[test]
    fn batch_latest_returns_one_row_per_target() {
        let store = Store::open(":memory:").unwrap();
        let ann = store.annotations();
        ann.save("t", "c1", Priority::Skip, None, None).unwrap();
        ann.save("t", "c2", Priority::Normal, None, None).unwrap();
        ann.save("t", "c2", Priority::Important, None, None).unwrap();

        let map = ann
            .batch_latest(&["c1".to_string(), "c2".to_string(), "c3".to_string()])
            .unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["c1"].priority, Priority::Skip);
        assert_eq!(map["c2"].priority, Priority::Important);
    }

    #[test]
    fn retention_round_trips() {
        let store = Store::open(":memory:").unwrap();
        let ann = store.annotations();
        let rc = RetentionCriteria {
            match_patterns: vec!["budget: $40k".to_string()],
            ..Default::default()
        };
        ann.save("t", "c1", Priority::Important, Some(&rc), None)
            .unwrap();
        let latest = ann.latest("c1").unwrap().unwrap();
        assert_eq!(latest.retention.unwrap().match_patterns, ["budget: $40k"]);
    }

    #[test]
    fn untag_hides_and_retag_restores() {
        let store = Store::open(":memory:").unwrap();
        let ann = store.annotations();
        ann.save_tag_event("t", "c1", "decision", false).unwrap();
        assert_eq!(ann.active_tags("c1").unwrap(), ["decision"]);
        ann.save_tag_event("t", "c1", "decision", true).unwrap();
        assert!(ann.active_tags("c1").unwrap().is_empty());
        ann.save_tag_event("t", "c1", "decision", false).unwrap();
        assert_eq!(ann.active_tags("c1").unwrap(), ["decision"]);
    }

    #[test]
    fn registry_seeds_base_tags() {
        let store = Store::open(":memory:").unwrap();
        let ann = store.annotations();
        ann.seed_registry("t").unwrap();
        ann.seed_registry("t").unwrap();
        assert!(ann.is_registered("t", "instruction").unwrap());
        assert!(!ann.is_registered("t", "custom").unwrap());
        assert_eq!(ann.list_registry("t").unwrap().len(), BASE_TAGS.len());
    }
}
