//! Spawn pointers: parent/child relationships between tracts in one DB.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;

use crate::errors::Result;
use crate::store::{ts_from_sql, ts_to_sql};

/// One spawn pointer.
#[derive(Debug, Clone)]
pub struct SpawnPointerRow {
    pub id: i64,
    pub parent_tract_id: String,
    pub parent_commit_hash: Option<String>,
    pub child_tract_id: String,
    pub purpose: String,
    pub inheritance_mode: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SpawnPointerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(SpawnPointerRow {
            id: row.get(0)?,
            parent_tract_id: row.get(1)?,
            parent_commit_hash: row.get(2)?,
            child_tract_id: row.get(3)?,
            purpose: row.get(4)?,
            inheritance_mode: row.get(5)?,
            display_name: row.get(6)?,
            created_at: ts_from_sql(&row.get::<_, String>(7)?),
        })
    }
}

const SPAWN_COLUMNS: &str = "id, parent_tract_id, parent_commit_hash, child_tract_id, \
     purpose, inheritance_mode, display_name, created_at";

pub struct SpawnStore<'a> {
    conn: &'a Connection,
}

impl<'a> SpawnStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &self,
        parent_tract_id: &str,
        parent_commit_hash: Option<&str>,
        child_tract_id: &str,
        purpose: &str,
        inheritance_mode: &str,
        display_name: Option<&str>,
    ) -> Result<SpawnPointerRow> {
        let created_at = Utc::now();
        self.conn.execute(
            "INSERT INTO spawn_pointers
               (parent_tract_id, parent_commit_hash, child_tract_id, purpose,
                inheritance_mode, display_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                parent_tract_id,
                parent_commit_hash,
                child_tract_id,
                purpose,
                inheritance_mode,
                display_name,
                ts_to_sql(&created_at),
            ],
        )?;
        Ok(SpawnPointerRow {
            id: self.conn.last_insert_rowid(),
            parent_tract_id: parent_tract_id.to_string(),
            parent_commit_hash: parent_commit_hash.map(str::to_owned),
            child_tract_id: child_tract_id.to_string(),
            purpose: purpose.to_string(),
            inheritance_mode: inheritance_mode.to_string(),
            display_name: display_name.map(str::to_owned),
            created_at,
        })
    }

    /// The pointer that created a child tract, if any.
    pub fn by_child(&self, child_tract_id: &str) -> Result<Option<SpawnPointerRow>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SPAWN_COLUMNS} FROM spawn_pointers
                     WHERE child_tract_id = ?1 ORDER BY id LIMIT 1"
                ),
                [child_tract_id],
                SpawnPointerRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Children spawned from a tract, oldest first.
    pub fn children_of(&self, parent_tract_id: &str) -> Result<Vec<SpawnPointerRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SPAWN_COLUMNS} FROM spawn_pointers
             WHERE parent_tract_id = ?1 ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([parent_tract_id], SpawnPointerRow::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Walk up the spawn tree checking ancestry. Terminates at the root or
    /// on a cycle.
    pub fn has_ancestor(&self, child_tract_id: &str, potential_ancestor: &str) -> Result<bool> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = child_tract_id.to_string();
        loop {
            if !visited.insert(current.clone()) {
                return Ok(false);
            }
            let Some(pointer) = self.by_child(&current)? else {
                return Ok(false);
            };
            if pointer.parent_tract_id == potential_ancestor {
                return Ok(true);
            }
            current = pointer.parent_tract_id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn spawn_tree_ancestry() {
        let store = Store::open(":memory:").unwrap();
        let spawns = store.spawns();
        spawns
            .save("root", None, "child", "research", "none", Some("worker"))
            .unwrap();
        spawns
            .save("child", Some("abcd1234"), "grandchild", "deep", "head_snapshot", None)
            .unwrap();

        assert!(spawns.has_ancestor("grandchild", "root").unwrap());
        assert!(spawns.has_ancestor("child", "root").unwrap());
        assert!(!spawns.has_ancestor("root", "child").unwrap());
        assert_eq!(spawns.children_of("child").unwrap().len(), 1);
        let p = spawns.by_child("child").unwrap().unwrap();
        assert_eq!(p.display_name.as_deref(), Some("worker"));
    }
}
