//! Content-addressed blob storage.
//!
//! Blobs are immutable and shared: the same payload committed twice (even
//! from different tracts) stores one row. Byte size and token count are
//! recorded at write time so downstream accounting never re-encodes.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::errors::Result;
use crate::store::{ts_from_sql, ts_to_sql};

/// One blob row.
#[derive(Debug, Clone)]
pub struct BlobRow {
    pub content_hash: String,
    pub payload_json: String,
    pub byte_size: usize,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

impl BlobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(BlobRow {
            content_hash: row.get(0)?,
            payload_json: row.get(1)?,
            byte_size: row.get::<_, i64>(2)? as usize,
            token_count: row.get::<_, i64>(3)? as usize,
            created_at: ts_from_sql(&row.get::<_, String>(4)?),
        })
    }
}

pub struct BlobStore<'a> {
    conn: &'a Connection,
}

impl<'a> BlobStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, content_hash: &str) -> Result<Option<BlobRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT content_hash, payload_json, byte_size, token_count, created_at
                 FROM blobs WHERE content_hash = ?1",
                [content_hash],
                BlobRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Store a blob only if its hash is not already present (dedup).
    pub fn save_if_absent(&self, blob: &BlobRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO blobs (content_hash, payload_json, byte_size, token_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(content_hash) DO NOTHING",
            params![
                blob.content_hash,
                blob.payload_json,
                blob.byte_size as i64,
                blob.token_count as i64,
                ts_to_sql(&blob.created_at),
            ],
        )?;
        Ok(())
    }

    /// Delete a blob if no commit still references it.
    ///
    /// Returns true if deleted, false if still referenced or absent.
    pub fn delete_if_orphaned(&self, content_hash: &str) -> Result<bool> {
        let referenced: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM commits WHERE content_hash = ?1 LIMIT 1",
                [content_hash],
                |r| r.get(0),
            )
            .optional()?;
        if referenced.is_some() {
            return Ok(false);
        }
        let deleted = self
            .conn
            .execute("DELETE FROM blobs WHERE content_hash = ?1", [content_hash])?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn blob(hash: &str, payload: &str) -> BlobRow {
        BlobRow {
            content_hash: hash.repeat(64 / hash.len()),
            payload_json: payload.to_string(),
            byte_size: payload.len(),
            token_count: payload.len() / 4,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn save_if_absent_is_idempotent() {
        let store = Store::open(":memory:").unwrap();
        let blobs = store.blobs();
        let b = blob("ab", r#"{"x":1}"#);
        blobs.save_if_absent(&b).unwrap();
        blobs.save_if_absent(&b).unwrap();

        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM blobs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            blobs.get(&b.content_hash).unwrap().unwrap().payload_json,
            r#"{"x":1}"#
        );
    }

    #[test]
    fn delete_if_orphaned_respects_references() {
        let store = Store::open(":memory:").unwrap();
        let blobs = store.blobs();
        let b = blob("cd", r#"{"y":2}"#);
        blobs.save_if_absent(&b).unwrap();

        // Reference it from a minimal commit row.
        store
            .conn()
            .execute(
                "INSERT INTO commits (commit_hash, tract_id, content_hash, content_type,
                 operation, token_count, created_at)
                 VALUES ('c1', 't1', ?1, 'dialogue', 'APPEND', 0, '2026-01-01T00:00:00.000000Z')",
                [&b.content_hash],
            )
            .unwrap();
        assert!(!blobs.delete_if_orphaned(&b.content_hash).unwrap());

        store
            .conn()
            .execute("DELETE FROM commits WHERE commit_hash = 'c1'", [])
            .unwrap();
        assert!(blobs.delete_if_orphaned(&b.content_hash).unwrap());
        assert!(blobs.get(&b.content_hash).unwrap().is_none());
    }
}
