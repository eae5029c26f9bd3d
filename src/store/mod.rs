//! SQLite persistence.
//!
//! One `Store` owns one `rusqlite::Connection`; the sub-stores are
//! lightweight views over it. Concurrency contract: one writer per DB file,
//! each thread opens its own `Store`. Schema migrations are monotonic
//! integers recorded in `_trace_meta`; opening an older database creates
//! any missing tables in place and bumps the version.

pub mod annotations;
pub mod blobs;
pub mod commits;
pub mod events;
pub mod refs;
pub mod spawn;

use std::cell::Cell;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::debug;

use crate::errors::Result;

pub use annotations::{AnnotationStore, TagRegistryEntry};
pub use blobs::{BlobRow, BlobStore};
pub use commits::{CommitRow, CommitStore, ConfigCondition};
pub use events::{EventStore, OperationEventRow};
pub use refs::{validate_branch_name, RefStore};
pub use spawn::{SpawnPointerRow, SpawnStore};

/// Reserved `_trace_meta` key carrying the schema version.
const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Ordered, monotonic migrations. Each entry runs at most once per DB.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    r#"
    CREATE TABLE IF NOT EXISTS blobs (
        content_hash TEXT PRIMARY KEY,
        payload_json TEXT NOT NULL,
        byte_size   INTEGER NOT NULL,
        token_count INTEGER NOT NULL,
        created_at  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS commits (
        commit_hash  TEXT PRIMARY KEY,
        tract_id     TEXT NOT NULL,
        parent_hash  TEXT,
        content_hash TEXT NOT NULL,
        content_type TEXT NOT NULL,
        operation    TEXT NOT NULL,
        edit_target  TEXT,
        message      TEXT,
        token_count  INTEGER NOT NULL,
        metadata_json TEXT,
        generation_config_json TEXT,
        tags_json    TEXT,
        created_at   TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_commits_tract   ON commits(tract_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_commits_parent  ON commits(parent_hash);
    CREATE INDEX IF NOT EXISTS idx_commits_content ON commits(content_hash);
    CREATE INDEX IF NOT EXISTS idx_commits_type    ON commits(tract_id, content_type);
    CREATE INDEX IF NOT EXISTS idx_commits_edit    ON commits(edit_target);

    CREATE TABLE IF NOT EXISTS commit_parents (
        commit_hash TEXT NOT NULL,
        parent_hash TEXT NOT NULL,
        position    INTEGER NOT NULL,
        PRIMARY KEY (commit_hash, position)
    );
    CREATE INDEX IF NOT EXISTS idx_parents_parent ON commit_parents(parent_hash);

    CREATE TABLE IF NOT EXISTS refs (
        tract_id        TEXT NOT NULL,
        ref_name        TEXT NOT NULL,
        commit_hash     TEXT,
        symbolic_target TEXT,
        PRIMARY KEY (tract_id, ref_name)
    );

    CREATE TABLE IF NOT EXISTS annotations (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        tract_id       TEXT NOT NULL,
        target_hash    TEXT NOT NULL,
        priority       TEXT NOT NULL,
        retention_json TEXT,
        reason         TEXT,
        created_at     TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_annotations_target ON annotations(target_hash, id);

    CREATE TABLE IF NOT EXISTS tag_annotations (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        tract_id    TEXT NOT NULL,
        target_hash TEXT NOT NULL,
        tag_name    TEXT NOT NULL,
        removed     INTEGER NOT NULL DEFAULT 0,
        created_at  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_tags_target ON tag_annotations(target_hash, tag_name, id);
    CREATE INDEX IF NOT EXISTS idx_tags_name   ON tag_annotations(tract_id, tag_name);

    CREATE TABLE IF NOT EXISTS tag_registry (
        tract_id     TEXT NOT NULL,
        name         TEXT NOT NULL,
        description  TEXT,
        auto_created INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (tract_id, name)
    );

    CREATE TABLE IF NOT EXISTS operation_events (
        event_id          TEXT PRIMARY KEY,
        tract_id          TEXT NOT NULL,
        event_type        TEXT NOT NULL,
        branch_name       TEXT,
        created_at        TEXT NOT NULL,
        original_tokens   INTEGER NOT NULL DEFAULT 0,
        compressed_tokens INTEGER NOT NULL DEFAULT 0,
        params_json       TEXT
    );

    CREATE TABLE IF NOT EXISTS operation_commits (
        event_id    TEXT NOT NULL,
        commit_hash TEXT NOT NULL,
        role        TEXT NOT NULL,
        position    INTEGER NOT NULL,
        PRIMARY KEY (event_id, role, position)
    );
    CREATE INDEX IF NOT EXISTS idx_opcommits_hash ON operation_commits(commit_hash);

    CREATE TABLE IF NOT EXISTS spawn_pointers (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        parent_tract_id    TEXT NOT NULL,
        parent_commit_hash TEXT,
        child_tract_id     TEXT NOT NULL,
        purpose            TEXT NOT NULL,
        inheritance_mode   TEXT NOT NULL,
        display_name       TEXT,
        created_at         TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_spawn_child  ON spawn_pointers(child_tract_id);
    CREATE INDEX IF NOT EXISTS idx_spawn_parent ON spawn_pointers(parent_tract_id);
    "#,
)];

/// Owns the connection and runs migrations.
pub struct Store {
    conn: Connection,
    in_tx: Cell<bool>,
}

impl Store {
    /// Open (or create) a store at `path`. `":memory:"` opens in-memory.
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(Path::new(path))?
        };
        // Several Tracts may share one file; let readers wait out a
        // writer's transaction instead of failing with SQLITE_BUSY.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn,
            in_tx: Cell::new(false),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Apply any migrations newer than the recorded schema version.
    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _trace_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )?;
        let current = self
            .meta_get(SCHEMA_VERSION_KEY)?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        for (version, sql) in MIGRATIONS {
            if *version > current {
                debug!(version, "applying schema migration");
                self.conn.execute_batch(sql)?;
                self.meta_set(SCHEMA_VERSION_KEY, &version.to_string())?;
            }
        }
        Ok(())
    }

    /// Current schema version.
    pub fn schema_version(&self) -> Result<i64> {
        Ok(self
            .meta_get(SCHEMA_VERSION_KEY)?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0))
    }

    /// Read a `_trace_meta` value.
    pub fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM _trace_meta WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Write a `_trace_meta` value.
    pub fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO _trace_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    /// Run `f` inside a transaction. Nested calls join the outer
    /// transaction; the outermost call commits or rolls back.
    pub fn with_tx<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.in_tx.get() {
            return f();
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_tx.set(true);
        let result = f();
        self.in_tx.set(false);
        match result {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    }

    /// Begin a deferred batch; `end_batch` decides its fate.
    pub fn begin_batch(&self) -> Result<()> {
        if !self.in_tx.get() {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            self.in_tx.set(true);
        }
        Ok(())
    }

    /// Close a batch opened with `begin_batch`.
    pub fn end_batch(&self, ok: bool) -> Result<()> {
        if self.in_tx.get() {
            self.in_tx.set(false);
            if ok {
                self.conn.execute_batch("COMMIT")?;
            } else {
                self.conn.execute_batch("ROLLBACK")?;
            }
        }
        Ok(())
    }

    pub fn blobs(&self) -> BlobStore<'_> {
        BlobStore::new(&self.conn)
    }

    pub fn commits(&self) -> CommitStore<'_> {
        CommitStore::new(&self.conn)
    }

    pub fn refs(&self) -> RefStore<'_> {
        RefStore::new(&self.conn)
    }

    pub fn annotations(&self) -> AnnotationStore<'_> {
        AnnotationStore::new(&self.conn)
    }

    pub fn events(&self) -> EventStore<'_> {
        EventStore::new(&self.conn)
    }

    pub fn spawns(&self) -> SpawnStore<'_> {
        SpawnStore::new(&self.conn)
    }
}

/// Encode a timestamp for storage. RFC 3339 UTC with microseconds sorts
/// lexicographically in time order.
pub fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp.
pub fn ts_from_sql(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| panic!("corrupt timestamp in store: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let store = Store::open(":memory:").unwrap();
        assert_eq!(store.schema_version().unwrap(), 1);
        store.migrate().unwrap();
        assert_eq!(store.schema_version().unwrap(), 1);
    }

    #[test]
    fn meta_round_trip() {
        let store = Store::open(":memory:").unwrap();
        assert!(store.meta_get("missing").unwrap().is_none());
        store.meta_set("k", "v1").unwrap();
        store.meta_set("k", "v2").unwrap();
        assert_eq!(store.meta_get("k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn timestamps_round_trip_and_sort() {
        let a = Utc::now();
        let encoded = ts_to_sql(&a);
        let decoded = ts_from_sql(&encoded);
        assert_eq!(ts_to_sql(&decoded), encoded);

        let later = a + chrono::Duration::microseconds(1);
        assert!(ts_to_sql(&later) > encoded);
    }

    #[test]
    fn tx_rolls_back_on_error() {
        let store = Store::open(":memory:").unwrap();
        let result: Result<()> = store.with_tx(|| {
            store.meta_set("inside", "yes")?;
            Err(crate::errors::TractError::Compression("boom".into()))
        });
        assert!(result.is_err());
        assert!(store.meta_get("inside").unwrap().is_none());
    }
}
