//! Cross-tract queries over one shared DB file.
//!
//! A `Session` is a read-mostly view across every tract in the store:
//! listing, timeline, content search, point-in-time compilation, and crash
//! recovery. It opens its own connection; writers keep theirs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::engine::row_to_info;
use crate::errors::Result;
use crate::models::{CommitInfo, CompiledContext};
use crate::store::Store;
use crate::tokens::{EstimateCounter, TokenCounter};
use crate::tract::compile_tract_at;

/// One tract as listed by `Session::list_tracts`.
#[derive(Debug, Clone)]
pub struct TractSummary {
    pub tract_id: String,
    pub display_name: Option<String>,
    pub commit_count: usize,
    pub latest_commit_at: DateTime<Utc>,
    /// False once the tract carries a `session_type = "end"` commit.
    pub is_active: bool,
    pub parent_tract_id: Option<String>,
}

pub struct Session {
    store: Store,
    counter: Arc<dyn TokenCounter>,
}

impl Session {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            store: Store::open(path)?,
            counter: Arc::new(EstimateCounter),
        })
    }

    pub fn open_with(path: &str, counter: Arc<dyn TokenCounter>) -> Result<Self> {
        Ok(Self {
            store: Store::open(path)?,
            counter,
        })
    }

    /// Whether a tract recorded a session-end boundary.
    fn is_tract_ended(&self, tract_id: &str) -> Result<bool> {
        let commits = self.store.commits();
        let blobs = self.store.blobs();
        for row in commits.get_by_type(tract_id, "session")? {
            if let Some(blob) = blobs.get(&row.content_hash)? {
                if let Ok(payload) = serde_json::from_str::<Value>(&blob.payload_json) {
                    if payload.get("session_type").and_then(Value::as_str) == Some("end") {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Every tract with commit counts, latest activity, active flag, and
    /// spawn parentage.
    pub fn list_tracts(&self) -> Result<Vec<TractSummary>> {
        let spawns = self.store.spawns();
        let mut out = Vec::new();
        for (tract_id, commit_count, latest_commit_at) in
            self.store.commits().tract_summaries()?
        {
            let pointer = spawns.by_child(&tract_id)?;
            out.push(TractSummary {
                is_active: !self.is_tract_ended(&tract_id)?,
                display_name: pointer.as_ref().and_then(|p| p.display_name.clone()),
                parent_tract_id: pointer.map(|p| p.parent_tract_id),
                tract_id,
                commit_count,
                latest_commit_at,
            });
        }
        Ok(out)
    }

    /// All commits across all tracts in chronological order.
    pub fn timeline(&self, limit: Option<usize>) -> Result<Vec<CommitInfo>> {
        Ok(self
            .store
            .commits()
            .timeline(limit)?
            .iter()
            .map(row_to_info)
            .collect())
    }

    /// Commits whose blob content contains `term` (LIKE, wildcards
    /// escaped).
    pub fn search(&self, term: &str, tract_id: Option<&str>) -> Result<Vec<CommitInfo>> {
        let escaped = term
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("%{escaped}%");
        Ok(self
            .store
            .commits()
            .search_payloads(&pattern, tract_id)?
            .iter()
            .map(row_to_info)
            .collect())
    }

    /// Compile any tract at a historical point in time.
    pub fn compile_at(
        &self,
        tract_id: &str,
        at_time: Option<DateTime<Utc>>,
        at_commit: Option<String>,
    ) -> Result<CompiledContext> {
        compile_tract_at(&self.store, self.counter.as_ref(), tract_id, at_time, at_commit)
    }

    /// The most recently active tract for crash recovery; root tracts
    /// (no spawn parent) are preferred.
    pub fn resume(&self) -> Result<Option<TractSummary>> {
        let mut tracts = self.list_tracts()?;
        tracts.sort_by(|a, b| b.latest_commit_at.cmp(&a.latest_commit_at));

        let mut best_root: Option<TractSummary> = None;
        let mut best_any: Option<TractSummary> = None;
        for summary in tracts {
            if !summary.is_active {
                continue;
            }
            if summary.parent_tract_id.is_none() {
                if best_root.is_none() {
                    best_root = Some(summary);
                }
            } else if best_any.is_none() {
                best_any = Some(summary);
            }
        }
        Ok(best_root.or(best_any))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}
