//! Garbage collection: reachability sweep with orphan retention and pin
//! protection.
//!
//! The live set is every commit reachable from any ref via any parent
//! edge, plus commits whose latest annotation is PINNED or IMPORTANT,
//! plus caller-preserved hashes. Orphans must also out-age the retention
//! window before they become eligible.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use tracing::info;

use crate::dag;
use crate::errors::{Result, TractError};
use crate::models::{GCResult, Priority};
use crate::pending::{PendingOperation, PendingState, PendingStatus, ValidationResult};
use crate::store::Store;

/// Options for `Tract::gc`.
#[derive(Debug, Clone)]
pub struct GcOptions {
    /// Minimum orphan age in days before removal. None uses the tract
    /// config value.
    pub orphan_retention_days: Option<i64>,
    /// Extra hashes protected for this run.
    pub preserve: Vec<String>,
    pub review: bool,
    pub triggered_by: Option<String>,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            orphan_retention_days: None,
            preserve: Vec::new(),
            review: false,
            triggered_by: None,
        }
    }
}

/// A planned collection awaiting approval.
pub struct PendingGc {
    pub state: PendingState,
    /// Hashes planned for removal; `exclude` edits the plan.
    pub commits_to_remove: Vec<String>,
    pub tokens_to_free: usize,
}

impl PendingGc {
    pub fn status(&self) -> PendingStatus {
        self.state.status()
    }

    pub fn approve(&mut self) -> Result<()> {
        self.state.approve()
    }

    pub fn reject(&mut self, reason: Option<String>) -> Result<()> {
        self.state.reject(reason)
    }

    /// Drop a hash from the removal plan.
    pub fn exclude(&mut self, commit_hash: &str) {
        self.commits_to_remove.retain(|h| h != commit_hash);
    }

    pub fn validate(&self) -> ValidationResult {
        ValidationResult::ok()
    }
}

impl PendingOperation for PendingGc {
    fn status(&self) -> PendingStatus {
        PendingGc::status(self)
    }
    fn approve(&mut self) -> Result<()> {
        PendingGc::approve(self)
    }
    fn reject(&mut self, reason: Option<String>) -> Result<()> {
        PendingGc::reject(self, reason)
    }
    fn validate(&self) -> ValidationResult {
        PendingGc::validate(self)
    }
    fn operation_name(&self) -> &'static str {
        "gc"
    }
}

/// Plan a collection for one tract.
pub fn plan(
    store: &Store,
    tract_id: &str,
    retention_days: i64,
    options: &GcOptions,
) -> Result<PendingGc> {
    let commits = store.commits();
    let refs = store.refs();

    // Reachability from every direct ref of this tract.
    let mut live: HashSet<String> = HashSet::new();
    for (ref_tract, target) in refs.all_ref_targets()? {
        if ref_tract == tract_id {
            live.extend(dag::all_ancestors(&commits, &target)?);
        }
    }

    // Pin protection and caller preserves.
    live.extend(
        store
            .annotations()
            .targets_with_latest(tract_id, &[Priority::Pinned, Priority::Important])?,
    );
    live.extend(options.preserve.iter().cloned());

    let retention = options.orphan_retention_days.unwrap_or(retention_days);
    let cutoff = Utc::now() - Duration::days(retention);

    let mut commits_to_remove: Vec<String> = Vec::new();
    let mut tokens_to_free = 0usize;
    for row in commits.get_all(tract_id)? {
        if live.contains(&row.commit_hash) {
            continue;
        }
        if row.created_at > cutoff {
            continue;
        }
        tokens_to_free += row.token_count;
        commits_to_remove.push(row.commit_hash);
    }

    Ok(PendingGc {
        state: PendingState::new(refs.head(tract_id)?, options.triggered_by.clone()),
        commits_to_remove,
        tokens_to_free,
    })
}

/// Finalize an approved collection: delete commit rows (with their
/// cascades) and then drop any blob no commit references anymore.
pub fn finalize(store: &Store, tract_id: &str, pending: &mut PendingGc) -> Result<GCResult> {
    if pending.status() != PendingStatus::Approved {
        return Err(TractError::InvalidState(format!(
            "cannot finalize a {} gc; approve it first",
            pending.status().as_str()
        )));
    }

    store.with_tx(|| {
        let commits = store.commits();
        let blobs = store.blobs();

        let mut blob_hashes: Vec<String> = Vec::new();
        let mut tokens_freed = 0usize;
        for hash in &pending.commits_to_remove {
            if let Some(row) = commits.get(hash)? {
                tokens_freed += row.token_count;
                blob_hashes.push(row.content_hash.clone());
                commits.delete(hash)?;
            }
        }

        let mut removed_blobs: Vec<String> = Vec::new();
        blob_hashes.sort();
        blob_hashes.dedup();
        for blob_hash in blob_hashes {
            if blobs.delete_if_orphaned(&blob_hash)? {
                removed_blobs.push(blob_hash);
            }
        }

        pending.state.mark_committed()?;
        info!(
            tract = %tract_id,
            commits = pending.commits_to_remove.len(),
            blobs = removed_blobs.len(),
            tokens_freed,
            "gc committed"
        );

        Ok(GCResult {
            removed_commits: pending.commits_to_remove.clone(),
            removed_blobs,
            tokens_freed,
        })
    })
}
