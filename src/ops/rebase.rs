//! Rebase and import: commit replay with new parentage.
//!
//! Rebase replays the current branch's unique commits onto another
//! branch's tip; import (cherry-pick) replays a single commit onto HEAD.
//! Both check EDIT targets against the destination ancestry and surface
//! semantic-safety issues to a resolver.

use std::collections::HashSet;

use chrono::Utc;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::content::Content;
use crate::dag;
use crate::engine::{row_to_info, CommitEngine, CommitParams};
use crate::errors::{Result, TractError};
use crate::llm::{ResolveAction, ResolveIssue, Resolver};
use crate::models::{CommitOperation, ImportIssue, ImportResult, RebaseResult, SafetyWarning};
use crate::pending::{PendingOperation, PendingState, PendingStatus, ValidationResult};
use crate::store::{CommitRow, OperationEventRow, Store};
use crate::tokens::TokenCounter;

/// A planned rebase awaiting approval.
#[derive(Debug)]
pub struct PendingRebase {
    pub state: PendingState,
    /// Hashes to replay, oldest first. `exclude` edits this plan.
    pub replay_plan: Vec<String>,
    pub warnings: Vec<SafetyWarning>,
    /// Tip of the branch being rebased onto.
    pub target_base: String,
    pub target_branch: String,
    pub current_branch: String,

    pub(crate) original_tip: String,
    pub(crate) rows: Vec<CommitRow>,
}

impl PendingRebase {
    pub fn status(&self) -> PendingStatus {
        self.state.status()
    }

    pub fn approve(&mut self) -> Result<()> {
        self.state.approve()
    }

    pub fn reject(&mut self, reason: Option<String>) -> Result<()> {
        self.state.reject(reason)
    }

    /// Drop one commit from the replay plan.
    pub fn exclude(&mut self, commit_hash: &str) {
        self.replay_plan.retain(|h| h != commit_hash);
        self.rows.retain(|c| c.commit_hash != commit_hash);
    }

    pub fn validate(&self) -> ValidationResult {
        if self.replay_plan.is_empty() {
            ValidationResult::failed("replay plan is empty")
        } else {
            ValidationResult::ok()
        }
    }
}

impl PendingOperation for PendingRebase {
    fn status(&self) -> PendingStatus {
        PendingRebase::status(self)
    }
    fn approve(&mut self) -> Result<()> {
        PendingRebase::approve(self)
    }
    fn reject(&mut self, reason: Option<String>) -> Result<()> {
        PendingRebase::reject(self, reason)
    }
    fn validate(&self) -> ValidationResult {
        PendingRebase::validate(self)
    }
    fn operation_name(&self) -> &'static str {
        "rebase"
    }
}

/// Plan a rebase of the current branch onto `target_branch`.
///
/// Returns None when the branch is already up to date.
pub fn plan(
    store: &Store,
    tract_id: &str,
    target_branch: &str,
    mut resolver: Option<Resolver>,
    triggered_by: Option<String>,
) -> Result<Option<PendingRebase>> {
    let refs = store.refs();
    let commits = store.commits();

    let current_branch = refs
        .current_branch(tract_id)?
        .ok_or_else(|| TractError::Rebase("cannot rebase in detached HEAD state".to_string()))?;
    let current_tip = refs
        .head(tract_id)?
        .ok_or_else(|| TractError::Rebase("no commits on current branch".to_string()))?;
    let target_tip = refs
        .branch(tract_id, target_branch)?
        .ok_or_else(|| TractError::BranchNotFound(target_branch.to_string()))?;

    if current_tip == target_tip {
        return Ok(None);
    }
    let merge_base = dag::find_merge_base(&commits, &current_tip, &target_tip)?;
    if merge_base.as_deref() == Some(target_tip.as_str()) {
        // Target is behind us; nothing to replay.
        return Ok(None);
    }

    let to_replay: Vec<CommitRow> = match &merge_base {
        Some(base) => dag::branch_commits(&commits, &current_tip, base)?,
        None => {
            let mut chain = commits.get_ancestors(&current_tip, None, None)?;
            chain.reverse();
            chain
        }
    };
    if to_replay.is_empty() {
        return Ok(None);
    }

    // Pre-flight: merge commits cannot be replayed.
    for row in &to_replay {
        if !commits.get_parents(&row.commit_hash)?.is_empty() {
            return Err(TractError::Rebase(
                "cannot rebase a branch containing merge commits".to_string(),
            ));
        }
    }

    // Semantic safety: EDITs whose target is absent from the destination
    // ancestry.
    let target_ancestors = dag::all_ancestors(&commits, &target_tip)?;
    let replay_set: HashSet<&str> = to_replay.iter().map(|c| c.commit_hash.as_str()).collect();
    let mut warnings: Vec<SafetyWarning> = Vec::new();
    for row in &to_replay {
        if row.operation == CommitOperation::Edit {
            if let Some(target) = &row.edit_target {
                if !target_ancestors.contains(target) && !replay_set.contains(target.as_str()) {
                    warnings.push(SafetyWarning {
                        warning_type: "edit_target_missing".to_string(),
                        commit_hash: row.commit_hash.clone(),
                        missing_target: Some(target.clone()),
                        description: format!(
                            "EDIT commit targets {}... which does not exist on target branch '{}'",
                            &target[..12.min(target.len())],
                            target_branch
                        ),
                    });
                }
            }
        }
    }
    if !warnings.is_empty() {
        match resolver.as_mut() {
            None => {
                return Err(TractError::SemanticSafety(format!(
                    "rebase has {} semantic safety warning(s): {}",
                    warnings.len(),
                    warnings
                        .iter()
                        .map(|w| w.description.as_str())
                        .collect::<Vec<_>>()
                        .join("; ")
                )))
            }
            Some(resolver) => {
                for warning in &warnings {
                    let issue = ResolveIssue {
                        issue_type: warning.warning_type.clone(),
                        commit_hash: warning.commit_hash.clone(),
                        description: warning.description.clone(),
                        content_a: None,
                        content_b: None,
                    };
                    let resolution = resolver(&issue);
                    if resolution.action == ResolveAction::Abort {
                        return Err(TractError::Rebase(format!(
                            "resolver aborted rebase: {}",
                            resolution.reasoning.unwrap_or_default()
                        )));
                    }
                    // Resolved and skip both proceed with the replay.
                }
            }
        }
    }

    Ok(Some(PendingRebase {
        state: PendingState::new(Some(current_tip.clone()), triggered_by),
        replay_plan: to_replay.iter().map(|c| c.commit_hash.clone()).collect(),
        warnings,
        target_base: target_tip,
        target_branch: target_branch.to_string(),
        current_branch,
        original_tip: current_tip,
        rows: to_replay,
    }))
}

/// Finalize an approved rebase: detach at the target tip, replay each
/// commit, move the branch ref, re-attach HEAD. On failure the branch ref
/// is restored to the original tip.
pub fn finalize(
    store: &Store,
    counter: &dyn TokenCounter,
    tract_id: &str,
    strict_tags: bool,
    custom_types: &HashSet<String>,
    pending: &mut PendingRebase,
) -> Result<RebaseResult> {
    if pending.status() != PendingStatus::Approved {
        return Err(TractError::InvalidState(format!(
            "cannot finalize a {} rebase; approve it first",
            pending.status().as_str()
        )));
    }
    // TOCTOU guard against concurrent commits since planning.
    let current_head = store.refs().head(tract_id)?;
    if current_head.as_deref() != Some(pending.original_tip.as_str()) {
        return Err(TractError::Rebase(
            "HEAD changed since the rebase was planned".to_string(),
        ));
    }

    let result = store.with_tx(|| {
        let engine = CommitEngine::new(store, counter, tract_id, strict_tags);
        let refs = store.refs();

        refs.set_ref(tract_id, "ORIG_HEAD", &pending.original_tip)?;
        refs.detach_head(tract_id, &pending.target_base)?;
        let mut replayed: Vec<crate::models::CommitInfo> = Vec::new();
        for row in &pending.rows {
            let content = super::reconstruct_content(store, row, custom_types)?;
            let info = engine.create_commit(
                &content,
                CommitParams {
                    operation: row.operation,
                    message: row.message.clone(),
                    edit_target: if row.operation == CommitOperation::Edit {
                        row.edit_target.clone()
                    } else {
                        None
                    },
                    metadata: row.metadata_json.clone(),
                    generation_config: row.generation_config_json.clone(),
                    tags: vec![],
                    created_at: None,
                },
            )?;
            replayed.push(info);
        }

        let new_head = replayed
            .last()
            .map(|c| c.commit_hash.clone())
            .unwrap_or_else(|| pending.target_base.clone());
        refs.set_branch(tract_id, &pending.current_branch, &new_head)?;
        refs.attach_head(tract_id, &pending.current_branch)?;

        // Provenance: a reorganize event mapping originals to replays.
        let event_id = Uuid::new_v4().simple().to_string();
        let events = store.events();
        events.save_event(&OperationEventRow {
            event_id: event_id.clone(),
            tract_id: tract_id.to_string(),
            event_type: "reorganize".to_string(),
            branch_name: Some(pending.current_branch.clone()),
            created_at: Utc::now(),
            original_tokens: 0,
            compressed_tokens: 0,
            params_json: Some(json!({"target_branch": pending.target_branch})),
        })?;
        for (i, row) in pending.rows.iter().enumerate() {
            events.add_commit(&event_id, &row.commit_hash, "source", i)?;
        }
        for (i, info) in replayed.iter().enumerate() {
            events.add_commit(&event_id, &info.commit_hash, "result", i)?;
        }

        pending.state.mark_committed()?;
        info!(
            branch = %pending.current_branch,
            onto = %pending.target_branch,
            replayed = replayed.len(),
            "rebase committed"
        );

        Ok(RebaseResult {
            original_commits: pending.rows.iter().map(row_to_info).collect(),
            replayed_commits: replayed,
            warnings: pending.warnings.clone(),
            new_head,
        })
    });

    if result.is_err() {
        // Restore the branch to its pre-rebase tip.
        let refs = store.refs();
        let _ = refs.set_branch(tract_id, &pending.current_branch, &pending.original_tip);
        let _ = refs.attach_head(tract_id, &pending.current_branch);
    }
    result
}

// ---------------------------------------------------------------------
// Import (cherry-pick)
// ---------------------------------------------------------------------

/// A planned import awaiting approval.
#[derive(Debug)]
pub struct PendingImport {
    pub state: PendingState,
    pub issues: Vec<ImportIssue>,
    /// Resolver-provided replacement text when the EDIT target is missing.
    pub resolved_content: Option<String>,
    /// True when the resolver chose to skip the import entirely.
    pub skipped: bool,

    pub(crate) original: CommitRow,
}

impl PendingImport {
    pub fn status(&self) -> PendingStatus {
        self.state.status()
    }

    pub fn approve(&mut self) -> Result<()> {
        self.state.approve()
    }

    pub fn reject(&mut self, reason: Option<String>) -> Result<()> {
        self.state.reject(reason)
    }

    pub fn validate(&self) -> ValidationResult {
        if !self.issues.is_empty() && self.resolved_content.is_none() && !self.skipped {
            ValidationResult::failed("import has unresolved issues")
        } else {
            ValidationResult::ok()
        }
    }
}

impl PendingOperation for PendingImport {
    fn status(&self) -> PendingStatus {
        PendingImport::status(self)
    }
    fn approve(&mut self) -> Result<()> {
        PendingImport::approve(self)
    }
    fn reject(&mut self, reason: Option<String>) -> Result<()> {
        PendingImport::reject(self, reason)
    }
    fn validate(&self) -> ValidationResult {
        PendingImport::validate(self)
    }
    fn operation_name(&self) -> &'static str {
        "import"
    }
}

/// Plan an import of `commit_hash` onto the current HEAD.
pub fn plan_import(
    store: &Store,
    tract_id: &str,
    commit_hash: &str,
    mut resolver: Option<Resolver>,
    triggered_by: Option<String>,
) -> Result<PendingImport> {
    let commits = store.commits();
    let original = commits
        .get(commit_hash)?
        .ok_or_else(|| TractError::ImportCommit(format!("commit not found: {commit_hash}")))?;
    let current_head = store.refs().head(tract_id)?;

    let mut issues: Vec<ImportIssue> = Vec::new();
    if original.operation == CommitOperation::Edit {
        if let Some(target) = &original.edit_target {
            let in_history = match &current_head {
                Some(head) => dag::all_ancestors(&commits, head)?.contains(target),
                None => false,
            };
            if !in_history {
                issues.push(ImportIssue {
                    issue_type: "edit_target_missing".to_string(),
                    commit_hash: original.commit_hash.clone(),
                    missing_target: Some(target.clone()),
                    description: format!(
                        "EDIT commit targets {}... which does not exist on the current branch",
                        &target[..12.min(target.len())]
                    ),
                });
            }
        }
    }

    let mut resolved_content: Option<String> = None;
    let mut skipped = false;
    if !issues.is_empty() {
        match resolver.as_mut() {
            None => {
                return Err(TractError::ImportCommit(format!(
                    "import has {} issue(s): {}",
                    issues.len(),
                    issues
                        .iter()
                        .map(|i| i.description.as_str())
                        .collect::<Vec<_>>()
                        .join("; ")
                )))
            }
            Some(resolver) => {
                for issue in &issues {
                    let resolve_issue = ResolveIssue {
                        issue_type: issue.issue_type.clone(),
                        commit_hash: issue.commit_hash.clone(),
                        description: issue.description.clone(),
                        content_a: None,
                        content_b: None,
                    };
                    let resolution = resolver(&resolve_issue);
                    match resolution.action {
                        ResolveAction::Abort => {
                            return Err(TractError::ImportCommit(format!(
                                "resolver aborted import: {}",
                                resolution.reasoning.unwrap_or_default()
                            )))
                        }
                        ResolveAction::Skip => skipped = true,
                        ResolveAction::Resolved => resolved_content = resolution.content_text,
                    }
                }
            }
        }
    }

    Ok(PendingImport {
        state: PendingState::new(current_head, triggered_by),
        issues,
        resolved_content,
        skipped,
        original,
    })
}

/// Finalize an approved import: replay the commit onto HEAD, or commit the
/// resolver's replacement as an APPEND with the original operation and
/// target preserved in metadata.
pub fn finalize_import(
    store: &Store,
    counter: &dyn TokenCounter,
    tract_id: &str,
    strict_tags: bool,
    custom_types: &HashSet<String>,
    pending: &mut PendingImport,
) -> Result<ImportResult> {
    if pending.status() != PendingStatus::Approved {
        return Err(TractError::InvalidState(format!(
            "cannot finalize a {} import; approve it first",
            pending.status().as_str()
        )));
    }
    let original_info = row_to_info(&pending.original);
    if pending.skipped {
        pending.state.mark_committed()?;
        return Ok(ImportResult {
            original_commit: original_info,
            new_commit: None,
            issues: pending.issues.clone(),
        });
    }

    store.with_tx(|| {
        let engine = CommitEngine::new(store, counter, tract_id, strict_tags);
        let new_info = if let Some(text) = &pending.resolved_content {
            // Original operation and target survive in metadata for audit.
            let mut metadata = pending
                .original
                .metadata_json
                .clone()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default();
            metadata.insert("original_operation".to_string(), json!("EDIT"));
            metadata.insert(
                "original_edit_target".to_string(),
                json!(pending.original.edit_target),
            );
            engine.create_commit(
                &Content::Freeform {
                    payload: json!({"text": text}),
                },
                CommitParams {
                    operation: CommitOperation::Append,
                    message: pending.original.message.clone(),
                    metadata: Some(serde_json::Value::Object(metadata)),
                    generation_config: pending.original.generation_config_json.clone(),
                    ..Default::default()
                },
            )?
        } else {
            let content = super::reconstruct_content(store, &pending.original, custom_types)?;
            engine.create_commit(
                &content,
                CommitParams {
                    operation: pending.original.operation,
                    message: pending.original.message.clone(),
                    edit_target: if pending.original.operation == CommitOperation::Edit {
                        pending.original.edit_target.clone()
                    } else {
                        None
                    },
                    metadata: pending.original.metadata_json.clone(),
                    generation_config: pending.original.generation_config_json.clone(),
                    tags: vec![],
                    created_at: None,
                },
            )?
        };

        let event_id = Uuid::new_v4().simple().to_string();
        let events = store.events();
        events.save_event(&OperationEventRow {
            event_id: event_id.clone(),
            tract_id: tract_id.to_string(),
            event_type: "import".to_string(),
            branch_name: None,
            created_at: Utc::now(),
            original_tokens: 0,
            compressed_tokens: 0,
            params_json: Some(json!({"original_commit": pending.original.commit_hash})),
        })?;
        events.add_commit(&event_id, &pending.original.commit_hash, "source", 0)?;
        events.add_commit(&event_id, &new_info.commit_hash, "result", 0)?;

        pending.state.mark_committed()?;
        Ok(ImportResult {
            original_commit: original_info,
            new_commit: Some(new_info),
            issues: pending.issues.clone(),
        })
    })
}
