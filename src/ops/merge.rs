//! Three-way merge with conflict resolution.
//!
//! Merging resolves in order: already-merged no-op, fast-forward, full
//! three-way using the merge base. Conflicts arise when both sides carry
//! EDIT chains for the same base commit; each conflict needs a resolution
//! text before the merge commit (two parent edges) and per-conflict EDIT
//! commits are written.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::content::Content;
use crate::dag;
use crate::engine::{row_to_info, CommitEngine, CommitParams};
use crate::errors::{Result, TractError};
use crate::llm::{ChatMessage, LlmClient, ResolveAction, ResolveIssue, Resolver};
use crate::models::MergeResult;
use crate::pending::{PendingOperation, PendingState, PendingStatus, ValidationResult};
use crate::prompts;
use crate::store::{CommitRow, OperationEventRow, Store};
use crate::tokens::TokenCounter;

/// One conflict between the two sides of a merge.
#[derive(Debug, Clone)]
pub struct MergeConflict {
    /// The base commit both sides edited.
    pub target_hash: String,
    pub ancestor_content: Option<String>,
    /// Current-branch text.
    pub content_a_text: String,
    /// Incoming-branch text.
    pub content_b_text: String,
    pub conflict_type: String,
}

/// Options for `Tract::merge`.
#[derive(Clone, Default)]
pub struct MergeOptions {
    pub review: bool,
    /// Free-text steering for the conflict resolver.
    pub guidance: Option<String>,
    /// Resolved LLM parameters for the default resolver.
    pub llm_params: Option<Value>,
    pub triggered_by: Option<String>,
}

/// How the merge planner resolved against the branch topology.
pub enum MergePlan {
    AlreadyMerged,
    FastForward { source_tip: String },
    ThreeWay(Box<PendingMerge>),
}

/// A planned three-way merge awaiting approval.
pub struct PendingMerge {
    pub state: PendingState,
    pub source_branch: String,
    pub target_branch: String,
    pub conflicts: Vec<MergeConflict>,
    /// `target_hash -> resolution text`, editable in review mode.
    pub resolutions: BTreeMap<String, String>,
    pub guidance: Option<String>,

    pub(crate) source_tip: String,
    pub(crate) current_tip: String,
    pub(crate) merge_base: Option<String>,
    pub(crate) llm_params: Value,
    pub(crate) client: Option<Arc<dyn LlmClient>>,
}

impl PendingMerge {
    pub fn status(&self) -> PendingStatus {
        self.state.status()
    }

    pub fn approve(&mut self) -> Result<()> {
        self.state.approve()
    }

    pub fn reject(&mut self, reason: Option<String>) -> Result<()> {
        self.state.reject(reason)
    }

    /// Replace the resolution for an existing conflict key.
    pub fn edit_resolution(&mut self, target_hash: &str, text: impl Into<String>) -> Result<()> {
        if !self.conflicts.iter().any(|c| c.target_hash == target_hash) {
            return Err(TractError::Merge(format!(
                "no conflict with key {target_hash}"
            )));
        }
        self.resolutions.insert(target_hash.to_string(), text.into());
        Ok(())
    }

    /// Upsert a resolution (no key check).
    pub fn set_resolution(&mut self, target_hash: impl Into<String>, text: impl Into<String>) {
        self.resolutions.insert(target_hash.into(), text.into());
    }

    pub fn edit_guidance(&mut self, text: impl Into<String>) {
        self.guidance = Some(text.into());
    }

    /// Every conflict key must carry a non-empty resolution.
    pub fn validate(&self) -> ValidationResult {
        for conflict in &self.conflicts {
            match self.resolutions.get(&conflict.target_hash) {
                Some(text) if !text.trim().is_empty() => {}
                _ => {
                    return ValidationResult::failed(format!(
                        "conflict {} has no resolution",
                        &conflict.target_hash[..8.min(conflict.target_hash.len())]
                    ))
                }
            }
        }
        ValidationResult::ok()
    }

    /// Re-invoke the LLM resolver for every conflict.
    pub fn retry(&mut self) -> Result<()> {
        let client = self.client.clone().ok_or_else(|| {
            TractError::LlmConfig("merge retry requires an LLM client".to_string())
        })?;
        for conflict in &self.conflicts {
            let text = resolve_with_llm(
                client.as_ref(),
                conflict,
                self.guidance.as_deref(),
                &self.llm_params,
            )?;
            self.resolutions.insert(conflict.target_hash.clone(), text);
        }
        Ok(())
    }
}

impl PendingOperation for PendingMerge {
    fn status(&self) -> PendingStatus {
        PendingMerge::status(self)
    }
    fn approve(&mut self) -> Result<()> {
        PendingMerge::approve(self)
    }
    fn reject(&mut self, reason: Option<String>) -> Result<()> {
        PendingMerge::reject(self, reason)
    }
    fn validate(&self) -> ValidationResult {
        PendingMerge::validate(self)
    }
    fn retry(&mut self) -> Result<()> {
        PendingMerge::retry(self)
    }
    fn fold_diagnosis(&mut self, diagnosis: &str) {
        let base = self.guidance.take().unwrap_or_default();
        self.guidance = Some(
            format!("{base}\n\nPrevious resolution was rejected: {diagnosis}")
                .trim()
                .to_string(),
        );
    }
    fn operation_name(&self) -> &'static str {
        "merge"
    }
}

fn resolve_with_llm(
    client: &dyn LlmClient,
    conflict: &MergeConflict,
    guidance: Option<&str>,
    llm_params: &Value,
) -> Result<String> {
    let messages = vec![
        ChatMessage {
            role: "system".into(),
            content: prompts::DEFAULT_MERGE_SYSTEM.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        },
        ChatMessage {
            role: "user".into(),
            content: prompts::build_merge_resolution_prompt(
                conflict.ancestor_content.as_deref(),
                &conflict.content_a_text,
                &conflict.content_b_text,
                guidance,
            ),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        },
    ];
    let completion = client.chat(&messages, llm_params)?;
    let text = completion.content()?;
    if text.trim().is_empty() {
        return Err(TractError::Merge("LLM returned an empty resolution".to_string()));
    }
    Ok(text)
}

/// Map each side's EDIT chains to the base commit they ultimately edit.
/// Only chains rooted outside the side's own unique commits count; those
/// are edits of shared history and can conflict with the other side.
fn edits_of_base<'a>(
    side: &'a [CommitRow],
    base_ancestors: &HashSet<String>,
) -> HashMap<String, &'a CommitRow> {
    let side_hashes: HashSet<&str> = side.iter().map(|c| c.commit_hash.as_str()).collect();
    let by_hash: HashMap<&str, &CommitRow> =
        side.iter().map(|c| (c.commit_hash.as_str(), c)).collect();

    let mut latest: HashMap<String, &CommitRow> = HashMap::new();
    for row in side {
        let Some(mut target) = row.edit_target.as_deref() else {
            continue;
        };
        // Follow the chain through this side's own edits to the base.
        let mut hops = 0;
        while side_hashes.contains(target) {
            match by_hash.get(target).and_then(|r| r.edit_target.as_deref()) {
                Some(next) => target = next,
                None => break,
            }
            hops += 1;
            if hops > side.len() {
                break;
            }
        }
        if !base_ancestors.contains(target) {
            continue;
        }
        let entry = latest.entry(target.to_string()).or_insert(row);
        if (row.created_at, &row.commit_hash) > (entry.created_at, &entry.commit_hash) {
            *entry = row;
        }
    }
    latest
}

/// Plan a merge of `source_branch` into the current branch.
#[allow(clippy::too_many_arguments)]
pub fn plan(
    store: &Store,
    client: Option<Arc<dyn LlmClient>>,
    tract_id: &str,
    custom_types: &HashSet<String>,
    source_branch: &str,
    mut resolver: Option<Resolver>,
    options: &MergeOptions,
) -> Result<MergePlan> {
    let refs = store.refs();
    let commits = store.commits();

    let current_branch = refs
        .current_branch(tract_id)?
        .ok_or_else(|| TractError::DetachedHead("merge requires an attached HEAD".to_string()))?;
    if current_branch == source_branch {
        return Err(TractError::Merge("cannot merge a branch into itself".to_string()));
    }
    let current_tip = refs
        .head(tract_id)?
        .ok_or_else(|| TractError::Merge("no commits on current branch".to_string()))?;
    let source_tip = refs
        .branch(tract_id, source_branch)?
        .ok_or_else(|| TractError::BranchNotFound(source_branch.to_string()))?;

    if dag::is_ancestor(&commits, &source_tip, &current_tip)? {
        return Ok(MergePlan::AlreadyMerged);
    }
    if dag::is_ancestor(&commits, &current_tip, &source_tip)? {
        return Ok(MergePlan::FastForward { source_tip });
    }

    let merge_base = dag::find_merge_base(&commits, &current_tip, &source_tip)?;
    let base_ancestors: HashSet<String> = match &merge_base {
        Some(base) => dag::all_ancestors(&commits, base)?,
        None => HashSet::new(),
    };

    let ours = dag::branch_commits(&commits, &current_tip, &source_tip)?;
    let theirs = dag::branch_commits(&commits, &source_tip, &current_tip)?;
    let our_edits = edits_of_base(&ours, &base_ancestors);
    let their_edits = edits_of_base(&theirs, &base_ancestors);

    let mut conflicts: Vec<MergeConflict> = Vec::new();
    let mut conflict_keys: Vec<&String> = our_edits
        .keys()
        .filter(|k| their_edits.contains_key(*k))
        .collect();
    conflict_keys.sort();
    for key in conflict_keys {
        let ancestor_text = commits
            .get(key)?
            .map(|row| super::reconstruct_content(store, &row, custom_types))
            .transpose()?
            .map(|c| super::content_text(&c));
        let ours_text = super::content_text(&super::reconstruct_content(
            store,
            our_edits[key],
            custom_types,
        )?);
        let theirs_text = super::content_text(&super::reconstruct_content(
            store,
            their_edits[key],
            custom_types,
        )?);
        conflicts.push(MergeConflict {
            target_hash: key.clone(),
            ancestor_content: ancestor_text,
            content_a_text: ours_text,
            content_b_text: theirs_text,
            conflict_type: "edit_conflict".to_string(),
        });
    }

    // Generate resolutions: caller resolver first, LLM by default.
    let llm_params = options.llm_params.clone().unwrap_or_else(|| json!({}));
    let mut resolutions: BTreeMap<String, String> = BTreeMap::new();
    for conflict in &conflicts {
        if let Some(resolver) = resolver.as_mut() {
            let issue = ResolveIssue {
                issue_type: conflict.conflict_type.clone(),
                commit_hash: conflict.target_hash.clone(),
                description: format!(
                    "both branches edited commit {}",
                    &conflict.target_hash[..8.min(conflict.target_hash.len())]
                ),
                content_a: Some(conflict.content_a_text.clone()),
                content_b: Some(conflict.content_b_text.clone()),
            };
            let resolution = resolver(&issue);
            match resolution.action {
                ResolveAction::Abort => {
                    return Err(TractError::Merge(format!(
                        "resolver aborted merge: {}",
                        resolution.reasoning.unwrap_or_default()
                    )))
                }
                ResolveAction::Skip => continue,
                ResolveAction::Resolved => {
                    if let Some(text) = resolution.content_text {
                        resolutions.insert(conflict.target_hash.clone(), text);
                    }
                }
            }
        } else if let Some(client) = client.as_ref() {
            let text = resolve_with_llm(
                client.as_ref(),
                conflict,
                options.guidance.as_deref(),
                &llm_params,
            )?;
            resolutions.insert(conflict.target_hash.clone(), text);
        }
    }

    Ok(MergePlan::ThreeWay(Box::new(PendingMerge {
        state: PendingState::new(Some(current_tip.clone()), options.triggered_by.clone()),
        source_branch: source_branch.to_string(),
        target_branch: current_branch,
        conflicts,
        resolutions,
        guidance: options.guidance.clone(),
        source_tip,
        current_tip,
        merge_base,
        llm_params,
        client,
    })))
}

/// Finalize an approved three-way merge: one merge commit with two parent
/// edges (0 = current tip, 1 = source tip) plus an EDIT commit per
/// resolution, then a `merge` provenance event.
pub fn finalize(
    store: &Store,
    counter: &dyn TokenCounter,
    tract_id: &str,
    strict_tags: bool,
    custom_types: &HashSet<String>,
    pending: &mut PendingMerge,
) -> Result<MergeResult> {
    if pending.status() != PendingStatus::Approved {
        return Err(TractError::InvalidState(format!(
            "cannot finalize a {} merge; approve it first",
            pending.status().as_str()
        )));
    }
    let verdict = pending.validate();
    if !verdict.ok {
        return Err(TractError::Merge(
            verdict.diagnosis.unwrap_or_else(|| "unresolved conflicts".to_string()),
        ));
    }
    let current_head = store.refs().head(tract_id)?;
    if current_head.as_deref() != Some(pending.current_tip.as_str()) {
        return Err(TractError::Merge(
            "HEAD changed since the merge was planned".to_string(),
        ));
    }

    store.with_tx(|| {
        store
            .refs()
            .set_ref(tract_id, "ORIG_HEAD", &pending.current_tip)?;
        let engine = CommitEngine::new(store, counter, tract_id, strict_tags);
        let merge_info = engine.create_commit(
            &Content::Session {
                session_type: crate::content::SessionType::Merge,
                summary: format!(
                    "Merged branch '{}' into '{}'",
                    pending.source_branch, pending.target_branch
                ),
                decisions: vec![],
                next_steps: vec![],
            },
            CommitParams {
                message: Some(format!("Merge branch '{}'", pending.source_branch)),
                ..Default::default()
            },
        )?;
        store.commits().add_parents(
            &merge_info.commit_hash,
            &[pending.current_tip.clone(), pending.source_tip.clone()],
        )?;

        // One EDIT per resolution, targeting the conflicted base commit.
        let mut resolution_commits: Vec<String> = Vec::new();
        for conflict in &pending.conflicts {
            let text = pending.resolutions[&conflict.target_hash].clone();
            let base_row = store
                .commits()
                .get(&conflict.target_hash)?
                .ok_or_else(|| TractError::CommitNotFound(conflict.target_hash.clone()))?;
            let base_content = super::reconstruct_content(store, &base_row, custom_types)?;
            let resolved = rewrite_text(&base_content, text);
            let info = engine.create_commit(
                &resolved,
                CommitParams {
                    operation: crate::models::CommitOperation::Edit,
                    edit_target: Some(conflict.target_hash.clone()),
                    message: Some("Merge conflict resolution".to_string()),
                    ..Default::default()
                },
            )?;
            resolution_commits.push(info.commit_hash);
        }

        let new_head = store.refs().head(tract_id)?.unwrap_or_default();

        let event_id = Uuid::new_v4().simple().to_string();
        let events = store.events();
        events.save_event(&OperationEventRow {
            event_id: event_id.clone(),
            tract_id: tract_id.to_string(),
            event_type: "merge".to_string(),
            branch_name: Some(pending.target_branch.clone()),
            created_at: Utc::now(),
            original_tokens: 0,
            compressed_tokens: 0,
            params_json: Some(json!({
                "source_branch": pending.source_branch,
                "merge_base": pending.merge_base,
                "conflicts": pending.conflicts.len(),
            })),
        })?;
        events.add_commit(&event_id, &pending.current_tip, "source", 0)?;
        events.add_commit(&event_id, &pending.source_tip, "source", 1)?;
        events.add_commit(&event_id, &merge_info.commit_hash, "result", 0)?;
        for (i, hash) in resolution_commits.iter().enumerate() {
            events.add_commit(&event_id, hash, "result", i + 1)?;
        }

        pending.state.mark_committed()?;
        info!(
            source = %pending.source_branch,
            target = %pending.target_branch,
            conflicts = pending.conflicts.len(),
            "merge committed"
        );

        let merge_row = store
            .commits()
            .get(&merge_info.commit_hash)?
            .expect("merge commit written in this transaction");
        Ok(MergeResult {
            merge_commit: Some(row_to_info(&merge_row)),
            fast_forward: false,
            already_merged: false,
            conflicts_resolved: pending.conflicts.len(),
            new_head,
        })
    })
}

/// Carry the base content's shape, replacing its text.
fn rewrite_text(base: &Content, text: String) -> Content {
    match base {
        Content::Instruction { .. } => Content::Instruction { text },
        Content::Dialogue {
            role,
            tool_call_id,
            tool_calls,
            ..
        } => Content::Dialogue {
            role: *role,
            text,
            tool_call_id: tool_call_id.clone(),
            tool_calls: tool_calls.clone(),
        },
        Content::Reasoning { format, .. } => Content::Reasoning {
            text,
            format: *format,
        },
        _ => Content::Freeform {
            payload: json!({"text": text}),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Role;

    #[test]
    fn validation_requires_every_resolution() {
        let mut pending = PendingMerge {
            state: PendingState::new(None, None),
            source_branch: "feature".into(),
            target_branch: "main".into(),
            conflicts: vec![MergeConflict {
                target_hash: "aaaabbbb".into(),
                ancestor_content: None,
                content_a_text: "ours".into(),
                content_b_text: "theirs".into(),
                conflict_type: "edit_conflict".into(),
            }],
            resolutions: BTreeMap::new(),
            guidance: None,
            source_tip: "s".into(),
            current_tip: "c".into(),
            merge_base: None,
            llm_params: json!({}),
            client: None,
        };
        assert!(!pending.validate().ok);
        pending.set_resolution("aaaabbbb", "merged text");
        assert!(pending.validate().ok);
        assert!(pending.edit_resolution("missing", "x").is_err());
    }

    #[test]
    fn rewrite_preserves_content_shape() {
        let base = Content::dialogue(Role::Assistant, "v1");
        let rewritten = rewrite_text(&base, "v2".into());
        assert!(matches!(
            rewritten,
            Content::Dialogue { role: Role::Assistant, ref text, .. } if text == "v2"
        ));

        let instruction = Content::instruction("old rule");
        assert!(matches!(
            rewrite_text(&instruction, "new rule".into()),
            Content::Instruction { ref text } if text == "new rule"
        ));
    }
}
