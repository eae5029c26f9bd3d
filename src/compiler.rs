//! The compile pipeline: project the commit DAG into a bounded, ordered,
//! token-counted message list.
//!
//! Stages: enumerate ancestors from HEAD (first-parent chain, plus each
//! merge's second-parent unique ancestors once), sort by created_at with
//! commit-hash tiebreak, apply time/commit cutoffs, fold EDIT chains,
//! resolve priorities, filter reasoning, project to messages, aggregate
//! consecutive same-role messages, count tokens.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::content::{Content, Message};
use crate::errors::{Result, TractError};
use crate::models::{CommitOperation, CompiledContext, Priority, ReorderWarning};
use crate::store::{CommitRow, Store};
use crate::tokens::TokenCounter;

/// Compile-time options.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Only include commits created at or before this instant.
    pub at_time: Option<DateTime<Utc>>,
    /// Only include commits up to (and including) this hash.
    pub at_commit: Option<String>,
    /// Keep reasoning commits in the output.
    pub include_reasoning: bool,
    /// Append a compact `[edited]` marker to folded edit chains.
    pub include_edit_annotations: bool,
    /// Explicit presentation order (reordering only; the DAG is untouched).
    pub order: Option<Vec<String>>,
}

/// The compiler's cached output, extendable for pure APPENDs.
///
/// Callers never see this; only `CompiledContext` crosses the facade.
#[derive(Debug, Clone)]
pub struct CompileSnapshot {
    pub head_hash: String,
    pub raw_messages: Vec<Message>,
    pub aggregated_messages: Vec<Message>,
    pub effective_hashes: HashSet<String>,
    pub commit_count: usize,
    pub token_count: usize,
    pub token_source: String,
    pub generation_configs: Vec<Value>,
}

impl CompileSnapshot {
    pub fn from_compiled(head_hash: &str, compiled: &CompiledContext) -> Self {
        Self {
            head_hash: head_hash.to_string(),
            raw_messages: compiled.messages.clone(),
            aggregated_messages: compiled.messages.clone(),
            effective_hashes: HashSet::new(),
            commit_count: compiled.commit_count,
            token_count: compiled.token_count,
            token_source: compiled.token_source.clone(),
            generation_configs: compiled.generation_configs.clone(),
        }
    }

    pub fn to_compiled(&self) -> CompiledContext {
        CompiledContext {
            messages: self.aggregated_messages.clone(),
            token_count: self.token_count,
            commit_count: self.commit_count,
            token_source: self.token_source.clone(),
            generation_configs: self.generation_configs.clone(),
        }
    }

    /// Extend in place for one APPEND commit: tail-aggregate the new
    /// message with the previous one when roles match, then recount.
    pub fn extend_for_append(
        &mut self,
        new_head: &str,
        message: Message,
        generation_config: Option<Value>,
        counter: &dyn TokenCounter,
    ) {
        self.raw_messages.push(message.clone());
        match self.aggregated_messages.last_mut() {
            Some(last) if last.role == message.role => {
                last.content = format!("{}\n\n{}", last.content, message.content);
            }
            _ => self.aggregated_messages.push(message),
        }
        self.effective_hashes.insert(new_head.to_string());
        self.head_hash = new_head.to_string();
        self.commit_count += 1;
        self.token_count = counter.count_messages(&self.aggregated_messages);
        self.token_source = counter.source();
        if let Some(config) = generation_config {
            self.generation_configs.push(config);
        }
    }
}

/// One logical message slot after edit folding.
struct Effective {
    /// The position-carrying commit (chain root).
    root: CommitRow,
    /// The content-carrying commit (latest EDIT, or the root itself).
    latest: CommitRow,
    edited: bool,
}

pub struct Compiler<'a> {
    store: &'a Store,
    counter: &'a dyn TokenCounter,
    custom_types: &'a HashSet<String>,
}

impl<'a> Compiler<'a> {
    pub fn new(
        store: &'a Store,
        counter: &'a dyn TokenCounter,
        custom_types: &'a HashSet<String>,
    ) -> Self {
        Self {
            store,
            counter,
            custom_types,
        }
    }

    /// Full compile from `head_hash`.
    pub fn compile(
        &self,
        tract_id: &str,
        head_hash: &str,
        options: &CompileOptions,
    ) -> Result<CompiledContext> {
        let commits = self.store.commits();
        let annotations = self.store.annotations();

        // 1. Enumerate: first-parent chain plus each merge's second-parent
        //    unique ancestors, once.
        let chain = commits.get_ancestors(head_hash, None, None)?;
        let chain_set: HashSet<String> = chain.iter().map(|c| c.commit_hash.clone()).collect();
        let mut enumerated: HashMap<String, CommitRow> = chain
            .into_iter()
            .map(|c| (c.commit_hash.clone(), c))
            .collect();
        let merge_heads: Vec<String> = enumerated.keys().cloned().collect();
        for hash in merge_heads {
            let extra_parents = commits.get_parents(&hash)?;
            for parent in extra_parents.into_iter().skip(1) {
                for ancestor in crate::dag::all_ancestors(&commits, &parent)? {
                    if !chain_set.contains(&ancestor) && !enumerated.contains_key(&ancestor) {
                        if let Some(row) = commits.get(&ancestor)? {
                            if row.tract_id == tract_id {
                                enumerated.insert(ancestor, row);
                            }
                        }
                    }
                }
            }
        }

        // 2. Chronological order, hash tiebreak.
        let mut rows: Vec<CommitRow> = enumerated.into_values().collect();
        rows.sort_by(|x, y| {
            x.created_at
                .cmp(&y.created_at)
                .then_with(|| x.commit_hash.cmp(&y.commit_hash))
        });

        // 3. Cutoffs.
        if let Some(at_time) = options.at_time {
            rows.retain(|c| c.created_at <= at_time);
        }
        if let Some(at_commit) = &options.at_commit {
            let position = rows
                .iter()
                .position(|c| &c.commit_hash == at_commit)
                .ok_or_else(|| TractError::CommitNotFound(at_commit.clone()))?;
            rows.truncate(position + 1);
        }

        // 4. Fold EDIT chains onto their root APPEND.
        let effectives = self.fold_edits(&rows);

        // 5/6. Priorities and reasoning filtering.
        let mut lookup: Vec<String> = Vec::new();
        for e in &effectives {
            lookup.push(e.root.commit_hash.clone());
            if e.latest.commit_hash != e.root.commit_hash {
                lookup.push(e.latest.commit_hash.clone());
            }
        }
        let latest_annotations = annotations.batch_latest(&lookup)?;
        let priority_of = |e: &Effective| -> Priority {
            let root = latest_annotations
                .get(&e.root.commit_hash)
                .map(|a| a.priority);
            let latest = latest_annotations
                .get(&e.latest.commit_hash)
                .map(|a| a.priority);
            // SKIP from either side drops the slot; PINNED from either
            // side pins it; otherwise NORMAL behavior.
            if root == Some(Priority::Skip) || latest == Some(Priority::Skip) {
                Priority::Skip
            } else if root == Some(Priority::Pinned) || latest == Some(Priority::Pinned) {
                Priority::Pinned
            } else {
                root.or(latest).unwrap_or(Priority::Normal)
            }
        };

        let mut surviving: Vec<(&Effective, Priority)> = Vec::new();
        for e in &effectives {
            let priority = priority_of(e);
            if priority == Priority::Skip {
                continue;
            }
            if e.latest.content_type == "reasoning"
                && !options.include_reasoning
                && priority != Priority::Pinned
            {
                continue;
            }
            surviving.push((e, priority));
        }

        // Optional reorder: listed slots first in the requested order,
        // unlisted slots follow in chronological order.
        if let Some(order) = &options.order {
            let position: HashMap<&str, usize> = order
                .iter()
                .enumerate()
                .map(|(i, h)| (h.as_str(), i))
                .collect();
            surviving.sort_by_key(|(e, _)| {
                position
                    .get(e.root.commit_hash.as_str())
                    .copied()
                    .unwrap_or(usize::MAX)
            });
        }

        // 7. Project.
        let mut raw_messages: Vec<Message> = Vec::with_capacity(surviving.len());
        let mut generation_configs: Vec<Value> = Vec::new();
        for (e, _) in &surviving {
            let message = self.build_message(&e.latest, e.edited && options.include_edit_annotations)?;
            raw_messages.push(message);
            if let Some(config) = &e.latest.generation_config_json {
                generation_configs.push(config.clone());
            }
        }
        let commit_count = surviving.len();

        // 8. Tail aggregation.
        let aggregated = aggregate_messages(raw_messages);

        // 9. Count.
        let token_count = self.counter.count_messages(&aggregated);
        debug!(
            commit_count,
            token_count,
            messages = aggregated.len(),
            "compiled context"
        );

        Ok(CompiledContext {
            messages: aggregated,
            token_count,
            commit_count,
            token_source: self.counter.source(),
            generation_configs,
        })
    }

    fn fold_edits(&self, rows: &[CommitRow]) -> Vec<Effective> {
        let by_hash: HashMap<&str, &CommitRow> =
            rows.iter().map(|c| (c.commit_hash.as_str(), c)).collect();

        // Resolve each commit to its chain root by following edit_target
        // until an APPEND (or a target missing from the enumerated set,
        // which leaves the EDIT standing alone at its own position).
        let root_of = |row: &CommitRow| -> String {
            let mut current = row;
            let mut hops = 0;
            while current.operation == CommitOperation::Edit {
                let Some(target) = current.edit_target.as_deref() else {
                    break;
                };
                let Some(next) = by_hash.get(target) else {
                    break;
                };
                current = *next;
                hops += 1;
                if hops > rows.len() {
                    break;
                }
            }
            current.commit_hash.clone()
        };

        let mut chains: HashMap<String, Vec<&CommitRow>> = HashMap::new();
        for row in rows {
            chains.entry(root_of(row)).or_default().push(row);
        }

        let mut effectives: Vec<Effective> = Vec::new();
        for row in rows {
            // Emit one slot per chain, at the root's position.
            let Some(members) = chains.get(row.commit_hash.as_str()) else {
                continue;
            };
            let root = row.clone();
            let latest = members
                .iter()
                .max_by(|x, y| {
                    x.created_at
                        .cmp(&y.created_at)
                        .then_with(|| x.commit_hash.cmp(&y.commit_hash))
                })
                .map(|c| (*c).clone())
                .unwrap_or_else(|| root.clone());
            let edited = members.len() > 1;
            effectives.push(Effective {
                root,
                latest,
                edited,
            });
        }
        effectives
    }

    fn build_message(&self, row: &CommitRow, mark_edited: bool) -> Result<Message> {
        let blobs = self.store.blobs();
        let blob = blobs.get(&row.content_hash)?.ok_or_else(|| {
            TractError::CommitNotFound(format!(
                "blob {} for commit {} is missing",
                row.content_hash, row.commit_hash
            ))
        })?;
        let payload: Value = serde_json::from_str(&blob.payload_json)?;
        let content = Content::from_payload(&payload, self.custom_types)?;
        let (role, mut text, name) = content.project();
        if mark_edited {
            text.push_str(" [edited]");
        }
        Ok(Message {
            role,
            content: text,
            name,
        })
    }

    /// Build the message for one commit, for the incremental snapshot path.
    pub fn build_message_for_commit(&self, row: &CommitRow) -> Result<Message> {
        self.build_message(row, false)
    }

    /// Report structural issues in a proposed reorder. Warnings only.
    pub fn check_reorder(&self, order: &[String]) -> Result<Vec<ReorderWarning>> {
        let commits = self.store.commits();
        let order_set: HashSet<&str> = order.iter().map(String::as_str).collect();
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, h)| (h.as_str(), i))
            .collect();

        let mut warnings = Vec::new();
        for hash in order {
            let Some(row) = commits.get(hash)? else {
                continue;
            };
            if let Some(target) = &row.edit_target {
                if row.operation == CommitOperation::Edit {
                    if let Some(&target_pos) = position.get(target.as_str()) {
                        if position[hash.as_str()] < target_pos {
                            warnings.push(ReorderWarning {
                                warning_type: "edit_before_target".to_string(),
                                commit_hash: row.commit_hash.clone(),
                                description: format!(
                                    "EDIT commit {} appears before its target {}",
                                    &row.commit_hash[..8.min(row.commit_hash.len())],
                                    &target[..8.min(target.len())]
                                ),
                                severity: "structural".to_string(),
                            });
                        }
                    }
                }
                if !order_set.contains(target.as_str()) {
                    warnings.push(ReorderWarning {
                        warning_type: "response_chain_break".to_string(),
                        commit_hash: row.commit_hash.clone(),
                        description: format!(
                            "Commit {} references {} which is not in the reordered set",
                            &row.commit_hash[..8.min(row.commit_hash.len())],
                            &target[..8.min(target.len())]
                        ),
                        severity: "semantic".to_string(),
                    });
                }
            }
        }
        Ok(warnings)
    }
}

/// Merge consecutive messages with identical roles, joining content with a
/// blank line.
pub fn aggregate_messages(messages: Vec<Message>) -> Vec<Message> {
    let mut aggregated: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match aggregated.last_mut() {
            Some(last) if last.role == message.role => {
                last.content = format!("{}\n\n{}", last.content, message.content);
            }
            _ => aggregated.push(message),
        }
    }
    aggregated
}
