//! The public entry point: git-like version control for LLM context.
//!
//! A `Tract` owns one store connection, one token counter, an optional LLM
//! client, the compile snapshot, and the hook registry. It is not
//! internally concurrency-safe; each thread opens its own `Tract` against
//! the same DB file.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::compiler::{CompileOptions, CompileSnapshot, Compiler};
use crate::config::{LLMConfig, TractConfig};
use crate::content::{Content, Message, Role};
use crate::engine::{row_to_info, CommitEngine, CommitParams};
use crate::errors::{Result, TractError};
use crate::llm::{extract_reasoning, strip_think_tags, ChatMessage, LlmClient, Resolver};
use crate::models::{
    BranchInfo, CommitInfo, CommitOperation, CompiledContext, CompressResult, DiffResult,
    GCResult, ImportResult, MergeResult, Priority, PriorityAnnotation, RebaseResult,
    ReorderWarning, RetentionCriteria,
};
use crate::ops::compress::{CompressOptions, PendingCompress};
use crate::ops::gc::{GcOptions, PendingGc};
use crate::ops::merge::{MergeOptions, MergePlan, PendingMerge};
use crate::ops::rebase::{PendingImport, PendingRebase};
use crate::ops::{compress as compress_op, gc as gc_op, merge as merge_op, rebase as rebase_op};
use crate::pending::{HookEvent, HookRejection, Hooks, PendingStatus};
use crate::store::{validate_branch_name, ConfigCondition, Store};
use crate::tokens::{EstimateCounter, TokenCounter, TokenUsage};

pub use crate::store::refs::validate_branch_name as validate_branch;

/// How a routed long-running operation ended up.
#[derive(Debug)]
pub enum Outcome<P, R> {
    /// Finalized (auto mode or an approving hook).
    Completed(R),
    /// Returned for review; drive it and call the matching `finalize_*`.
    Pending(P),
    /// A hook handler rejected the plan.
    Rejected(HookRejection),
}

pub type CompressOutcome = Outcome<PendingCompress, CompressResult>;
pub type MergeOutcome = Outcome<PendingMerge, MergeResult>;
pub type RebaseOutcome = Outcome<PendingRebase, RebaseResult>;
pub type GcOutcome = Outcome<PendingGc, GCResult>;
pub type ImportOutcome = Outcome<PendingImport, ImportResult>;

/// Optional fields for `commit_with`.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    pub operation: CommitOperation,
    pub message: Option<String>,
    pub edit_target: Option<String>,
    pub metadata: Option<Value>,
    pub generation_config: Option<Value>,
    pub tags: Vec<String>,
}

/// Options for `chat`.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Config-object override (middle of the resolution chain).
    pub llm_config: Option<LLMConfig>,
    /// Call-site overrides (top of the resolution chain), as a flat map.
    pub call_site: Option<Value>,
}

/// What `chat` returns.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub commit_info: CommitInfo,
    pub generation_config: Value,
    pub reasoning: Option<String>,
    pub reasoning_commit: Option<CommitInfo>,
}

/// How a spawned child inherits from its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InheritanceMode {
    None,
    HeadSnapshot,
    FullClone,
}

impl InheritanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InheritanceMode::None => "none",
            InheritanceMode::HeadSnapshot => "head_snapshot",
            InheritanceMode::FullClone => "full_clone",
        }
    }
}

/// Primary entry point.
pub struct Tract {
    store: Store,
    tract_id: String,
    config: TractConfig,
    counter: Arc<dyn TokenCounter>,
    client: Option<Arc<dyn LlmClient>>,
    custom_types: HashSet<String>,
    snapshot: Option<CompileSnapshot>,
    hooks: Hooks,
    in_batch: bool,
}

impl Tract {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Open (or create) a tract repository. `":memory:"` for in-memory.
    pub fn open(path: &str) -> Result<Self> {
        let config = TractConfig {
            db_path: path.to_string(),
            ..Default::default()
        };
        Self::open_with(config, None, None, None)
    }

    /// Open with full control over config, identity, tokenizer, and client.
    pub fn open_with(
        config: TractConfig,
        tract_id: Option<String>,
        tokenizer: Option<Arc<dyn TokenCounter>>,
        client: Option<Arc<dyn LlmClient>>,
    ) -> Result<Self> {
        let store = Store::open(&config.db_path)?;
        let tract_id = tract_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let counter = tokenizer.unwrap_or_else(|| Arc::new(EstimateCounter));
        store.annotations().seed_registry(&tract_id)?;
        debug!(tract = %tract_id, db = %config.db_path, "opened tract");
        Ok(Self {
            store,
            tract_id,
            config,
            counter,
            client,
            custom_types: HashSet::new(),
            snapshot: None,
            hooks: Hooks::default(),
            in_batch: false,
        })
    }

    /// Attach an LLM client after opening.
    pub fn configure_llm(&mut self, client: Arc<dyn LlmClient>) {
        self.client = Some(client);
    }

    /// Allow a custom `content_type` discriminator on this tract.
    pub fn register_content_type(&mut self, name: impl Into<String>) {
        self.custom_types.insert(name.into());
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn tract_id(&self) -> &str {
        &self.tract_id
    }

    pub fn config(&self) -> &TractConfig {
        &self.config
    }

    /// Current HEAD commit hash, or None before the first commit.
    pub fn head(&self) -> Result<Option<String>> {
        self.store.refs().head(&self.tract_id)
    }

    pub fn current_branch(&self) -> Result<Option<String>> {
        self.store.refs().current_branch(&self.tract_id)
    }

    pub fn is_detached(&self) -> Result<bool> {
        self.store.refs().is_detached(&self.tract_id)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ------------------------------------------------------------------
    // Commit / compile
    // ------------------------------------------------------------------

    pub fn commit(&mut self, content: Content) -> Result<CommitInfo> {
        self.commit_with(content, CommitOptions::default())
    }

    pub fn commit_with(&mut self, content: Content, options: CommitOptions) -> Result<CommitInfo> {
        if let Content::Custom { type_name, .. } = &content {
            if !self.custom_types.contains(type_name) {
                return Err(TractError::ContentValidation(format!(
                    "Unknown content type `{type_name}`. Register it with register_content_type()."
                )));
            }
        }
        let info = self.store.with_tx(|| {
            let engine = CommitEngine::new(
                &self.store,
                self.counter.as_ref(),
                &self.tract_id,
                self.config.strict_tags,
            );
            engine.create_commit(
                &content,
                CommitParams {
                    operation: options.operation,
                    message: options.message.clone(),
                    edit_target: options.edit_target.clone(),
                    metadata: options.metadata.clone(),
                    generation_config: options.generation_config.clone(),
                    tags: options.tags.clone(),
                    created_at: None,
                },
            )
        })?;

        // Snapshot: extend in place for a pure APPEND, invalidate otherwise.
        if options.operation == CommitOperation::Append && self.snapshot.is_some() {
            self.extend_snapshot(&info)?;
        } else {
            self.snapshot = None;
        }
        Ok(info)
    }

    fn extend_snapshot(&mut self, info: &CommitInfo) -> Result<()> {
        let Some(row) = self.store.commits().get(&info.commit_hash)? else {
            self.snapshot = None;
            return Ok(());
        };
        // Reasoning commits are filtered from the default compile; the
        // cache just follows HEAD past them.
        if row.content_type == "reasoning" {
            if let Some(snapshot) = self.snapshot.as_mut() {
                snapshot.head_hash = info.commit_hash.clone();
            }
            return Ok(());
        }
        let compiler = Compiler::new(&self.store, self.counter.as_ref(), &self.custom_types);
        let message = match compiler.build_message_for_commit(&row) {
            Ok(m) => m,
            Err(_) => {
                self.snapshot = None;
                return Ok(());
            }
        };
        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.extend_for_append(
                &info.commit_hash,
                message,
                row.generation_config_json.clone(),
                self.counter.as_ref(),
            );
        }
        Ok(())
    }

    pub fn compile(&mut self) -> Result<CompiledContext> {
        self.compile_with(CompileOptions::default())
    }

    pub fn compile_with(&mut self, options: CompileOptions) -> Result<CompiledContext> {
        let Some(head) = self.head()? else {
            return Ok(CompiledContext::default());
        };
        let compiler = Compiler::new(&self.store, self.counter.as_ref(), &self.custom_types);

        // Time travel, reorder, and flag variations bypass the snapshot.
        let bypass = options.at_time.is_some()
            || options.at_commit.is_some()
            || options.include_reasoning
            || options.include_edit_annotations
            || options.order.is_some();
        if bypass {
            let result = compiler.compile(&self.tract_id, &head, &options)?;
            self.warn_over_budget(&result);
            return Ok(result);
        }

        if let Some(snapshot) = &self.snapshot {
            if snapshot.head_hash == head {
                return Ok(snapshot.to_compiled());
            }
        }
        let result = compiler.compile(&self.tract_id, &head, &options)?;
        self.snapshot = Some(CompileSnapshot::from_compiled(&head, &result));
        self.warn_over_budget(&result);
        Ok(result)
    }

    fn warn_over_budget(&self, compiled: &CompiledContext) {
        if let Some(budget) = self.config.max_tokens {
            if compiled.token_count > budget {
                tracing::warn!(
                    token_count = compiled.token_count,
                    budget,
                    "compiled context exceeds the configured token budget"
                );
            }
        }
    }

    /// Report structural issues in a proposed compile `order`.
    pub fn check_reorder(&self, order: &[String]) -> Result<Vec<ReorderWarning>> {
        let compiler = Compiler::new(&self.store, self.counter.as_ref(), &self.custom_types);
        compiler.check_reorder(order)
    }

    /// Record API-reported token usage against the cached compilation.
    pub fn record_usage(
        &mut self,
        usage: TokenUsage,
        head_hash: Option<&str>,
    ) -> Result<CompiledContext> {
        let current = self.head()?;
        let target = match head_hash {
            Some(h) => {
                if current.as_deref() != Some(h) {
                    return Err(TractError::InvalidState(format!(
                        "cannot record usage: head_hash {h} does not match current HEAD"
                    )));
                }
                h.to_string()
            }
            None => current.ok_or_else(|| {
                TractError::InvalidState("cannot record usage: no commits exist".to_string())
            })?,
        };

        if self
            .snapshot
            .as_ref()
            .is_none_or(|s| s.head_hash != target)
        {
            self.compile()?;
        }
        if let Some(snapshot) = self.snapshot.as_mut() {
            if snapshot.head_hash == target {
                snapshot.token_count = usage.prompt_tokens;
                snapshot.token_source = usage.source();
                return Ok(snapshot.to_compiled());
            }
        }
        Ok(CompiledContext {
            token_count: usage.prompt_tokens,
            token_source: usage.source(),
            ..Default::default()
        })
    }

    /// Parse a provider usage object and record it.
    pub fn record_usage_value(&mut self, usage: &Value) -> Result<CompiledContext> {
        self.record_usage(TokenUsage::from_value(usage)?, None)
    }

    /// Run several mutations in one deferred transaction. Rolls back on
    /// error.
    pub fn batch<T>(&mut self, f: impl FnOnce(&mut Tract) -> Result<T>) -> Result<T> {
        // Re-entrant batches join the outer one.
        if self.in_batch {
            return f(self);
        }
        self.snapshot = None;
        self.store.begin_batch()?;
        self.in_batch = true;
        let result = f(self);
        self.in_batch = false;
        match result {
            Ok(value) => {
                self.store.end_batch(true)?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.store.end_batch(false);
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn get_commit(&self, commit_hash: &str) -> Result<Option<CommitInfo>> {
        Ok(self
            .store
            .commits()
            .get(commit_hash)?
            .as_ref()
            .map(row_to_info))
    }

    /// Resolve a hash prefix (>= 4 chars) within this tract.
    pub fn resolve_prefix(&self, prefix: &str) -> Result<Option<CommitInfo>> {
        Ok(self
            .store
            .commits()
            .get_by_prefix(prefix, Some(&self.tract_id))?
            .as_ref()
            .map(row_to_info))
    }

    /// Walk history from HEAD backward, newest first.
    pub fn log(&self, limit: usize) -> Result<Vec<CommitInfo>> {
        let Some(head) = self.head()? else {
            return Ok(Vec::new());
        };
        Ok(self
            .store
            .commits()
            .get_ancestors(&head, Some(limit), None)?
            .iter()
            .map(row_to_info)
            .collect())
    }

    /// Query commits by generation-config values.
    pub fn query_by_config(
        &self,
        field: &str,
        operator: &str,
        value: Value,
    ) -> Result<Vec<CommitInfo>> {
        self.query_by_config_multi(&[ConfigCondition::new(field, operator, value)])
    }

    pub fn query_by_config_multi(
        &self,
        conditions: &[ConfigCondition],
    ) -> Result<Vec<CommitInfo>> {
        Ok(self
            .store
            .commits()
            .get_by_config(&self.tract_id, conditions)?
            .iter()
            .map(row_to_info)
            .collect())
    }

    // ------------------------------------------------------------------
    // Annotations and tags
    // ------------------------------------------------------------------

    pub fn annotate(&mut self, target: &str, priority: Priority) -> Result<PriorityAnnotation> {
        self.annotate_with(target, priority, None, None)
    }

    pub fn annotate_with(
        &mut self,
        target: &str,
        priority: Priority,
        reason: Option<&str>,
        retention: Option<RetentionCriteria>,
    ) -> Result<PriorityAnnotation> {
        if self.store.commits().get(target)?.is_none() {
            return Err(TractError::CommitNotFound(target.to_string()));
        }
        let annotation = self.store.with_tx(|| {
            self.store.annotations().save(
                &self.tract_id,
                target,
                priority,
                retention.as_ref(),
                reason,
            )
        })?;
        self.snapshot = None;
        Ok(annotation)
    }

    pub fn annotation_history(&self, target: &str) -> Result<Vec<PriorityAnnotation>> {
        self.store.annotations().history(target)
    }

    /// Add a mutable tag to a commit.
    pub fn tag(&mut self, target: &str, name: &str) -> Result<()> {
        if self.store.commits().get(target)?.is_none() {
            return Err(TractError::CommitNotFound(target.to_string()));
        }
        let annotations = self.store.annotations();
        if !annotations.is_registered(&self.tract_id, name)? {
            if self.config.strict_tags {
                return Err(TractError::TagNotRegistered(name.to_string()));
            }
            annotations.register_tag(&self.tract_id, name, None, true)?;
        }
        self.store
            .with_tx(|| annotations.save_tag_event(&self.tract_id, target, name, false))
    }

    /// Record an untag event for a mutable tag.
    pub fn untag(&mut self, target: &str, name: &str) -> Result<()> {
        self.store
            .with_tx(|| {
                self.store
                    .annotations()
                    .save_tag_event(&self.tract_id, target, name, true)
            })
    }

    /// Union of immutable commit-time tags and active mutable tags.
    pub fn get_tags(&self, target: &str) -> Result<Vec<String>> {
        let row = self
            .store
            .commits()
            .get(target)?
            .ok_or_else(|| TractError::CommitNotFound(target.to_string()))?;
        let mut tags = row.tags_json;
        for tag in self.store.annotations().active_tags(target)? {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        Ok(tags)
    }

    pub fn register_tag(&mut self, name: &str, description: Option<&str>) -> Result<()> {
        self.store
            .annotations()
            .register_tag(&self.tract_id, name, description, false)
    }

    /// Commits currently carrying a tag, from either source.
    pub fn find_by_tag(&self, name: &str) -> Result<Vec<CommitInfo>> {
        let mutable = self
            .store
            .annotations()
            .targets_with_tag(&self.tract_id, name)?;
        let mut out: Vec<CommitInfo> = Vec::new();
        for row in self.store.commits().get_all(&self.tract_id)? {
            if row.tags_json.iter().any(|t| t == name) || mutable.contains(&row.commit_hash) {
                out.push(row_to_info(&row));
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Branches
    // ------------------------------------------------------------------

    /// Create a branch at HEAD (or at `source`), optionally switching to
    /// it.
    pub fn create_branch(
        &mut self,
        name: &str,
        source: Option<&str>,
        switch: bool,
    ) -> Result<BranchInfo> {
        validate_branch_name(name)?;
        let refs = self.store.refs();
        if refs.branch(&self.tract_id, name)?.is_some() {
            return Err(TractError::BranchExists(name.to_string()));
        }
        let target = match source {
            Some(prefix) => {
                let info = self
                    .resolve_prefix(prefix)?
                    .ok_or_else(|| TractError::CommitNotFound(prefix.to_string()))?;
                info.commit_hash
            }
            None => self.head()?.ok_or_else(|| {
                TractError::InvalidState("cannot create a branch before the first commit".into())
            })?,
        };
        self.store.with_tx(|| {
            refs.set_branch(&self.tract_id, name, &target)?;
            if switch {
                refs.attach_head(&self.tract_id, name)?;
            }
            Ok(())
        })?;
        if switch {
            self.snapshot = None;
        }
        Ok(BranchInfo {
            name: name.to_string(),
            commit_hash: target,
            is_current: switch,
        })
    }

    /// Attach HEAD to an existing branch.
    pub fn switch(&mut self, name: &str) -> Result<()> {
        let refs = self.store.refs();
        if refs.branch(&self.tract_id, name)?.is_none() {
            return Err(TractError::BranchNotFound(name.to_string()));
        }
        self.store
            .with_tx(|| refs.attach_head(&self.tract_id, name))?;
        self.snapshot = None;
        Ok(())
    }

    /// Detach HEAD at a commit (accepts a >= 4 char prefix).
    pub fn checkout_commit(&mut self, prefix: &str) -> Result<CommitInfo> {
        let info = self
            .resolve_prefix(prefix)?
            .ok_or_else(|| TractError::CommitNotFound(prefix.to_string()))?;
        self.store
            .with_tx(|| self.store.refs().detach_head(&self.tract_id, &info.commit_hash))?;
        self.snapshot = None;
        Ok(info)
    }

    pub fn list_branches(&self) -> Result<Vec<BranchInfo>> {
        let refs = self.store.refs();
        let current = refs.current_branch(&self.tract_id)?;
        let mut out = Vec::new();
        for name in refs.list_branches(&self.tract_id)? {
            if let Some(hash) = refs.branch(&self.tract_id, &name)? {
                out.push(BranchInfo {
                    is_current: current.as_deref() == Some(name.as_str()),
                    name,
                    commit_hash: hash,
                });
            }
        }
        Ok(out)
    }

    /// Delete a branch. Rejected for the current branch; rejected for
    /// unmerged branches unless `force`.
    pub fn delete_branch(&mut self, name: &str, force: bool) -> Result<()> {
        let refs = self.store.refs();
        let commits = self.store.commits();
        let tip = refs
            .branch(&self.tract_id, name)?
            .ok_or_else(|| TractError::BranchNotFound(name.to_string()))?;
        if refs.current_branch(&self.tract_id)?.as_deref() == Some(name) {
            return Err(TractError::InvalidState(format!(
                "cannot delete the current branch `{name}`"
            )));
        }
        if !force {
            // Unmerged: commits on this branch unreachable from any other
            // branch.
            let mut reachable: HashSet<String> = HashSet::new();
            for other in refs.list_branches(&self.tract_id)? {
                if other == name {
                    continue;
                }
                if let Some(other_tip) = refs.branch(&self.tract_id, &other)? {
                    reachable.extend(crate::dag::all_ancestors(&commits, &other_tip)?);
                }
            }
            let branch_commits = crate::dag::all_ancestors(&commits, &tip)?;
            if branch_commits.difference(&reachable).next().is_some() {
                return Err(TractError::UnmergedBranch(name.to_string()));
            }
        }
        self.store
            .with_tx(|| refs.delete_branch(&self.tract_id, name))
    }

    /// Commits unique to each side of HEAD vs another branch.
    pub fn diff(&self, other_branch: &str) -> Result<DiffResult> {
        let commits = self.store.commits();
        let head = self
            .head()?
            .ok_or_else(|| TractError::InvalidState("no commits to diff".into()))?;
        let other = self
            .store
            .refs()
            .branch(&self.tract_id, other_branch)?
            .ok_or_else(|| TractError::BranchNotFound(other_branch.to_string()))?;
        Ok(DiffResult {
            merge_base: crate::dag::find_merge_base(&commits, &head, &other)?,
            only_ours: crate::dag::branch_commits(&commits, &head, &other)?
                .iter()
                .map(row_to_info)
                .collect(),
            only_theirs: crate::dag::branch_commits(&commits, &other, &head)?
                .iter()
                .map(row_to_info)
                .collect(),
        })
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    pub fn on_compress(
        &mut self,
        handler: impl FnMut(&mut PendingCompress) + Send + 'static,
    ) {
        self.hooks.compress = Some(Box::new(handler));
    }

    pub fn on_merge(&mut self, handler: impl FnMut(&mut PendingMerge) + Send + 'static) {
        self.hooks.merge = Some(Box::new(handler));
    }

    pub fn on_rebase(&mut self, handler: impl FnMut(&mut PendingRebase) + Send + 'static) {
        self.hooks.rebase = Some(Box::new(handler));
    }

    pub fn on_gc(&mut self, handler: impl FnMut(&mut PendingGc) + Send + 'static) {
        self.hooks.gc = Some(Box::new(handler));
    }

    pub fn on_import(&mut self, handler: impl FnMut(&mut PendingImport) + Send + 'static) {
        self.hooks.import = Some(Box::new(handler));
    }

    pub fn off(&mut self, event: HookEvent) {
        self.hooks.off(event);
    }

    fn hook_rejection<P: crate::pending::PendingOperation>(pending: &P, reason: Option<String>) -> HookRejection {
        HookRejection {
            reason: reason.unwrap_or_else(|| "rejected by hook".to_string()),
            rejection_source: "hook".to_string(),
            metadata: json!({"operation": pending.operation_name()}),
        }
    }

    // ------------------------------------------------------------------
    // Compression
    // ------------------------------------------------------------------

    /// Plan and route a compression.
    pub fn compress(&mut self, mut options: CompressOptions) -> Result<CompressOutcome> {
        // Resolve the LLM parameter chain for the summarizer calls.
        let call_site = options
            .llm_params
            .as_ref()
            .map(LLMConfig::from_value);
        let resolved = self
            .config
            .resolve_llm("compress", None, call_site.as_ref());
        if !resolved.is_empty() {
            options.llm_params = Some(resolved.to_value());
            if options.content.is_none() && self.client.is_none() {
                return Err(TractError::LlmConfig(
                    "LLM parameters were supplied but no client is configured and no \
                     manual content was given"
                        .to_string(),
                ));
            }
        }
        let review = options.review;
        let mut pending = compress_op::plan(
            &self.store,
            self.counter.clone(),
            self.client.clone(),
            &self.tract_id,
            &self.custom_types,
            options,
        )?;

        if review {
            return Ok(Outcome::Pending(pending));
        }
        if let Some(mut handler) = self.hooks.compress.take() {
            handler(&mut pending);
            self.hooks.compress = Some(handler);
            return match pending.status() {
                PendingStatus::Approved => {
                    Ok(Outcome::Completed(self.finalize_compress(&mut pending)?))
                }
                PendingStatus::Rejected => Ok(Outcome::Rejected(Self::hook_rejection(
                    &pending,
                    pending.state.reject_reason.clone(),
                ))),
                _ => Err(TractError::InvalidState(
                    "compress hook must approve or reject the pending operation".to_string(),
                )),
            };
        }
        pending.approve()?;
        Ok(Outcome::Completed(self.finalize_compress(&mut pending)?))
    }

    /// Finalize an approved compression (TOCTOU-guarded).
    pub fn finalize_compress(&mut self, pending: &mut PendingCompress) -> Result<CompressResult> {
        let result = compress_op::finalize(
            &self.store,
            self.counter.as_ref(),
            &self.tract_id,
            self.config.strict_tags,
            &self.custom_types,
            pending,
        )?;
        self.snapshot = None;
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Merge / rebase / import
    // ------------------------------------------------------------------

    /// Merge `source_branch` into the current branch.
    pub fn merge(
        &mut self,
        source_branch: &str,
        resolver: Option<Resolver>,
        options: MergeOptions,
    ) -> Result<MergeOutcome> {
        let mut merged_options = options;
        if merged_options.llm_params.is_none() {
            let resolved = self.config.resolve_llm("merge", None, None);
            if !resolved.is_empty() {
                merged_options.llm_params = Some(resolved.to_value());
            }
        }
        let review = merged_options.review;
        let plan = merge_op::plan(
            &self.store,
            self.client.clone(),
            &self.tract_id,
            &self.custom_types,
            source_branch,
            resolver,
            &merged_options,
        )?;

        let mut pending = match plan {
            MergePlan::AlreadyMerged => {
                let head = self.head()?.unwrap_or_default();
                return Ok(Outcome::Completed(MergeResult {
                    merge_commit: None,
                    fast_forward: false,
                    already_merged: true,
                    conflicts_resolved: 0,
                    new_head: head,
                }));
            }
            MergePlan::FastForward { source_tip } => {
                self.store
                    .with_tx(|| self.store.refs().update_head(&self.tract_id, &source_tip))?;
                self.snapshot = None;
                return Ok(Outcome::Completed(MergeResult {
                    merge_commit: None,
                    fast_forward: true,
                    already_merged: false,
                    conflicts_resolved: 0,
                    new_head: source_tip,
                }));
            }
            MergePlan::ThreeWay(pending) => pending,
        };

        if review {
            return Ok(Outcome::Pending(*pending));
        }
        if let Some(mut handler) = self.hooks.merge.take() {
            handler(&mut pending);
            self.hooks.merge = Some(handler);
            return match pending.status() {
                PendingStatus::Approved => {
                    Ok(Outcome::Completed(self.finalize_merge(&mut pending)?))
                }
                PendingStatus::Rejected => Ok(Outcome::Rejected(Self::hook_rejection(
                    pending.as_ref(),
                    pending.state.reject_reason.clone(),
                ))),
                _ => Err(TractError::InvalidState(
                    "merge hook must approve or reject the pending operation".to_string(),
                )),
            };
        }
        pending.approve()?;
        Ok(Outcome::Completed(self.finalize_merge(&mut pending)?))
    }

    pub fn finalize_merge(&mut self, pending: &mut PendingMerge) -> Result<MergeResult> {
        let result = merge_op::finalize(
            &self.store,
            self.counter.as_ref(),
            &self.tract_id,
            self.config.strict_tags,
            &self.custom_types,
            pending,
        )?;
        self.snapshot = None;
        Ok(result)
    }

    /// Rebase the current branch onto `target_branch`.
    pub fn rebase(
        &mut self,
        target_branch: &str,
        resolver: Option<Resolver>,
        review: bool,
    ) -> Result<RebaseOutcome> {
        let plan = rebase_op::plan(&self.store, &self.tract_id, target_branch, resolver, None)?;
        let Some(mut pending) = plan else {
            let head = self.head()?.unwrap_or_default();
            return Ok(Outcome::Completed(RebaseResult {
                new_head: head,
                ..Default::default()
            }));
        };

        if review {
            return Ok(Outcome::Pending(pending));
        }
        if let Some(mut handler) = self.hooks.rebase.take() {
            handler(&mut pending);
            self.hooks.rebase = Some(handler);
            return match pending.status() {
                PendingStatus::Approved => {
                    Ok(Outcome::Completed(self.finalize_rebase(&mut pending)?))
                }
                PendingStatus::Rejected => Ok(Outcome::Rejected(Self::hook_rejection(
                    &pending,
                    pending.state.reject_reason.clone(),
                ))),
                _ => Err(TractError::InvalidState(
                    "rebase hook must approve or reject the pending operation".to_string(),
                )),
            };
        }
        pending.approve()?;
        Ok(Outcome::Completed(self.finalize_rebase(&mut pending)?))
    }

    pub fn finalize_rebase(&mut self, pending: &mut PendingRebase) -> Result<RebaseResult> {
        let result = rebase_op::finalize(
            &self.store,
            self.counter.as_ref(),
            &self.tract_id,
            self.config.strict_tags,
            &self.custom_types,
            pending,
        )?;
        self.snapshot = None;
        Ok(result)
    }

    /// Import (cherry-pick) a commit onto the current HEAD.
    pub fn import_commit(
        &mut self,
        commit_hash: &str,
        resolver: Option<Resolver>,
        review: bool,
    ) -> Result<ImportOutcome> {
        let mut pending =
            rebase_op::plan_import(&self.store, &self.tract_id, commit_hash, resolver, None)?;

        if review {
            return Ok(Outcome::Pending(pending));
        }
        if let Some(mut handler) = self.hooks.import.take() {
            handler(&mut pending);
            self.hooks.import = Some(handler);
            return match pending.status() {
                PendingStatus::Approved => {
                    Ok(Outcome::Completed(self.finalize_import(&mut pending)?))
                }
                PendingStatus::Rejected => Ok(Outcome::Rejected(Self::hook_rejection(
                    &pending,
                    pending.state.reject_reason.clone(),
                ))),
                _ => Err(TractError::InvalidState(
                    "import hook must approve or reject the pending operation".to_string(),
                )),
            };
        }
        pending.approve()?;
        Ok(Outcome::Completed(self.finalize_import(&mut pending)?))
    }

    pub fn finalize_import(&mut self, pending: &mut PendingImport) -> Result<ImportResult> {
        let result = rebase_op::finalize_import(
            &self.store,
            self.counter.as_ref(),
            &self.tract_id,
            self.config.strict_tags,
            &self.custom_types,
            pending,
        )?;
        self.snapshot = None;
        Ok(result)
    }

    // ------------------------------------------------------------------
    // GC
    // ------------------------------------------------------------------

    pub fn gc(&mut self, options: GcOptions) -> Result<GcOutcome> {
        let review = options.review;
        let mut pending = gc_op::plan(
            &self.store,
            &self.tract_id,
            self.config.orphan_retention_days,
            &options,
        )?;

        if review {
            return Ok(Outcome::Pending(pending));
        }
        if let Some(mut handler) = self.hooks.gc.take() {
            handler(&mut pending);
            self.hooks.gc = Some(handler);
            return match pending.status() {
                PendingStatus::Approved => Ok(Outcome::Completed(self.finalize_gc(&mut pending)?)),
                PendingStatus::Rejected => Ok(Outcome::Rejected(Self::hook_rejection(
                    &pending,
                    pending.state.reject_reason.clone(),
                ))),
                _ => Err(TractError::InvalidState(
                    "gc hook must approve or reject the pending operation".to_string(),
                )),
            };
        }
        pending.approve()?;
        Ok(Outcome::Completed(self.finalize_gc(&mut pending)?))
    }

    pub fn finalize_gc(&mut self, pending: &mut PendingGc) -> Result<GCResult> {
        let result = gc_op::finalize(&self.store, &self.tract_id, pending)?;
        self.snapshot = None;
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------

    /// Compile the context, call the configured client, and commit the
    /// assistant's reply (optionally preceded by a Reasoning commit).
    pub fn chat(&mut self, options: ChatOptions) -> Result<ChatResponse> {
        let client = self.client.clone().ok_or_else(|| {
            TractError::LlmConfig("chat requires a configured LLM client".to_string())
        })?;
        let compiled = self.compile()?;
        let call_site = options.call_site.as_ref().map(LLMConfig::from_value);
        let resolved = self
            .config
            .resolve_llm("chat", options.llm_config.as_ref(), call_site.as_ref());
        let params = resolved.to_value();

        let messages: Vec<ChatMessage> = compiled.messages.iter().map(ChatMessage::from).collect();
        let completion = client.chat(&messages, &params)?;
        let mut text = completion.content()?;
        let reasoning = extract_reasoning(&completion);
        if reasoning
            .as_ref()
            .is_some_and(|(_, f)| *f == crate::content::ReasoningFormat::ThinkTags)
        {
            text = strip_think_tags(&text);
        }

        let mut reasoning_commit = None;
        if self.config.commit_reasoning {
            if let Some((reasoning_text, format)) = &reasoning {
                reasoning_commit = Some(self.commit_with(
                    Content::Reasoning {
                        text: reasoning_text.clone(),
                        format: *format,
                    },
                    CommitOptions::default(),
                )?);
            }
        }

        let tool_calls = completion.tool_calls().and_then(|v| {
            serde_json::from_value::<Vec<crate::content::ToolCall>>(v.clone()).ok()
        });
        let commit_info = self.commit_with(
            Content::Dialogue {
                role: Role::Assistant,
                text: text.clone(),
                tool_call_id: None,
                tool_calls,
            },
            CommitOptions {
                generation_config: Some(params.clone()),
                ..Default::default()
            },
        )?;

        let usage = completion.usage();
        if let Some(usage) = usage {
            let _ = self.record_usage(usage, None);
        }

        Ok(ChatResponse {
            text,
            usage,
            commit_info,
            generation_config: params,
            reasoning: reasoning.map(|(t, _)| t),
            reasoning_commit,
        })
    }

    // ------------------------------------------------------------------
    // Spawn
    // ------------------------------------------------------------------

    /// Spawn a child tract in the same DB and return its id.
    ///
    /// Inheritance: `None` starts empty; `HeadSnapshot` re-commits the
    /// parent's compiled messages into the child; `FullClone` re-creates
    /// the parent's whole DAG and branch refs under the child id.
    pub fn spawn(
        &mut self,
        purpose: &str,
        inheritance: InheritanceMode,
        display_name: Option<&str>,
    ) -> Result<String> {
        let child_id = Uuid::new_v4().simple().to_string();
        let head = self.head()?;
        let compiled = match inheritance {
            InheritanceMode::HeadSnapshot => Some(self.compile()?),
            _ => None,
        };

        self.store.with_tx(|| {
            self.store.spawns().save(
                &self.tract_id,
                head.as_deref(),
                &child_id,
                purpose,
                inheritance.as_str(),
                display_name,
            )?;
            self.store.annotations().seed_registry(&child_id)?;

            match inheritance {
                InheritanceMode::None => {}
                InheritanceMode::HeadSnapshot => {
                    let engine = CommitEngine::new(
                        &self.store,
                        self.counter.as_ref(),
                        &child_id,
                        self.config.strict_tags,
                    );
                    for message in &compiled.as_ref().expect("compiled above").messages {
                        let content = snapshot_content(message);
                        engine.create_commit(&content, CommitParams::default())?;
                    }
                }
                InheritanceMode::FullClone => {
                    self.clone_into(&child_id)?;
                }
            }
            Ok(())
        })?;
        Ok(child_id)
    }

    /// Re-create every commit of this tract under `child_id`, remapping
    /// parent pointers, branch refs, and priority annotations.
    fn clone_into(&self, child_id: &str) -> Result<()> {
        use std::collections::HashMap;
        let commits = self.store.commits();
        let refs = self.store.refs();

        let rows = commits.get_all(&self.tract_id)?;
        let mut mapping: HashMap<String, String> = HashMap::new();
        for row in &rows {
            let parent = row
                .parent_hash
                .as_ref()
                .and_then(|p| mapping.get(p))
                .cloned();
            let edit_target = row
                .edit_target
                .as_ref()
                .and_then(|t| mapping.get(t))
                .cloned();
            let new_hash = crate::engine::compute_commit_hash(
                child_id,
                parent.as_deref(),
                &row.content_hash,
                row.operation,
                edit_target.as_deref(),
                row.metadata_json.as_ref(),
                row.generation_config_json.as_ref(),
                &row.created_at,
            );
            let mut clone = row.clone();
            clone.commit_hash = new_hash.clone();
            clone.tract_id = child_id.to_string();
            clone.parent_hash = parent;
            clone.edit_target = edit_target;
            commits.save(&clone)?;

            let merge_parents = commits.get_parents(&row.commit_hash)?;
            if !merge_parents.is_empty() {
                let remapped: Vec<String> = merge_parents
                    .iter()
                    .map(|p| mapping.get(p).cloned().unwrap_or_else(|| p.clone()))
                    .collect();
                commits.add_parents(&new_hash, &remapped)?;
            }
            mapping.insert(row.commit_hash.clone(), new_hash);
        }

        for name in refs.list_branches(&self.tract_id)? {
            if let Some(tip) = refs.branch(&self.tract_id, &name)? {
                if let Some(mapped) = mapping.get(&tip) {
                    refs.set_branch(child_id, &name, mapped)?;
                }
            }
        }
        if let Some(branch) = refs.current_branch(&self.tract_id)? {
            refs.attach_head(child_id, &branch)?;
        } else if let Some(head) = refs.head(&self.tract_id)? {
            if let Some(mapped) = mapping.get(&head) {
                refs.detach_head(child_id, mapped)?;
            }
        }

        let annotations = self.store.annotations();
        for row in &rows {
            for annotation in annotations.history(&row.commit_hash)? {
                if annotation.tract_id != self.tract_id {
                    continue;
                }
                if let Some(mapped) = mapping.get(&annotation.target_hash) {
                    annotations.save(
                        child_id,
                        mapped,
                        annotation.priority,
                        annotation.retention.as_ref(),
                        annotation.reason.as_deref(),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Spawn pointers involving this tract.
    pub fn spawned_children(&self) -> Result<Vec<crate::store::SpawnPointerRow>> {
        self.store.spawns().children_of(&self.tract_id)
    }

    /// Close the tract, dropping the connection.
    pub fn close(self) {}
}

/// Rebuild content for a head-snapshot inherited message.
fn snapshot_content(message: &Message) -> Content {
    match message.role {
        Role::System => Content::instruction(message.content.clone()),
        Role::Tool => Content::ToolResult {
            call_id: "inherited".to_string(),
            name: message.name.clone().unwrap_or_else(|| "tool".to_string()),
            output: message.content.clone(),
        },
        role => Content::dialogue(role, message.content.clone()),
    }
}

/// Compile any tract in a store at a point in time (cross-tract helper).
pub(crate) fn compile_tract_at(
    store: &Store,
    counter: &dyn TokenCounter,
    tract_id: &str,
    at_time: Option<DateTime<Utc>>,
    at_commit: Option<String>,
) -> Result<CompiledContext> {
    let Some(head) = store.refs().head(tract_id)? else {
        return Ok(CompiledContext::default());
    };
    let custom_types = HashSet::new();
    let compiler = Compiler::new(store, counter, &custom_types);
    compiler.compile(
        tract_id,
        &head,
        &CompileOptions {
            at_time,
            at_commit,
            ..Default::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatCompletion;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted client: pops queued replies, then repeats the fallback.
    struct MockLlm {
        replies: Mutex<VecDeque<String>>,
        fallback: String,
        calls: Mutex<usize>,
    }

    impl MockLlm {
        fn always(text: &str) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(VecDeque::new()),
                fallback: text.to_string(),
                calls: Mutex::new(0),
            })
        }

        fn scripted(replies: &[&str], fallback: &str) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
                fallback: fallback.to_string(),
                calls: Mutex::new(0),
            })
        }

        fn call_count(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl LlmClient for MockLlm {
        fn chat(&self, _messages: &[ChatMessage], _params: &Value) -> Result<ChatCompletion> {
            *self.calls.lock().unwrap() += 1;
            let text = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            Ok(ChatCompletion::new(json!({
                "choices": [{"message": {"content": text}}],
                "usage": {"prompt_tokens": 100, "completion_tokens": 20, "total_tokens": 120},
                "model": "mock",
            })))
        }
    }

    fn open_tract() -> Tract {
        Tract::open(":memory:").unwrap()
    }

    fn user(text: &str) -> Content {
        Content::dialogue(Role::User, text)
    }

    fn assistant(text: &str) -> Content {
        Content::dialogue(Role::Assistant, text)
    }

    // --- End-to-end scenario 1: linear chain compile -------------------

    #[test]
    fn linear_chain_compiles_in_order() {
        let mut t = open_tract();
        t.commit(Content::instruction("You are helpful.")).unwrap();
        t.commit(user("hi")).unwrap();
        t.commit(assistant("hello")).unwrap();

        let compiled = t.compile().unwrap();
        assert_eq!(compiled.commit_count, 3);
        let pairs: Vec<(Role, &str)> = compiled
            .messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (Role::System, "You are helpful."),
                (Role::User, "hi"),
                (Role::Assistant, "hello"),
            ]
        );
        assert!(compiled.token_count > 0);
    }

    // --- Scenario 2: tail aggregation ----------------------------------

    #[test]
    fn adjacent_same_role_commits_aggregate() {
        let mut t = open_tract();
        t.commit(user("a")).unwrap();
        t.commit(user("b")).unwrap();

        let compiled = t.compile().unwrap();
        assert_eq!(compiled.messages.len(), 1);
        assert_eq!(compiled.messages[0].role, Role::User);
        assert_eq!(compiled.messages[0].content, "a\n\nb");
        assert_eq!(compiled.commit_count, 2);
    }

    #[test]
    fn snapshot_extends_across_appends_and_matches_full_compile() {
        let mut t = open_tract();
        t.commit(user("a")).unwrap();
        let first = t.compile().unwrap();
        assert_eq!(first.messages.len(), 1);

        // Incremental path.
        t.commit(user("b")).unwrap();
        t.commit(assistant("c")).unwrap();
        let incremental = t.compile().unwrap();

        // Fresh tract state compiles to the same thing.
        t.snapshot = None;
        let full = t.compile().unwrap();
        assert_eq!(incremental.messages, full.messages);
        assert_eq!(incremental.commit_count, full.commit_count);
    }

    // --- Scenario 3: edit fold -----------------------------------------

    #[test]
    fn edit_folds_to_latest_at_original_position() {
        let mut t = open_tract();
        t.commit(user("question")).unwrap();
        let original = t.commit(assistant("v1")).unwrap();
        t.commit_with(
            assistant("v2"),
            CommitOptions {
                operation: CommitOperation::Edit,
                edit_target: Some(original.commit_hash.clone()),
                ..Default::default()
            },
        )
        .unwrap();

        let compiled = t.compile().unwrap();
        assert_eq!(compiled.messages.len(), 2);
        assert_eq!(compiled.messages[1].role, Role::Assistant);
        assert_eq!(compiled.messages[1].content, "v2");

        let annotated = t
            .compile_with(CompileOptions {
                include_edit_annotations: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(annotated.messages[1].content, "v2 [edited]");
    }

    #[test]
    fn chained_edits_keep_only_newest() {
        let mut t = open_tract();
        let original = t.commit(assistant("v1")).unwrap();
        let edit1 = t
            .commit_with(
                assistant("v2"),
                CommitOptions {
                    operation: CommitOperation::Edit,
                    edit_target: Some(original.commit_hash.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        t.commit_with(
            assistant("v3"),
            CommitOptions {
                operation: CommitOperation::Edit,
                edit_target: Some(edit1.commit_hash),
                ..Default::default()
            },
        )
        .unwrap();

        let compiled = t.compile().unwrap();
        assert_eq!(compiled.messages.len(), 1);
        assert_eq!(compiled.messages[0].content, "v3");
    }

    // --- Scenario 4: branch + merge base -------------------------------

    #[test]
    fn merge_base_of_two_branches_is_fork_point() {
        let mut t = open_tract();
        let base = t.commit(user("base")).unwrap();
        t.create_branch("feature", None, true).unwrap();
        let f1 = t.commit(user("feature work")).unwrap();
        t.switch("main").unwrap();
        let m1 = t.commit(user("main work")).unwrap();

        let commits = t.store.commits();
        let found =
            crate::dag::find_merge_base(&commits, &m1.commit_hash, &f1.commit_hash).unwrap();
        assert_eq!(found.as_deref(), Some(base.commit_hash.as_str()));
    }

    #[test]
    fn branch_lifecycle_and_unmerged_protection() {
        let mut t = open_tract();
        t.commit(user("one")).unwrap();
        t.create_branch("feature", None, true).unwrap();
        assert_eq!(t.current_branch().unwrap().as_deref(), Some("feature"));
        t.commit(user("feature-only")).unwrap();

        assert!(matches!(
            t.create_branch("feature", None, false),
            Err(TractError::BranchExists(_))
        ));
        assert!(matches!(
            t.create_branch("bad..name", None, false),
            Err(TractError::InvalidBranchName(_))
        ));
        assert!(matches!(
            t.delete_branch("feature", false),
            Err(TractError::InvalidState(_))
        ));

        t.switch("main").unwrap();
        assert!(matches!(
            t.delete_branch("feature", false),
            Err(TractError::UnmergedBranch(_))
        ));
        t.delete_branch("feature", true).unwrap();
        assert!(matches!(
            t.switch("feature"),
            Err(TractError::BranchNotFound(_))
        ));
    }

    // --- Priority annotations ------------------------------------------

    #[test]
    fn skip_drops_and_pinned_rescues_reasoning() {
        let mut t = open_tract();
        t.commit(user("keep me")).unwrap();
        let skipped = t.commit(user("drop me")).unwrap();
        t.annotate(&skipped.commit_hash, Priority::Skip).unwrap();

        let reasoning = t
            .commit(Content::Reasoning {
                text: "thinking...".into(),
                format: ReasoningFormat::Parsed,
            })
            .unwrap();

        let compiled = t.compile().unwrap();
        assert_eq!(compiled.messages.len(), 1);
        assert_eq!(compiled.messages[0].content, "keep me");

        // Pinning the reasoning commit forces it back in.
        t.annotate(&reasoning.commit_hash, Priority::Pinned).unwrap();
        let compiled = t.compile().unwrap();
        assert_eq!(compiled.messages.len(), 2);
        assert!(compiled.messages[1].content.contains("thinking"));
    }

    #[test]
    fn include_reasoning_flag_honors_explicit_skip() {
        let mut t = open_tract();
        t.commit(user("q")).unwrap();
        let reasoning = t
            .commit(Content::Reasoning {
                text: "hidden".into(),
                format: ReasoningFormat::Parsed,
            })
            .unwrap();

        // Default: reasoning filtered.
        assert_eq!(t.compile().unwrap().messages.len(), 1);
        // Included on request.
        let included = t
            .compile_with(CompileOptions {
                include_reasoning: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(included.messages.len(), 2);

        // Explicit SKIP beats include_reasoning.
        t.annotate(&reasoning.commit_hash, Priority::Skip).unwrap();
        let skipped = t
            .compile_with(CompileOptions {
                include_reasoning: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(skipped.messages.len(), 1);
    }

    // --- Scenario 5: compress with PINNED ------------------------------

    #[test]
    fn compress_preserves_pinned_and_reports_ratio() {
        let mut t = open_tract();
        let client = MockLlm::always("summary of the conversation");
        t.configure_llm(client);

        let pinned = t.commit(Content::instruction("You are helpful.")).unwrap();
        t.annotate(&pinned.commit_hash, Priority::Pinned).unwrap();
        t.commit(user("first long message about the project"))
            .unwrap();
        t.commit(assistant("a detailed response full of filler text"))
            .unwrap();
        t.commit(user("another message that can be condensed"))
            .unwrap();

        let outcome = t
            .compress(CompressOptions {
                target_tokens: Some(50),
                ..CompressOptions::new()
            })
            .unwrap();
        let Outcome::Completed(result) = outcome else {
            panic!("expected auto-approved compression");
        };

        assert_eq!(result.summary_commits.len(), 1);
        assert_eq!(result.preserved_commits.len(), 1);
        assert_eq!(result.source_commits.len(), 3);
        assert!(result.compression_ratio < 1.0);
        assert!(result.original_tokens > result.compressed_tokens);

        // New history: preserved instruction plus one assistant summary.
        let compiled = t.compile().unwrap();
        assert_eq!(compiled.messages.len(), 2);
        assert_eq!(compiled.messages[0].content, "You are helpful.");
        assert_eq!(compiled.messages[1].content, "summary of the conversation");

        // Token accounting matches the new commits.
        let summary_row = t.get_commit(&result.summary_commits[0]).unwrap().unwrap();
        let head = t.head().unwrap().unwrap();
        let pinned_recreated = t
            .store
            .commits()
            .get_ancestors(&head, None, None)
            .unwrap()
            .into_iter()
            .find(|c| c.content_type == "instruction")
            .unwrap();
        assert_eq!(
            result.compressed_tokens,
            summary_row.token_count + pinned_recreated.token_count
        );
        assert!(summary_row.tags.contains(&"summary".to_string()));

        // Provenance.
        let sources = t
            .store
            .events()
            .commits_for(&result.compression_id, "source")
            .unwrap();
        assert_eq!(sources, result.source_commits);
    }

    #[test]
    fn compress_manual_mode_rejects_multiple_groups() {
        let mut t = open_tract();
        t.commit(user("a")).unwrap();
        let mid = t.commit(user("pinned middle")).unwrap();
        t.annotate(&mid.commit_hash, Priority::Pinned).unwrap();
        t.commit(user("b")).unwrap();

        let err = t
            .compress(CompressOptions {
                content: Some("one summary".into()),
                ..CompressOptions::new()
            })
            .unwrap_err();
        assert!(matches!(err, TractError::Compression(_)));
    }

    #[test]
    fn compress_manual_mode_single_group() {
        let mut t = open_tract();
        t.commit(user("a")).unwrap();
        t.commit(user("b")).unwrap();

        let Outcome::Completed(result) = t
            .compress(CompressOptions {
                content: Some("condensed".into()),
                ..CompressOptions::new()
            })
            .unwrap()
        else {
            panic!("expected completion");
        };
        assert_eq!(result.summary_commits.len(), 1);
        let compiled = t.compile().unwrap();
        assert_eq!(compiled.messages.len(), 1);
        assert_eq!(compiled.messages[0].content, "condensed");
    }

    #[test]
    fn compress_without_client_or_content_is_config_error() {
        let mut t = open_tract();
        t.commit(user("a")).unwrap();
        let err = t.compress(CompressOptions::new()).unwrap_err();
        assert!(matches!(err, TractError::LlmConfig(_)));
    }

    #[test]
    fn compress_retries_on_retention_until_satisfied() {
        let mut t = open_tract();
        let client = MockLlm::scripted(
            &["summary without the key fact", "summary keeps budget $40k"],
            "summary keeps budget $40k",
        );
        t.configure_llm(client.clone());

        t.commit(user("planning")).unwrap();
        let important = t.commit(user("the budget is $40k")).unwrap();
        t.annotate_with(
            &important.commit_hash,
            Priority::Important,
            None,
            Some(RetentionCriteria {
                match_patterns: vec!["budget $40k".into()],
                ..Default::default()
            }),
        )
        .unwrap();

        let Outcome::Completed(result) = t.compress(CompressOptions::new()).unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(result.summary_commits.len(), 1);
        assert_eq!(client.call_count(), 2);
        let compiled = t.compile().unwrap();
        assert!(compiled.messages[0].content.contains("budget $40k"));
    }

    #[test]
    fn compress_retry_exhaustion_surfaces() {
        let mut t = open_tract();
        t.configure_llm(MockLlm::always("never mentions the magic word"));
        let important = t.commit(user("remember xyzzy")).unwrap();
        t.annotate_with(
            &important.commit_hash,
            Priority::Important,
            None,
            Some(RetentionCriteria {
                match_patterns: vec!["xyzzy".into()],
                ..Default::default()
            }),
        )
        .unwrap();

        let err = t
            .compress(CompressOptions {
                max_retries: 2,
                ..CompressOptions::new()
            })
            .unwrap_err();
        assert!(matches!(err, TractError::RetryExhausted { attempts: 3, .. }));
    }

    // --- TOCTOU ---------------------------------------------------------

    #[test]
    fn compress_finalize_fails_when_head_moved() {
        let mut t = open_tract();
        t.configure_llm(MockLlm::always("summary"));
        t.commit(user("a")).unwrap();
        t.commit(user("b")).unwrap();

        let Outcome::Pending(mut pending) = t
            .compress(CompressOptions {
                review: true,
                ..CompressOptions::new()
            })
            .unwrap()
        else {
            panic!("expected pending in review mode");
        };

        // HEAD moves between plan and approval.
        t.commit(user("concurrent")).unwrap();
        pending.approve().unwrap();
        let err = t.finalize_compress(&mut pending).unwrap_err();
        assert!(matches!(err, TractError::Compression(_)));
        // The concurrent commit is still there.
        assert_eq!(t.compile().unwrap().commit_count, 3);
    }

    // --- Hooks ----------------------------------------------------------

    #[test]
    fn compress_hook_can_edit_and_approve() {
        let mut t = open_tract();
        t.configure_llm(MockLlm::always("llm draft"));
        t.commit(user("a")).unwrap();
        t.commit(user("b")).unwrap();

        t.on_compress(|pending| {
            pending.edit_summary(0, "hook's version").unwrap();
            pending.approve().unwrap();
        });
        let Outcome::Completed(_) = t.compress(CompressOptions::new()).unwrap() else {
            panic!("expected hook approval");
        };
        assert_eq!(t.compile().unwrap().messages[0].content, "hook's version");
    }

    #[test]
    fn compress_hook_rejection_leaves_history_intact() {
        let mut t = open_tract();
        t.configure_llm(MockLlm::always("draft"));
        t.commit(user("a")).unwrap();
        t.commit(user("b")).unwrap();

        t.on_gc(|_| {}); // unrelated hook must not interfere
        t.on_compress(|pending| {
            pending.reject(Some("not today".into())).unwrap();
        });
        let Outcome::Rejected(rejection) = t.compress(CompressOptions::new()).unwrap() else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.reason, "not today");
        assert_eq!(rejection.rejection_source, "hook");
        assert_eq!(t.compile().unwrap().commit_count, 2);
    }

    #[test]
    fn auto_retry_steers_pending_compress() {
        let mut t = open_tract();
        let client = MockLlm::scripted(&["missing", "contains token42"], "contains token42");
        t.configure_llm(client);
        t.commit(user("a")).unwrap();

        let Outcome::Pending(mut pending) = t
            .compress(CompressOptions {
                review: true,
                ..CompressOptions::new()
            })
            .unwrap()
        else {
            panic!("expected pending");
        };
        // Simulate a reviewer-imposed constraint after planning.
        pending.group_retention[0].push(RetentionCriteria {
            match_patterns: vec!["token42".into()],
            ..Default::default()
        });
        pending.edit_summary(0, "missing").unwrap();

        let rejection = crate::pending::auto_retry(&mut pending, 3).unwrap();
        assert!(rejection.is_none());
        assert_eq!(pending.status(), PendingStatus::Approved);
        let result = t.finalize_compress(&mut pending).unwrap();
        assert_eq!(result.summary_commits.len(), 1);
    }

    // --- Scenario 6: rebase then fast-forward merge ---------------------

    #[test]
    fn rebase_then_merge_fast_forwards() {
        let mut t = open_tract();
        t.commit(user("tip")).unwrap();
        t.create_branch("feature", None, true).unwrap();
        t.commit(user("f1")).unwrap();
        t.commit(user("f2")).unwrap();
        t.switch("main").unwrap();
        let m1 = t.commit(user("m1")).unwrap();

        t.switch("feature").unwrap();
        let Outcome::Completed(rebase) = t.rebase("main", None, false).unwrap() else {
            panic!("expected auto rebase");
        };
        assert_eq!(rebase.replayed_commits.len(), 2);
        assert_eq!(
            rebase.replayed_commits[0].parent_hash.as_deref(),
            Some(m1.commit_hash.as_str())
        );
        // New hashes, same content.
        assert_ne!(
            rebase.replayed_commits[0].commit_hash,
            rebase.original_commits[0].commit_hash
        );

        t.switch("main").unwrap();
        let Outcome::Completed(merge) = t
            .merge("feature", None, MergeOptions::default())
            .unwrap()
        else {
            panic!("expected merge completion");
        };
        assert!(merge.fast_forward);
        assert_eq!(merge.new_head, rebase.new_head);

        let compiled = t.compile().unwrap();
        assert_eq!(compiled.commit_count, 4);
    }

    #[test]
    fn rebase_rejects_merge_commits_in_range() {
        let mut t = open_tract();
        let base = t.commit(user("base")).unwrap();
        t.create_branch("feature", None, true).unwrap();
        t.commit(user("f1")).unwrap();
        t.switch("main").unwrap();
        t.commit(user("m1")).unwrap();

        // Divergent histories: the merge creates a two-parent commit on
        // main.
        let Outcome::Completed(result) = t
            .merge("feature", None, MergeOptions::default())
            .unwrap()
        else {
            panic!("merge should complete without conflicts");
        };
        assert!(result.merge_commit.is_some());

        // A branch forked before the merge: rebasing main onto it would
        // replay the merge commit.
        t.create_branch("other", Some(&base.commit_hash[..8]), true)
            .unwrap();
        t.commit(user("o1")).unwrap();
        t.switch("main").unwrap();
        let err = t.rebase("other", None, false).unwrap_err();
        assert!(matches!(err, TractError::Rebase(_)));
    }

    #[test]
    fn merge_already_merged_and_self_merge() {
        let mut t = open_tract();
        t.commit(user("base")).unwrap();
        t.create_branch("feature", None, false).unwrap();
        t.commit(user("ahead")).unwrap();

        let Outcome::Completed(result) = t
            .merge("feature", None, MergeOptions::default())
            .unwrap()
        else {
            panic!("expected completion");
        };
        assert!(result.already_merged);

        assert!(matches!(
            t.merge("main", None, MergeOptions::default()),
            Err(TractError::Merge(_))
        ));
    }

    #[test]
    fn merge_conflict_resolved_by_resolver() {
        let mut t = open_tract();
        let base = t.commit(assistant("shared draft")).unwrap();
        let base_hash = base.commit_hash.clone();

        t.create_branch("feature", None, true).unwrap();
        t.commit_with(
            assistant("feature version"),
            CommitOptions {
                operation: CommitOperation::Edit,
                edit_target: Some(base_hash.clone()),
                ..Default::default()
            },
        )
        .unwrap();

        t.switch("main").unwrap();
        t.commit_with(
            assistant("main version"),
            CommitOptions {
                operation: CommitOperation::Edit,
                edit_target: Some(base_hash.clone()),
                ..Default::default()
            },
        )
        .unwrap();

        let resolver: Resolver = Box::new(|issue| {
            assert_eq!(issue.issue_type, "edit_conflict");
            crate::llm::Resolution::resolved("reconciled version")
        });
        let Outcome::Completed(result) = t
            .merge("feature", Some(resolver), MergeOptions::default())
            .unwrap()
        else {
            panic!("expected completion");
        };
        assert_eq!(result.conflicts_resolved, 1);
        let merge_commit = result.merge_commit.unwrap();
        let parents = t.store.commits().get_parents(&merge_commit.commit_hash).unwrap();
        assert_eq!(parents.len(), 2);

        // The resolution EDIT wins during compile.
        let compiled = t.compile().unwrap();
        let texts: Vec<&str> = compiled.messages.iter().map(|m| m.content.as_str()).collect();
        assert!(texts.iter().any(|t| t.contains("reconciled version")));
        assert!(!texts.iter().any(|t| t.contains("shared draft")));
    }

    // --- Import ---------------------------------------------------------

    #[test]
    fn import_replays_commit_onto_head() {
        let mut t = open_tract();
        t.commit(user("base")).unwrap();
        t.create_branch("feature", None, true).unwrap();
        let cherry = t.commit(user("cherry")).unwrap();
        t.switch("main").unwrap();
        t.commit(user("mainline")).unwrap();

        let Outcome::Completed(result) =
            t.import_commit(&cherry.commit_hash, None, false).unwrap()
        else {
            panic!("expected completion");
        };
        let imported = result.new_commit.unwrap();
        assert_ne!(imported.commit_hash, cherry.commit_hash);
        assert_eq!(imported.content_hash, cherry.content_hash);
        assert!(result.issues.is_empty());
    }

    #[test]
    fn import_edit_with_missing_target_needs_resolver() {
        // Two tracts share one DB file; the second never saw the first's
        // edit target.
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let mut a = Tract::open(&path).unwrap();
        let a_orig = a.commit(assistant("v1")).unwrap();
        let a_edit = a
            .commit_with(
                assistant("v2"),
                CommitOptions {
                    operation: CommitOperation::Edit,
                    edit_target: Some(a_orig.commit_hash.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        drop(a);

        let mut b = Tract::open(&path).unwrap();
        b.commit(user("unrelated root")).unwrap();

        let err = b.import_commit(&a_edit.commit_hash, None, false).unwrap_err();
        assert!(matches!(err, TractError::ImportCommit(_)));

        let resolver: Resolver =
            Box::new(|_| crate::llm::Resolution::resolved("resolved standalone text"));
        let Outcome::Completed(result) = b
            .import_commit(&a_edit.commit_hash, Some(resolver), false)
            .unwrap()
        else {
            panic!("expected completion");
        };
        let imported = result.new_commit.unwrap();
        assert_eq!(imported.operation, CommitOperation::Append);
        assert_eq!(
            imported.metadata.unwrap()["original_operation"],
            json!("EDIT")
        );
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].issue_type, "edit_target_missing");

        // Skip action imports nothing.
        let skipper: Resolver = Box::new(|_| crate::llm::Resolution::skip());
        let Outcome::Completed(result) = b
            .import_commit(&a_edit.commit_hash, Some(skipper), false)
            .unwrap()
        else {
            panic!("expected completion");
        };
        assert!(result.new_commit.is_none());
    }

    // --- GC -------------------------------------------------------------

    #[test]
    fn gc_removes_unreachable_and_is_idempotent() {
        let mut t = open_tract();
        t.commit(user("a")).unwrap();
        t.commit(user("b")).unwrap();
        let Outcome::Completed(_) = t
            .compress(CompressOptions {
                content: Some("s".into()),
                ..CompressOptions::new()
            })
            .unwrap()
        else {
            panic!("expected compression");
        };

        // Originals are unreachable now; zero retention makes them
        // immediately eligible.
        let Outcome::Completed(first) = t
            .gc(GcOptions {
                orphan_retention_days: Some(0),
                ..Default::default()
            })
            .unwrap()
        else {
            panic!("expected gc completion");
        };
        assert_eq!(first.removed_commits.len(), 2);
        assert!(!first.removed_blobs.is_empty());
        assert!(first.tokens_freed > 0);

        let Outcome::Completed(second) = t
            .gc(GcOptions {
                orphan_retention_days: Some(0),
                ..Default::default()
            })
            .unwrap()
        else {
            panic!("expected gc completion");
        };
        assert!(second.removed_commits.is_empty());

        // The surviving chain still compiles.
        assert_eq!(t.compile().unwrap().messages[0].content, "s");
    }

    #[test]
    fn gc_respects_pins_retention_and_exclusions() {
        let mut t = open_tract();
        let keep = t.commit(user("keep")).unwrap();
        t.commit(user("tail")).unwrap();
        let Outcome::Completed(_) = t
            .compress(CompressOptions {
                content: Some("s".into()),
                ..CompressOptions::new()
            })
            .unwrap()
        else {
            panic!("expected compression");
        };
        t.annotate(&keep.commit_hash, Priority::Pinned).unwrap();

        // Retention window keeps fresh orphans alive.
        let Outcome::Completed(windowed) = t.gc(GcOptions::default()).unwrap() else {
            panic!()
        };
        assert!(windowed.removed_commits.is_empty());

        // Pinned commit survives even with zero retention.
        let Outcome::Pending(mut pending) = t
            .gc(GcOptions {
                orphan_retention_days: Some(0),
                review: true,
                ..Default::default()
            })
            .unwrap()
        else {
            panic!()
        };
        assert!(!pending.commits_to_remove.contains(&keep.commit_hash));
        assert_eq!(pending.commits_to_remove.len(), 1);

        // Exclusion edits the plan.
        let spared = pending.commits_to_remove[0].clone();
        pending.exclude(&spared);
        pending.approve().unwrap();
        let result = t.finalize_gc(&mut pending).unwrap();
        assert!(result.removed_commits.is_empty());
        assert!(t.get_commit(&spared).unwrap().is_some());
    }

    // --- Chat / usage ---------------------------------------------------

    #[test]
    fn chat_commits_reply_and_records_usage() {
        let mut t = open_tract();
        t.configure_llm(MockLlm::always("hello there"));
        t.commit(user("hi")).unwrap();

        let response = t.chat(ChatOptions::default()).unwrap();
        assert_eq!(response.text, "hello there");
        assert_eq!(response.usage.unwrap().prompt_tokens, 100);
        assert_eq!(
            response.commit_info.content_type,
            "dialogue".to_string()
        );

        let compiled = t.compile().unwrap();
        assert_eq!(compiled.token_source, "api:100+20");
        assert_eq!(compiled.token_count, 100);
        assert_eq!(compiled.messages.len(), 2);
    }

    #[test]
    fn chat_resolution_chain_reaches_the_client() {
        let mut config = TractConfig::default();
        config.default_llm.temperature = Some(0.0);
        config.operations.chat = Some(LLMConfig {
            model: Some("chat-model".into()),
            ..Default::default()
        });
        let mut t = Tract::open_with(config, None, None, Some(MockLlm::always("ok"))).unwrap();
        t.commit(user("hi")).unwrap();

        let response = t
            .chat(ChatOptions {
                call_site: Some(json!({"temperature": 0.9})),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(response.generation_config["model"], "chat-model");
        assert_eq!(response.generation_config["temperature"], 0.9);

        // Recorded on the commit and queryable.
        let hot = t
            .query_by_config("temperature", ">", json!(0.5))
            .unwrap();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].commit_hash, response.commit_info.commit_hash);
    }

    #[test]
    fn chat_commits_reasoning_when_configured() {
        let config = TractConfig {
            commit_reasoning: true,
            ..Default::default()
        };
        let client = Arc::new(ReasoningLlm);
        let mut t = Tract::open_with(config, None, None, Some(client)).unwrap();
        t.commit(user("why?")).unwrap();

        let response = t.chat(ChatOptions::default()).unwrap();
        assert_eq!(response.text, "because");
        assert_eq!(response.reasoning.as_deref(), Some("let me think"));
        let reasoning_commit = response.reasoning_commit.unwrap();
        assert_eq!(reasoning_commit.content_type, "reasoning");

        // Reasoning commits are filtered from the default compile.
        let compiled = t.compile().unwrap();
        assert!(!compiled
            .messages
            .iter()
            .any(|m| m.content.contains("let me think")));
    }

    struct ReasoningLlm;

    impl LlmClient for ReasoningLlm {
        fn chat(&self, _messages: &[ChatMessage], _params: &Value) -> Result<ChatCompletion> {
            Ok(ChatCompletion::new(json!({
                "choices": [{"message": {
                    "content": "because",
                    "reasoning": "let me think",
                }}],
            })))
        }
    }

    // --- Batch ----------------------------------------------------------

    #[test]
    fn batch_rolls_back_every_commit_on_error() {
        let mut t = open_tract();
        t.commit(user("before")).unwrap();

        let result: Result<()> = t.batch(|t| {
            t.commit(user("inside-1"))?;
            t.commit(user("inside-2"))?;
            Err(TractError::ContentValidation("abort the batch".into()))
        });
        assert!(result.is_err());
        let compiled = t.compile().unwrap();
        assert_eq!(compiled.commit_count, 1);
        assert_eq!(compiled.messages[0].content, "before");

        t.batch(|t| {
            t.commit(user("kept-1"))?;
            t.commit(user("kept-2"))?;
            Ok(())
        })
        .unwrap();
        assert_eq!(t.compile().unwrap().commit_count, 3);
    }

    // --- Tags -----------------------------------------------------------

    #[test]
    fn tags_union_immutable_and_mutable_sources() {
        let mut t = open_tract();
        let info = t.commit(Content::instruction("rule")).unwrap();
        assert_eq!(t.get_tags(&info.commit_hash).unwrap(), ["instruction"]);

        assert!(matches!(
            t.tag(&info.commit_hash, "made-up"),
            Err(TractError::TagNotRegistered(_))
        ));
        t.register_tag("made-up", Some("test tag")).unwrap();
        t.tag(&info.commit_hash, "made-up").unwrap();
        assert_eq!(
            t.get_tags(&info.commit_hash).unwrap(),
            ["instruction", "made-up"]
        );

        t.untag(&info.commit_hash, "made-up").unwrap();
        assert_eq!(t.get_tags(&info.commit_hash).unwrap(), ["instruction"]);

        // find_by_tag sees immutable tags and honors untag events.
        assert_eq!(t.find_by_tag("instruction").unwrap().len(), 1);
        assert!(t.find_by_tag("made-up").unwrap().is_empty());
    }

    // --- Time travel and reorder ----------------------------------------

    #[test]
    fn at_commit_cutoff_travels_back() {
        let mut t = open_tract();
        t.commit(user("one")).unwrap();
        let second = t.commit(assistant("two")).unwrap();
        t.commit(user("three")).unwrap();

        let compiled = t
            .compile_with(CompileOptions {
                at_commit: Some(second.commit_hash.clone()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(compiled.commit_count, 2);
        assert_eq!(compiled.messages.last().unwrap().content, "two");
    }

    #[test]
    fn reorder_check_flags_edit_hazards() {
        let mut t = open_tract();
        let a = t.commit(assistant("v1")).unwrap();
        let edit = t
            .commit_with(
                assistant("v2"),
                CommitOptions {
                    operation: CommitOperation::Edit,
                    edit_target: Some(a.commit_hash.clone()),
                    ..Default::default()
                },
            )
            .unwrap();

        let warnings = t
            .check_reorder(&[edit.commit_hash.clone(), a.commit_hash.clone()])
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].warning_type, "edit_before_target");

        let warnings = t.check_reorder(&[edit.commit_hash.clone()]).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].warning_type, "response_chain_break");
    }

    // --- Detached HEAD ---------------------------------------------------

    #[test]
    fn detached_head_checkout_and_guards() {
        let mut t = open_tract();
        let first = t.commit(user("one")).unwrap();
        t.commit(user("two")).unwrap();

        t.checkout_commit(&first.commit_hash[..8]).unwrap();
        assert!(t.is_detached().unwrap());
        assert_eq!(t.compile().unwrap().commit_count, 1);
        assert!(matches!(
            t.rebase("main", None, false),
            Err(TractError::Rebase(_))
        ));

        t.switch("main").unwrap();
        assert!(!t.is_detached().unwrap());
        assert_eq!(t.compile().unwrap().commit_count, 2);
    }

    // --- Spawn -----------------------------------------------------------

    #[test]
    fn spawn_full_clone_reproduces_history_under_new_id() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let mut parent = Tract::open(&path).unwrap();
        parent.commit(Content::instruction("rule")).unwrap();
        parent.commit(user("hello")).unwrap();
        let child_id = parent
            .spawn("analysis", InheritanceMode::FullClone, Some("worker"))
            .unwrap();
        let parent_id = parent.tract_id().to_string();
        drop(parent);

        let config = TractConfig {
            db_path: path.clone(),
            ..Default::default()
        };
        let mut child =
            Tract::open_with(config, Some(child_id.clone()), None, None).unwrap();
        let compiled = child.compile().unwrap();
        assert_eq!(compiled.commit_count, 2);
        assert_eq!(compiled.messages[1].content, "hello");

        let session = Session::open(&path).unwrap();
        let tracts = session.list_tracts().unwrap();
        assert_eq!(tracts.len(), 2);
        let child_summary = tracts
            .iter()
            .find(|s| s.tract_id == child_id)
            .unwrap();
        assert_eq!(child_summary.parent_tract_id.as_deref(), Some(parent_id.as_str()));
        assert_eq!(child_summary.display_name.as_deref(), Some("worker"));
    }

    #[test]
    fn spawn_head_snapshot_recommits_messages() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let mut parent = Tract::open(&path).unwrap();
        parent.commit(Content::instruction("be brief")).unwrap();
        parent.commit(user("context")).unwrap();
        let child_id = parent
            .spawn("subtask", InheritanceMode::HeadSnapshot, None)
            .unwrap();

        let config = TractConfig {
            db_path: path,
            ..Default::default()
        };
        let mut child = Tract::open_with(config, Some(child_id), None, None).unwrap();
        let compiled = child.compile().unwrap();
        assert_eq!(compiled.messages.len(), 2);
        assert_eq!(compiled.messages[0].role, Role::System);
        assert_eq!(compiled.messages[0].content, "be brief");
    }

    use crate::content::ReasoningFormat;
    use crate::session::Session;
}
