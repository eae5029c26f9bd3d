//! Context compression: summarize commit ranges into shorter commits.
//!
//! PINNED commits survive verbatim and partition the range into groups;
//! SKIP commits drop out; IMPORTANT commits compress like NORMAL ones but
//! contribute retention criteria the summary must satisfy. Originals stay
//! in the DB as unreachable history until GC collects them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::content::{Content, Role};
use crate::errors::{Result, TractError};
use crate::engine::{CommitEngine, CommitParams};
use crate::llm::{ChatMessage, LlmClient};
use crate::models::{CompressResult, MatchMode, Priority, RetentionCriteria};
use crate::pending::{PendingOperation, PendingState, PendingStatus, ValidationResult};
use crate::prompts;
use crate::store::{CommitRow, OperationEventRow, Store};
use crate::tokens::TokenCounter;

/// Caller-supplied summary validator: `(ok, diagnosis)`.
pub type SummaryValidator = Arc<dyn Fn(&str) -> (bool, Option<String>) + Send + Sync>;

/// Tolerance added to `target_tokens` when none is given.
const DEFAULT_TOKEN_TOLERANCE: usize = 500;

/// Options for `Tract::compress`.
#[derive(Clone, Default)]
pub struct CompressOptions {
    /// Explicit commit hashes to compress (chain order preserved).
    pub commits: Option<Vec<String>>,
    /// Range start, inclusive.
    pub from_commit: Option<String>,
    /// Range end, inclusive.
    pub to_commit: Option<String>,
    /// Target token count per group summary.
    pub target_tokens: Option<usize>,
    /// Hashes treated as PINNED for this invocation only.
    pub preserve: Vec<String>,
    /// Manual summary text; bypasses the LLM. Single-group ranges only.
    pub content: Option<String>,
    /// Extra guidance appended to the summarization user prompt.
    pub instructions: Option<String>,
    /// Replacement for the summarization system prompt.
    pub system_prompt: Option<String>,
    /// Generation config recorded on the summary commits.
    pub generation_config: Option<Value>,
    /// Resolved LLM parameters forwarded to the client.
    pub llm_params: Option<Value>,
    /// Caller-supplied summary validator.
    pub validator: Option<SummaryValidator>,
    /// Steering retries per group before `RetryExhausted`.
    pub max_retries: u32,
    /// Additive token tolerance; None means the default (500), 0 is strict.
    pub token_tolerance: Option<usize>,
    /// Generate cross-group guidance with a first LLM pass.
    pub two_stage: bool,
    /// Return the pending to the caller instead of routing.
    pub review: bool,
    /// Provenance marker, e.g. `trigger:auto_compress`.
    pub triggered_by: Option<String>,
}

impl CompressOptions {
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            ..Default::default()
        }
    }
}

/// A planned compression awaiting approval.
pub struct PendingCompress {
    pub state: PendingState,
    /// One draft summary per group, editable in review mode.
    pub summaries: Vec<String>,
    /// Cross-group guidance and where it came from (`llm`, `user`,
    /// `user+llm`).
    pub guidance: Option<String>,
    pub guidance_source: Option<String>,
    pub source_commits: Vec<String>,
    pub preserved_commits: Vec<String>,
    pub original_tokens: usize,
    pub estimated_tokens: usize,

    // Plan internals needed for retry and finalization.
    pub(crate) range: Vec<CommitRow>,
    pub(crate) groups: Vec<Vec<CommitRow>>,
    pub(crate) pinned_hashes: HashSet<String>,
    pub(crate) skip_hashes: HashSet<String>,
    pub(crate) group_retention: Vec<Vec<RetentionCriteria>>,
    pub(crate) group_retention_instructions: Vec<Vec<String>>,
    pub(crate) group_texts: Vec<String>,
    pub(crate) branch_name: Option<String>,
    pub(crate) target_tokens: Option<usize>,
    pub(crate) instructions: Option<String>,
    pub(crate) system_prompt: Option<String>,
    pub(crate) generation_config: Option<Value>,
    pub(crate) llm_params: Value,
    pub(crate) token_tolerance: Option<usize>,
    pub(crate) manual: bool,
    pub(crate) counter: Arc<dyn TokenCounter>,
    pub(crate) client: Option<Arc<dyn LlmClient>>,
    pub(crate) validator: Option<SummaryValidator>,
}

impl std::fmt::Debug for PendingCompress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCompress")
            .field("state", &self.state)
            .field("summaries", &self.summaries)
            .field("guidance", &self.guidance)
            .field("guidance_source", &self.guidance_source)
            .field("source_commits", &self.source_commits)
            .field("preserved_commits", &self.preserved_commits)
            .field("original_tokens", &self.original_tokens)
            .field("estimated_tokens", &self.estimated_tokens)
            .field("range", &self.range)
            .field("groups", &self.groups)
            .field("pinned_hashes", &self.pinned_hashes)
            .field("skip_hashes", &self.skip_hashes)
            .field("group_retention", &self.group_retention)
            .field("group_retention_instructions", &self.group_retention_instructions)
            .field("group_texts", &self.group_texts)
            .field("branch_name", &self.branch_name)
            .field("target_tokens", &self.target_tokens)
            .field("instructions", &self.instructions)
            .field("system_prompt", &self.system_prompt)
            .field("generation_config", &self.generation_config)
            .field("llm_params", &self.llm_params)
            .field("token_tolerance", &self.token_tolerance)
            .field("manual", &self.manual)
            .finish_non_exhaustive()
    }
}

impl PendingCompress {
    pub fn status(&self) -> PendingStatus {
        self.state.status()
    }

    pub fn approve(&mut self) -> Result<()> {
        self.state.approve()
    }

    pub fn reject(&mut self, reason: Option<String>) -> Result<()> {
        self.state.reject(reason)
    }

    /// Replace one draft summary.
    pub fn edit_summary(&mut self, group_index: usize, text: impl Into<String>) -> Result<()> {
        let slot = self.summaries.get_mut(group_index).ok_or_else(|| {
            TractError::Compression(format!("no summary group at index {group_index}"))
        })?;
        *slot = text.into();
        Ok(())
    }

    /// Replace the guidance. Flips `guidance_source` to `user` (or
    /// `user+llm` when an LLM draft existed).
    pub fn edit_guidance(&mut self, text: impl Into<String>) {
        self.guidance = Some(text.into());
        self.guidance_source = Some(match self.guidance_source.as_deref() {
            Some("llm") | Some("user+llm") => "user+llm".to_string(),
            _ => "user".to_string(),
        });
    }

    /// Re-run the two-stage guidance call.
    pub fn regenerate_guidance(&mut self) -> Result<()> {
        let client = self.client.clone().ok_or_else(|| {
            TractError::LlmConfig("regenerate_guidance requires an LLM client".to_string())
        })?;
        let all_text = self.group_texts.join("\n\n");
        let messages = vec![
            ChatMessage {
                role: "system".into(),
                content: prompts::COMPRESS_GUIDANCE_SYSTEM.into(),
                name: None,
                tool_call_id: None,
                tool_calls: None,
            },
            ChatMessage {
                role: "user".into(),
                content: prompts::build_compress_guidance_prompt(
                    &all_text,
                    self.instructions.as_deref(),
                ),
                name: None,
                tool_call_id: None,
                tool_calls: None,
            },
        ];
        let completion = client.chat(&messages, &self.llm_params)?;
        self.guidance = Some(completion.content()?);
        self.guidance_source = Some("llm".to_string());
        Ok(())
    }

    /// Validate every group summary against retention criteria, the
    /// caller validator, and the token budget.
    pub fn validate(&self) -> ValidationResult {
        for (index, summary) in self.summaries.iter().enumerate() {
            let criteria = self.group_retention.get(index).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(diagnosis) = validate_retention(summary, criteria) {
                return ValidationResult::failed(diagnosis);
            }
            if let Some(validator) = &self.validator {
                let (ok, diagnosis) = validator(summary);
                if !ok {
                    return ValidationResult::failed(
                        diagnosis.unwrap_or_else(|| "summary rejected by validator".to_string()),
                    );
                }
            }
            if let Some(target) = self.target_tokens {
                let actual = self.counter.count_text(summary);
                let tolerance = self.token_tolerance.unwrap_or(DEFAULT_TOKEN_TOLERANCE);
                if actual > target + tolerance {
                    return ValidationResult::failed(format!(
                        "Summary is ~{actual} tokens (target: {target}). \
                         Condense to ~{target} tokens."
                    ));
                }
            }
        }
        ValidationResult::ok()
    }

    /// Regenerate every summary with the current instructions/guidance.
    pub fn retry(&mut self) -> Result<()> {
        if self.manual {
            return Err(TractError::Compression(
                "manual-content compressions cannot retry".to_string(),
            ));
        }
        let client = self.client.clone().ok_or_else(|| {
            TractError::LlmConfig("retry requires an LLM client".to_string())
        })?;
        let mut instructions = self.instructions.clone();
        if let Some(guidance) = &self.guidance {
            instructions = Some(match instructions {
                Some(existing) => format!("Guidance:\n{guidance}\n\n{existing}"),
                None => format!("Guidance:\n{guidance}"),
            });
        }
        for (index, text) in self.group_texts.iter().enumerate() {
            let summary = summarize_group(
                client.as_ref(),
                text,
                self.target_tokens,
                instructions.as_deref(),
                self.system_prompt.as_deref(),
                &self.group_retention_instructions[index],
                &self.llm_params,
            )?;
            self.summaries[index] = summary;
        }
        self.estimated_tokens = self
            .summaries
            .iter()
            .map(|s| self.counter.count_text(s))
            .sum();
        Ok(())
    }
}

impl PendingOperation for PendingCompress {
    fn status(&self) -> PendingStatus {
        PendingCompress::status(self)
    }
    fn approve(&mut self) -> Result<()> {
        PendingCompress::approve(self)
    }
    fn reject(&mut self, reason: Option<String>) -> Result<()> {
        PendingCompress::reject(self, reason)
    }
    fn validate(&self) -> ValidationResult {
        PendingCompress::validate(self)
    }
    fn retry(&mut self) -> Result<()> {
        PendingCompress::retry(self)
    }
    fn fold_diagnosis(&mut self, diagnosis: &str) {
        let base = self.instructions.take().unwrap_or_default();
        self.instructions = Some(
            format!("{base}\n\nPrevious summary was rejected: {diagnosis}")
                .trim()
                .to_string(),
        );
    }
    fn operation_name(&self) -> &'static str {
        "compress"
    }
}

/// Check deterministic retention criteria; None means satisfied.
fn validate_retention(summary: &str, criteria: &[RetentionCriteria]) -> Option<String> {
    let mut failures: Vec<String> = Vec::new();
    for c in criteria {
        for pattern in &c.match_patterns {
            match c.match_mode {
                MatchMode::Regex => match regex::Regex::new(pattern) {
                    Ok(re) => {
                        if !re.is_match(summary) {
                            failures.push(format!("regex not found: {pattern}"));
                        }
                    }
                    Err(_) => failures.push(format!("invalid regex: {pattern}")),
                },
                MatchMode::Substring => {
                    if !summary.contains(pattern.as_str()) {
                        failures.push(format!("substring not found: {pattern}"));
                    }
                }
            }
        }
    }
    if failures.is_empty() {
        None
    } else {
        Some(format!("Summary missing: {}", failures.join("; ")))
    }
}

/// Resolve the commits to compress into chain order (oldest first).
fn resolve_range(
    store: &Store,
    head_hash: &str,
    options: &CompressOptions,
) -> Result<Vec<CommitRow>> {
    let mut chain = store.commits().get_ancestors(head_hash, None, None)?;
    if chain.is_empty() {
        return Err(TractError::Compression("No commits to compress".to_string()));
    }
    chain.reverse();

    if let Some(commits) = &options.commits {
        let wanted: HashSet<&str> = commits.iter().map(String::as_str).collect();
        let result: Vec<CommitRow> = chain
            .iter()
            .filter(|c| wanted.contains(c.commit_hash.as_str()))
            .cloned()
            .collect();
        let found: HashSet<&str> = result.iter().map(|c| c.commit_hash.as_str()).collect();
        let mut missing: Vec<&str> = wanted.difference(&found).copied().collect();
        if !missing.is_empty() {
            missing.sort();
            return Err(TractError::Compression(format!(
                "Commits not found in current chain: {}",
                missing.join(", ")
            )));
        }
        if result.is_empty() {
            return Err(TractError::Compression(
                "No commits matched the provided list".to_string(),
            ));
        }
        return Ok(result);
    }

    if options.from_commit.is_some() || options.to_commit.is_some() {
        let hashes: Vec<&str> = chain.iter().map(|c| c.commit_hash.as_str()).collect();
        let mut start = 0usize;
        let mut end = chain.len() - 1;
        if let Some(from) = &options.from_commit {
            start = hashes.iter().position(|h| h == from).ok_or_else(|| {
                TractError::Compression(format!("from_commit not found in chain: {from}"))
            })?;
        }
        if let Some(to) = &options.to_commit {
            end = hashes.iter().position(|h| h == to).ok_or_else(|| {
                TractError::Compression(format!("to_commit not found in chain: {to}"))
            })?;
        }
        if start > end {
            return Err(TractError::Compression(
                "Invalid range: from_commit is after to_commit in chain".to_string(),
            ));
        }
        return Ok(chain[start..=end].to_vec());
    }

    Ok(chain)
}

/// Partition the range into runs of compressible commits. PINNED commits
/// are boundaries; SKIP commits drop out entirely.
fn partition_around_pinned(
    range: &[CommitRow],
    pinned: &HashSet<String>,
    skip: &HashSet<String>,
) -> Vec<Vec<CommitRow>> {
    let mut groups: Vec<Vec<CommitRow>> = Vec::new();
    let mut current: Vec<CommitRow> = Vec::new();
    for row in range {
        if pinned.contains(&row.commit_hash) {
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
            }
        } else if skip.contains(&row.commit_hash) {
            continue;
        } else {
            current.push(row.clone());
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

fn summarize_group(
    client: &dyn LlmClient,
    messages_text: &str,
    target_tokens: Option<usize>,
    instructions: Option<&str>,
    system_prompt: Option<&str>,
    retention_instructions: &[String],
    llm_params: &Value,
) -> Result<String> {
    let system = system_prompt.unwrap_or(prompts::DEFAULT_SUMMARIZE_SYSTEM);
    let user = prompts::build_summarize_prompt(
        messages_text,
        target_tokens,
        instructions,
        retention_instructions,
    );
    let messages = vec![
        ChatMessage {
            role: "system".into(),
            content: system.to_string(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        },
        ChatMessage {
            role: "user".into(),
            content: user,
            name: None,
            tool_call_id: None,
            tool_calls: None,
        },
    ];
    let completion = client.chat(&messages, llm_params)?;
    let content = completion.content()?;
    if content.trim().is_empty() {
        return Err(TractError::Compression("LLM returned empty summary".to_string()));
    }
    Ok(content)
}

/// Plan a compression. Always returns a `PendingCompress`; the facade
/// routes it (review / hook / auto).
#[allow(clippy::too_many_arguments)]
pub fn plan(
    store: &Store,
    counter: Arc<dyn TokenCounter>,
    client: Option<Arc<dyn LlmClient>>,
    tract_id: &str,
    custom_types: &HashSet<String>,
    options: CompressOptions,
) -> Result<PendingCompress> {
    let head_hash = store
        .refs()
        .head(tract_id)?
        .ok_or_else(|| TractError::Compression("No commits to compress".to_string()))?;
    let branch_name = store.refs().current_branch(tract_id)?;

    let range = resolve_range(store, &head_hash, &options)?;

    // Classify by latest priority; the preserve list overrides to PINNED.
    let preserve: HashSet<&str> = options.preserve.iter().map(String::as_str).collect();
    let hashes: Vec<String> = range.iter().map(|c| c.commit_hash.clone()).collect();
    let annotations = store.annotations().batch_latest(&hashes)?;

    let mut pinned: Vec<CommitRow> = Vec::new();
    let mut important: Vec<CommitRow> = Vec::new();
    let mut normal: Vec<CommitRow> = Vec::new();
    let mut skip: Vec<CommitRow> = Vec::new();
    for row in &range {
        if preserve.contains(row.commit_hash.as_str()) {
            pinned.push(row.clone());
            continue;
        }
        match annotations.get(&row.commit_hash).map(|a| a.priority) {
            Some(Priority::Pinned) => pinned.push(row.clone()),
            Some(Priority::Important) => important.push(row.clone()),
            Some(Priority::Skip) => skip.push(row.clone()),
            _ => normal.push(row.clone()),
        }
    }

    let compressible: Vec<CommitRow> = {
        let important_set: HashSet<&str> =
            important.iter().map(|c| c.commit_hash.as_str()).collect();
        let normal_set: HashSet<&str> = normal.iter().map(|c| c.commit_hash.as_str()).collect();
        range
            .iter()
            .filter(|c| {
                normal_set.contains(c.commit_hash.as_str())
                    || important_set.contains(c.commit_hash.as_str())
            })
            .cloned()
            .collect()
    };
    if compressible.is_empty() {
        return Err(TractError::Compression(
            "Nothing to compress -- all commits are pinned or skipped".to_string(),
        ));
    }

    let pinned_hashes: HashSet<String> = pinned.iter().map(|c| c.commit_hash.clone()).collect();
    let skip_hashes: HashSet<String> = skip.iter().map(|c| c.commit_hash.clone()).collect();
    let groups = partition_around_pinned(&range, &pinned_hashes, &skip_hashes);

    // Retention criteria from IMPORTANT commits, per group.
    let important_hashes: HashSet<&str> =
        important.iter().map(|c| c.commit_hash.as_str()).collect();
    let mut group_retention: Vec<Vec<RetentionCriteria>> = Vec::with_capacity(groups.len());
    let mut group_retention_instructions: Vec<Vec<String>> = Vec::with_capacity(groups.len());
    for group in &groups {
        let mut criteria: Vec<RetentionCriteria> = Vec::new();
        let mut instructions_list: Vec<String> = Vec::new();
        for row in group {
            if important_hashes.contains(row.commit_hash.as_str()) {
                if let Some(annotation) = annotations.get(&row.commit_hash) {
                    if let Some(rc) = &annotation.retention {
                        if let Some(instruction) = &rc.instructions {
                            instructions_list.push(instruction.clone());
                        }
                        criteria.push(rc.clone());
                    }
                }
            }
        }
        group_retention.push(criteria);
        group_retention_instructions.push(instructions_list);
    }

    let group_texts: Vec<String> = groups
        .iter()
        .map(|g| build_messages_text_checked(store, g, custom_types))
        .collect::<Result<Vec<_>>>()?;

    let llm_params = options.llm_params.clone().unwrap_or_else(|| json!({}));

    // Optional two-stage guidance pass.
    let mut instructions = options.instructions.clone();
    let mut guidance: Option<String> = None;
    let mut guidance_source: Option<String> = None;
    if options.two_stage && client.is_none() && options.content.is_none() {
        return Err(TractError::Compression(
            "two_stage compression requires an LLM client".to_string(),
        ));
    }
    if options.two_stage && client.is_some() {
        let client = client.as_ref().unwrap();
        let all_text = group_texts.join("\n\n");
        let messages = vec![
            ChatMessage {
                role: "system".into(),
                content: prompts::COMPRESS_GUIDANCE_SYSTEM.into(),
                name: None,
                tool_call_id: None,
                tool_calls: None,
            },
            ChatMessage {
                role: "user".into(),
                content: prompts::build_compress_guidance_prompt(
                    &all_text,
                    instructions.as_deref(),
                ),
                name: None,
                tool_call_id: None,
                tool_calls: None,
            },
        ];
        let completion = client.chat(&messages, &llm_params)?;
        let text = completion.content()?;
        instructions = Some(match instructions {
            Some(existing) => format!("Guidance:\n{text}\n\n{existing}"),
            None => format!("Guidance:\n{text}"),
        });
        guidance = Some(text);
        guidance_source = Some("llm".to_string());
    }

    // Generate summaries: manual single-group text, or one LLM summary per
    // group with steering retries.
    let summaries: Vec<String> = if let Some(content) = &options.content {
        if groups.len() > 1 {
            return Err(TractError::Compression(format!(
                "Manual mode provides a single summary but PINNED commits create {} \
                 separate groups. Use LLM mode for multi-group compression, or remove \
                 PINNED annotations from interleaving commits.",
                groups.len()
            )));
        }
        vec![content.clone()]
    } else if let Some(client) = client.as_ref() {
        let mut summaries = Vec::with_capacity(groups.len());
        for (index, text) in group_texts.iter().enumerate() {
            let criteria = &group_retention[index];
            let needs_retry = options.validator.is_some()
                || criteria.iter().any(|c| !c.match_patterns.is_empty())
                || options.target_tokens.is_some();

            if needs_retry {
                let mut current_instructions = instructions.clone();
                let mut attempts = 0u32;
                let summary = loop {
                    let candidate = summarize_group(
                        client.as_ref(),
                        text,
                        options.target_tokens,
                        current_instructions.as_deref(),
                        options.system_prompt.as_deref(),
                        &group_retention_instructions[index],
                        &llm_params,
                    )?;
                    let diagnosis = validate_retention(&candidate, criteria)
                        .or_else(|| {
                            options.validator.as_ref().and_then(|v| {
                                let (ok, diagnosis) = v(&candidate);
                                (!ok).then(|| {
                                    diagnosis
                                        .unwrap_or_else(|| "summary rejected".to_string())
                                })
                            })
                        })
                        .or_else(|| {
                            options.target_tokens.and_then(|target| {
                                let actual = counter.count_text(&candidate);
                                let tolerance = options
                                    .token_tolerance
                                    .unwrap_or(DEFAULT_TOKEN_TOLERANCE);
                                (actual > target + tolerance).then(|| {
                                    format!(
                                        "Summary is ~{actual} tokens (target: {target}). \
                                         Condense to ~{target} tokens."
                                    )
                                })
                            })
                        });
                    match diagnosis {
                        None => break candidate,
                        Some(diagnosis) => {
                            attempts += 1;
                            if attempts > options.max_retries {
                                return Err(TractError::RetryExhausted {
                                    attempts,
                                    last_diagnosis: diagnosis,
                                });
                            }
                            let base = current_instructions.take().unwrap_or_default();
                            current_instructions = Some(
                                format!("{base}\n\nPrevious summary was rejected: {diagnosis}")
                                    .trim()
                                    .to_string(),
                            );
                        }
                    }
                };
                summaries.push(summary);
            } else {
                summaries.push(summarize_group(
                    client.as_ref(),
                    text,
                    options.target_tokens,
                    instructions.as_deref(),
                    options.system_prompt.as_deref(),
                    &group_retention_instructions[index],
                    &llm_params,
                )?);
            }
        }
        summaries
    } else {
        return Err(TractError::LlmConfig(
            "No LLM client configured and no manual content provided. \
             Configure a client first or pass content."
                .to_string(),
        ));
    };

    let original_tokens: usize = compressible.iter().map(|c| c.token_count).sum();
    let estimated_tokens: usize = summaries.iter().map(|s| counter.count_text(s)).sum();

    Ok(PendingCompress {
        state: PendingState::new(Some(head_hash), options.triggered_by.clone()),
        summaries,
        guidance,
        guidance_source,
        source_commits: compressible.iter().map(|c| c.commit_hash.clone()).collect(),
        preserved_commits: pinned.iter().map(|c| c.commit_hash.clone()).collect(),
        original_tokens,
        estimated_tokens,
        range,
        groups,
        pinned_hashes,
        skip_hashes,
        group_retention,
        group_retention_instructions,
        group_texts,
        branch_name,
        target_tokens: options.target_tokens,
        instructions,
        system_prompt: options.system_prompt.clone(),
        generation_config: options.generation_config.clone(),
        llm_params,
        token_tolerance: options.token_tolerance,
        manual: options.content.is_some(),
        counter,
        client,
        validator: options.validator.clone(),
    })
}

fn build_messages_text_checked(
    store: &Store,
    group: &[CommitRow],
    custom_types: &HashSet<String>,
) -> Result<String> {
    super::build_messages_text(store, group, custom_types)
}

/// Finalize an approved compression: reset the branch to the pre-range
/// parent, re-create PINNED commits with fresh parents, emit one summary
/// commit at each group's first position, and record provenance.
pub fn finalize(
    store: &Store,
    counter: &dyn TokenCounter,
    tract_id: &str,
    strict_tags: bool,
    custom_types: &HashSet<String>,
    pending: &mut PendingCompress,
) -> Result<CompressResult> {
    if pending.status() != PendingStatus::Approved {
        return Err(TractError::InvalidState(format!(
            "cannot finalize a {} compression; approve it first",
            pending.status().as_str()
        )));
    }

    // TOCTOU guard: the plan is only valid against the HEAD it saw.
    let current_head = store.refs().head(tract_id)?;
    if current_head != pending.state.planned_head {
        return Err(TractError::Compression(format!(
            "HEAD changed since compression was planned (expected {}, got {}). \
             Re-run compress() to plan against the current state.",
            pending
                .state
                .planned_head
                .as_deref()
                .map(|h| &h[..8.min(h.len())])
                .unwrap_or("none"),
            current_head
                .as_deref()
                .map(|h| &h[..8.min(h.len())])
                .unwrap_or("none"),
        )));
    }

    store.with_tx(|| {
        let engine = CommitEngine::new(store, counter, tract_id, strict_tags);

        // Reset the branch to the parent of the range.
        let pre_range_parent = pending.range[0].parent_hash.clone();
        match &pre_range_parent {
            Some(parent) => store.refs().update_head(tract_id, parent)?,
            None => {
                // Range starts at the root: drop the ref so the next
                // commit starts a fresh chain.
                if let Some(branch) = &pending.branch_name {
                    store.refs().delete_branch(tract_id, branch)?;
                } else {
                    store.refs().delete_ref(tract_id, "HEAD")?;
                }
            }
        }

        // Walk the range in order, re-creating PINNED commits and emitting
        // each group's summary at its first member's position.
        let group_first: HashMap<&str, usize> = pending
            .groups
            .iter()
            .enumerate()
            .filter_map(|(i, g)| g.first().map(|c| (c.commit_hash.as_str(), i)))
            .collect();
        let mut emitted: HashSet<usize> = HashSet::new();
        let mut summary_commits: Vec<String> = Vec::new();
        let mut summary_tokens = 0usize;
        let mut pinned_tokens = 0usize;

        for row in &pending.range {
            let hash = row.commit_hash.as_str();
            if pending.skip_hashes.contains(hash) {
                continue;
            }
            if pending.pinned_hashes.contains(hash) {
                let content = super::reconstruct_content(store, row, custom_types)?;
                let info = engine.create_commit(
                    &content,
                    CommitParams {
                        operation: row.operation,
                        message: row
                            .message
                            .clone()
                            .or_else(|| Some("Preserved pinned commit".to_string())),
                        edit_target: row.edit_target.clone(),
                        metadata: row.metadata_json.clone(),
                        generation_config: row.generation_config_json.clone(),
                        tags: vec![],
                        created_at: None,
                    },
                )?;
                pinned_tokens += info.token_count;
                continue;
            }
            if let Some(&group_index) = group_first.get(hash) {
                if emitted.insert(group_index) {
                    let summary_text = &pending.summaries[group_index];
                    let info = engine.create_commit(
                        &Content::Dialogue {
                            role: Role::Assistant,
                            text: summary_text.clone(),
                            tool_call_id: None,
                            tool_calls: None,
                        },
                        CommitParams {
                            message: Some(format!(
                                "Compressed {} commits",
                                pending.groups[group_index].len()
                            )),
                            generation_config: pending.generation_config.clone(),
                            tags: vec!["summary".to_string()],
                            ..Default::default()
                        },
                    )?;
                    summary_tokens += info.token_count;
                    summary_commits.push(info.commit_hash);
                }
            }
        }

        let new_head = store.refs().head(tract_id)?.unwrap_or_default();
        let compressed_tokens = summary_tokens + pinned_tokens;

        // Provenance.
        let compression_id = Uuid::new_v4().simple().to_string();
        let events = store.events();
        events.save_event(&OperationEventRow {
            event_id: compression_id.clone(),
            tract_id: tract_id.to_string(),
            event_type: "compress".to_string(),
            branch_name: pending.branch_name.clone(),
            created_at: Utc::now(),
            original_tokens: pending.original_tokens,
            compressed_tokens,
            params_json: Some(json!({
                "target_tokens": pending.target_tokens,
                "instructions": pending.instructions,
                "system_prompt": pending.system_prompt,
            })),
        })?;
        for (position, source) in pending.source_commits.iter().enumerate() {
            events.add_commit(&compression_id, source, "source", position)?;
        }
        for (position, result) in summary_commits.iter().enumerate() {
            events.add_commit(&compression_id, result, "result", position)?;
        }

        pending.state.mark_committed()?;
        let ratio = if pending.original_tokens > 0 {
            compressed_tokens as f64 / pending.original_tokens as f64
        } else {
            0.0
        };
        info!(
            compression_id = %compression_id,
            original = pending.original_tokens,
            compressed = compressed_tokens,
            groups = pending.groups.len(),
            "compression committed"
        );

        Ok(CompressResult {
            compression_id,
            original_tokens: pending.original_tokens,
            compressed_tokens,
            source_commits: pending.source_commits.clone(),
            summary_commits,
            preserved_commits: pending.preserved_commits.clone(),
            compression_ratio: ratio,
            new_head,
        })
    })
}
