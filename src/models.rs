//! Value objects exposed by the facade.
//!
//! These are the plain data types operations accept and return. Rows owned
//! by the store live in `store`; everything here is detached from the
//! database and safe to hold across mutations.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::Message;

/// The two commit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitOperation {
    #[default]
    Append,
    Edit,
}

impl CommitOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitOperation::Append => "APPEND",
            CommitOperation::Edit => "EDIT",
        }
    }
}

impl fmt::Display for CommitOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommitOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "APPEND" => Ok(CommitOperation::Append),
            "EDIT" => Ok(CommitOperation::Edit),
            other => Err(format!("Invalid commit operation: {other}")),
        }
    }
}

/// Per-commit priority steering compile and compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Pinned,
    Normal,
    Skip,
    Important,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Pinned => "PINNED",
            Priority::Normal => "NORMAL",
            Priority::Skip => "SKIP",
            Priority::Important => "IMPORTANT",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PINNED" => Ok(Priority::Pinned),
            "NORMAL" => Ok(Priority::Normal),
            "SKIP" => Ok(Priority::Skip),
            "IMPORTANT" => Ok(Priority::Important),
            other => Err(format!("Invalid priority: {other}")),
        }
    }
}

/// How retention `match_patterns` are matched against a summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Substring,
    Regex,
}

/// Deterministic post-conditions a summary must satisfy, attached to
/// IMPORTANT annotations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RetentionCriteria {
    #[serde(default)]
    pub match_patterns: Vec<String>,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Detached view of one commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    pub commit_hash: String,
    pub tract_id: String,
    pub parent_hash: Option<String>,
    pub content_hash: String,
    pub content_type: String,
    pub operation: CommitOperation,
    pub edit_target: Option<String>,
    pub message: Option<String>,
    pub token_count: usize,
    pub metadata: Option<Value>,
    pub generation_config: Option<Value>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A priority annotation row, detached.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityAnnotation {
    pub id: i64,
    pub tract_id: String,
    pub target_hash: String,
    pub priority: Priority,
    pub retention: Option<RetentionCriteria>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The compiled, LLM-ready projection of a tract.
#[derive(Debug, Clone, Default)]
pub struct CompiledContext {
    pub messages: Vec<Message>,
    pub token_count: usize,
    pub commit_count: usize,
    pub token_source: String,
    pub generation_configs: Vec<Value>,
}

/// A branch as listed by the facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub name: String,
    pub commit_hash: String,
    pub is_current: bool,
}

/// Outcome of a successful compression.
#[derive(Debug, Clone)]
pub struct CompressResult {
    pub compression_id: String,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub source_commits: Vec<String>,
    pub summary_commits: Vec<String>,
    pub preserved_commits: Vec<String>,
    pub compression_ratio: f64,
    pub new_head: String,
}

/// Outcome of a merge.
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// Merge commit when a three-way merge happened.
    pub merge_commit: Option<CommitInfo>,
    pub fast_forward: bool,
    pub already_merged: bool,
    pub conflicts_resolved: usize,
    pub new_head: String,
}

/// A semantic-safety warning raised while planning a rebase.
#[derive(Debug, Clone)]
pub struct SafetyWarning {
    pub warning_type: String,
    pub commit_hash: String,
    pub missing_target: Option<String>,
    pub description: String,
}

/// Outcome of a rebase.
#[derive(Debug, Clone, Default)]
pub struct RebaseResult {
    pub replayed_commits: Vec<CommitInfo>,
    pub original_commits: Vec<CommitInfo>,
    pub warnings: Vec<SafetyWarning>,
    pub new_head: String,
}

/// An issue raised while importing a commit.
#[derive(Debug, Clone)]
pub struct ImportIssue {
    pub issue_type: String,
    pub commit_hash: String,
    pub missing_target: Option<String>,
    pub description: String,
}

/// Outcome of an import (cherry-pick).
#[derive(Debug, Clone)]
pub struct ImportResult {
    pub original_commit: CommitInfo,
    /// None when the resolver chose to skip.
    pub new_commit: Option<CommitInfo>,
    pub issues: Vec<ImportIssue>,
}

/// Outcome of garbage collection.
#[derive(Debug, Clone, Default)]
pub struct GCResult {
    pub removed_commits: Vec<String>,
    pub removed_blobs: Vec<String>,
    pub tokens_freed: usize,
}

/// Commits unique to each side of a two-branch comparison.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    pub merge_base: Option<String>,
    pub only_ours: Vec<CommitInfo>,
    pub only_theirs: Vec<CommitInfo>,
}

/// A warning from the reorder safety check. Warnings, not errors: the
/// caller decides whether to proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorderWarning {
    pub warning_type: String,
    pub commit_hash: String,
    pub description: String,
    pub severity: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_and_priority_round_trip() {
        for op in [CommitOperation::Append, CommitOperation::Edit] {
            assert_eq!(op.as_str().parse::<CommitOperation>().unwrap(), op);
        }
        for p in [
            Priority::Pinned,
            Priority::Normal,
            Priority::Skip,
            Priority::Important,
        ] {
            assert_eq!(p.as_str().parse::<Priority>().unwrap(), p);
        }
    }

    #[test]
    fn retention_criteria_serde_defaults() {
        let rc: RetentionCriteria =
            serde_json::from_str(r#"{"match_patterns": ["budget"]}"#).unwrap();
        assert_eq!(rc.match_mode, MatchMode::Substring);
        assert!(rc.instructions.is_none());
        let back = serde_json::to_value(&rc).unwrap();
        assert_eq!(back["match_mode"], "substring");
    }
}
