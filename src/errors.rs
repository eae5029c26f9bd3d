//! Error types for the Tract crate.
//!
//! This module defines a unified error enumeration used across the blob and
//! commit stores, ref handling, compilation, compression, merge/rebase, and
//! garbage collection. It integrates with `thiserror` to provide rich
//! `Display` implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Validation, not-found, constraint, and rewrite-failure families map to
//!   the facade-level errors callers are expected to match on.
//! - Structural invariant violations (a parent row pointing at a commit that
//!   does not exist mid-walk) are programmer errors and panic instead.

use thiserror::Error;

/// Unified error enumeration for the Tract library.
#[derive(Error, Debug)]
pub enum TractError {
    /// Branch name failed git-style validation.
    #[error("Invalid branch name: `{0}`")]
    InvalidBranchName(String),

    /// Content payload failed validation or refers to an unregistered type.
    #[error("Content validation failed: {0}")]
    ContentValidation(String),

    /// A tag was used that is not present in the tag registry (strict mode).
    #[error("Tag `{0}` is not registered. Register it with register_tag() or disable strict_tags.")]
    TagNotRegistered(String),

    /// A commit-hash prefix matched more than one commit.
    #[error("Ambiguous commit prefix `{prefix}`: matches {candidates:?}")]
    AmbiguousPrefix {
        prefix: String,
        candidates: Vec<String>,
    },

    /// Commit hash not present in the store.
    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    /// Named branch does not exist.
    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    /// Operation requires an attached HEAD.
    #[error("HEAD is detached: {0}")]
    DetachedHead(String),

    /// Branch already exists.
    #[error("Branch already exists: {0}")]
    BranchExists(String),

    /// Branch carries commits unreachable from any other branch.
    #[error("Branch `{0}` has unmerged commits. Use force to delete anyway.")]
    UnmergedBranch(String),

    /// Import (cherry-pick) could not complete.
    #[error("Import failed: {0}")]
    ImportCommit(String),

    /// Compression planning or finalization failed.
    #[error("Compression failed: {0}")]
    Compression(String),

    /// Rebase planning or replay failed.
    #[error("Rebase failed: {0}")]
    Rebase(String),

    /// Semantic safety warnings were raised and no resolver was supplied.
    #[error("Semantic safety check failed: {0}")]
    SemanticSafety(String),

    /// A validate-and-retry loop ran out of attempts.
    #[error("Retry exhausted after {attempts} attempt(s): {last_diagnosis}")]
    RetryExhausted {
        attempts: u32,
        last_diagnosis: String,
    },

    /// An LLM parameter was supplied but no client is configured.
    #[error("LLM not configured: {0}")]
    LlmConfig(String),

    /// The LLM client returned an error or a malformed response.
    #[error("LLM call failed: {0}")]
    Llm(String),

    /// A pending operation was driven through an invalid state transition.
    #[error("Invalid pending-operation state: {0}")]
    InvalidState(String),

    /// Merge could not complete.
    #[error("Merge failed: {0}")]
    Merge(String),

    /// Garbage collection failed.
    #[error("GC failed: {0}")]
    Gc(String),

    /// Underlying SQLite error.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, TractError>;
