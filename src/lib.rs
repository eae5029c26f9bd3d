//! Tract is a content-addressed, git-like version-control engine for the
//! context windows of LLM agents.
//!
//! Every message, instruction, tool call, tool result, reasoning trace, or
//! structured artifact is an immutable commit in a DAG with named branches,
//! annotations, and provenance records. Callers compile the DAG into an
//! LLM-ready message list and can branch, merge, rebase, cherry-pick,
//! compress, and garbage-collect the history.
//!
//! ```no_run
//! use tract::{Content, Role, Tract};
//!
//! # fn main() -> tract::Result<()> {
//! let mut t = Tract::open(":memory:")?;
//! t.commit(Content::instruction("You are helpful."))?;
//! t.commit(Content::dialogue(Role::User, "hi"))?;
//! let compiled = t.compile()?;
//! assert_eq!(compiled.commit_count, 2);
//! # Ok(())
//! # }
//! ```

pub mod compiler;
pub mod config;
pub mod content;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod hash;
pub mod llm;
pub mod models;
pub mod ops;
pub mod pending;
pub mod prompts;
pub mod session;
pub mod store;
pub mod tokens;
pub mod tract;

pub use compiler::CompileOptions;
pub use config::{LLMConfig, OperationConfigs, TractConfig};
pub use content::{Content, Message, ReasoningFormat, Role, SessionType, ToolCall};
pub use errors::{Result, TractError};
pub use hash::ContentHash;
pub use llm::{ChatCompletion, ChatMessage, LlmClient, ResolveAction, ResolveIssue, Resolution};
pub use models::{
    BranchInfo, CommitInfo, CommitOperation, CompiledContext, CompressResult, DiffResult,
    GCResult, ImportResult, MatchMode, MergeResult, Priority, PriorityAnnotation, RebaseResult,
    ReorderWarning, RetentionCriteria, SafetyWarning,
};
pub use ops::compress::{CompressOptions, PendingCompress};
pub use ops::gc::{GcOptions, PendingGc};
pub use ops::merge::{MergeConflict, MergeOptions, PendingMerge};
pub use ops::rebase::{PendingImport, PendingRebase};
pub use pending::{auto_retry, HookEvent, HookRejection, PendingStatus, ValidationResult};
pub use session::{Session, TractSummary};
pub use tokens::{EstimateCounter, TokenCounter, TokenUsage};
pub use tract::{
    ChatOptions, ChatResponse, CommitOptions, CompressOutcome, GcOutcome, ImportOutcome,
    InheritanceMode, MergeOutcome, Outcome, RebaseOutcome, Tract,
};
