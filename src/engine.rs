//! The commit engine: turns content into blob + commit rows and moves HEAD.
//!
//! The commit hash is a pure function of the immutable fields:
//! sha256(canonical_json({tract_id, parent, content_hash, operation,
//! edit_target, metadata, generation_config, created_at})). Committing the
//! same content on the same parent at the same instant therefore yields
//! the same hash, and the store treats the duplicate insert as a no-op.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;

use crate::content::Content;
use crate::errors::{Result, TractError};
use crate::hash::{canonical_string, ContentHash};
use crate::models::{CommitInfo, CommitOperation};
use crate::store::{BlobRow, CommitRow, Store};
use crate::tokens::TokenCounter;

/// Optional fields for a new commit.
#[derive(Debug, Clone, Default)]
pub struct CommitParams {
    pub operation: CommitOperation,
    pub message: Option<String>,
    pub edit_target: Option<String>,
    pub metadata: Option<Value>,
    pub generation_config: Option<Value>,
    /// Explicit tags, unioned with auto-classified ones.
    pub tags: Vec<String>,
    /// Override the commit timestamp (rewrites replaying history).
    pub created_at: Option<DateTime<Utc>>,
}

pub struct CommitEngine<'a> {
    store: &'a Store,
    counter: &'a dyn TokenCounter,
    tract_id: &'a str,
    strict_tags: bool,
}

impl<'a> CommitEngine<'a> {
    pub fn new(
        store: &'a Store,
        counter: &'a dyn TokenCounter,
        tract_id: &'a str,
        strict_tags: bool,
    ) -> Self {
        Self {
            store,
            counter,
            tract_id,
            strict_tags,
        }
    }

    /// Create a commit from content, parented at the current HEAD, and
    /// advance HEAD to it.
    pub fn create_commit(&self, content: &Content, params: CommitParams) -> Result<CommitInfo> {
        if params.operation == CommitOperation::Edit && params.edit_target.is_none() {
            return Err(TractError::ContentValidation(
                "EDIT commits require an edit_target".to_string(),
            ));
        }
        if let Some(target) = &params.edit_target {
            if self.store.commits().get(target)?.is_none() {
                return Err(TractError::CommitNotFound(target.clone()));
            }
        }

        // Tags: auto-classified plus explicit, deduplicated in order.
        let mut tags = content.auto_tags(params.operation == CommitOperation::Edit);
        for tag in &params.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        if self.strict_tags {
            let annotations = self.store.annotations();
            for tag in &tags {
                if !annotations.is_registered(self.tract_id, tag)? {
                    return Err(TractError::TagNotRegistered(tag.clone()));
                }
            }
        }

        // Blob first: the commit must never reference a missing payload.
        let payload = content.to_payload();
        let payload_json = canonical_string(&payload);
        let content_hash = ContentHash::of_canonical_json(&payload);
        let token_count = self.counter.count_text(&payload_json);
        let mut created_at = params.created_at.unwrap_or_else(Utc::now);

        let parent_hash = self.store.refs().head(self.tract_id)?;
        // Mutations appear in created_at order within a tract; nudge past
        // the parent when the clock has not advanced a full microsecond.
        if let Some(parent) = &parent_hash {
            if let Some(parent_row) = self.store.commits().get(parent)? {
                if parent_row.created_at >= created_at {
                    created_at = parent_row.created_at + chrono::Duration::microseconds(1);
                }
            }
        }

        let blob = BlobRow {
            content_hash: content_hash.to_string(),
            byte_size: payload_json.len(),
            payload_json,
            token_count,
            created_at,
        };

        let commit_hash = compute_commit_hash(
            self.tract_id,
            parent_hash.as_deref(),
            content_hash.as_str(),
            params.operation,
            params.edit_target.as_deref(),
            params.metadata.as_ref(),
            params.generation_config.as_ref(),
            &created_at,
        );

        let row = CommitRow {
            commit_hash: commit_hash.clone(),
            tract_id: self.tract_id.to_string(),
            parent_hash,
            content_hash: content_hash.to_string(),
            content_type: content.content_type().to_string(),
            operation: params.operation,
            edit_target: params.edit_target,
            message: params.message,
            token_count,
            metadata_json: params.metadata,
            generation_config_json: params.generation_config,
            tags_json: tags,
            created_at,
        };

        self.store.blobs().save_if_absent(&blob)?;
        self.store.commits().save(&row)?;
        self.store.refs().update_head(self.tract_id, &commit_hash)?;
        debug!(
            commit = %&commit_hash[..8],
            content_type = %row.content_type,
            operation = %row.operation,
            "created commit"
        );

        Ok(row_to_info(&row))
    }
}

/// Compute the commit hash over the immutable fields.
#[allow(clippy::too_many_arguments)]
pub fn compute_commit_hash(
    tract_id: &str,
    parent: Option<&str>,
    content_hash: &str,
    operation: CommitOperation,
    edit_target: Option<&str>,
    metadata: Option<&Value>,
    generation_config: Option<&Value>,
    created_at: &DateTime<Utc>,
) -> String {
    let input = json!({
        "tract_id": tract_id,
        "parent": parent,
        "content_hash": content_hash,
        "operation": operation.as_str(),
        "edit_target": edit_target,
        "metadata": metadata,
        "generation_config": generation_config,
        "created_at": crate::store::ts_to_sql(created_at),
    });
    ContentHash::of_canonical_json(&input).to_string()
}

/// Detach a commit row into the caller-facing `CommitInfo`.
pub fn row_to_info(row: &CommitRow) -> CommitInfo {
    CommitInfo {
        commit_hash: row.commit_hash.clone(),
        tract_id: row.tract_id.clone(),
        parent_hash: row.parent_hash.clone(),
        content_hash: row.content_hash.clone(),
        content_type: row.content_type.clone(),
        operation: row.operation,
        edit_target: row.edit_target.clone(),
        message: row.message.clone(),
        token_count: row.token_count,
        metadata: row.metadata_json.clone(),
        generation_config: row.generation_config_json.clone(),
        tags: row.tags_json.clone(),
        created_at: row.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Role;
    use crate::tokens::EstimateCounter;

    fn engine_store() -> Store {
        let store = Store::open(":memory:").unwrap();
        store.annotations().seed_registry("t").unwrap();
        store
    }

    #[test]
    fn commit_hash_is_deterministic() {
        let now = Utc::now();
        let a = compute_commit_hash("t", None, "abc", CommitOperation::Append, None, None, None, &now);
        let b = compute_commit_hash("t", None, "abc", CommitOperation::Append, None, None, None, &now);
        assert_eq!(a, b);
        let c = compute_commit_hash("t2", None, "abc", CommitOperation::Append, None, None, None, &now);
        assert_ne!(a, c);
    }

    #[test]
    fn create_commit_saves_blob_and_moves_head() {
        let store = engine_store();
        let counter = EstimateCounter;
        let engine = CommitEngine::new(&store, &counter, "t", true);

        let info = engine
            .create_commit(
                &Content::dialogue(Role::User, "hi"),
                CommitParams::default(),
            )
            .unwrap();
        assert_eq!(store.refs().head("t").unwrap().unwrap(), info.commit_hash);
        assert!(store.blobs().get(&info.content_hash).unwrap().is_some());
        assert!(info.parent_hash.is_none());

        let second = engine
            .create_commit(
                &Content::dialogue(Role::Assistant, "hello"),
                CommitParams::default(),
            )
            .unwrap();
        assert_eq!(second.parent_hash.as_deref(), Some(info.commit_hash.as_str()));
    }

    #[test]
    fn identical_payloads_share_one_blob() {
        let store = engine_store();
        let counter = EstimateCounter;
        let engine = CommitEngine::new(&store, &counter, "t", true);
        let content = Content::dialogue(Role::User, "same");
        let a = engine.create_commit(&content, CommitParams::default()).unwrap();
        let b = engine.create_commit(&content, CommitParams::default()).unwrap();
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.commit_hash, b.commit_hash); // different parents

        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM blobs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn strict_tags_reject_unregistered() {
        let store = engine_store();
        let counter = EstimateCounter;
        let engine = CommitEngine::new(&store, &counter, "t", true);
        let err = engine
            .create_commit(
                &Content::dialogue(Role::User, "x"),
                CommitParams {
                    tags: vec!["unregistered".to_string()],
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, TractError::TagNotRegistered(_)));
    }

    #[test]
    fn edit_requires_existing_target() {
        let store = engine_store();
        let counter = EstimateCounter;
        let engine = CommitEngine::new(&store, &counter, "t", true);
        let err = engine
            .create_commit(
                &Content::dialogue(Role::Assistant, "v2"),
                CommitParams {
                    operation: CommitOperation::Edit,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, TractError::ContentValidation(_)));
    }
}
