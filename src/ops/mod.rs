//! Long-running operations: compression, merge, rebase/import, GC.
//!
//! Each operation plans into a `Pending*` value (see `pending`), which the
//! facade routes: back to the caller for review, through a registered hook
//! handler, or straight to auto-approval and finalization.

pub mod compress;
pub mod gc;
pub mod merge;
pub mod rebase;

use std::collections::HashSet;

use crate::content::Content;
use crate::errors::{Result, TractError};
use crate::store::{CommitRow, Store};

/// Reload and validate a commit's content from its blob.
pub(crate) fn reconstruct_content(
    store: &Store,
    row: &CommitRow,
    custom_types: &HashSet<String>,
) -> Result<Content> {
    let blob = store.blobs().get(&row.content_hash)?.ok_or_else(|| {
        TractError::CommitNotFound(format!(
            "blob {} for commit {} is missing",
            row.content_hash, row.commit_hash
        ))
    })?;
    let payload = serde_json::from_str(&blob.payload_json)?;
    Content::from_payload(&payload, custom_types)
}

/// Render a role label enriched with tool metadata, for summarization and
/// conflict prompts. Examples: `[assistant]`,
/// `[assistant (calls: grep(pattern=error))]`, `[tool:grep (call_id=c1)]`.
pub(crate) fn build_role_label(content: &Content) -> String {
    match content {
        Content::Dialogue {
            role,
            tool_calls: Some(calls),
            ..
        } if !calls.is_empty() => {
            let rendered: Vec<String> = calls
                .iter()
                .map(|c| {
                    let args = c
                        .arguments
                        .as_object()
                        .filter(|o| !o.is_empty())
                        .map(|o| {
                            o.iter()
                                .map(|(k, v)| format!("{k}={}", truncate_value(v)))
                                .collect::<Vec<_>>()
                                .join(", ")
                        });
                    match args {
                        Some(args) => format!("{}({args})", c.name),
                        None => c.name.clone(),
                    }
                })
                .collect();
            format!("[{role} (calls: {})]", rendered.join(", "))
        }
        Content::ToolResult { call_id, name, .. } => {
            format!("[tool:{name} (call_id={call_id})]")
        }
        other => {
            let (role, _, _) = other.project();
            format!("[{role}]")
        }
    }
}

/// Build the role-labelled text block for a run of commits.
pub(crate) fn build_messages_text(
    store: &Store,
    group: &[CommitRow],
    custom_types: &HashSet<String>,
) -> Result<String> {
    let mut parts: Vec<String> = Vec::with_capacity(group.len());
    let mut unavailable = 0usize;
    for row in group {
        match reconstruct_content(store, row, custom_types) {
            Ok(content) => {
                let label = build_role_label(&content);
                let (_, text, _) = content.project();
                parts.push(format!("{label}: {text}"));
            }
            Err(_) => {
                tracing::warn!(commit = %row.commit_hash, "content unavailable");
                parts.push("[content unavailable]".to_string());
                unavailable += 1;
            }
        }
    }
    if unavailable == group.len() {
        return Err(TractError::Compression(format!(
            "All {} commits in group have unavailable content",
            group.len()
        )));
    }
    Ok(parts.join("\n\n"))
}

fn truncate_value(value: &serde_json::Value) -> String {
    let raw = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    const MAX: usize = 60;
    if raw.chars().count() > MAX {
        let truncated: String = raw.chars().take(MAX - 3).collect();
        format!("{truncated}...")
    } else {
        raw
    }
}

/// Extract plain text from content for conflict resolution.
pub(crate) fn content_text(content: &Content) -> String {
    let (_, text, _) = content.project();
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{Role, ToolCall};
    use serde_json::json;

    #[test]
    fn role_labels_cover_tool_shapes() {
        let plain = Content::dialogue(Role::User, "hi");
        assert_eq!(build_role_label(&plain), "[user]");

        let calling = Content::Dialogue {
            role: Role::Assistant,
            text: "checking".into(),
            tool_call_id: None,
            tool_calls: Some(vec![ToolCall {
                id: "c1".into(),
                name: "grep".into(),
                arguments: json!({"pattern": "error"}),
            }]),
        };
        assert_eq!(
            build_role_label(&calling),
            "[assistant (calls: grep(pattern=error))]"
        );

        let result = Content::ToolResult {
            call_id: "c1".into(),
            name: "grep".into(),
            output: "3 matches".into(),
        };
        assert_eq!(build_role_label(&result), "[tool:grep (call_id=c1)]");
    }

    #[test]
    fn long_argument_values_truncate() {
        let long = "x".repeat(100);
        let calling = Content::Dialogue {
            role: Role::Assistant,
            text: String::new(),
            tool_call_id: None,
            tool_calls: Some(vec![ToolCall {
                id: "c".into(),
                name: "write".into(),
                arguments: json!({"body": long}),
            }]),
        };
        let label = build_role_label(&calling);
        assert!(label.contains("..."));
        assert!(label.len() < 100);
    }
}
