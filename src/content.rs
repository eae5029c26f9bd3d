//! The sealed content model for commits.
//!
//! Every commit stores exactly one `Content` value. Serialization uses an
//! explicit `content_type` tag so stored payloads stay stable across crate
//! versions; the codec is written out by hand (rather than derived) so that
//! the storage format is an explicit contract, the same way the object
//! codecs in a git object store spell out their wire format.
//!
//! Custom content types are allowed but must be registered on the owning
//! `Tract` before the first commit that uses them.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::{Result, TractError};
use crate::hash;

/// Chat role of a projected message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("Invalid role: {other}")),
        }
    }
}

/// A tool call requested by an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Format in which reasoning text was captured from an LLM response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningFormat {
    /// Provider returned a structured `reasoning` field.
    Parsed,
    /// Provider returned a `reasoning_content` field.
    ReasoningContent,
    /// Anthropic-style `content[type=thinking]` block.
    Anthropic,
    /// Inline `<think>...</think>` tags stripped from the content.
    ThinkTags,
}

impl ReasoningFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningFormat::Parsed => "parsed",
            ReasoningFormat::ReasoningContent => "reasoning_content",
            ReasoningFormat::Anthropic => "anthropic",
            ReasoningFormat::ThinkTags => "think_tags",
        }
    }
}

/// Kind of session boundary recorded by a `Content::Session` commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Start,
    End,
    Checkpoint,
    Merge,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Start => "start",
            SessionType::End => "end",
            SessionType::Checkpoint => "checkpoint",
            SessionType::Merge => "merge",
        }
    }
}

/// The sealed sum of everything a commit can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// A chat turn: user, assistant, or system dialogue.
    Dialogue {
        role: Role,
        text: String,
        tool_call_id: Option<String>,
        tool_calls: Option<Vec<ToolCall>>,
    },
    /// A standing instruction (system prompt material).
    Instruction { text: String },
    /// A reasoning trace captured from a model response.
    Reasoning {
        text: String,
        format: ReasoningFormat,
    },
    /// Output of a tool invocation.
    ToolResult {
        call_id: String,
        name: String,
        output: String,
    },
    /// A structured artifact (plan, table, document fragment).
    Artifact {
        artifact_type: String,
        content: Value,
    },
    /// A session boundary with an optional summary.
    Session {
        session_type: SessionType,
        summary: String,
        decisions: Vec<String>,
        next_steps: Vec<String>,
    },
    /// An arbitrary JSON payload with no further interpretation.
    Freeform { payload: Value },
    /// A caller-registered custom type.
    Custom { type_name: String, payload: Value },
}

impl Content {
    /// Convenience constructor for a plain dialogue turn.
    pub fn dialogue(role: Role, text: impl Into<String>) -> Self {
        Content::Dialogue {
            role,
            text: text.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Convenience constructor for an instruction.
    pub fn instruction(text: impl Into<String>) -> Self {
        Content::Instruction { text: text.into() }
    }

    /// The storage discriminator for this content.
    pub fn content_type(&self) -> &str {
        match self {
            Content::Dialogue { .. } => "dialogue",
            Content::Instruction { .. } => "instruction",
            Content::Reasoning { .. } => "reasoning",
            Content::ToolResult { .. } => "tool_result",
            Content::Artifact { .. } => "artifact",
            Content::Session { .. } => "session",
            Content::Freeform { .. } => "freeform",
            Content::Custom { type_name, .. } => type_name,
        }
    }

    /// Serialize to the tagged storage payload.
    pub fn to_payload(&self) -> Value {
        match self {
            Content::Dialogue {
                role,
                text,
                tool_call_id,
                tool_calls,
            } => {
                let mut map = Map::new();
                map.insert("content_type".into(), json!("dialogue"));
                map.insert("role".into(), json!(role));
                map.insert("text".into(), json!(text));
                if let Some(id) = tool_call_id {
                    map.insert("tool_call_id".into(), json!(id));
                }
                if let Some(calls) = tool_calls {
                    map.insert("tool_calls".into(), json!(calls));
                }
                Value::Object(map)
            }
            Content::Instruction { text } => {
                json!({"content_type": "instruction", "text": text})
            }
            Content::Reasoning { text, format } => {
                json!({"content_type": "reasoning", "text": text, "format": format})
            }
            Content::ToolResult {
                call_id,
                name,
                output,
            } => {
                json!({
                    "content_type": "tool_result",
                    "call_id": call_id,
                    "name": name,
                    "output": output,
                })
            }
            Content::Artifact {
                artifact_type,
                content,
            } => {
                json!({
                    "content_type": "artifact",
                    "artifact_type": artifact_type,
                    "content": content,
                })
            }
            Content::Session {
                session_type,
                summary,
                decisions,
                next_steps,
            } => {
                json!({
                    "content_type": "session",
                    "session_type": session_type,
                    "summary": summary,
                    "decisions": decisions,
                    "next_steps": next_steps,
                })
            }
            Content::Freeform { payload } => {
                json!({"content_type": "freeform", "payload": payload})
            }
            Content::Custom { type_name, payload } => {
                json!({"content_type": type_name, "payload": payload})
            }
        }
    }

    /// Deserialize from a tagged storage payload.
    ///
    /// `custom_types` is the set of registered custom discriminators; an
    /// unknown tag outside that set is a validation error.
    pub fn from_payload(value: &Value, custom_types: &HashSet<String>) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| TractError::ContentValidation("payload is not an object".into()))?;
        let tag = obj
            .get("content_type")
            .and_then(Value::as_str)
            .ok_or_else(|| TractError::ContentValidation("missing content_type tag".into()))?;

        let text_field = |key: &str| -> Result<String> {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| {
                    TractError::ContentValidation(format!("{tag}: missing `{key}` field"))
                })
        };

        match tag {
            "dialogue" => {
                let role: Role = text_field("role")?
                    .parse()
                    .map_err(TractError::ContentValidation)?;
                let tool_calls = match obj.get("tool_calls") {
                    Some(v) => Some(serde_json::from_value::<Vec<ToolCall>>(v.clone())?),
                    None => None,
                };
                Ok(Content::Dialogue {
                    role,
                    text: text_field("text")?,
                    tool_call_id: obj
                        .get("tool_call_id")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    tool_calls,
                })
            }
            "instruction" => Ok(Content::Instruction {
                text: text_field("text")?,
            }),
            "reasoning" => {
                let format = obj
                    .get("format")
                    .cloned()
                    .unwrap_or_else(|| json!("parsed"));
                Ok(Content::Reasoning {
                    text: text_field("text")?,
                    format: serde_json::from_value(format)?,
                })
            }
            "tool_result" => Ok(Content::ToolResult {
                call_id: text_field("call_id")?,
                name: text_field("name")?,
                output: text_field("output")?,
            }),
            "artifact" => Ok(Content::Artifact {
                artifact_type: text_field("artifact_type")?,
                content: obj.get("content").cloned().unwrap_or(Value::Null),
            }),
            "session" => {
                let session_type = obj
                    .get("session_type")
                    .cloned()
                    .ok_or_else(|| {
                        TractError::ContentValidation("session: missing session_type".into())
                    })?;
                let list_field = |key: &str| -> Vec<String> {
                    obj.get(key)
                        .and_then(Value::as_array)
                        .map(|a| {
                            a.iter()
                                .filter_map(Value::as_str)
                                .map(str::to_owned)
                                .collect()
                        })
                        .unwrap_or_default()
                };
                Ok(Content::Session {
                    session_type: serde_json::from_value(session_type)?,
                    summary: text_field("summary")?,
                    decisions: list_field("decisions"),
                    next_steps: list_field("next_steps"),
                })
            }
            "freeform" => Ok(Content::Freeform {
                payload: obj.get("payload").cloned().unwrap_or(Value::Null),
            }),
            other if custom_types.contains(other) => Ok(Content::Custom {
                type_name: other.to_owned(),
                payload: obj.get("payload").cloned().unwrap_or(Value::Null),
            }),
            other => Err(TractError::ContentValidation(format!(
                "Unknown content type `{other}`. Register it with register_content_type()."
            ))),
        }
    }

    /// Project this content into a message role plus text.
    ///
    /// Reasoning projects as assistant; whether it survives compilation is
    /// the compiler's decision, not this function's.
    pub fn project(&self) -> (Role, String, Option<String>) {
        match self {
            Content::Dialogue {
                role,
                text,
                tool_call_id: _,
                tool_calls: _,
            } => (*role, text.clone(), None),
            Content::Instruction { text } => (Role::System, text.clone(), None),
            Content::Reasoning { text, .. } => (Role::Assistant, text.clone(), None),
            Content::ToolResult { name, output, .. } => {
                (Role::Tool, output.clone(), Some(name.clone()))
            }
            Content::Session {
                session_type,
                summary,
                decisions,
                next_steps,
            } => {
                let mut lines = vec![format!("[session:{}] {}", session_type.as_str(), summary)];
                for d in decisions {
                    lines.push(format!("decision: {d}"));
                }
                for n in next_steps {
                    lines.push(format!("next: {n}"));
                }
                (Role::System, lines.join("\n"), None)
            }
            Content::Artifact { content, .. } => {
                (Role::User, hash::canonical_string(content), None)
            }
            Content::Freeform { payload } | Content::Custom { payload, .. } => {
                (Role::User, hash::canonical_string(payload), None)
            }
        }
    }

    /// Immutable tags assigned automatically at commit time.
    ///
    /// An assistant dialogue that requested tool calls classifies as
    /// `tool_call`; one that did not classifies as `reasoning`.
    pub fn auto_tags(&self, is_edit: bool) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        match self {
            Content::Instruction { .. } => tags.push("instruction".into()),
            Content::Dialogue {
                role: Role::Assistant,
                tool_calls,
                ..
            } => {
                if tool_calls.as_ref().is_some_and(|c| !c.is_empty()) {
                    tags.push("tool_call".into());
                } else {
                    tags.push("reasoning".into());
                }
            }
            Content::Reasoning { .. } => tags.push("reasoning".into()),
            Content::ToolResult { .. } => tags.push("tool_result".into()),
            Content::Session { .. } => tags.push("observation".into()),
            _ => {}
        }
        if is_edit {
            tags.push("revision".into());
        }
        tags
    }
}

/// A single LLM-ready message produced by compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_custom() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn dialogue_round_trips_through_payload() {
        let content = Content::Dialogue {
            role: Role::Assistant,
            text: "hello".into(),
            tool_call_id: None,
            tool_calls: Some(vec![ToolCall {
                id: "call_1".into(),
                name: "grep".into(),
                arguments: json!({"pattern": "error"}),
            }]),
        };
        let payload = content.to_payload();
        let back = Content::from_payload(&payload, &no_custom()).unwrap();
        assert_eq!(content, back);
    }

    #[test]
    fn instruction_projects_as_system() {
        let content = Content::instruction("You are helpful.");
        let (role, text, name) = content.project();
        assert_eq!(role, Role::System);
        assert_eq!(text, "You are helpful.");
        assert!(name.is_none());
    }

    #[test]
    fn tool_result_projects_with_name() {
        let content = Content::ToolResult {
            call_id: "call_9".into(),
            name: "grep".into(),
            output: "3 matches".into(),
        };
        let (role, text, name) = content.project();
        assert_eq!(role, Role::Tool);
        assert_eq!(text, "3 matches");
        assert_eq!(name.as_deref(), Some("grep"));
    }

    #[test]
    fn unknown_type_rejected_unless_registered() {
        let payload = json!({"content_type": "metric", "payload": {"latency_ms": 12}});
        assert!(Content::from_payload(&payload, &no_custom()).is_err());

        let mut registry = HashSet::new();
        registry.insert("metric".to_string());
        let content = Content::from_payload(&payload, &registry).unwrap();
        assert!(matches!(content, Content::Custom { ref type_name, .. } if type_name == "metric"));
    }

    #[test]
    fn auto_tags_classify_assistant_turns() {
        let with_calls = Content::Dialogue {
            role: Role::Assistant,
            text: "checking".into(),
            tool_call_id: None,
            tool_calls: Some(vec![ToolCall {
                id: "c1".into(),
                name: "ls".into(),
                arguments: Value::Null,
            }]),
        };
        assert_eq!(with_calls.auto_tags(false), vec!["tool_call"]);

        let plain = Content::dialogue(Role::Assistant, "done");
        assert_eq!(plain.auto_tags(false), vec!["reasoning"]);
        assert_eq!(plain.auto_tags(true), vec!["reasoning", "revision"]);
    }

    #[test]
    fn session_round_trip_and_projection() {
        let content = Content::Session {
            session_type: SessionType::End,
            summary: "wrapped up".into(),
            decisions: vec!["ship it".into()],
            next_steps: vec![],
        };
        let back = Content::from_payload(&content.to_payload(), &no_custom()).unwrap();
        assert_eq!(content, back);
        let (role, text, _) = content.project();
        assert_eq!(role, Role::System);
        assert!(text.contains("[session:end] wrapped up"));
        assert!(text.contains("decision: ship it"));
    }
}
