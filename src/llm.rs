//! Consumed LLM client interface.
//!
//! The engine only needs a `chat(messages, params) -> completion` callable.
//! Response parsing is deliberately tolerant: completions are plain JSON in
//! the OpenAI chat shape, and reasoning extraction auto-detects the four
//! formats providers actually emit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::{Message, ReasoningFormat};
use crate::errors::{Result, TractError};
use crate::tokens::TokenUsage;

/// Wire-shape message sent to a client. `Message` covers the common case;
/// tool plumbing fields ride along when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
}

impl From<&Message> for ChatMessage {
    fn from(m: &Message) -> Self {
        ChatMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
            name: m.name.clone(),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

/// An OpenAI-shaped chat completion, kept as raw JSON plus typed accessors.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub raw: Value,
}

impl ChatCompletion {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    /// The first choice's message object.
    fn message(&self) -> Option<&Value> {
        self.raw.get("choices")?.get(0)?.get("message")
    }

    /// Assistant text content of the first choice.
    pub fn content(&self) -> Result<String> {
        self.message()
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                TractError::Llm("response has no choices[0].message.content".to_string())
            })
    }

    /// Tool calls requested by the first choice, if any.
    pub fn tool_calls(&self) -> Option<&Value> {
        self.message()?.get("tool_calls")
    }

    /// Normalized token usage, if the provider reported any.
    pub fn usage(&self) -> Option<TokenUsage> {
        self.raw
            .get("usage")
            .and_then(|u| TokenUsage::from_value(u).ok())
    }

    /// Model identifier echoed by the provider.
    pub fn model(&self) -> Option<&str> {
        self.raw.get("model").and_then(Value::as_str)
    }
}

/// The one callable the core consumes.
pub trait LlmClient: Send + Sync {
    /// `params` is a flat JSON object of generation parameters
    /// (the serialized resolved `LLMConfig`).
    fn chat(&self, messages: &[ChatMessage], params: &Value) -> Result<ChatCompletion>;
}

/// Extract a reasoning trace from a completion.
///
/// Detection priority: `message.reasoning` -> `message.reasoning_content`
/// -> Anthropic-style `content[type=thinking].thinking` -> inline
/// `<think>...</think>` tags.
pub fn extract_reasoning(completion: &ChatCompletion) -> Option<(String, ReasoningFormat)> {
    let message = completion
        .raw
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))?;

    if let Some(text) = message.get("reasoning").and_then(Value::as_str) {
        if !text.is_empty() {
            return Some((text.to_owned(), ReasoningFormat::Parsed));
        }
    }
    if let Some(text) = message.get("reasoning_content").and_then(Value::as_str) {
        if !text.is_empty() {
            return Some((text.to_owned(), ReasoningFormat::ReasoningContent));
        }
    }
    // Anthropic block shape: content is an array of typed blocks.
    if let Some(blocks) = message.get("content").and_then(Value::as_array) {
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("thinking") {
                if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                    return Some((text.to_owned(), ReasoningFormat::Anthropic));
                }
            }
        }
    }
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        if let (Some(start), Some(end)) = (text.find("<think>"), text.find("</think>")) {
            if end > start {
                let inner = text[start + "<think>".len()..end].trim().to_owned();
                if !inner.is_empty() {
                    return Some((inner, ReasoningFormat::ThinkTags));
                }
            }
        }
    }
    None
}

/// Strip inline `<think>` blocks from assistant text after reasoning has
/// been extracted separately.
pub fn strip_think_tags(text: &str) -> String {
    match (text.find("<think>"), text.find("</think>")) {
        (Some(start), Some(end)) if end > start => {
            let mut out = String::with_capacity(text.len());
            out.push_str(&text[..start]);
            out.push_str(&text[end + "</think>".len()..]);
            out.trim().to_string()
        }
        _ => text.to_string(),
    }
}

/// What a resolver is asked to resolve during merge/rebase/import.
#[derive(Debug, Clone)]
pub struct ResolveIssue {
    /// Machine-readable kind, e.g. `edit_target_missing`, `edit_conflict`.
    pub issue_type: String,
    /// Hash of the commit at the center of the issue.
    pub commit_hash: String,
    /// Human-readable description.
    pub description: String,
    /// Current-side text, when the issue is a content conflict.
    pub content_a: Option<String>,
    /// Incoming-side text, when the issue is a content conflict.
    pub content_b: Option<String>,
}

/// Resolver verdict for one issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAction {
    Resolved,
    Skip,
    Abort,
}

/// A resolver's answer.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub action: ResolveAction,
    pub content_text: Option<String>,
    pub reasoning: Option<String>,
}

impl Resolution {
    pub fn resolved(text: impl Into<String>) -> Self {
        Self {
            action: ResolveAction::Resolved,
            content_text: Some(text.into()),
            reasoning: None,
        }
    }

    pub fn skip() -> Self {
        Self {
            action: ResolveAction::Skip,
            content_text: None,
            reasoning: None,
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            action: ResolveAction::Abort,
            content_text: None,
            reasoning: Some(reason.into()),
        }
    }
}

/// Caller-supplied issue resolver.
pub type Resolver = Box<dyn FnMut(&ResolveIssue) -> Resolution + Send>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn completion(message: Value) -> ChatCompletion {
        ChatCompletion::new(json!({"choices": [{"message": message}]}))
    }

    #[test]
    fn extracts_parsed_reasoning_first() {
        let c = completion(json!({
            "content": "answer",
            "reasoning": "step by step",
            "reasoning_content": "ignored",
        }));
        let (text, format) = extract_reasoning(&c).unwrap();
        assert_eq!(text, "step by step");
        assert_eq!(format, ReasoningFormat::Parsed);
    }

    #[test]
    fn extracts_reasoning_content_second() {
        let c = completion(json!({"content": "answer", "reasoning_content": "trace"}));
        let (text, format) = extract_reasoning(&c).unwrap();
        assert_eq!(text, "trace");
        assert_eq!(format, ReasoningFormat::ReasoningContent);
    }

    #[test]
    fn extracts_anthropic_thinking_blocks() {
        let c = completion(json!({
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "answer"},
            ]
        }));
        let (text, format) = extract_reasoning(&c).unwrap();
        assert_eq!(text, "hmm");
        assert_eq!(format, ReasoningFormat::Anthropic);
    }

    #[test]
    fn extracts_think_tags_last() {
        let c = completion(json!({"content": "<think>quietly</think>loudly"}));
        let (text, format) = extract_reasoning(&c).unwrap();
        assert_eq!(text, "quietly");
        assert_eq!(format, ReasoningFormat::ThinkTags);
        assert_eq!(strip_think_tags("<think>quietly</think>loudly"), "loudly");
    }

    #[test]
    fn no_reasoning_yields_none() {
        let c = completion(json!({"content": "plain"}));
        assert!(extract_reasoning(&c).is_none());
    }

    #[test]
    fn completion_accessors() {
        let c = ChatCompletion::new(json!({
            "choices": [{"message": {"content": "hi"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12},
            "model": "test-model",
        }));
        assert_eq!(c.content().unwrap(), "hi");
        assert_eq!(c.usage().unwrap().prompt_tokens, 10);
        assert_eq!(c.model(), Some("test-model"));
    }
}
