//! Pluggable token counting.
//!
//! The engine never talks to a tokenizer directly; everything goes through
//! the `TokenCounter` trait so callers can plug a real BPE tokenizer. The
//! built-in `EstimateCounter` uses the usual ~4-chars-per-token heuristic.
//! Any `source()` not starting with `api:` is treated as an estimate by
//! display layers.

use serde_json::Value;

use crate::content::Message;
use crate::errors::{Result, TractError};

/// Counts tokens for text and message arrays.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> usize;

    /// Count a message array, including per-message formatting overhead.
    fn count_messages(&self, messages: &[Message]) -> usize;

    /// Stable identifier for where counts come from,
    /// e.g. `estimate:chars` or `tiktoken:cl100k_base`.
    fn source(&self) -> String;
}

/// Character-based token estimator. Roughly 4 chars per token, with a
/// fixed per-message overhead to approximate chat formatting tokens.
#[derive(Debug, Default, Clone)]
pub struct EstimateCounter;

const CHARS_PER_TOKEN: usize = 4;
const PER_MESSAGE_OVERHEAD: usize = 4;

impl TokenCounter for EstimateCounter {
    fn count_text(&self, text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }

    fn count_messages(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| {
                let mut n = PER_MESSAGE_OVERHEAD + self.count_text(&m.content);
                if let Some(name) = &m.name {
                    n += self.count_text(name);
                }
                n
            })
            .sum()
    }

    fn source(&self) -> String {
        "estimate:chars".to_string()
    }
}

/// API-reported token usage, normalized across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl TokenUsage {
    /// The token_source string recorded for API-reported counts.
    pub fn source(&self) -> String {
        format!("api:{}+{}", self.prompt_tokens, self.completion_tokens)
    }

    /// Normalize a provider usage object.
    ///
    /// Accepts OpenAI shape (`prompt_tokens`/`completion_tokens`) and
    /// Anthropic shape (`input_tokens`/`output_tokens`).
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            TractError::ContentValidation("usage must be a JSON object".to_string())
        })?;
        let get = |key: &str| obj.get(key).and_then(Value::as_u64).unwrap_or(0) as usize;

        if obj.contains_key("prompt_tokens") {
            Ok(Self {
                prompt_tokens: get("prompt_tokens"),
                completion_tokens: get("completion_tokens"),
                total_tokens: get("total_tokens"),
            })
        } else if obj.contains_key("input_tokens") {
            let prompt = get("input_tokens");
            let completion = get("output_tokens");
            Ok(Self {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
            })
        } else {
            Err(TractError::ContentValidation(format!(
                "Unrecognized usage format. Expected `prompt_tokens` (OpenAI) or \
                 `input_tokens` (Anthropic). Got keys: {:?}",
                obj.keys().collect::<Vec<_>>()
            )))
        }
    }
}
