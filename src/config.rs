//! Tract and LLM configuration.
//!
//! `LLMConfig` is the generation-parameter bundle recorded on commits and
//! resolved for every LLM call. Its serde round-trip is part of the public
//! contract: recognized aliases collapse (`stop` -> `stop_sequences`,
//! `max_completion_tokens` -> `max_tokens`), API plumbing keys are dropped,
//! and anything unrecognized survives in `extra` and is forwarded verbatim
//! to the client.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Keys that belong to the request envelope, not the generation config.
const PLUMBING_KEYS: &[&str] = &["messages", "tools", "stream", "response_format"];

/// LLM generation parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LLMConfig {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u64>,
    pub stop_sequences: Option<Vec<String>>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub top_k: Option<u64>,
    pub seed: Option<i64>,
    /// Unrecognized keys, forwarded verbatim (e.g. `reasoning_effort`).
    pub extra: BTreeMap<String, Value>,
}

impl LLMConfig {
    pub fn is_empty(&self) -> bool {
        *self == LLMConfig::default()
    }

    /// Serialize to a flat JSON object. `None` fields are omitted; `extra`
    /// keys are inlined at the top level.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(v) = &self.model {
            map.insert("model".into(), Value::String(v.clone()));
        }
        if let Some(v) = self.temperature {
            map.insert("temperature".into(), json_f64(v));
        }
        if let Some(v) = self.top_p {
            map.insert("top_p".into(), json_f64(v));
        }
        if let Some(v) = self.max_tokens {
            map.insert("max_tokens".into(), Value::from(v));
        }
        if let Some(v) = &self.stop_sequences {
            map.insert(
                "stop_sequences".into(),
                Value::Array(v.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(v) = self.frequency_penalty {
            map.insert("frequency_penalty".into(), json_f64(v));
        }
        if let Some(v) = self.presence_penalty {
            map.insert("presence_penalty".into(), json_f64(v));
        }
        if let Some(v) = self.top_k {
            map.insert("top_k".into(), Value::from(v));
        }
        if let Some(v) = self.seed {
            map.insert("seed".into(), Value::from(v));
        }
        for (k, v) in &self.extra {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }

    /// Parse from a flat JSON object, collapsing aliases and dropping
    /// plumbing keys.
    pub fn from_value(value: &Value) -> Self {
        let mut config = LLMConfig::default();
        let Some(obj) = value.as_object() else {
            return config;
        };
        for (key, v) in obj {
            match key.as_str() {
                "model" => config.model = v.as_str().map(str::to_owned),
                "temperature" => config.temperature = v.as_f64(),
                "top_p" => config.top_p = v.as_f64(),
                "max_tokens" | "max_completion_tokens" => config.max_tokens = v.as_u64(),
                "stop_sequences" | "stop" => {
                    config.stop_sequences = parse_stop(v);
                }
                "frequency_penalty" => config.frequency_penalty = v.as_f64(),
                "presence_penalty" => config.presence_penalty = v.as_f64(),
                "top_k" => config.top_k = v.as_u64(),
                "seed" => config.seed = v.as_i64(),
                k if PLUMBING_KEYS.contains(&k) => {}
                other => {
                    config.extra.insert(other.to_owned(), v.clone());
                }
            }
        }
        config
    }

    /// Overlay `overrides` on top of `self`. Set fields in `overrides` win;
    /// `extra` maps are merged key-by-key with overrides winning.
    pub fn merged_with(&self, overrides: &LLMConfig) -> LLMConfig {
        let mut extra = self.extra.clone();
        for (k, v) in &overrides.extra {
            extra.insert(k.clone(), v.clone());
        }
        LLMConfig {
            model: overrides.model.clone().or_else(|| self.model.clone()),
            temperature: overrides.temperature.or(self.temperature),
            top_p: overrides.top_p.or(self.top_p),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            stop_sequences: overrides
                .stop_sequences
                .clone()
                .or_else(|| self.stop_sequences.clone()),
            frequency_penalty: overrides.frequency_penalty.or(self.frequency_penalty),
            presence_penalty: overrides.presence_penalty.or(self.presence_penalty),
            top_k: overrides.top_k.or(self.top_k),
            seed: overrides.seed.or(self.seed),
            extra,
        }
    }
}

fn json_f64(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn parse_stop(v: &Value) -> Option<Vec<String>> {
    match v {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
        ),
        _ => None,
    }
}

/// Per-operation LLM configuration overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationConfigs {
    pub chat: Option<LLMConfig>,
    pub compress: Option<LLMConfig>,
    pub merge: Option<LLMConfig>,
}

/// Top-level tract configuration.
#[derive(Debug, Clone)]
pub struct TractConfig {
    /// SQLite path; `":memory:"` for in-memory.
    pub db_path: String,
    /// Optional compile-time token budget.
    pub max_tokens: Option<usize>,
    /// Identifier of the tokenizer encoding in use.
    pub tokenizer_encoding: String,
    /// Whether `chat()` commits reasoning traces as Reasoning commits.
    pub commit_reasoning: bool,
    /// Whether unregistered tags are rejected at commit time.
    pub strict_tags: bool,
    /// GC eligibility window for unreachable commits, in days.
    pub orphan_retention_days: i64,
    /// Per-operation generation config defaults.
    pub operations: OperationConfigs,
    /// Tract-wide generation config default.
    pub default_llm: LLMConfig,
}

impl Default for TractConfig {
    fn default() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            max_tokens: None,
            tokenizer_encoding: "chars".to_string(),
            commit_reasoning: false,
            strict_tags: true,
            orphan_retention_days: 7,
            operations: OperationConfigs::default(),
            default_llm: LLMConfig::default(),
        }
    }
}

impl TractConfig {
    /// Resolve the effective LLM config for one operation.
    ///
    /// Chain (weakest first): tract default, operation config, `llm_config`
    /// argument, call-site overrides.
    pub fn resolve_llm(
        &self,
        operation: &str,
        llm_config: Option<&LLMConfig>,
        call_site: Option<&LLMConfig>,
    ) -> LLMConfig {
        let mut resolved = self.default_llm.clone();
        let op_config = match operation {
            "chat" => self.operations.chat.as_ref(),
            "compress" => self.operations.compress.as_ref(),
            "merge" => self.operations.merge.as_ref(),
            _ => None,
        };
        if let Some(op) = op_config {
            resolved = resolved.merged_with(op);
        }
        if let Some(cfg) = llm_config {
            resolved = resolved.merged_with(cfg);
        }
        if let Some(cs) = call_site {
            resolved = resolved.merged_with(cs);
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_preserves_fields() {
        let config = LLMConfig {
            model: Some("gpt-4o".into()),
            temperature: Some(0.7),
            max_tokens: Some(2048),
            stop_sequences: Some(vec!["END".into()]),
            seed: Some(42),
            ..Default::default()
        };
        assert_eq!(LLMConfig::from_value(&config.to_value()), config);
    }

    #[test]
    fn aliases_collapse() {
        let config = LLMConfig::from_value(&json!({
            "stop": ["STOP"],
            "max_completion_tokens": 512,
        }));
        assert_eq!(config.stop_sequences, Some(vec!["STOP".to_string()]));
        assert_eq!(config.max_tokens, Some(512));
        assert!(config.extra.is_empty());
    }

    #[test]
    fn stop_accepts_bare_string() {
        let config = LLMConfig::from_value(&json!({"stop": "DONE"}));
        assert_eq!(config.stop_sequences, Some(vec!["DONE".to_string()]));
    }

    #[test]
    fn plumbing_keys_dropped_unknown_keys_kept() {
        let config = LLMConfig::from_value(&json!({
            "messages": [],
            "stream": true,
            "reasoning_effort": "high",
            "temperature": 0.2,
        }));
        assert_eq!(config.temperature, Some(0.2));
        assert!(!config.extra.contains_key("messages"));
        assert!(!config.extra.contains_key("stream"));
        assert_eq!(config.extra.get("reasoning_effort"), Some(&json!("high")));
    }

    #[test]
    fn merged_with_prefers_overrides() {
        let base = LLMConfig {
            model: Some("base-model".into()),
            temperature: Some(0.1),
            ..Default::default()
        };
        let over = LLMConfig {
            temperature: Some(0.9),
            ..Default::default()
        };
        let merged = base.merged_with(&over);
        assert_eq!(merged.model.as_deref(), Some("base-model"));
        assert_eq!(merged.temperature, Some(0.9));
    }

    #[test]
    fn resolution_chain_orders_correctly() {
        let mut config = TractConfig::default();
        config.default_llm.model = Some("default".into());
        config.default_llm.temperature = Some(0.0);
        config.operations.chat = Some(LLMConfig {
            model: Some("chat-model".into()),
            ..Default::default()
        });
        let arg = LLMConfig {
            temperature: Some(0.5),
            ..Default::default()
        };
        let call_site = LLMConfig {
            temperature: Some(1.0),
            ..Default::default()
        };

        let resolved = config.resolve_llm("chat", Some(&arg), Some(&call_site));
        assert_eq!(resolved.model.as_deref(), Some("chat-model"));
        assert_eq!(resolved.temperature, Some(1.0));
    }
}
