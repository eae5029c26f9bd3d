//! Prompt templates for LLM-driven operations.
//!
//! The system prompts are replaceable at the call site; the user prompts
//! are assembled from the operation inputs.

/// System prompt for group summarization during compression.
pub const DEFAULT_SUMMARIZE_SYSTEM: &str = "\
You are a context summarizer for an AI agent's conversation history. \
You condense conversation segments into compact summaries that preserve \
facts, decisions, tool interactions, and open questions. Write plain \
prose. Do not add commentary about the summarization itself.";

/// System prompt for two-stage compression guidance.
pub const COMPRESS_GUIDANCE_SYSTEM: &str = "\
You are planning how to compress an AI agent's conversation history. \
Read the full conversation and produce short guidance for a summarizer: \
which facts, identifiers, decisions, and constraints must survive, and \
what can be dropped. Answer with the guidance only.";

/// System prompt for merge conflict resolution.
pub const DEFAULT_MERGE_SYSTEM: &str = "\
You reconcile two conflicting revisions of the same message from an AI \
agent's history. Produce a single merged text that preserves the intent \
and factual content of both sides. Answer with the merged text only.";

/// Build the user prompt for summarizing one group of messages.
pub fn build_summarize_prompt(
    messages_text: &str,
    target_tokens: Option<usize>,
    instructions: Option<&str>,
    retention_instructions: &[String],
) -> String {
    let mut prompt = format!(
        "Summarize the following conversation segment:\n\n{messages_text}\n"
    );
    if let Some(target) = target_tokens {
        prompt.push_str(&format!("\nTarget length: about {target} tokens.\n"));
    }
    if !retention_instructions.is_empty() {
        prompt.push_str("\nThe summary MUST preserve the following:\n");
        for instruction in retention_instructions {
            prompt.push_str(&format!("- {instruction}\n"));
        }
    }
    if let Some(extra) = instructions {
        if !extra.is_empty() {
            prompt.push_str(&format!("\nAdditional instructions: {extra}\n"));
        }
    }
    prompt
}

/// Build the user prompt for the two-stage guidance call.
pub fn build_compress_guidance_prompt(all_text: &str, instructions: Option<&str>) -> String {
    let mut prompt = format!(
        "The following conversation will be compressed. Produce guidance \
         for the summarizer.\n\n{all_text}\n"
    );
    if let Some(extra) = instructions {
        if !extra.is_empty() {
            prompt.push_str(&format!("\nCaller instructions: {extra}\n"));
        }
    }
    prompt
}

/// Build the user prompt for resolving one merge conflict.
pub fn build_merge_resolution_prompt(
    ancestor: Option<&str>,
    current: &str,
    incoming: &str,
    guidance: Option<&str>,
) -> String {
    let mut prompt = String::new();
    if let Some(base) = ancestor {
        prompt.push_str(&format!("Common ancestor version:\n{base}\n\n"));
    }
    prompt.push_str(&format!(
        "Current branch version:\n{current}\n\nIncoming branch version:\n{incoming}\n"
    ));
    if let Some(extra) = guidance {
        if !extra.is_empty() {
            prompt.push_str(&format!("\nGuidance: {extra}\n"));
        }
    }
    prompt
}
