//! Token accounting for streamed usage reporting
//!
//! The backend's streaming responses carry no usage block, so the final
//! `message_delta.usage` on the Anthropic path is computed here: input from
//! the request messages, output from the accumulated text deltas.
//!
//! Counting uses a BPE tokenizer keyed by model family and falls back to a
//! character-based estimator (chars/4) when no tokenizer matches. The
//! estimator is deliberately rough; exact numbers only ever come from a
//! tokenizer.

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

/// Per-message serialization overhead, tokens. Chat templates wrap every
/// message in role markers and separators.
const MESSAGE_OVERHEAD: u32 = 4;

/// Reply priming overhead, tokens.
const REPLY_PRIMING: u32 = 2;

fn bpe_for_family(model: &str) -> Option<&'static CoreBPE> {
    static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();
    static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();

    let lower = model.to_lowercase();
    // Newer model families ship the o200k vocabulary; everything else that
    // we can serve tokenizes close enough to cl100k.
    if lower.contains("gpt-4o") || lower.contains("o1") || lower.contains("o3") {
        O200K
            .get_or_init(|| tiktoken_rs::o200k_base().ok())
            .as_ref()
    } else {
        CL100K
            .get_or_init(|| tiktoken_rs::cl100k_base().ok())
            .as_ref()
    }
}

/// Count tokens in a text fragment
///
/// BPE when available, chars/4 estimate otherwise.
pub fn count_text(model: &str, text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    match bpe_for_family(model) {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        None => estimate_tokens(text),
    }
}

/// Character-based fallback estimator (~4 chars per token for English)
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let chars = text.chars().count() as u32;
    (chars / 4).max(1)
}

/// Count input tokens over a messages array (OpenAI shape)
///
/// Sums role and content text per message plus template overhead. Tool
/// call arguments count as content; non-string content parts are counted
/// through their JSON serialization.
pub fn count_messages(model: &str, messages: &[serde_json::Value]) -> u32 {
    let mut total = REPLY_PRIMING;
    for msg in messages {
        total += MESSAGE_OVERHEAD;
        if let Some(role) = msg.get("role").and_then(|v| v.as_str()) {
            total += count_text(model, role);
        }
        match msg.get("content") {
            Some(serde_json::Value::String(s)) => total += count_text(model, s),
            Some(serde_json::Value::Array(parts)) => {
                for part in parts {
                    total += count_text(model, &part.to_string());
                }
            }
            _ => {}
        }
        if let Some(tool_calls) = msg.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tool_calls {
                total += count_text(model, &tc.to_string());
            }
        }
    }
    total
}

/// Running token tracker for one streamed response
#[derive(Debug)]
pub struct TokenTracker {
    model: String,
    input_tokens: u32,
    output_text: String,
}

impl TokenTracker {
    /// Create a tracker, counting the request's input messages up front
    pub fn new(model: &str, messages: &[serde_json::Value]) -> Self {
        Self {
            model: model.to_string(),
            input_tokens: count_messages(model, messages),
            output_text: String::new(),
        }
    }

    /// Accumulate an output text delta
    pub fn push_output(&mut self, text: &str) {
        self.output_text.push_str(text);
    }

    pub fn input_tokens(&self) -> u32 {
        self.input_tokens
    }

    /// Output token count over everything pushed so far
    pub fn output_tokens(&self) -> u32 {
        count_text(&self.model, &self.output_text)
    }
}
