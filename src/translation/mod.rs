//! Dialect translation - Anthropic Messages <-> OpenAI Chat Completions
//!
//! The backend only speaks OpenAI Chat Completions; Anthropic-dialect
//! clients are served by translating in both directions:
//!
//! ```text
//! Client request (Anthropic Messages)
//!     |
//! request::translate  -> OpenAI Chat Completions + RequestContext
//!     |
//! [reverse proxy to the backend]
//!     |
//! response::translate (buffered)  or  stream::AnthropicStreamTranslator (SSE)
//!     |
//! Client response (Anthropic Messages)
//! ```
//!
//! The `RequestContext` produced during request translation carries what
//! response translation needs: the caller's model name, the streaming
//! flag, and the translated messages for token accounting.

pub mod request;
pub mod response;
pub mod stream;

/// Options applied during request translation
#[derive(Debug, Clone)]
pub struct TranslateOptions {
    /// The model id actually served; caller-supplied names are overwritten
    pub active_model: String,

    /// Safety cap for max_tokens
    pub max_tokens_cap: u32,

    /// Prune conversations above this many messages
    pub context_prune_threshold: usize,
}

/// Context carried from request translation to response translation
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Model name the client asked for (echoed back in responses)
    pub original_model: String,

    /// Whether the client requested SSE streaming
    pub streaming: bool,

    /// Translated OpenAI messages, kept for input token counting
    pub messages: Vec<serde_json::Value>,
}

/// OpenAI finish_reason -> Anthropic stop_reason
///
/// Unknown values pass through unchanged rather than degrading to
/// `end_turn`; a new backend value is better surfaced than masked.
pub fn convert_finish_reason(finish_reason: &str) -> String {
    match finish_reason {
        "stop" => "end_turn".to_string(),
        "length" => "max_tokens".to_string(),
        "tool_calls" | "function_call" => "tool_use".to_string(),
        other => other.to_string(),
    }
}

/// Format an Anthropic SSE event: `event: <type>\ndata: <json>\n\n`
pub fn format_sse_event<T: serde::Serialize>(event_type: &str, data: &T) -> Vec<u8> {
    match serde_json::to_string(data) {
        Ok(json) => format!("event: {}\ndata: {}\n\n", event_type, json).into_bytes(),
        Err(e) => {
            tracing::error!("failed to serialize {} event: {}", event_type, e);
            Vec::new()
        }
    }
}
