//! OpenAI -> Anthropic buffered response translation
//!
//! Converts a complete (non-streaming) OpenAI Chat Completions response
//! into an Anthropic Messages object. Content becomes an ordered block
//! sequence: one text block when the message carries text, then one
//! tool_use block per tool call (or legacy function_call).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{convert_finish_reason, RequestContext};

/// Translate a buffered OpenAI response body into an Anthropic body
pub fn translate(body: &[u8], ctx: &RequestContext) -> Result<Vec<u8>> {
    let openai: OpenAiChatCompletion =
        serde_json::from_slice(body).context("failed to parse OpenAI response")?;

    let choice = openai.choices.first();
    let mut content: Vec<AnthropicContentBlock> = Vec::new();

    if let Some(choice) = choice {
        if let Some(text) = &choice.message.content {
            if !text.is_empty() {
                content.push(AnthropicContentBlock::Text { text: text.clone() });
            }
        }

        // Structured tool calls, falling back to the legacy function_call
        let calls: Vec<(String, String)> = match &choice.message.tool_calls {
            Some(tool_calls) if !tool_calls.is_empty() => tool_calls
                .iter()
                .map(|tc| (tc.function.name.clone(), tc.function.arguments.clone()))
                .collect(),
            _ => choice
                .message
                .function_call
                .as_ref()
                .map(|fc| vec![(fc.name.clone(), fc.arguments.clone())])
                .unwrap_or_default(),
        };

        for (i, (name, arguments)) in calls.iter().enumerate() {
            let input: serde_json::Value =
                serde_json::from_str(arguments).unwrap_or_else(|_| serde_json::json!({}));
            content.push(AnthropicContentBlock::ToolUse {
                id: format!("toolu_{}_{}", openai.id, i),
                name: name.clone(),
                input,
            });
        }
    }

    let stop_reason = choice
        .and_then(|c| c.finish_reason.as_deref())
        .map(convert_finish_reason);

    // Non-standard field some backends set; defaults to null
    let stop_sequence = choice.and_then(|c| c.stop_sequence.clone());

    let usage = openai
        .usage
        .as_ref()
        .map(|u| AnthropicUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or(AnthropicUsage {
            input_tokens: 0,
            output_tokens: 0,
        });

    let anthropic = AnthropicResponse {
        id: format!("msg_{}", openai.id.replace("chatcmpl-", "")),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: ctx.original_model.clone(),
        stop_reason,
        stop_sequence,
        usage,
    };

    serde_json::to_vec(&anthropic).context("failed to serialize Anthropic response")
}

// ============================================================================
// OpenAI Response Types (Input - Deserialize)
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenAiChatCompletion {
    id: String,
    /// Some backends omit this field
    #[serde(default)]
    #[allow(dead_code)]
    object: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    created: Option<u64>,
    #[serde(default)]
    #[allow(dead_code)]
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[allow(dead_code)]
    #[serde(default)]
    index: u32,
    message: OpenAiMessage,
    finish_reason: Option<String>,
    /// Not standard OpenAI; carried when a backend sets it
    #[serde(default)]
    stop_sequence: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[allow(dead_code)]
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    /// Legacy single-call form
    #[serde(default)]
    function_call: Option<OpenAiFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    #[allow(dead_code)]
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    #[serde(default)]
    #[allow(dead_code)]
    call_type: Option<String>,
    function: OpenAiFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[allow(dead_code)]
    #[serde(default)]
    total_tokens: u32,
}

// ============================================================================
// Anthropic Response Types (Output - Serialize)
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicResponse {
    id: String,
    #[serde(rename = "type")]
    response_type: String,
    role: String,
    content: Vec<AnthropicContentBlock>,
    model: String,
    stop_reason: Option<String>,
    stop_sequence: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
