//! Anthropic -> OpenAI request translation
//!
//! Converts Anthropic Messages API requests to OpenAI Chat Completions
//! format before they reach the backend.
//!
//! # Key mappings
//!
//! | Anthropic                       | OpenAI                           |
//! |---------------------------------|----------------------------------|
//! | `model` (any)                   | the configured active model id   |
//! | Top-level `system` field        | leading `role: "system"` message |
//! | `tool_use` content block        | `tool_calls` on the same message |
//! | `tool_result` content block     | separate `role: "tool"` message  |
//! | `tool_choice.type: "any"`       | `"required"`                     |
//! | `stop_sequences` (array)        | `stop`                           |
//!
//! The caller's model name is always overwritten with the active id so
//! external tooling can hard-code whatever name it likes. Long
//! conversations are pruned to a bounded window before forwarding.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{RequestContext, TranslateOptions};

/// Translate an Anthropic Messages body into an OpenAI Chat Completions body
pub fn translate(body: &[u8], opts: &TranslateOptions) -> Result<(Vec<u8>, RequestContext)> {
    let anthropic: AnthropicRequest = serde_json::from_slice(body).map_err(|e| {
        let preview = String::from_utf8_lossy(&body[..body.len().min(300)]);
        tracing::debug!("unparseable Anthropic request: {} | {}", e, preview);
        anyhow::anyhow!("failed to parse Anthropic request: {}", e)
    })?;

    let mut messages: Vec<OpenAiMessage> = Vec::new();

    // Prepend system message if present
    if let Some(system) = &anthropic.system {
        let text = system.flatten();
        if !text.is_empty() {
            messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: Some(text),
                tool_calls: None,
                tool_call_id: None,
            });
        }
    }

    for msg in &anthropic.messages {
        messages.extend(convert_message(msg));
    }

    let pruned = prune_messages(messages, opts.context_prune_threshold);

    let openai = OpenAiChatRequest {
        // The caller's name is advisory; the backend serves one model
        model: opts.active_model.clone(),
        messages: pruned,
        max_tokens: anthropic.max_tokens.map(|t| t.min(opts.max_tokens_cap)),
        temperature: anthropic.temperature,
        top_p: anthropic.top_p,
        stop: anthropic.stop_sequences.clone(),
        stream: anthropic.stream,
        tools: anthropic
            .tools
            .map(|tools| tools.into_iter().map(convert_tool).collect()),
        tool_choice: anthropic.tool_choice.map(convert_tool_choice),
    };

    let translated = serde_json::to_vec(&openai).context("failed to serialize OpenAI request")?;

    let messages_json = openai
        .messages
        .iter()
        .map(|m| serde_json::to_value(m).unwrap_or_default())
        .collect();

    tracing::debug!(
        "translated Anthropic request: model {:?} -> {:?}, {} message(s)",
        anthropic.model,
        openai.model,
        openai.messages.len()
    );

    Ok((
        translated,
        RequestContext {
            original_model: anthropic.model,
            streaming: anthropic.stream.unwrap_or(false),
            messages: messages_json,
        },
    ))
}

/// Bound the conversation before forwarding
///
/// Above the threshold, keep a leading system message (when present) plus
/// the most recent N-1 messages. Clients get no indication.
fn prune_messages(mut messages: Vec<OpenAiMessage>, threshold: usize) -> Vec<OpenAiMessage> {
    if threshold == 0 || messages.len() <= threshold {
        return messages;
    }
    let original = messages.len();

    let head = if messages.first().map(|m| m.role == "system").unwrap_or(false) {
        Some(messages.remove(0))
    } else {
        None
    };

    let keep = threshold - 1;
    let tail = messages.split_off(messages.len().saturating_sub(keep));
    let pruned: Vec<OpenAiMessage> = head.into_iter().chain(tail).collect();

    tracing::debug!(
        "pruned {} message(s) from long conversation",
        original - pruned.len()
    );
    pruned
}

// ============================================================================
// Anthropic Request Types (Input - Deserialize)
// ============================================================================

#[derive(Debug, Deserialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    #[serde(default)]
    system: Option<SystemPrompt>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(default)]
    tool_choice: Option<AnthropicToolChoice>,
    // Ignored fields
    #[serde(default)]
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    #[allow(dead_code)]
    top_k: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

impl SystemPrompt {
    fn flatten(&self) -> String {
        match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    SystemBlock::Text { text } => text.as_str(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SystemBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

#[derive(Debug, Deserialize)]
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
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultContent>,
    },
    // Extended thinking blocks are dropped; the backend has no slot for them
    #[serde(rename = "thinking")]
    Thinking {
        #[allow(dead_code)]
        thinking: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ToolResultContent {
    Text(String),
    Blocks(Vec<ToolResultBlock>),
}

impl ToolResultContent {
    fn flatten(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ToolResultBlock::Text { text } => text.as_str(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ToolResultBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicToolChoice {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "tool")]
    Tool { name: String },
}

// ============================================================================
// OpenAI Request Types (Output - Serialize)
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<OpenAiToolChoice>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAiToolChoice {
    Mode(String), // "auto", "required"
    Specific {
        #[serde(rename = "type")]
        choice_type: String,
        function: ToolChoiceFunction,
    },
}

#[derive(Debug, Serialize)]
struct ToolChoiceFunction {
    name: String,
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// Convert one Anthropic message to OpenAI form
///
/// A single Anthropic message may produce multiple OpenAI messages:
/// tool_result blocks become separate `role: "tool"` messages.
fn convert_message(msg: &AnthropicMessage) -> Vec<OpenAiMessage> {
    match &msg.content {
        AnthropicContent::Text(text) => vec![OpenAiMessage {
            role: msg.role.clone(),
            content: Some(text.clone()),
            tool_calls: None,
            tool_call_id: None,
        }],
        AnthropicContent::Blocks(blocks) => {
            let mut messages: Vec<OpenAiMessage> = Vec::new();
            let mut text_parts: Vec<String> = Vec::new();
            let mut tool_calls: Vec<OpenAiToolCall> = Vec::new();

            for block in blocks {
                match block {
                    AnthropicContentBlock::Text { text } => {
                        text_parts.push(text.clone());
                    }
                    AnthropicContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(OpenAiToolCall {
                            id: id.clone(),
                            call_type: "function".to_string(),
                            function: OpenAiFunctionCall {
                                name: name.clone(),
                                arguments: serde_json::to_string(input).unwrap_or_default(),
                            },
                        });
                    }
                    AnthropicContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } => {
                        messages.push(OpenAiMessage {
                            role: "tool".to_string(),
                            content: Some(
                                content.as_ref().map(|c| c.flatten()).unwrap_or_default(),
                            ),
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id.clone()),
                        });
                    }
                    AnthropicContentBlock::Thinking { .. } => {}
                }
            }

            // The main message with text and/or tool calls leads; tool
            // results follow it.
            if !text_parts.is_empty() || !tool_calls.is_empty() {
                messages.insert(
                    0,
                    OpenAiMessage {
                        role: msg.role.clone(),
                        content: if text_parts.is_empty() {
                            None
                        } else {
                            Some(text_parts.join("\n"))
                        },
                        tool_calls: if tool_calls.is_empty() {
                            None
                        } else {
                            Some(tool_calls)
                        },
                        tool_call_id: None,
                    },
                );
            }

            if messages.is_empty() {
                messages.push(OpenAiMessage {
                    role: msg.role.clone(),
                    content: Some(String::new()),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }

            messages
        }
    }
}

fn convert_tool(tool: AnthropicTool) -> OpenAiTool {
    OpenAiTool {
        tool_type: "function".to_string(),
        function: OpenAiFunction {
            name: tool.name,
            description: tool.description,
            parameters: tool.input_schema,
        },
    }
}

fn convert_tool_choice(choice: AnthropicToolChoice) -> OpenAiToolChoice {
    match choice {
        AnthropicToolChoice::Auto => OpenAiToolChoice::Mode("auto".to_string()),
        AnthropicToolChoice::Any => OpenAiToolChoice::Mode("required".to_string()),
        AnthropicToolChoice::Tool { name } => OpenAiToolChoice::Specific {
            choice_type: "function".to_string(),
            function: ToolChoiceFunction { name },
        },
    }
}
