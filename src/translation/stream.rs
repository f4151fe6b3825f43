//! OpenAI SSE -> Anthropic SSE streaming translation
//!
//! Consumes OpenAI-format chunks from the backend and emits the scripted
//! Anthropic event sequence:
//!
//! ```text
//! message_start
//! content_block_start(0, text)
//! [content_block_delta(0, text_delta)]*
//! [per tool call: content_block_start(k, tool_use)
//!                 [content_block_delta(k, input_json_delta)]*
//!                 content_block_stop(k)]
//! content_block_stop(0)
//! message_delta(stop_reason, usage)
//! message_stop
//! ```
//!
//! The block indices are an API contract: text is always 0, tool-use
//! blocks take 1..N in order of first appearance. Usage is only ever sent
//! in the final `message_delta` right before `message_stop` - clients
//! terminate early when usage arrives mid-stream.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{convert_finish_reason, format_sse_event, RequestContext};
use crate::tokens::TokenTracker;

/// Per-request translation state machine
pub struct AnthropicStreamTranslator {
    /// Caller's model name, echoed in message_start
    model: String,

    /// Buffer for SSE lines split across chunk boundaries
    line_buffer: String,

    message_start_sent: bool,
    text_block_stop_sent: bool,

    /// OpenAI tool index -> per-call state
    tool_states: BTreeMap<usize, ToolCallState>,

    /// OpenAI index of the tool block currently open, if any
    open_tool: Option<usize>,

    /// Next Anthropic block index for a new tool call (text holds 0)
    next_block_index: u32,

    has_any_tool_call: bool,
    last_finish_reason: Option<String>,
    tracker: TokenTracker,
    done: bool,
}

#[derive(Debug)]
struct ToolCallState {
    block_index: u32,
    closed: bool,
}

impl AnthropicStreamTranslator {
    pub fn new(ctx: &RequestContext) -> Self {
        Self {
            model: ctx.original_model.clone(),
            line_buffer: String::new(),
            message_start_sent: false,
            text_block_stop_sent: false,
            tool_states: BTreeMap::new(),
            open_tool: None,
            next_block_index: 1,
            has_any_tool_call: false,
            last_finish_reason: None,
            tracker: TokenTracker::new(&ctx.original_model, &ctx.messages),
            done: false,
        }
    }

    /// Feed backend bytes; returns Anthropic SSE bytes to forward
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.done {
            return Vec::new();
        }

        self.line_buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut output = Vec::new();
        while let Some(newline) = self.line_buffer.find('\n') {
            let line = self.line_buffer[..newline].trim().to_string();
            self.line_buffer.drain(..=newline);

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };

            if data == "[DONE]" {
                output.extend(self.finish_events());
                self.done = true;
                break;
            }

            match serde_json::from_str::<OpenAiStreamChunk>(data) {
                Ok(parsed) => output.extend(self.translate_chunk(&parsed)),
                Err(e) => tracing::debug!("skipping unparseable backend chunk: {}", e),
            }
        }
        output
    }

    /// Flush terminal events if the stream ended without `[DONE]`
    pub fn finish(&mut self) -> Vec<u8> {
        if self.done || !self.message_start_sent {
            return Vec::new();
        }
        self.done = true;
        self.finish_events()
    }

    fn translate_chunk(&mut self, chunk: &OpenAiStreamChunk) -> Vec<u8> {
        let mut output = Vec::new();

        if !self.message_start_sent {
            output.extend(self.message_start(chunk));
        }

        let Some(choice) = chunk.choices.first() else {
            return output;
        };

        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                self.tracker.push_output(content);
                output.extend(format_sse_event(
                    "content_block_delta",
                    &ContentBlockDeltaEvent {
                        event_type: "content_block_delta",
                        index: 0,
                        delta: ContentDelta::TextDelta {
                            text: content.clone(),
                        },
                    },
                ));
            }
        }

        if let Some(tool_calls) = &choice.delta.tool_calls {
            for tc in tool_calls {
                output.extend(self.translate_tool_delta(chunk, tc));
            }
        }

        if let Some(finish_reason) = &choice.finish_reason {
            self.last_finish_reason = Some(finish_reason.clone());
            // Close the open tool block; the text block closes at [DONE]
            output.extend(self.close_open_tool());
        }

        output
    }

    fn translate_tool_delta(
        &mut self,
        chunk: &OpenAiStreamChunk,
        tc: &OpenAiToolCallDelta,
    ) -> Vec<u8> {
        let mut output = Vec::new();
        let is_new = !self.tool_states.contains_key(&tc.index);

        if is_new {
            // A new tool call seals the previous one
            output.extend(self.close_open_tool());

            let block_index = self.next_block_index;
            self.next_block_index += 1;
            self.tool_states.insert(
                tc.index,
                ToolCallState {
                    block_index,
                    closed: false,
                },
            );
            self.open_tool = Some(tc.index);
            self.has_any_tool_call = true;

            let id = tc
                .id
                .clone()
                .unwrap_or_else(|| format!("toolu_{}_{}", chunk.id, tc.index));
            let name = tc
                .function
                .as_ref()
                .and_then(|f| f.name.clone())
                .unwrap_or_default();

            output.extend(format_sse_event(
                "content_block_start",
                &ContentBlockStartEvent {
                    event_type: "content_block_start",
                    index: block_index,
                    content_block: ContentBlockPayload::ToolUse {
                        id,
                        name,
                        input: serde_json::json!({}),
                    },
                },
            ));
        }

        if let Some(args) = tc.function.as_ref().and_then(|f| f.arguments.as_ref()) {
            if !args.is_empty() {
                let block_index = self.tool_states[&tc.index].block_index;
                output.extend(format_sse_event(
                    "content_block_delta",
                    &ContentBlockDeltaEvent {
                        event_type: "content_block_delta",
                        index: block_index,
                        delta: ContentDelta::InputJsonDelta {
                            partial_json: args.clone(),
                        },
                    },
                ));
            }
        }

        output
    }

    fn close_open_tool(&mut self) -> Vec<u8> {
        let Some(open) = self.open_tool.take() else {
            return Vec::new();
        };
        let state = self.tool_states.get_mut(&open).expect("open tool tracked");
        if state.closed {
            return Vec::new();
        }
        state.closed = true;
        format_sse_event(
            "content_block_stop",
            &ContentBlockStopEvent {
                event_type: "content_block_stop",
                index: state.block_index,
            },
        )
    }

    fn message_start(&mut self, chunk: &OpenAiStreamChunk) -> Vec<u8> {
        self.message_start_sent = true;
        let mut output = format_sse_event(
            "message_start",
            &MessageStartEvent {
                event_type: "message_start",
                message: MessageStartPayload {
                    id: format!("msg_{}", chunk.id.replace("chatcmpl-", "")),
                    msg_type: "message",
                    role: "assistant",
                    content: vec![],
                    model: self.model.clone(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: Usage {
                        input_tokens: 0,
                        output_tokens: 0,
                    },
                },
            },
        );
        // The text block always occupies index 0
        output.extend(format_sse_event(
            "content_block_start",
            &ContentBlockStartEvent {
                event_type: "content_block_start",
                index: 0,
                content_block: ContentBlockPayload::Text {
                    text: String::new(),
                },
            },
        ));
        output
    }

    fn finish_events(&mut self) -> Vec<u8> {
        let mut output = Vec::new();

        // Seal any tool block the backend left open
        output.extend(self.close_open_tool());

        if !self.text_block_stop_sent {
            self.text_block_stop_sent = true;
            output.extend(format_sse_event(
                "content_block_stop",
                &ContentBlockStopEvent {
                    event_type: "content_block_stop",
                    index: 0,
                },
            ));
        }

        let stop_reason = if self.has_any_tool_call {
            "tool_use".to_string()
        } else {
            self.last_finish_reason
                .as_deref()
                .map(convert_finish_reason)
                .unwrap_or_else(|| "end_turn".to_string())
        };

        // Usage only now, right before message_stop
        output.extend(format_sse_event(
            "message_delta",
            &MessageDeltaEvent {
                event_type: "message_delta",
                delta: MessageDelta {
                    stop_reason,
                    stop_sequence: None,
                },
                usage: Usage {
                    input_tokens: self.tracker.input_tokens(),
                    output_tokens: self.tracker.output_tokens(),
                },
            },
        ));

        output.extend(b"event: message_stop\ndata: {}\n\n".as_slice());
        output
    }
}

// ============================================================================
// OpenAI Stream Types (Input - Deserialize)
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    #[allow(dead_code)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[allow(dead_code)]
    #[serde(default)]
    index: u32,
    #[serde(default)]
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    #[allow(dead_code)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

// ============================================================================
// Anthropic Event Types (Output - Serialize)
// ============================================================================

#[derive(Debug, Serialize)]
struct MessageStartEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    message: MessageStartPayload,
}

#[derive(Debug, Serialize)]
struct MessageStartPayload {
    id: String,
    #[serde(rename = "type")]
    msg_type: &'static str,
    role: &'static str,
    content: Vec<serde_json::Value>,
    model: String,
    stop_reason: Option<String>,
    stop_sequence: Option<String>,
    usage: Usage,
}

#[derive(Debug, Serialize)]
struct ContentBlockStartEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    index: u32,
    content_block: ContentBlockPayload,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentBlockPayload {
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
struct ContentBlockDeltaEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    index: u32,
    delta: ContentDelta,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Serialize)]
struct ContentBlockStopEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    index: u32,
}

#[derive(Debug, Serialize)]
struct MessageDeltaEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    delta: MessageDelta,
    usage: Usage,
}

#[derive(Debug, Serialize)]
struct MessageDelta {
    stop_reason: String,
    stop_sequence: Option<String>,
}

#[derive(Debug, Serialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}
