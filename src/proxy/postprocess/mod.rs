// SSE post-processor for the backend's token stream
//
// The backend sometimes emits tool calls as structured `delta.tool_calls`
// and sometimes as XML embedded in `delta.content`. Under tensor-parallel
// serving, structured tool-call fragments can arrive multiple times, once
// per parallel worker. This processor sits between the backend and
// everything downstream and normalizes both problems:
//
// - XML mode: once a content stream looks like an XML tool call, chunks
//   are buffered until `[DONE]`, the accumulated content is parsed, and a
//   single synthesized `tool_calls` chunk replaces the buffered text.
// - Native dedup: duplicated tool-call chunks are dropped, by exact line
//   hash and by (id-already-started, arguments-last-seen) semantic checks.
//
// The processor never fails a response: anything unparseable degrades to
// passthrough with a metric.

pub mod xml;

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crate::metrics::Metrics;

/// Content markers that flip the processor into XML mode
const XML_TRIGGERS: [&str; 3] = ["<function=", "<tool_call", "<function_call"];

/// Per-response stream post-processor
pub struct SsePostProcessor {
    metrics: Arc<Metrics>,
    xml_detection_enabled: bool,

    /// Bytes held until a newline boundary; chunks may split mid-JSON
    line_buffer: String,

    /// Concatenated delta.content across the response
    accumulated_content: String,

    xml_mode: bool,
    xml_mode_started: Option<Instant>,

    /// First parsed chunk, template for the synthesized tool-call chunk
    first_chunk_template: Option<Value>,

    /// Raw lines withheld while XML mode decides, for fallback flush
    buffered_lines: Vec<String>,

    native_tool_calls_detected: bool,
    seen_chunk_hashes: HashSet<[u8; 32]>,
    started_tool_ids: HashSet<String>,
    last_args_by_index: HashMap<usize, String>,

    done: bool,

    /// Response is not SSE at all; bytes pass straight through
    binary_passthrough: Option<bool>,
}

impl SsePostProcessor {
    pub fn new(metrics: Arc<Metrics>, xml_detection_enabled: bool) -> Self {
        Self {
            metrics,
            xml_detection_enabled,
            line_buffer: String::new(),
            accumulated_content: String::new(),
            xml_mode: false,
            xml_mode_started: None,
            first_chunk_template: None,
            buffered_lines: Vec::new(),
            native_tool_calls_detected: false,
            seen_chunk_hashes: HashSet::new(),
            started_tool_ids: HashSet::new(),
            last_args_by_index: HashMap::new(),
            done: false,
            binary_passthrough: None,
        }
    }

    /// Process one write from the backend; returns bytes to forward
    pub fn process(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.binary_passthrough == Some(true) {
            return chunk.to_vec();
        }

        self.line_buffer.push_str(&String::from_utf8_lossy(chunk));

        // The leading bytes decide SSE vs binary for the whole response;
        // wait until enough have arrived to tell
        if self.binary_passthrough.is_none() {
            if self.line_buffer.len() < 6 && "data: ".starts_with(self.line_buffer.as_str()) {
                return Vec::new();
            }
            if self.line_buffer.starts_with("data: ") {
                self.binary_passthrough = Some(false);
            } else {
                self.binary_passthrough = Some(true);
                return std::mem::take(&mut self.line_buffer).into_bytes();
            }
        }

        let mut output = Vec::new();
        while let Some(newline) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=newline).collect();
            output.extend(self.process_line(line.trim_end_matches('\n')));
        }
        output
    }

    /// Flush state at end of response
    ///
    /// A stream that ended without `[DONE]` while XML mode was buffering
    /// degrades to passthrough of everything withheld.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut output = Vec::new();
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            if self.binary_passthrough == Some(false) {
                output.extend(self.process_line(&line));
            } else {
                // Undecided or binary: flush raw
                output.extend(line.into_bytes());
            }
        }
        if self.xml_mode && !self.done {
            tracing::warn!("stream ended mid-XML buffering, flushing as-is");
            self.metrics.record_xml_parse("truncated");
            output.extend(self.flush_buffered());
        }
        output
    }

    fn process_line(&mut self, line: &str) -> Vec<u8> {
        if self.done {
            // Nothing is parsed or forwarded past [DONE]; the terminator
            // below already carried its own separator
            return Vec::new();
        }

        let Some(payload) = line.strip_prefix("data: ") else {
            // event:/comment/blank lines ride along with the data lines
            if self.xml_mode {
                self.buffered_lines.push(line.to_string());
                return Vec::new();
            }
            return format!("{}\n", line).into_bytes();
        };

        if payload.trim() == "[DONE]" {
            self.done = true;
            if self.xml_mode {
                return self.convert_buffered_xml();
            }
            return b"data: [DONE]\n\n".to_vec();
        }

        let parsed: Option<Value> = serde_json::from_str(payload).ok();
        if let Some(chunk) = &parsed {
            if self.first_chunk_template.is_none() {
                self.first_chunk_template = Some(chunk.clone());
            }
            self.inspect_chunk(chunk);
        }

        if self.xml_mode {
            self.buffered_lines.push(line.to_string());
            if let Some(started) = self.xml_mode_started {
                tracing::debug!(
                    "buffering XML tool call, {}ms elapsed, {} chars",
                    started.elapsed().as_millis(),
                    self.accumulated_content.len()
                );
            }
            return Vec::new();
        }

        // Native passthrough, with dedup once tool calls have shown up
        if self.native_tool_calls_detected && self.is_duplicate(line, parsed.as_ref()) {
            self.metrics.record_dedup_drop();
            return Vec::new();
        }

        format!("{}\n", line).into_bytes()
    }

    /// Update detection state from a parsed chunk
    fn inspect_chunk(&mut self, chunk: &Value) {
        let delta = chunk
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"));
        let Some(delta) = delta else { return };

        let has_native = delta
            .get("tool_calls")
            .and_then(|tc| tc.as_array())
            .map(|tc| !tc.is_empty())
            .unwrap_or(false);

        if has_native {
            self.native_tool_calls_detected = true;
            if self.xml_mode {
                // The backend went native after all; the buffered text was
                // a false positive
                tracing::debug!("native tool calls during XML mode, cancelling buffer");
                self.xml_mode = false;
                self.xml_mode_started = None;
                self.accumulated_content.clear();
                self.buffered_lines.clear();
            }
            return;
        }

        // reasoning_content passes through untouched and never triggers
        // XML mode; only delta.content is inspected
        if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
            if !content.is_empty() {
                self.accumulated_content.push_str(content);

                if !self.xml_mode
                    && !self.native_tool_calls_detected
                    && self.xml_detection_enabled
                    && has_xml_trigger(&self.accumulated_content)
                {
                    tracing::debug!("XML tool-call marker detected, buffering stream");
                    self.xml_mode = true;
                    self.xml_mode_started = Some(Instant::now());
                    self.buffered_lines.clear();
                }
            }
        }
    }

    /// Dedup for native tool-call streams
    fn is_duplicate(&mut self, line: &str, parsed: Option<&Value>) -> bool {
        // Exact byte duplicates across the lifetime of the response
        let mut hasher = Sha256::new();
        hasher.update(line.as_bytes());
        let hash: [u8; 32] = hasher.finalize().into();
        if !self.seen_chunk_hashes.insert(hash) {
            return true;
        }

        // Semantic backstops for chunks that differ in bytes but repeat
        // the same tool-call fragment
        let Some(tool_calls) = parsed
            .and_then(|c| c.get("choices"))
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("tool_calls"))
            .and_then(|tc| tc.as_array())
        else {
            return false;
        };
        if tool_calls.is_empty() {
            return false;
        }

        let mut all_duplicate = true;
        for tc in tool_calls {
            let id = tc.get("id").and_then(|v| v.as_str());
            let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let args = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|a| a.as_str());

            match (id, args) {
                // Start chunk: id present, no arguments yet
                (Some(id), None) | (Some(id), Some("")) => {
                    if !self.started_tool_ids.insert(id.to_string()) {
                        continue; // already started: duplicate
                    }
                    all_duplicate = false;
                }
                (_, Some(args)) => {
                    if let Some(id) = id {
                        self.started_tool_ids.insert(id.to_string());
                    }
                    if self.last_args_by_index.get(&index).map(String::as_str) == Some(args) {
                        continue; // same arguments fragment again
                    }
                    self.last_args_by_index.insert(index, args.to_string());
                    all_duplicate = false;
                }
                (None, None) => {
                    all_duplicate = false;
                }
            }
        }
        all_duplicate
    }

    /// `[DONE]` arrived while buffering XML: convert or fall back
    fn convert_buffered_xml(&mut self) -> Vec<u8> {
        let calls = xml::parse_tool_calls(&self.accumulated_content);

        let output = if let Some(call) = calls.first() {
            tracing::info!(
                "converted XML tool call {:?} ({} parsed)",
                call.name,
                calls.len()
            );
            self.metrics.record_xml_parse("success");
            let chunk = self.synthesize_tool_chunk(call);
            format!("data: {}\n\ndata: [DONE]\n\n", chunk).into_bytes()
        } else {
            tracing::warn!(
                "XML mode engaged but nothing parsed from {} chars, passing through",
                self.accumulated_content.len()
            );
            self.metrics.record_xml_parse("failure");
            let mut flushed = self.flush_buffered();
            flushed.extend(b"data: [DONE]\n\n".as_slice());
            flushed
        };

        // Either way the response is over; reset per-response state
        self.xml_mode = false;
        self.xml_mode_started = None;
        self.accumulated_content.clear();
        self.buffered_lines.clear();
        output
    }

    /// Build the replacement chunk from the first-chunk template
    fn synthesize_tool_chunk(&self, call: &xml::ParsedToolCall) -> Value {
        let mut chunk = self
            .first_chunk_template
            .clone()
            .unwrap_or_else(|| serde_json::json!({"object": "chat.completion.chunk"}));

        let mut hasher = Sha256::new();
        hasher.update(call.name.as_bytes());
        hasher.update(self.accumulated_content.as_bytes());
        let digest = hasher.finalize();
        let id = format!("call_{:02x}{:02x}{:02x}{:02x}", digest[0], digest[1], digest[2], digest[3]);

        let delta = serde_json::json!({
            "tool_calls": [{
                "index": 0,
                "id": id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.arguments_json(),
                }
            }]
        });

        if let Some(choice) = chunk
            .get_mut("choices")
            .and_then(|c| c.get_mut(0))
            .and_then(|c| c.as_object_mut())
        {
            choice.insert("delta".to_string(), delta);
            choice.insert("finish_reason".to_string(), Value::from("tool_calls"));
        } else {
            chunk = serde_json::json!({
                "object": "chat.completion.chunk",
                "choices": [{"index": 0, "delta": delta, "finish_reason": "tool_calls"}]
            });
        }
        chunk
    }

    fn flush_buffered(&mut self) -> Vec<u8> {
        let mut output = Vec::new();
        for line in self.buffered_lines.drain(..) {
            output.extend(line.as_bytes());
            output.push(b'\n');
        }
        output
    }
}

/// XML markers, including a trailing partial `<function` head
fn has_xml_trigger(content: &str) -> bool {
    if XML_TRIGGERS.iter().any(|t| content.contains(t)) {
        return true;
    }
    // An open "<function" prefix at the tail: the marker may still be
    // arriving token by token
    const OPEN: &str = "<function";
    (1..OPEN.len()).any(|n| content.ends_with(&OPEN[..n]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(xml: bool) -> SsePostProcessor {
        SsePostProcessor::new(Arc::new(Metrics::new()), xml)
    }

    fn content_chunk(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({
                "id": "chatcmpl-1",
                "object": "chat.completion.chunk",
                "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]
            })
        )
    }

    fn tool_chunk(id: Option<&str>, index: u64, args: Option<&str>) -> String {
        let mut tc = serde_json::json!({"index": index, "type": "function"});
        if let Some(id) = id {
            tc["id"] = id.into();
            tc["function"] = serde_json::json!({"name": "ls"});
        }
        if let Some(args) = args {
            tc["function"] = serde_json::json!({"arguments": args});
        }
        format!(
            "data: {}\n\n",
            serde_json::json!({
                "id": "chatcmpl-1",
                "choices": [{"index": 0, "delta": {"tool_calls": [tc]}, "finish_reason": null}]
            })
        )
    }

    fn data_lines(bytes: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(bytes)
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .filter(|d| *d != "[DONE]")
            .map(|d| serde_json::from_str(d).unwrap())
            .collect()
    }

    #[test]
    fn test_binary_passthrough_for_non_sse() {
        let mut p = processor(true);
        let body = br#"{"id": "chatcmpl-1", "choices": []}"#;
        assert_eq!(p.process(body), body.to_vec());
        // Stays binary for later writes even if they look like SSE
        assert_eq!(p.process(b"data: x\n"), b"data: x\n".to_vec());
    }

    #[test]
    fn test_plain_text_stream_passes_through() {
        let mut p = processor(true);
        let chunk = content_chunk("Hello world");
        let out = p.process(chunk.as_bytes());
        assert_eq!(String::from_utf8(out).unwrap(), chunk);

        let done = p.process(b"data: [DONE]\n\n");
        assert!(String::from_utf8(done).unwrap().contains("[DONE]"));
    }

    #[test]
    fn test_xml_tool_call_converges_to_single_chunk() {
        let mut p = processor(true);
        let mut out = Vec::new();
        // Token-by-token reconstruction of the XML payload
        for piece in [
            "<func", "tion=ls>", "<parameter=path>", ".", "</parameter>", "</function>",
        ] {
            out.extend(p.process(content_chunk(piece).as_bytes()));
        }
        // Nothing emitted while buffering
        assert!(out.is_empty());

        out.extend(p.process(b"data: [DONE]\n\n"));
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.ends_with("data: [DONE]\n\n"));

        let chunks = data_lines(&out);
        assert_eq!(chunks.len(), 1, "exactly one synthesized chunk");
        let choice = &chunks[0]["choices"][0];
        assert_eq!(choice["finish_reason"], "tool_calls");
        let tc = &choice["delta"]["tool_calls"][0];
        assert_eq!(tc["index"], 0);
        assert_eq!(tc["type"], "function");
        assert_eq!(tc["function"]["name"], "ls");
        assert_eq!(tc["function"]["arguments"], r#"{"path":"."}"#);
    }

    #[test]
    fn test_xml_detection_disabled_passes_through() {
        let mut p = processor(false);
        let chunk = content_chunk("<function=ls><parameter=path>.</parameter></function>");
        let out = p.process(chunk.as_bytes());
        assert_eq!(String::from_utf8(out).unwrap(), chunk);
    }

    #[test]
    fn test_unparseable_xml_flushes_buffered_lines() {
        let mut p = processor(true);
        let mut out = Vec::new();
        // Trigger fires but no well-formed head ever completes
        out.extend(p.process(content_chunk("<tool_call but then prose").as_bytes()));
        out.extend(p.process(content_chunk(" continues normally").as_bytes()));
        assert!(out.is_empty());

        out.extend(p.process(b"data: [DONE]\n\n"));
        let chunks = data_lines(&out);
        // Both original chunks came back, then [DONE]
        assert_eq!(chunks.len(), 2);
        assert!(String::from_utf8(out).unwrap().contains("[DONE]"));
    }

    #[test]
    fn test_native_cancels_xml_mode() {
        let mut p = processor(true);
        let mut out = Vec::new();
        out.extend(p.process(content_chunk("<function=").as_bytes()));
        assert!(out.is_empty(), "xml mode buffering");

        // Structured tool calls arrive: buffer is discarded, native wins
        let native = tool_chunk(Some("call_1"), 0, None);
        out.extend(p.process(native.as_bytes()));
        assert_eq!(String::from_utf8(out).unwrap(), native);
    }

    #[test]
    fn test_exact_duplicate_chunks_dropped() {
        let mut p = processor(true);
        let start = tool_chunk(Some("call_1"), 0, None);
        let args = tool_chunk(None, 0, Some("{\"path\":"));

        let mut out = Vec::new();
        out.extend(p.process(start.as_bytes()));
        out.extend(p.process(args.as_bytes()));
        // Tensor-parallel copies of both
        out.extend(p.process(start.as_bytes()));
        out.extend(p.process(args.as_bytes()));
        out.extend(p.process(tool_chunk(None, 0, Some("\".\"}")).as_bytes()));

        let chunks = data_lines(&out);
        assert_eq!(chunks.len(), 3, "each semantic chunk exactly once");
    }

    #[test]
    fn test_semantic_dedup_by_started_id() {
        let mut p = processor(true);
        let mut out = Vec::new();
        out.extend(p.process(tool_chunk(Some("call_1"), 0, None).as_bytes()));
        // Byte-different chunk (other id field order) replaying the same start
        let replay = format!(
            "data: {}\n\n",
            serde_json::json!({
                "id": "chatcmpl-1",
                "system_fingerprint": "fp2",
                "choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "id": "call_1", "type": "function", "function": {"name": "ls"}}
                ]}, "finish_reason": null}]
            })
        );
        out.extend(p.process(replay.as_bytes()));
        assert_eq!(data_lines(&out).len(), 1);
    }

    #[test]
    fn test_semantic_dedup_by_last_args() {
        let mut p = processor(true);
        let mut out = Vec::new();
        out.extend(p.process(tool_chunk(Some("call_1"), 0, None).as_bytes()));
        out.extend(p.process(tool_chunk(None, 0, Some("{\"a\":1}")).as_bytes()));
        // Same args under a different envelope
        let replay = format!(
            "data: {}\n\n",
            serde_json::json!({
                "id": "chatcmpl-1",
                "created": 99,
                "choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "{\"a\":1}"}}
                ]}, "finish_reason": null}]
            })
        );
        out.extend(p.process(replay.as_bytes()));
        assert_eq!(data_lines(&out).len(), 2);
    }

    #[test]
    fn test_reasoning_content_passes_through() {
        let mut p = processor(true);
        let chunk = format!(
            "data: {}\n\n",
            serde_json::json!({
                "id": "chatcmpl-1",
                "choices": [{"index": 0, "delta": {"reasoning_content": "<function= hmm"}, "finish_reason": null}]
            })
        );
        let out = p.process(chunk.as_bytes());
        // Byte-for-byte passthrough, no XML mode
        assert_eq!(String::from_utf8(out).unwrap(), chunk);
        let out2 = p.process(content_chunk("normal text").as_bytes());
        assert!(!out2.is_empty(), "reasoning must not have engaged XML mode");
    }

    #[test]
    fn test_split_mid_json_line() {
        let mut p = processor(true);
        let chunk = content_chunk("Hello");
        let (a, b) = chunk.split_at(20);
        let mut out = Vec::new();
        out.extend(p.process(a.as_bytes()));
        out.extend(p.process(b.as_bytes()));
        assert_eq!(String::from_utf8(out).unwrap(), chunk);
    }

    #[test]
    fn test_truncated_xml_stream_flushes_on_finish() {
        let mut p = processor(true);
        let mut out = Vec::new();
        out.extend(p.process(content_chunk("<function=ls><parameter=path>.").as_bytes()));
        assert!(out.is_empty());
        // Connection dropped without [DONE]
        out.extend(p.finish());
        assert_eq!(data_lines(&out).len(), 1, "buffered chunk flushed");
    }
}
