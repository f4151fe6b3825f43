// XML tool-call parsing
//
// Some backends emit tool invocations as XML inside `delta.content`
// instead of structured `tool_calls`:
//
//   <tool_call><function=ls><parameter=path>.</parameter></function></tool_call>
//   <function=get_weather><parameter=city>London</parameter></function>
//
// Closing tags are optional because truncating backends exist. The parser
// is deterministic and permissive about tails but conservative about
// heads: without a well-formed `<function=NAME>` head it returns zero
// calls and the stream passes through untouched.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// One tool call recovered from XML content
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    /// JSON object of (parameter, value) pairs in source order
    pub arguments: Value,
}

impl ParsedToolCall {
    /// Arguments as the JSON string OpenAI chunks carry
    pub fn arguments_json(&self) -> String {
        self.arguments.to_string()
    }
}

fn function_head() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<function=([A-Za-z0-9_.\-]+)>").expect("static regex"))
}

fn parameter_head() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<parameter=([A-Za-z0-9_.\-]+)>").expect("static regex"))
}

/// Extract every tool call from accumulated content
///
/// Returns an empty vector on anything that lacks a well-formed function
/// head; the caller treats that as "not XML after all".
pub fn parse_tool_calls(content: &str) -> Vec<ParsedToolCall> {
    let mut calls = Vec::new();

    for head in function_head().captures_iter(content) {
        let full = head.get(0).expect("whole match");
        let name = head.get(1).expect("name group").as_str().to_string();

        // Body runs to </function>, the next function head, or end of input
        let body_start = full.end();
        let rest = &content[body_start..];
        let body_end = rest
            .find("</function>")
            .or_else(|| function_head().find(rest).map(|m| m.start()))
            .unwrap_or(rest.len());
        let body = &rest[..body_end];

        calls.push(ParsedToolCall {
            name,
            arguments: Value::Object(parse_parameters(body)),
        });
    }

    calls
}

/// Parse `<parameter=KEY>VALUE` pairs from a function body
fn parse_parameters(body: &str) -> Map<String, Value> {
    let mut params = Map::new();

    let heads: Vec<(usize, usize, String)> = parameter_head()
        .captures_iter(body)
        .map(|c| {
            let m = c.get(0).expect("whole match");
            (
                m.start(),
                m.end(),
                c.get(1).expect("key group").as_str().to_string(),
            )
        })
        .collect();

    for (i, (_, value_start, key)) in heads.iter().enumerate() {
        // Value runs to </parameter>, the next parameter head, or end
        let tail = &body[*value_start..];
        let next_head_offset = heads
            .get(i + 1)
            .map(|(next_start, _, _)| next_start - value_start);
        let value_end = tail
            .find("</parameter>")
            .into_iter()
            .chain(next_head_offset)
            .min()
            .unwrap_or(tail.len());

        let raw = tail[..value_end].trim();
        params.insert(key.clone(), coerce_value(raw));
    }

    params
}

/// Values are strings unless they read as a bare number or boolean
fn coerce_value(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    Value::String(raw.to_string())
}
