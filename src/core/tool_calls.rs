//! Extraction of tool calls from free-form model output
//!
//! Three syntaxes are recognised, collected in this order and kept additively
//! (a call written in two syntaxes is reported twice):
//!
//! 1. Bracketed calls: `[name(key="value", n=3)]`, optionally wrapped in
//!    `<|tool_call_start|>` / `<|tool_call_end|>`
//! 2. JSON arrays: `[{"name": "...", "arguments": {...}}]`
//! 3. Tagged blocks: `<tool_call>{"name": "...", "arguments": {...}}</tool_call>`,
//!    or `name: x` and `arguments: {...}` lines inside the tags
//!
//! A candidate that cannot be parsed is skipped; the others are still returned.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use crate::tools::ToolCall;

fn bracketed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\w+)\(([^)]*)\)\]").expect("valid regex"))
}

fn keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(\w+)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^,\s)]+))"#).expect("valid regex")
    })
}

fn tagged_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").expect("valid regex"))
}

fn name_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"name:\s*"?(\w+)"?"#).expect("valid regex"))
}

pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = parse_bracketed(text);
    calls.extend(parse_json_arrays(text));
    calls.extend(parse_tagged(text));
    calls
}

fn parse_bracketed(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();

    for captures in bracketed_re().captures_iter(text) {
        let name = &captures[1];
        let raw_args = &captures[2];

        let mut arguments = Map::new();
        for pair in keyword_re().captures_iter(raw_args) {
            let value = if let Some(quoted) = pair.get(2).or_else(|| pair.get(3)) {
                Value::String(quoted.as_str().to_string())
            } else {
                let bare = pair.get(4).map(|m| m.as_str()).unwrap_or_default();
                serde_json::from_str(bare).unwrap_or_else(|_| Value::String(bare.to_string()))
            };
            arguments.insert(pair[1].to_string(), value);
        }

        if arguments.is_empty() && !raw_args.trim().is_empty() {
            tracing::warn!(tool = %name, "Skipping tool call with unparseable arguments");
            continue;
        }

        calls.push(ToolCall::new(name, arguments));
    }

    calls
}

fn parse_json_arrays(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut offset = 0;

    while let Some(pos) = text[offset..].find('[') {
        let start = offset + pos;
        let mut items = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Vec<Value>>();

        match items.next() {
            Some(Ok(values)) => {
                calls.extend(values.iter().filter_map(call_from_value));
                offset = start + items.byte_offset();
            }
            _ => offset = start + 1,
        }
    }

    calls
}

fn parse_tagged(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();

    for captures in tagged_re().captures_iter(text) {
        let body = captures[1].trim();

        if let Ok(value) = serde_json::from_str::<Value>(body) {
            match call_from_value(&value) {
                Some(call) => calls.push(call),
                None => tracing::warn!("Skipping tagged tool call without name and arguments"),
            }
            continue;
        }

        match parse_tagged_lines(body) {
            Some(call) => calls.push(call),
            None => tracing::warn!("Skipping malformed tagged tool call"),
        }
    }

    calls
}

/// `name: x` followed by `arguments: {...}`
fn parse_tagged_lines(body: &str) -> Option<ToolCall> {
    let name = name_line_re().captures(body)?.get(1)?.as_str();
    let after = &body[body.find("arguments:")? + "arguments:".len()..];
    let start = after.find('{')?;
    let arguments = serde_json::Deserializer::from_str(&after[start..])
        .into_iter::<Map<String, Value>>()
        .next()?
        .ok()?;

    Some(ToolCall::new(name, arguments))
}

/// Accepts `{"name", "arguments"}` and the OpenAI `{"function": {...}}` shape.
/// Arguments given as a JSON string are decoded.
fn call_from_value(value: &Value) -> Option<ToolCall> {
    let object = value.as_object()?;
    let object = match object.get("function").and_then(Value::as_object) {
        Some(function) => function,
        None => object,
    };

    let name = object.get("name")?.as_str()?;
    let arguments = match object.get("arguments")? {
        Value::Object(map) => map.clone(),
        Value::String(encoded) => match serde_json::from_str::<Map<String, Value>>(encoded) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(tool = %name, "Skipping tool call with invalid arguments: {}", e);
                return None;
            }
        },
        _ => return None,
    };

    Some(ToolCall::new(name, arguments))
}
