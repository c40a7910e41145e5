// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in the conversation history.
///
/// One type serves both the in-memory history and the wire: `to_wire` strips
/// the bookkeeping fields (`id`, `timestamp`) that the endpoint must not see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Set on `role = tool` messages: the assistant call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name, set alongside `tool_call_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "new_message_id")]
    pub id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            thinking: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            id: new_message_id(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Assistant message carrying tool calls (content may be empty).
    pub fn assistant_with_calls(text: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        let mut m = Self::new(Role::Assistant, text);
        m.tool_calls = calls;
        m
    }

    /// Tool-result message answering `call_id`; `content` is the JSON-encoded
    /// tool result.
    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut m = Self::new(Role::Tool, content);
        m.tool_call_id = Some(call_id.into());
        m.name = Some(tool_name.into());
        m
    }

    /// Wire-format JSON object for the chat endpoint.
    pub fn to_wire(&self) -> Value {
        let mut v = json!({
            "role": match self.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            },
            "content": self.content,
        });
        if !self.tool_calls.is_empty() {
            v["tool_calls"] = json!(self.tool_calls);
        }
        if let Some(id) = &self.tool_call_id {
            v["tool_call_id"] = json!(id);
        }
        if let Some(name) = &self.name {
            v["name"] = json!(name);
        }
        v
    }

    /// Approximate token count used for context accounting.
    ///
    /// 4-chars-per-token heuristic; tool calls count their serialized
    /// arguments.
    pub fn approx_tokens(&self) -> usize {
        let mut chars = self.content.len();
        chars += self.thinking.as_deref().map(str::len).unwrap_or(0);
        for tc in &self.tool_calls {
            chars += tc.function.name.len() + tc.function.arguments.to_string().len();
        }
        (chars / 4).max(1)
    }
}

// ─── Tool calls ───────────────────────────────────────────────────────────────

/// Canonical tool-call shape.  After [`normalize_tool_calls`] runs, `id` is
/// always present, `kind` is always `"function"` and `arguments` is always a
/// JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    #[serde(rename = "type", default = "default_call_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn default_call_kind() -> String {
    "function".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Always an object after normalization.
    pub arguments: Value,
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

impl ToolSchema {
    /// Wire shape: `{type:"function", function:{...}}`.
    pub fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// A model listed by the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: Option<String>,
}

// ─── Normalization / repair ───────────────────────────────────────────────────

/// Outcome of normalizing the raw `tool_calls` value from a response.
#[derive(Debug, Default)]
pub struct NormalizedCalls {
    pub calls: Vec<ToolCallRequest>,
    /// Human-readable validation failures (empty = all calls valid).
    pub errors: Vec<String>,
}

/// Normalize raw tool calls into the canonical shape.
///
/// Accepted input shapes per element:
/// - `{id, type, function: {name, arguments: object|string}}`
/// - `{name, arguments}` (flat; lifted into a `function` envelope)
///
/// Repairs applied:
/// - missing `id` → `repaired-<unix-ms>-<index>`
/// - missing `type` → `"function"`
/// - `arguments` given as a JSON string → decoded (with escape/truncation
///   repair before giving up)
/// - `arguments` absent or null → `{}`
///
/// Validation failures (collected, call dropped from `calls`):
/// - `function.name` missing or not a string
/// - string `arguments` that are not valid JSON even after repair
pub fn normalize_tool_calls(raw: &Value) -> NormalizedCalls {
    let mut out = NormalizedCalls::default();
    let items: Vec<Value> = match raw {
        Value::Array(a) => a.clone(),
        Value::Null => return out,
        // A single bare object is treated as a one-element list.
        Value::Object(_) => vec![raw.clone()],
        other => {
            out.errors
                .push(format!("tool_calls must be an array, got: {other}"));
            return out;
        }
    };

    let now_ms = Utc::now().timestamp_millis();
    for (index, item) in items.iter().enumerate() {
        // Lift the flat `{name, arguments}` shape into a function envelope.
        let function = match item.get("function") {
            Some(f) => f.clone(),
            None => json!({
                "name": item.get("name").cloned().unwrap_or(Value::Null),
                "arguments": item.get("arguments").cloned().unwrap_or(Value::Null),
            }),
        };

        let name = match function.get("name").and_then(Value::as_str) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => {
                out.errors.push(format!(
                    "tool call #{index}: missing or non-string function.name"
                ));
                continue;
            }
        };

        let arguments = match function.get("arguments") {
            None | Some(Value::Null) => json!({}),
            Some(Value::Object(o)) => Value::Object(o.clone()),
            Some(Value::String(s)) => {
                if s.trim().is_empty() {
                    json!({})
                } else {
                    match decode_arguments(s) {
                        Ok(v) => v,
                        Err(e) => {
                            out.errors.push(format!(
                                "tool call #{index} ({name}): arguments is not valid JSON: {e}"
                            ));
                            continue;
                        }
                    }
                }
            }
            Some(other) => {
                out.errors.push(format!(
                    "tool call #{index} ({name}): arguments must be an object, got: {other}"
                ));
                continue;
            }
        };

        let id = match item.get("id").and_then(Value::as_str) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => format!("repaired-{now_ms}-{index}"),
        };

        out.calls.push(ToolCallRequest {
            id,
            kind: item
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("function")
                .to_string(),
            function: FunctionCall { name, arguments },
        });
    }
    out
}

/// Decode string arguments, applying generic JSON repairs before giving up.
fn decode_arguments(s: &str) -> anyhow::Result<Value> {
    match serde_json::from_str::<Value>(s) {
        Ok(Value::Object(o)) => return Ok(Value::Object(o)),
        Ok(other) => anyhow::bail!("decoded to non-object: {other}"),
        Err(first_err) => match attempt_json_repair(s) {
            Ok(v) if v.is_object() => {
                warn!("repaired invalid JSON tool-call arguments from model");
                Ok(v)
            }
            _ => Err(first_err.into()),
        },
    }
}

/// Attempt to repair common JSON syntax errors.
///
/// Handles:
/// - invalid escape sequences inside string values (e.g. `\c`, `\p`)
/// - missing commas between key-value pairs
/// - truncated output (unterminated string / missing closing brace)
pub fn attempt_json_repair(json_str: &str) -> anyhow::Result<Value> {
    // 1. Fix invalid JSON escape sequences inside string values.
    let fixed = fix_invalid_json_escapes(json_str);
    if let Ok(v) = serde_json::from_str::<Value>(&fixed) {
        return Ok(v);
    }

    // 2. Fix missing comma between key-value pairs like: "key1"value": "...
    let repaired = regex::Regex::new(r#""([^"]+)"([a-zA-Z_][a-zA-Z0-9_]*)":\s*"#)
        .unwrap()
        .replace_all(&fixed, r#""$1", "$2": "#);
    if let Ok(v) = serde_json::from_str::<Value>(&repaired) {
        return Ok(v);
    }

    // 3. Try adding a missing closing quote and brace if the JSON ends abruptly.
    if !fixed.trim().ends_with('}') {
        let mut completed = fixed.clone();
        let quote_count = fixed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        if !completed.trim().ends_with('}') {
            completed.push('}');
        }
        if let Ok(v) = serde_json::from_str::<Value>(&completed) {
            return Ok(v);
        }
    }

    anyhow::bail!("JSON repair failed: all repair strategies exhausted")
}

/// Walk through a JSON string and replace any invalid escape sequences inside
/// string values with a properly escaped backslash.
///
/// Valid JSON escape characters are: `"`, `\`, `/`, `b`, `f`, `n`, `r`, `t`, `u`.
/// Anything else (e.g. `\c`, `\p`, `\(`) becomes `\\X` so the result parses.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
