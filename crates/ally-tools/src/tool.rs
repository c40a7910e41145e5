// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model (forwarded verbatim on the result).
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments, always an object after normalization.
    pub args: Value,
}

/// Sink for streamed output chunks emitted by long-running tools.
/// Chunks are opaque text; the orchestrator does not parse them.
pub type ChunkSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-call execution context handed to every tool.
#[derive(Clone)]
pub struct ToolCtx {
    /// Cancelled when the user interrupts or a parent aborts.  Tools must
    /// honor it at I/O boundaries.
    pub cancel: CancellationToken,
    /// Present when a subscriber wants live output.
    pub chunks: Option<ChunkSink>,
    /// True when the call came from the user directly, not from the model.
    pub user_initiated: bool,
}

impl ToolCtx {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            chunks: None,
            user_initiated: false,
        }
    }

    /// Context for unit tests: fresh token, no chunk sink.
    pub fn test() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn emit_chunk(&self, chunk: &str) {
        if let Some(sink) = &self.chunks {
            sink(chunk);
        }
    }
}

/// Closed error taxonomy.  Every failed result carries exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Arguments failed schema or precondition checks (e.g. line not read).
    ValidationError,
    /// Invalid user-supplied target (e.g. unknown shell id).
    UserError,
    /// The user denied confirmation.
    PermissionError,
    /// Path traversal, forbidden command and friends.
    SecurityError,
    /// User cancellation or parent abort.
    Interrupted,
    /// Programmer or environment fault.
    SystemError,
    /// Fallback; treated like a system error.
    General,
}

/// The result of executing a tool.
///
/// Contract: exactly one of `success = true` or a non-empty `error`.
/// Extra structured fields ride in `data` and are flattened into the wire
/// JSON that becomes the `tool` message content.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub success: bool,
    pub error: String,
    pub error_kind: Option<ErrorKind>,
    pub suggestion: Option<String>,
    /// Result is for the agent's own bookkeeping; hidden from chat.
    pub internal_only: bool,
    pub data: Map<String, Value>,
}

impl ToolResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: String::new(),
            error_kind: None,
            suggestion: None,
            internal_only: false,
            data: Map::new(),
        }
    }

    pub fn err(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            error: msg.into(),
            error_kind: Some(kind),
            suggestion: None,
            internal_only: false,
            data: Map::new(),
        }
    }

    /// The uniform result for a cancelled execution.
    pub fn interrupted() -> Self {
        Self::err(ErrorKind::Interrupted, "Tool execution was interrupted")
    }

    /// Canonical denial: one message for every tool, so denials never leak
    /// tool internals.
    pub fn permission_denied() -> Self {
        Self::err(
            ErrorKind::PermissionError,
            "Permission denied. Tell Ally what to do instead.",
        )
    }

    /// Builder-style extra field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_suggestion(mut self, s: impl Into<String>) -> Self {
        self.suggestion = Some(s.into());
        self
    }

    /// Fetch an extra field (mostly for tests).
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// The JSON object sent back to the model as the `tool` message content.
    pub fn to_wire_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("success".into(), json!(self.success));
        if !self.error.is_empty() {
            obj.insert("error".into(), json!(self.error));
        }
        if let Some(kind) = self.error_kind {
            obj.insert("error_type".into(), serde_json::to_value(kind).unwrap());
        }
        if let Some(s) = &self.suggestion {
            obj.insert("suggestion".into(), json!(s));
        }
        for (k, v) in &self.data {
            obj.insert(k.clone(), v.clone());
        }
        Value::Object(obj)
    }
}

/// Shape of a tool's text output, used for context-aware truncation when a
/// result exceeds the configured token cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal output: keep head and tail so errors at the end survive.
    HeadTail,
    /// Ordered match list: keep the leading matches.
    MatchList,
    /// File content: head + tail window.
    FileContent,
    /// Hard truncation.
    #[default]
    Generic,
}

/// A pending file mutation shown to the user before permission is requested.
#[derive(Debug, Clone)]
pub struct ChangePreview {
    pub path: String,
    /// Unified diff of the pending change.
    pub diff: String,
}

/// Trait every built-in and plugin tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> Value;

    /// Ask the user before executing.  Mutating tools say `true`.
    fn requires_confirmation(&self) -> bool {
        false
    }
    /// Rendered in the chat transcript at all.
    fn visible_in_chat(&self) -> bool {
        true
    }
    /// Rendered collapsed by default (noisy output).
    fn should_collapse(&self) -> bool {
        false
    }
    /// Counts toward the consecutive read/search streak.
    fn is_exploratory(&self) -> bool {
        false
    }
    /// Housekeeping tools say `false` so they leave the streak untouched.
    fn breaks_exploratory_streak(&self) -> bool {
        true
    }
    /// Extra guidance appended to the system prompt for this tool.
    fn usage_guidance(&self) -> Option<&str> {
        None
    }
    /// Restrict the tool to specific agent types (`None` = everyone).
    fn visible_to(&self) -> Option<&[&str]> {
        None
    }
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }

    /// One-line rendering of a result for the transcript (`None` = default
    /// rendering of the wire JSON).
    fn result_preview(&self, _result: &ToolResult) -> Option<String> {
        None
    }

    /// Cheap argument check run before the permission prompt, so the user is
    /// never asked to approve a call that cannot run anyway.
    fn validate_before_permission(&self, _args: &Value) -> Option<ToolResult> {
        None
    }

    /// The string the permission pattern lists match against (e.g. the shell
    /// command).  `None` means pattern lists do not apply to this tool.
    fn permission_hint(&self, _args: &Value) -> Option<String> {
        None
    }

    /// Preview of a pending file mutation (`None` for everything else).
    async fn preview_changes(&self, _call: &ToolCall) -> Option<ChangePreview> {
        None
    }

    /// Execute the tool.  Failures are returned as [`ToolResult`] values,
    /// never raised.
    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_result_has_no_error() {
        let r = ToolResult::ok();
        assert!(r.success);
        assert!(r.error.is_empty());
        assert!(r.error_kind.is_none());
    }

    #[test]
    fn err_result_is_not_success() {
        let r = ToolResult::err(ErrorKind::UserError, "unknown id");
        assert!(!r.success);
        assert_eq!(r.error_kind, Some(ErrorKind::UserError));
    }

    #[test]
    fn error_kinds_serialize_to_wire_names() {
        let names: Vec<String> = [
            ErrorKind::ValidationError,
            ErrorKind::UserError,
            ErrorKind::PermissionError,
            ErrorKind::SecurityError,
            ErrorKind::Interrupted,
            ErrorKind::SystemError,
            ErrorKind::General,
        ]
        .iter()
        .map(|k| serde_json::to_value(k).unwrap().as_str().unwrap().to_string())
        .collect();
        assert_eq!(
            names,
            vec![
                "validation_error",
                "user_error",
                "permission_error",
                "security_error",
                "interrupted",
                "system_error",
                "general",
            ]
        );
    }

    #[test]
    fn wire_json_flattens_extra_fields() {
        let r = ToolResult::ok().with("content", "hello").with("lines", 3);
        let w = r.to_wire_json();
        assert_eq!(w["success"], json!(true));
        assert_eq!(w["content"], json!("hello"));
        assert_eq!(w["lines"], json!(3));
        assert!(w.get("error").is_none());
    }

    #[test]
    fn wire_json_carries_error_type() {
        let r = ToolResult::err(ErrorKind::ValidationError, "bad line").with_suggestion("re-read");
        let w = r.to_wire_json();
        assert_eq!(w["error"], json!("bad line"));
        assert_eq!(w["error_type"], json!("validation_error"));
        assert_eq!(w["suggestion"], json!("re-read"));
    }

    #[test]
    fn permission_denied_uses_canonical_message() {
        let r = ToolResult::permission_denied();
        assert_eq!(r.error, "Permission denied. Tell Ally what to do instead.");
        assert_eq!(r.error_kind, Some(ErrorKind::PermissionError));
    }

    #[test]
    fn interrupted_result_has_interrupted_kind() {
        assert_eq!(
            ToolResult::interrupted().error_kind,
            Some(ErrorKind::Interrupted)
        );
    }

    #[test]
    fn chunk_emission_reaches_sink() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let seen2 = seen.clone();
        let mut ctx = ToolCtx::test();
        ctx.chunks = Some(Arc::new(move |c: &str| {
            seen2.lock().unwrap().push(c.to_string());
        }));
        ctx.emit_chunk("one");
        ctx.emit_chunk("two");
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn chunk_emission_without_sink_is_a_no_op() {
        ToolCtx::test().emit_chunk("ignored");
    }
}
