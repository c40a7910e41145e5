// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ally_config::ModelConfig;

use crate::endpoint::{ChatEndpoint, ChatStream, EndpointError};
use crate::wire::{normalize_tool_calls, ChatMessage, ModelInfo, ToolCallRequest, ToolSchema};

/// Streamed deltas forwarded to the UI while a response is being aggregated.
#[derive(Debug, Clone)]
pub enum ChatDelta {
    Text(String),
    Thinking(String),
}

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub tools: Vec<ToolSchema>,
    /// Request a streamed response.  Single-shot responses still arrive as
    /// one frame through the same decode path.
    pub stream: bool,
    /// Override the configured retry budget (used by the validation retry,
    /// which must not retry at all).
    pub max_retries: Option<u32>,
}

/// The aggregated result of one model call.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    /// The request was cancelled; `content` holds whatever streamed first.
    pub interrupted: bool,
    pub error: Option<String>,
    pub suggestion: Option<String>,
    /// Content already reached the UI through the delta channel.
    pub streamed: bool,
    /// Tool calls failed validation and the repair retry did not fix them.
    pub validation_failed: bool,
    pub validation_errors: Vec<String>,
}

impl ChatResponse {
    fn interrupted(partial: String, streamed: bool) -> Self {
        Self {
            content: partial,
            interrupted: true,
            streamed,
            ..Default::default()
        }
    }

    fn failed(error: String, suggestion: Option<String>) -> Self {
        Self {
            error: Some(error),
            suggestion,
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// What one request/stream round produced before normalization.
#[derive(Debug, Default)]
struct Aggregated {
    content: String,
    thinking: String,
    raw_tool_calls: Option<Value>,
    interrupted: bool,
}

/// Outcome of one logical request including its retries.
enum Round {
    Done(Aggregated),
    Interrupted { partial: String },
    Failed { error: String, suggestion: Option<String> },
}

/// Client for one (endpoint, model) pair: retries with back-off, streams,
/// cancels, and normalizes tool calls.
pub struct ChatClient {
    endpoint: Arc<dyn ChatEndpoint>,
    cfg: ModelConfig,
    /// Cancellation token of the in-flight request; replaced on every send.
    current: Mutex<CancellationToken>,
    /// Tool capability of this (endpoint, model) pair.  `None` until the
    /// first tool-bearing request settles the question; then cached for the
    /// process lifetime.
    tool_support: Mutex<Option<bool>>,
}

impl ChatClient {
    pub fn new(endpoint: Arc<dyn ChatEndpoint>, cfg: ModelConfig) -> Self {
        Self {
            endpoint,
            cfg,
            current: Mutex::new(CancellationToken::new()),
            tool_support: Mutex::new(None),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.cfg.name
    }

    /// Cancel the in-flight request, if any.  Idempotent.
    pub fn cancel(&self) {
        self.current.lock().unwrap().cancel();
    }

    /// Cancel and drop any in-flight work.  The client can still be used
    /// afterwards; this exists so owners have an explicit shutdown hook.
    pub fn close(&self) {
        self.cancel();
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, EndpointError> {
        self.endpoint.list_models().await
    }

    /// Whether this (endpoint, model) pair accepts a `tools` array.
    ///
    /// Optimistically `true` until a tool-bearing request is rejected; the
    /// rejection is detected inside [`send`] (a 400 mentioning tools), the
    /// request transparently retried without tools, and the answer cached
    /// so the capability costs at most one wasted round-trip per process.
    pub fn tools_supported(&self) -> bool {
        self.tool_support.lock().unwrap().unwrap_or(true)
    }

    /// Explicit capability probe: one minimal tool-bearing request.
    ///
    /// Useful at startup for UI display; the agent loop itself relies on
    /// the lazy detection in [`send`].
    pub async fn supports_tools(&self) -> bool {
        if let Some(known) = *self.tool_support.lock().unwrap() {
            return known;
        }
        let probe_tool = ToolSchema {
            name: "noop".into(),
            description: "capability probe".into(),
            parameters: json!({"type": "object", "properties": {}}),
        };
        let body = self.build_body(&[ChatMessage::user("ping")], &[probe_tool], false);
        let cancel = CancellationToken::new();
        let supported = match self
            .endpoint
            .chat(body, Duration::from_secs(self.cfg.base_timeout_secs), &cancel)
            .await
        {
            Err(EndpointError::Http { status: 400, body }) if is_tool_rejection(&body) => {
                warn!(model = %self.cfg.name, "model does not support tools");
                false
            }
            // Anything else, including transport failures, counts as
            // supported; a real failure will surface on the actual request
            // with a proper error message.
            _ => true,
        };
        *self.tool_support.lock().unwrap() = Some(supported);
        supported
    }

    /// Send a chat request and return the aggregated response.
    ///
    /// Retries transport failures up to the configured budget with
    /// exponential back-off (linear for decode failures) and an adaptive
    /// per-attempt timeout.  Streamed text/thinking deltas are forwarded to
    /// `deltas` as they arrive.  Cancellation returns a response with
    /// `interrupted = true` carrying any partial content.
    pub async fn send(
        &self,
        messages: &[ChatMessage],
        opts: SendOptions,
        deltas: Option<&mpsc::Sender<ChatDelta>>,
    ) -> ChatResponse {
        let cancel = {
            let mut current = self.current.lock().unwrap();
            *current = CancellationToken::new();
            current.clone()
        };

        let max_retries = opts.max_retries.unwrap_or(self.cfg.max_retries);
        let send_tools: &[ToolSchema] = if self.tools_supported() {
            &opts.tools
        } else {
            &[]
        };
        let body = self.build_body(messages, send_tools, opts.stream);

        let mut round = self
            .send_with_retries(body, max_retries, &cancel, deltas)
            .await;

        // Lazy capability detection: a 400 that complains about tools on a
        // tool-bearing request marks the model as tool-incapable and the
        // request is retried once without them.
        if let Round::Failed { error, .. } = &round {
            if !send_tools.is_empty() && is_tool_rejection(error) {
                warn!(model = %self.cfg.name, "endpoint rejected tools; retrying without and caching");
                *self.tool_support.lock().unwrap() = Some(false);
                let body = self.build_body(messages, &[], opts.stream);
                round = self.send_with_retries(body, max_retries, &cancel, deltas).await;
            }
        }

        let agg = match round {
            Round::Done(agg) => agg,
            Round::Interrupted { partial } => {
                let streamed = !partial.is_empty();
                return ChatResponse::interrupted(partial, streamed);
            }
            Round::Failed { error, suggestion } => {
                return ChatResponse::failed(error, suggestion);
            }
        };

        let mut response = ChatResponse {
            streamed: !agg.content.is_empty() && deltas.is_some(),
            thinking: if agg.thinking.is_empty() {
                None
            } else {
                Some(strip_think_wrappers(agg.thinking))
            },
            content: agg.content,
            ..Default::default()
        };

        // A model that emits its reasoning as a bare <think> block produced
        // no real answer; reclassify so the agent loop sees an empty turn.
        reclassify_inline_thinking(&mut response);

        let raw = match agg.raw_tool_calls {
            Some(raw) => raw,
            None => return response,
        };
        let normalized = normalize_tool_calls(&raw);
        if normalized.errors.is_empty() {
            response.tool_calls = normalized.calls;
            return response;
        }

        // Repair round: hand the model its own broken calls plus a
        // description of the required shape, non-streamed, no retries.
        warn!(errors = ?normalized.errors, "tool calls failed validation; attempting repair round");
        let mut retry_messages = messages.to_vec();
        retry_messages.push(assistant_with_raw_calls(&response, &raw));
        retry_messages.push(ChatMessage::user(validation_correction(&normalized.errors)));
        let retry_body = self.build_body(&retry_messages, &opts.tools, false);

        if let Round::Done(retry_agg) = self.send_with_retries(retry_body, 0, &cancel, None).await {
            if let Some(raw2) = retry_agg.raw_tool_calls {
                let n2 = normalize_tool_calls(&raw2);
                if n2.errors.is_empty() && !n2.calls.is_empty() {
                    return ChatResponse {
                        content: retry_agg.content,
                        tool_calls: n2.calls,
                        ..Default::default()
                    };
                }
            }
        }

        response.tool_calls = normalized.calls;
        response.validation_failed = true;
        response.validation_errors = normalized.errors;
        response
    }

    /// The retry loop around one logical request.
    async fn send_with_retries(
        &self,
        body: Value,
        max_retries: u32,
        cancel: &CancellationToken,
        deltas: Option<&mpsc::Sender<ChatDelta>>,
    ) -> Round {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Round::Interrupted {
                    partial: String::new(),
                };
            }

            let timeout = Duration::from_secs(
                self.cfg.base_timeout_secs + attempt as u64 * self.cfg.retry_timeout_increment_secs,
            );
            let outcome = match self.endpoint.chat(body.clone(), timeout, cancel).await {
                Ok(stream) => self.aggregate(stream, cancel, deltas).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(agg) if agg.interrupted => {
                    return Round::Interrupted {
                        partial: agg.content,
                    };
                }
                Ok(agg) => return Round::Done(agg),
                Err(EndpointError::Cancelled) => {
                    return Round::Interrupted {
                        partial: String::new(),
                    };
                }
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    let delay = backoff_delay(&e, attempt);
                    warn!(attempt, error = %e, delay_secs = delay.as_secs(), "request failed; backing off");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Round::Interrupted { partial: String::new() };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    return Round::Failed {
                        suggestion: self.suggestion_for(&e),
                        error: e.to_string(),
                    };
                }
            }
        }
    }

    /// Drain one response stream.
    ///
    /// Content and thinking accumulate by concatenation; `tool_calls` are
    /// replaced: the last non-empty value wins.  A frame with `done = true`
    /// (or stream end) terminates.  Transport errors mid-stream surface only
    /// when nothing useful arrived; a partial response beats a hard failure.
    async fn aggregate(
        &self,
        mut stream: ChatStream,
        cancel: &CancellationToken,
        deltas: Option<&mpsc::Sender<ChatDelta>>,
    ) -> Result<Aggregated, EndpointError> {
        let mut agg = Aggregated::default();
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    agg.interrupted = true;
                    return Ok(agg);
                }
                item = stream.next() => item,
            };
            let frame = match item {
                None => break,
                Some(Ok(f)) => f,
                Some(Err(e)) => {
                    if agg.content.is_empty() && agg.raw_tool_calls.is_none() {
                        return Err(e);
                    }
                    warn!(error = %e, "stream broke mid-response; keeping partial content");
                    break;
                }
            };

            if !frame.thinking.is_empty() {
                agg.thinking.push_str(&frame.thinking);
                if let Some(tx) = deltas {
                    let _ = tx.send(ChatDelta::Thinking(frame.thinking.clone())).await;
                }
            }
            if !frame.content.is_empty() {
                agg.content.push_str(&frame.content);
                if let Some(tx) = deltas {
                    let _ = tx.send(ChatDelta::Text(frame.content.clone())).await;
                }
            }
            if let Some(tc) = frame.tool_calls {
                let non_empty = match &tc {
                    Value::Array(a) => !a.is_empty(),
                    Value::Null => false,
                    _ => true,
                };
                if non_empty {
                    agg.raw_tool_calls = Some(tc);
                }
            }
            if frame.done {
                break;
            }
        }
        Ok(agg)
    }

    fn build_body(&self, messages: &[ChatMessage], tools: &[ToolSchema], stream: bool) -> Value {
        let mut options = json!({
            "temperature": self.cfg.temperature,
            "num_ctx": self.cfg.context_size,
        });
        if let Some(n) = self.cfg.max_tokens {
            options["num_predict"] = json!(n);
        }
        let mut body = json!({
            "model": self.cfg.name,
            "messages": messages.iter().map(ChatMessage::to_wire).collect::<Vec<_>>(),
            "stream": stream,
            "options": options,
        });
        if let Some(keep) = &self.cfg.keep_alive {
            body["keep_alive"] = json!(keep);
        }
        if let Some(effort) = &self.cfg.reasoning_effort {
            body["options"]["reasoning_effort"] = json!(effort);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools.iter().map(ToolSchema::to_wire).collect::<Vec<_>>());
            body["tool_choice"] = json!("auto");
        }
        debug!(model = %self.cfg.name, messages = messages.len(), tools = tools.len(), "built chat request");
        body
    }

    fn suggestion_for(&self, e: &EndpointError) -> Option<String> {
        match e {
            EndpointError::Network(_) | EndpointError::Timeout(_) => Some(format!(
                "Is the model server running at {}? Start it and try again.",
                self.cfg.endpoint
            )),
            EndpointError::Http { status: 404, .. } => Some(format!(
                "Model '{}' was not found on the server. Pull it first or pick another with /model.",
                self.cfg.name
            )),
            _ => None,
        }
    }
}

/// Reconstruct the assistant message that carried the broken tool calls so
/// the repair round sees exactly what the model produced.
fn assistant_with_raw_calls(resp: &ChatResponse, raw: &Value) -> ChatMessage {
    let mut m = ChatMessage::assistant(resp.content.clone());
    match serde_json::from_value::<Vec<ToolCallRequest>>(raw.clone()) {
        Ok(calls) => m.tool_calls = calls,
        // Calls too malformed to re-serialize ride along as text.
        Err(_) => {
            m.content = format!("{}\n\n[previous tool_calls]: {}", m.content, raw);
        }
    }
    m
}

fn validation_correction(errors: &[String]) -> String {
    let mut msg =
        String::from("Your previous tool calls were malformed and could not be executed:\n");
    for e in errors {
        msg.push_str(&format!("- {e}\n"));
    }
    msg.push_str(
        "\nRe-issue the tool calls using exactly this JSON shape:\n\
         {\"id\": \"<id>\", \"type\": \"function\", \"function\": \
         {\"name\": \"<tool name>\", \"arguments\": { ... }}}\n\
         `arguments` must be a JSON object, not a string.",
    );
    msg
}

/// Does this 400-class error text look like "this model has no tool support"?
fn is_tool_rejection(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("400") && lower.contains("tool")
        || lower.contains("does not support tools")
        || lower.contains("tools are not supported")
}

fn backoff_delay(err: &EndpointError, attempt: u32) -> Duration {
    if err.is_decode() {
        Duration::from_secs(1 + attempt as u64)
    } else {
        Duration::from_secs(1u64 << attempt.min(6))
    }
}

/// Strip `<think>` / `</think>` wrapper tags from accumulated thinking.
///
/// Some serving layers forward the raw markup inside the thinking field
/// instead of the clean inner text.
fn strip_think_wrappers(s: String) -> String {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("<think>").unwrap_or(trimmed);
    let inner = inner.strip_suffix("</think>").unwrap_or(inner);
    inner.trim().to_string()
}

/// When the entire text response is a single `<think>…</think>` block, the
/// model thought without answering.  Move the text into `thinking` so the
/// caller sees an empty turn and applies its retry nudge.
fn reclassify_inline_thinking(resp: &mut ChatResponse) {
    if resp.content.is_empty() || resp.thinking.is_some() {
        return;
    }
    let trimmed = resp.content.trim();
    let inner = match trimmed.strip_prefix("<think>") {
        Some(i) => i,
        None => return,
    };
    let inner = inner.strip_suffix("</think>").unwrap_or(inner);
    // Real content after the think block means this is a normal answer.
    if inner.contains("</think>") {
        return;
    }
    resp.thinking = Some(inner.trim().to_string());
    resp.content.clear();
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
