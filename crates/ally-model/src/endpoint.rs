// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Chat endpoint abstraction and the HTTP implementation.
//!
//! The wire format is the Ollama-style chat API: `POST /api/chat` accepting
//! `{model, messages, stream, options, tools?}` and returning either a single
//! JSON object or an NDJSON stream of `{message: {role, content, thinking?,
//! tool_calls?}, done}` frames, plus `GET /api/tags` for model listing.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::wire::ModelInfo;

/// One decoded frame of a streamed (or single-shot) chat response.
#[derive(Debug, Clone, Default)]
pub struct ChatFrame {
    pub content: String,
    pub thinking: String,
    /// Raw `tool_calls` value as sent by the endpoint; normalized later.
    /// Frames replace, not append: the last non-empty value wins.
    pub tool_calls: Option<Value>,
    pub done: bool,
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatFrame, EndpointError>> + Send>>;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("network error: {0}")]
    Network(String),
    #[error("endpoint error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("endpoint reported: {0}")]
    Server(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request cancelled")]
    Cancelled,
}

impl EndpointError {
    /// True when a retry with back-off is worthwhile.
    pub fn is_retryable(&self) -> bool {
        match self {
            EndpointError::Network(_) | EndpointError::Timeout(_) => true,
            EndpointError::Http { status, .. } => *status >= 500,
            EndpointError::Decode(_) => true,
            EndpointError::Server(_) => false,
            EndpointError::Cancelled => false,
        }
    }

    /// Decode failures back off linearly, everything else exponentially.
    pub fn is_decode(&self) -> bool {
        matches!(self, EndpointError::Decode(_))
    }
}

/// Seam between the client and the transport, so agent tests can script
/// responses without a server.
#[async_trait]
pub trait ChatEndpoint: Send + Sync {
    /// Issue one chat request.  `body` is the full wire-format request.
    /// Implementations must honor `cancel` at I/O boundaries.
    async fn chat(
        &self,
        body: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ChatStream, EndpointError>;

    /// List the models the endpoint serves.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, EndpointError>;
}

// ─── HTTP implementation ──────────────────────────────────────────────────────

pub struct HttpEndpoint {
    base_url: String,
    client: reqwest::Client,
}

impl HttpEndpoint {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }
}

#[async_trait]
impl ChatEndpoint for HttpEndpoint {
    async fn chat(
        &self,
        body: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ChatStream, EndpointError> {
        debug!(url = %self.chat_url(), "sending chat request");

        let send = self.client.post(self.chat_url()).timeout(timeout).json(&body).send();
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EndpointError::Cancelled),
            r = send => r,
        };

        let resp = match resp {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(EndpointError::Timeout(timeout)),
            Err(e) => return Err(EndpointError::Network(e.to_string())),
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(EndpointError::Http { status, body });
        }

        // NDJSON frames may be split across TCP chunks: keep a carry-over
        // buffer and emit only complete lines.  Malformed lines are skipped,
        // never fatal.  A `None` sentinel marks end-of-body so the trailing
        // unterminated line (the entire body of a non-streamed response)
        // still gets parsed.
        let byte_stream = resp.bytes_stream();
        let frame_stream = byte_stream
            .map(Some)
            .chain(futures::stream::once(std::future::ready(None)))
            .scan(String::new(), |buf, item| {
                let frames: Vec<Result<ChatFrame, EndpointError>> = match item {
                    Some(Ok(b)) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_lines(buf)
                    }
                    Some(Err(e)) => vec![Err(EndpointError::Network(e.to_string()))],
                    None => flush_remainder(buf),
                };
                std::future::ready(Some(frames))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(frame_stream))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, EndpointError> {
        let resp = self
            .client
            .get(self.tags_url())
            .send()
            .await
            .map_err(|e| EndpointError::Network(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EndpointError::Http {
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| EndpointError::Decode(e.to_string()))?;
        let models = body["models"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| serde_json::from_value(m.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

/// Parse whatever is left in the carry-over buffer at end of body.
/// A non-streamed response arrives as one JSON object with no trailing
/// newline, so this is where it becomes a frame.
pub(crate) fn flush_remainder(buf: &mut String) -> Vec<Result<ChatFrame, EndpointError>> {
    let rest = std::mem::take(buf);
    parse_frame_line(&rest).into_iter().collect()
}

/// Drain all complete `\n`-terminated lines from `buf` and parse each into a
/// [`ChatFrame`].  A trailing incomplete line is left in place so the next
/// chunk can extend it.
pub(crate) fn drain_complete_lines(buf: &mut String) -> Vec<Result<ChatFrame, EndpointError>> {
    let mut frames = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(frame) = parse_frame_line(&line) {
            frames.push(frame);
        }
    }
    frames
}

/// Parse a single NDJSON line into a [`ChatFrame`].
///
/// Returns `None` for blank or malformed lines; the decoder tolerates
/// corrupted frames by skipping them.
pub(crate) fn parse_frame_line(line: &str) -> Option<Result<ChatFrame, EndpointError>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let v: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "skipping malformed stream line");
            return None;
        }
    };
    Some(Ok(parse_frame(&v)))
}

/// Decode one response object.  Also accepted here: the single-call
/// `function_call` shape, converted into a one-element `tool_calls` list.
pub(crate) fn parse_frame(v: &Value) -> ChatFrame {
    if let Some(err) = v.get("error") {
        let msg = err
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        // An in-band error frame terminates the turn; map it onto a done
        // frame with no content and let the client surface the message.
        warn!(error = %msg, "endpoint reported in-band error");
        return ChatFrame {
            done: true,
            ..Default::default()
        };
    }

    let message = &v["message"];
    let tool_calls = match message.get("tool_calls") {
        Some(tc) if !tc.is_null() => Some(tc.clone()),
        _ => message.get("function_call").filter(|fc| !fc.is_null()).map(|fc| json!([fc])),
    };

    ChatFrame {
        content: message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        thinking: message
            .get("thinking")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        tool_calls,
        done: v.get("done").and_then(Value::as_bool).unwrap_or(false),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
