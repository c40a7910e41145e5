// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::endpoint::{ChatEndpoint, ChatFrame, ChatStream, EndpointError};
use crate::wire::ModelInfo;

/// One scripted endpoint round.
pub enum ScriptedCall {
    /// Emit these frames, then end the stream.
    Frames(Vec<ChatFrame>),
    /// Fail the request before any frame is produced.
    Fail(EndpointError),
    /// Return a stream that never yields, for cancellation tests.
    Hang,
}

/// A pre-scripted chat endpoint.  Each `chat` call pops the next script from
/// the front of the queue, so tests can specify exact frame sequences,
/// including tool calls and transport failures, without network access.
pub struct ScriptedEndpoint {
    calls: Mutex<VecDeque<ScriptedCall>>,
    /// Every request body seen, in order, so tests can inspect what was sent.
    requests: Mutex<Vec<Value>>,
    models: Vec<ModelInfo>,
}

impl ScriptedEndpoint {
    pub fn new(calls: Vec<ScriptedCall>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(calls.into()),
            requests: Mutex::new(Vec::new()),
            models: vec![ModelInfo {
                name: "scripted-model".into(),
                size: 0,
                modified_at: None,
            }],
        })
    }

    /// Convenience: endpoint that answers every request with one text reply.
    pub fn always_text(reply: impl Into<String>) -> Arc<Self> {
        let reply = reply.into();
        Self::new(vec![ScriptedCall::Frames(vec![ChatFrame {
            content: reply,
            done: true,
            ..Default::default()
        }])])
    }

    /// Convenience frames: a tool call followed (next round) by a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: Value,
        final_text: impl Into<String>,
    ) -> Arc<Self> {
        Self::new(vec![
            ScriptedCall::Frames(vec![ChatFrame {
                tool_calls: Some(json!([{
                    "id": tool_id.into(),
                    "type": "function",
                    "function": {"name": tool_name.into(), "arguments": args},
                }])),
                done: true,
                ..Default::default()
            }]),
            ScriptedCall::Frames(vec![ChatFrame {
                content: final_text.into(),
                done: true,
                ..Default::default()
            }]),
        ])
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request_at(&self, index: usize) -> Value {
        self.requests.lock().unwrap()[index].clone()
    }

    /// Append more scripted rounds after construction.
    pub fn push_call(&self, call: ScriptedCall) {
        self.calls.lock().unwrap().push_back(call);
    }
}

#[async_trait]
impl ChatEndpoint for ScriptedEndpoint {
    async fn chat(
        &self,
        body: Value,
        _timeout: Duration,
        _cancel: &CancellationToken,
    ) -> Result<ChatStream, EndpointError> {
        self.requests.lock().unwrap().push(body);
        let call = self.calls.lock().unwrap().pop_front();
        match call {
            None => {
                // Scripts exhausted: a recognizable fallback beats a panic in
                // the middle of an agent loop under test.
                let frames = vec![Ok(ChatFrame {
                    content: "[no more scripts]".into(),
                    done: true,
                    ..Default::default()
                })];
                Ok(Box::pin(stream::iter(frames)))
            }
            Some(ScriptedCall::Fail(e)) => Err(e),
            Some(ScriptedCall::Hang) => Ok(Box::pin(stream::pending())),
            Some(ScriptedCall::Frames(frames)) => {
                let items: Vec<Result<ChatFrame, EndpointError>> =
                    frames.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, EndpointError> {
        Ok(self.models.clone())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
