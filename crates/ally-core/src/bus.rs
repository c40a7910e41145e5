// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-process activity bus.
//!
//! Synchronous fan-out of typed events to per-kind and wildcard subscribers.
//! This is a UI/log bus, not a queue: no backpressure, no buffering, and
//! subscribers are expected to return promptly (a renderer appends to its
//! state, a logger writes a line).  Emission after shutdown is a silent
//! no-op so late tool completions do not panic during teardown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;

use ally_tools::TodoItem;

/// Discriminant for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    ToolCallStart,
    ToolCallEnd,
    OutputChunk,
    DiffPreview,
    PermissionRequest,
    AgentStart,
    AgentEnd,
    TextChunk,
    ThoughtChunk,
    TurnComplete,
    TodoUpdate,
    TokenUsage,
    ContextTrimmed,
    InterruptAll,
    Error,
}

/// Closed payload set.  `data`-bearing variants carry what a renderer needs;
/// anything heavier goes through a dedicated channel, not the bus.
#[derive(Debug, Clone)]
pub enum ActivityPayload {
    ToolCallStart {
        call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolCallEnd {
        call_id: String,
        tool_name: String,
        success: bool,
        error_kind: Option<String>,
    },
    OutputChunk {
        call_id: String,
        chunk: String,
    },
    DiffPreview {
        call_id: String,
        path: String,
        diff: String,
    },
    PermissionRequest {
        call_id: String,
        tool_name: String,
        summary: String,
    },
    AgentStart {
        agent_id: String,
        task: String,
    },
    AgentEnd {
        agent_id: String,
        success: bool,
    },
    TextChunk {
        agent_id: String,
        text: String,
    },
    ThoughtChunk {
        agent_id: String,
        text: String,
    },
    TurnComplete {
        agent_id: String,
    },
    TodoUpdate {
        todos: Vec<TodoItem>,
    },
    TokenUsage {
        used: usize,
        budget: usize,
    },
    ContextTrimmed {
        tokens_before: usize,
        tokens_after: usize,
    },
    InterruptAll {
        reason: String,
    },
    Error {
        message: String,
    },
}

impl ActivityPayload {
    pub fn kind(&self) -> ActivityKind {
        match self {
            ActivityPayload::ToolCallStart { .. } => ActivityKind::ToolCallStart,
            ActivityPayload::ToolCallEnd { .. } => ActivityKind::ToolCallEnd,
            ActivityPayload::OutputChunk { .. } => ActivityKind::OutputChunk,
            ActivityPayload::DiffPreview { .. } => ActivityKind::DiffPreview,
            ActivityPayload::PermissionRequest { .. } => ActivityKind::PermissionRequest,
            ActivityPayload::AgentStart { .. } => ActivityKind::AgentStart,
            ActivityPayload::AgentEnd { .. } => ActivityKind::AgentEnd,
            ActivityPayload::TextChunk { .. } => ActivityKind::TextChunk,
            ActivityPayload::ThoughtChunk { .. } => ActivityKind::ThoughtChunk,
            ActivityPayload::TurnComplete { .. } => ActivityKind::TurnComplete,
            ActivityPayload::TodoUpdate { .. } => ActivityKind::TodoUpdate,
            ActivityPayload::TokenUsage { .. } => ActivityKind::TokenUsage,
            ActivityPayload::ContextTrimmed { .. } => ActivityKind::ContextTrimmed,
            ActivityPayload::InterruptAll { .. } => ActivityKind::InterruptAll,
            ActivityPayload::Error { .. } => ActivityKind::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActivityEvent {
    pub id: String,
    /// Call id of the enclosing tool call, for nested sub-agent activity.
    pub parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: ActivityPayload,
}

pub type SubscriberToken = u64;
type Subscriber = (
    SubscriberToken,
    Option<ActivityKind>,
    Arc<dyn Fn(&ActivityEvent) + Send + Sync>,
);

pub struct ActivityBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_token: AtomicU64,
    shut_down: AtomicBool,
}

impl ActivityBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Subscribe to one event kind, or to everything with `None`.
    pub fn subscribe(
        &self,
        kind: Option<ActivityKind>,
        f: impl Fn(&ActivityEvent) + Send + Sync + 'static,
    ) -> SubscriberToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap()
            .push((token, kind, Arc::new(f)));
        token
    }

    pub fn unsubscribe(&self, token: SubscriberToken) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|(t, _, _)| *t != token);
    }

    pub fn emit(&self, payload: ActivityPayload) {
        self.emit_with_parent(None, payload);
    }

    /// Emit with the enclosing tool-call id attached (nested agent activity).
    pub fn emit_with_parent(&self, parent_id: Option<String>, payload: ActivityPayload) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        let event = ActivityEvent {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id,
            timestamp: Utc::now(),
            payload,
        };
        // Snapshot under the lock, deliver outside it: a subscriber that
        // subscribes/unsubscribes from its callback must not deadlock.
        let subscribers: Vec<Subscriber> = self.subscribers.lock().unwrap().clone();
        let kind = event.payload.kind();
        for (_, filter, f) in &subscribers {
            if filter.map(|k| k == kind).unwrap_or(true) {
                f(&event);
            }
        }
    }

    /// Stop delivering events.  Idempotent; later `emit` calls are no-ops.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.subscribers.lock().unwrap().clear();
    }
}

impl Default for ActivityBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
