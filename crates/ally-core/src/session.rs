// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ally_model::ChatMessage;
use ally_tools::TodoItem;

/// In-memory conversation session with approximate token accounting.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    /// Approximate total token count for the current message list.
    pub token_count: usize,
    /// Maximum context tokens (from the model config).
    pub max_tokens: usize,
    /// Tool-call ids whose bookkeeping is cleaned up after the response.
    pub pending_tool_cleanups: Vec<String>,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            pending_tool_cleanups: Vec::new(),
        }
    }

    pub fn push(&mut self, msg: ChatMessage) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    /// Fraction of the context window consumed (0.0–1.0).
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        self.token_count as f32 / self.max_tokens as f32
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate the token count from scratch (after trimming).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(ChatMessage::approx_tokens).sum();
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.token_count = 0;
        self.pending_tool_cleanups.clear();
    }
}

/// What the core hands to the session-store collaborator for persistence.
/// Loading and saving to disk is implemented outside the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub messages: Vec<ChatMessage>,
    pub todos: Vec<TodoItem>,
    /// Cached project context, opaque to the core.
    #[serde(default)]
    pub project_context: Option<String>,
    #[serde(default)]
    pub pending_tool_cleanups: Vec<String>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, name: &str) -> anyhow::Result<Option<SessionSnapshot>>;
    async fn save(&self, name: &str, snapshot: &SessionSnapshot) -> anyhow::Result<()>;
}

/// Store that persists nothing; used when no session name was given.
pub struct NullSessionStore;

#[async_trait]
impl SessionStore for NullSessionStore {
    async fn load(&self, _name: &str) -> anyhow::Result<Option<SessionSnapshot>> {
        Ok(None)
    }
    async fn save(&self, _name: &str, _snapshot: &SessionSnapshot) -> anyhow::Result<()> {
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sessions_have_unique_ids() {
        assert_ne!(Session::new(100).id, Session::new(100).id);
    }

    #[test]
    fn push_accumulates_tokens() {
        let mut s = Session::new(1000);
        s.push(ChatMessage::user("12345678")); // 2 tokens
        s.push(ChatMessage::assistant("abcd")); // 1 token
        assert_eq!(s.token_count, 3);
    }

    #[test]
    fn context_fraction_handles_zero_budget() {
        assert_eq!(Session::new(0).context_fraction(), 0.0);
    }

    #[test]
    fn near_limit_threshold() {
        let mut s = Session::new(10);
        s.push(ChatMessage::user("12345678901234567890")); // 5 tokens
        assert!(s.is_near_limit(0.5));
        assert!(!s.is_near_limit(0.6));
    }

    #[test]
    fn recalculate_matches_push_sum() {
        let mut s = Session::new(1000);
        s.push(ChatMessage::user("hello world"));
        let tracked = s.token_count;
        s.recalculate_tokens();
        assert_eq!(s.token_count, tracked);
    }

    #[test]
    fn clear_resets_everything() {
        let mut s = Session::new(1000);
        s.push(ChatMessage::user("x"));
        s.pending_tool_cleanups.push("c1".into());
        s.clear();
        assert!(s.messages.is_empty());
        assert_eq!(s.token_count, 0);
        assert!(s.pending_tool_cleanups.is_empty());
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let snap = SessionSnapshot {
            messages: vec![ChatMessage::user("hi")],
            todos: vec![],
            project_context: Some("rust workspace".into()),
            pending_tool_cleanups: vec!["call-1".into()],
        };
        let json = serde_json::to_string(&snap).unwrap();
        let back: SessionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.messages.len(), 1);
        assert_eq!(back.pending_tool_cleanups, vec!["call-1"]);
    }
}
