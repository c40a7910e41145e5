// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A structured todo item managed by the `todo_write` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub task: String,
    /// One of: "pending", "in_progress", "completed".
    pub status: String,
    /// Present-continuous label shown while the item is in progress.
    #[serde(default)]
    pub active_form: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Events emitted by stateful tools back to the agent loop, which translates
/// them into activity-bus events for the UI.
#[derive(Debug)]
pub enum ToolEvent {
    TodoUpdate(Vec<TodoItem>),
}
