// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::events::{TodoItem, ToolEvent};
use crate::tool::{ErrorKind, Tool, ToolCall, ToolCtx, ToolResult};

pub struct TodoWriteTool {
    todos: Arc<Mutex<Vec<TodoItem>>>,
    event_tx: mpsc::Sender<ToolEvent>,
}

impl TodoWriteTool {
    pub fn new(todos: Arc<Mutex<Vec<TodoItem>>>, event_tx: mpsc::Sender<ToolEvent>) -> Self {
        Self { todos, event_tx }
    }
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "Create and manage the structured task list for this session.\n\n\
         ## Statuses\n\
         - pending: not yet started\n\
         - in_progress: currently being worked on (only ONE at a time)\n\
         - completed: finished\n\n\
         ## When to use\n\
         - Complex multi-step tasks (3+ distinct steps)\n\
         - The user provides multiple tasks at once\n\n\
         ## When NOT to use\n\
         - Single straightforward tasks\n\
         - Purely conversational requests\n\n\
         ## IMPORTANT\n\
         - Each item needs a unique id, a task, and a status\n\
         - Calling todo_write replaces the entire list (not a merge)\n\
         - Mark items completed immediately after finishing them"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "description": "The full todo list (replaces the existing one)",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {
                                "type": "string",
                                "description": "Unique identifier for the task"
                            },
                            "task": {
                                "type": "string",
                                "description": "Description of the task"
                            },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed"],
                                "description": "Current status"
                            },
                            "active_form": {
                                "type": "string",
                                "description": "Present-continuous label shown while in progress"
                            }
                        },
                        "required": ["id", "task", "status"]
                    }
                }
            },
            "required": ["todos"],
            "additionalProperties": false
        })
    }

    /// Bookkeeping; does not reset the exploratory streak.
    fn breaks_exploratory_streak(&self) -> bool {
        false
    }

    fn should_collapse(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolResult {
        let raw = match call.args.get("todos").and_then(Value::as_array) {
            Some(a) => a,
            None => {
                return ToolResult::err(
                    ErrorKind::ValidationError,
                    "missing required parameter 'todos' (array)",
                )
            }
        };

        let mut items = Vec::with_capacity(raw.len());
        let mut in_progress = 0usize;
        for (i, entry) in raw.iter().enumerate() {
            let id = match entry.get("id").and_then(Value::as_str) {
                Some(s) if !s.is_empty() => s.to_string(),
                _ => {
                    return ToolResult::err(
                        ErrorKind::ValidationError,
                        format!("todo #{i}: missing 'id'"),
                    )
                }
            };
            // `content` accepted as an alias; some models insist on it.
            let task = match entry
                .get("task")
                .or_else(|| entry.get("content"))
                .and_then(Value::as_str)
            {
                Some(s) if !s.is_empty() => s.to_string(),
                _ => {
                    return ToolResult::err(
                        ErrorKind::ValidationError,
                        format!("todo #{i}: missing 'task'"),
                    )
                }
            };
            let status = match entry.get("status").and_then(Value::as_str) {
                Some(s @ ("pending" | "in_progress" | "completed")) => s.to_string(),
                other => {
                    return ToolResult::err(
                        ErrorKind::ValidationError,
                        format!(
                            "todo #{i}: status must be pending, in_progress or completed (got {other:?})"
                        ),
                    )
                }
            };
            if status == "in_progress" {
                in_progress += 1;
            }
            items.push(TodoItem {
                id,
                task,
                status,
                active_form: entry
                    .get("active_form")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                created_at: chrono::Utc::now(),
            });
        }

        if in_progress > 1 {
            return ToolResult::err(
                ErrorKind::ValidationError,
                format!("{in_progress} items are in_progress; at most one is allowed"),
            );
        }

        debug!(count = items.len(), "todo_write tool");
        *self.todos.lock().await = items.clone();
        let _ = self.event_tx.send(ToolEvent::TodoUpdate(items.clone())).await;

        ToolResult::ok()
            .with("count", items.len())
            .with(
                "in_progress",
                items
                    .iter()
                    .find(|t| t.status == "in_progress")
                    .map(|t| json!(t.id))
                    .unwrap_or(Value::Null),
            )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> (TodoWriteTool, Arc<Mutex<Vec<TodoItem>>>, mpsc::Receiver<ToolEvent>) {
        let todos = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel(16);
        (TodoWriteTool::new(todos.clone(), tx), todos, rx)
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "t1".into(),
            name: "todo_write".into(),
            args,
        }
    }

    #[tokio::test]
    async fn replaces_list_and_emits_event() {
        let (t, todos, mut rx) = tool();
        let out = t
            .execute(
                &call(json!({"todos": [
                    {"id": "1", "task": "analyze", "status": "in_progress"},
                    {"id": "2", "task": "implement", "status": "pending"}
                ]})),
                &ToolCtx::test(),
            )
            .await;
        assert!(out.success, "{}", out.error);
        assert_eq!(todos.lock().await.len(), 2);
        assert_eq!(out.get("in_progress").unwrap(), &json!("1"));
        match rx.recv().await.unwrap() {
            ToolEvent::TodoUpdate(items) => assert_eq!(items.len(), 2),
        }
    }

    #[tokio::test]
    async fn two_in_progress_items_are_rejected() {
        let (t, todos, _rx) = tool();
        let out = t
            .execute(
                &call(json!({"todos": [
                    {"id": "1", "task": "a", "status": "in_progress"},
                    {"id": "2", "task": "b", "status": "in_progress"}
                ]})),
                &ToolCtx::test(),
            )
            .await;
        assert_eq!(out.error_kind, Some(ErrorKind::ValidationError));
        assert!(todos.lock().await.is_empty(), "rejected write must not commit");
    }

    #[tokio::test]
    async fn content_is_accepted_as_task_alias() {
        let (t, todos, _rx) = tool();
        let out = t
            .execute(
                &call(json!({"todos": [
                    {"id": "1", "content": "aliased", "status": "pending"}
                ]})),
                &ToolCtx::test(),
            )
            .await;
        assert!(out.success);
        assert_eq!(todos.lock().await[0].task, "aliased");
    }

    #[tokio::test]
    async fn unknown_status_is_rejected() {
        let (t, _, _rx) = tool();
        let out = t
            .execute(
                &call(json!({"todos": [{"id": "1", "task": "x", "status": "cancelled"}]})),
                &ToolCtx::test(),
            )
            .await;
        assert_eq!(out.error_kind, Some(ErrorKind::ValidationError));
    }

    #[tokio::test]
    async fn second_write_replaces_not_merges() {
        let (t, todos, _rx) = tool();
        t.execute(
            &call(json!({"todos": [{"id": "1", "task": "a", "status": "pending"}]})),
            &ToolCtx::test(),
        )
        .await;
        t.execute(
            &call(json!({"todos": [{"id": "9", "task": "z", "status": "pending"}]})),
            &ToolCtx::test(),
        )
        .await;
        let list = todos.lock().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "9");
    }
}
