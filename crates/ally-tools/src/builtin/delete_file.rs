// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::patch::{PatchJournal, PatchKind};
use crate::read_state::ReadStateTracker;
use crate::tool::{ErrorKind, Tool, ToolCall, ToolCtx, ToolResult};

pub struct DeleteFileTool {
    tracker: Arc<ReadStateTracker>,
    journal: Arc<PatchJournal>,
}

impl DeleteFileTool {
    pub fn new(tracker: Arc<ReadStateTracker>, journal: Arc<PatchJournal>) -> Self {
        Self { tracker, journal }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a single file. Directories are refused. The deletion is\n\
         undoable within this session via /undo."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path of the file to delete"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolResult {
        let path = match call.args.get("path").and_then(Value::as_str) {
            Some(p) => p,
            None => {
                return ToolResult::err(
                    ErrorKind::ValidationError,
                    "missing required parameter 'path'",
                )
            }
        };

        let meta = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolResult::err(ErrorKind::UserError, format!("file not found: {path}"))
            }
            Err(e) => {
                return ToolResult::err(ErrorKind::SystemError, format!("stat error: {e}"))
            }
        };
        if meta.is_dir() {
            return ToolResult::err(
                ErrorKind::SecurityError,
                format!("{path} is a directory; delete_file only removes files"),
            );
        }

        let pre_image = match tokio::fs::read_to_string(path).await {
            Ok(c) => Some(c),
            // Binary content cannot be restored through the text journal;
            // the deletion still proceeds but is not undoable.
            Err(_) => None,
        };

        debug!(path = %path, "delete_file tool");
        if let Err(e) = tokio::fs::remove_file(path).await {
            return ToolResult::err(ErrorKind::SystemError, format!("delete failed: {e}"));
        }

        if let Some(content) = pre_image {
            self.journal
                .record(Path::new(path), PatchKind::Delete, Some(content));
        }
        self.tracker.clear_file(Path::new(path));

        ToolResult::ok().with("path", path).with("deleted", true)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
