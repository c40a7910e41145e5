// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::diffs::unified_diff;
use crate::patch::{PatchJournal, PatchKind};
use crate::read_state::ReadStateTracker;
use crate::tool::{ChangePreview, ErrorKind, Tool, ToolCall, ToolCtx, ToolResult};

/// Create or overwrite a whole file.
pub struct WriteFileTool {
    tracker: Arc<ReadStateTracker>,
    journal: Arc<PatchJournal>,
}

impl WriteFileTool {
    pub fn new(tracker: Arc<ReadStateTracker>, journal: Arc<PatchJournal>) -> Self {
        Self { tracker, journal }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create a new file or overwrite an existing one with the given content.\n\
         Parent directories are created as needed.\n\
         For small changes to an existing file prefer edit_file or line_edit;\n\
         write_file replaces the whole file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path of the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "Full new file content"
                }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    fn validate_before_permission(&self, args: &Value) -> Option<ToolResult> {
        if args.get("path").and_then(Value::as_str).is_none() {
            return Some(ToolResult::err(
                ErrorKind::ValidationError,
                "missing required parameter 'path'",
            ));
        }
        if args.get("content").and_then(Value::as_str).is_none() {
            return Some(ToolResult::err(
                ErrorKind::ValidationError,
                "missing required parameter 'content'",
            ));
        }
        None
    }

    async fn preview_changes(&self, call: &ToolCall) -> Option<ChangePreview> {
        let path = call.args.get("path").and_then(Value::as_str)?;
        let new = call.args.get("content").and_then(Value::as_str)?;
        let old = tokio::fs::read_to_string(path).await.unwrap_or_default();
        Some(ChangePreview {
            path: path.to_string(),
            diff: unified_diff(path, &old, new),
        })
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolResult {
        let path = call.args.get("path").and_then(Value::as_str).unwrap_or("");
        let content = call.args.get("content").and_then(Value::as_str).unwrap_or("");
        if path.is_empty() {
            return ToolResult::err(ErrorKind::ValidationError, "missing required parameter 'path'");
        }

        debug!(path = %path, bytes = content.len(), "write_file tool");

        let pre_image = match tokio::fs::read_to_string(path).await {
            Ok(existing) => Some(existing),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return ToolResult::err(ErrorKind::SystemError, format!("read error: {e}"))
            }
        };

        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return ToolResult::err(
                        ErrorKind::SystemError,
                        format!("creating parent directory: {e}"),
                    );
                }
            }
        }

        if let Err(e) = tokio::fs::write(path, content).await {
            return ToolResult::err(ErrorKind::SystemError, format!("write failed: {e}"));
        }

        self.journal.record(Path::new(path), PatchKind::Write, pre_image);

        // A fresh write makes the whole file "read": the model just authored
        // every line, so it may edit without a round-trip through read_file.
        let line_count = content.lines().count();
        self.tracker.clear_file(Path::new(path));
        if line_count > 0 {
            self.tracker.track_read(Path::new(path), 1, line_count);
        }

        ToolResult::ok()
            .with("path", path)
            .with("bytes", content.len())
            .with("lines", line_count)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> (WriteFileTool, Arc<ReadStateTracker>, Arc<PatchJournal>) {
        let tracker = Arc::new(ReadStateTracker::new());
        let journal = Arc::new(PatchJournal::new(50, 1024 * 1024));
        (
            WriteFileTool::new(tracker.clone(), journal.clone()),
            tracker,
            journal,
        )
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "w1".into(),
            name: "write_file".into(),
            args,
        }
    }

    #[tokio::test]
    async fn writes_new_file_and_marks_lines_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/new.txt");
        let path_str = path.to_string_lossy().into_owned();
        let (t, tracker, journal) = tool();

        let out = t
            .execute(
                &call(json!({"path": path_str, "content": "a\nb\nc\n"})),
                &ToolCtx::test(),
            )
            .await;
        assert!(out.success, "{}", out.error);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\nc\n");
        // Editable without a read: all three lines count as read.
        assert!(tracker.validate_lines_read(&path, 1, 3).is_ok());
        assert!(tracker.validate_lines_read(&path, 1, 4).is_err());
        assert_eq!(journal.len(), 1);
    }

    #[tokio::test]
    async fn overwrite_records_pre_image_for_undo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "old").unwrap();
        let path_str = path.to_string_lossy().into_owned();
        let (t, _, journal) = tool();

        t.execute(&call(json!({"path": path_str, "content": "new"})), &ToolCtx::test())
            .await;
        journal.undo_last().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old");
    }

    #[tokio::test]
    async fn undo_of_fresh_write_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.txt");
        let path_str = path.to_string_lossy().into_owned();
        let (t, _, journal) = tool();

        t.execute(&call(json!({"path": path_str, "content": "x"})), &ToolCtx::test())
            .await;
        journal.undo_last().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn preview_is_a_unified_diff() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "old line\n").unwrap();
        let path_str = path.to_string_lossy().into_owned();
        let (t, _, _) = tool();

        let preview = t
            .preview_changes(&call(json!({"path": path_str, "content": "new line\n"})))
            .await
            .unwrap();
        assert!(preview.diff.contains("-old line"));
        assert!(preview.diff.contains("+new line"));
    }

    #[tokio::test]
    async fn missing_content_fails_pre_permission() {
        let (t, _, _) = tool();
        let r = t.validate_before_permission(&json!({"path": "/x"})).unwrap();
        assert_eq!(r.error_kind, Some(ErrorKind::ValidationError));
    }

    #[test]
    fn write_requires_confirmation() {
        let (t, _, _) = tool();
        assert!(t.requires_confirmation());
        assert!(!t.is_exploratory());
    }
}
