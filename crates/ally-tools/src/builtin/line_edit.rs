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
use crate::read_state::{ranges_text, ReadStateTracker};
use crate::tool::{ChangePreview, ErrorKind, Tool, ToolCall, ToolCtx, ToolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Replace,
    Insert,
    Delete,
}

impl Op {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "replace" => Some(Op::Replace),
            "insert" => Some(Op::Insert),
            "delete" => Some(Op::Delete),
            _ => None,
        }
    }
}

/// Line-precise edit guarded by read-before-edit.
///
/// The target line must have been read (or written) this session; on
/// success, coverage from the edited line onward is invalidated, so stale
/// follow-up edits force a re-read even when nothing shifted.
pub struct LineEditTool {
    tracker: Arc<ReadStateTracker>,
    journal: Arc<PatchJournal>,
}

impl LineEditTool {
    pub fn new(tracker: Arc<ReadStateTracker>, journal: Arc<PatchJournal>) -> Self {
        Self { tracker, journal }
    }

    fn parse_args(args: &Value) -> Result<(String, Op, usize, String), ToolResult> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ToolResult::err(ErrorKind::ValidationError, "missing required parameter 'path'")
            })?
            .to_string();
        let op = args
            .get("operation")
            .and_then(Value::as_str)
            .and_then(Op::parse)
            .ok_or_else(|| {
                ToolResult::err(
                    ErrorKind::ValidationError,
                    "operation must be one of: replace, insert, delete",
                )
            })?;
        let line = args.get("line").and_then(Value::as_u64).ok_or_else(|| {
            ToolResult::err(ErrorKind::ValidationError, "missing required parameter 'line'")
        })? as usize;
        if line < 1 {
            return Err(ToolResult::err(
                ErrorKind::ValidationError,
                "line numbers are 1-indexed",
            ));
        }
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if matches!(op, Op::Replace | Op::Insert) && content.is_empty() {
            return Err(ToolResult::err(
                ErrorKind::ValidationError,
                "'content' is required for replace and insert",
            ));
        }
        Ok((path, op, line, content))
    }

    fn apply(lines: &mut Vec<String>, op: Op, line: usize, content: &str) -> i64 {
        let new_lines: Vec<String> = content.lines().map(str::to_string).collect();
        match op {
            Op::Replace => {
                let delta = new_lines.len() as i64 - 1;
                lines.splice(line - 1..line, new_lines);
                delta
            }
            Op::Insert => {
                let delta = new_lines.len() as i64;
                lines.splice(line - 1..line - 1, new_lines);
                delta
            }
            Op::Delete => {
                lines.remove(line - 1);
                -1
            }
        }
    }
}

#[async_trait]
impl Tool for LineEditTool {
    fn name(&self) -> &str {
        "line_edit"
    }

    fn description(&self) -> &str {
        "Edit a file at a specific 1-indexed line.\n\
         operation=replace: replace that line with `content` (may be multi-line)\n\
         operation=insert:  insert `content` before that line\n\
         operation=delete:  remove that line\n\
         The target line must have been read with read_file first; after the\n\
         edit, lines from the edit point onward must be re-read before the\n\
         next line_edit."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file"
                },
                "operation": {
                    "type": "string",
                    "enum": ["replace", "insert", "delete"],
                    "description": "What to do at the target line"
                },
                "line": {
                    "type": "integer",
                    "description": "1-indexed target line"
                },
                "content": {
                    "type": "string",
                    "description": "New content for replace/insert (may span multiple lines)"
                }
            },
            "required": ["path", "operation", "line"],
            "additionalProperties": false
        })
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    fn validate_before_permission(&self, args: &Value) -> Option<ToolResult> {
        Self::parse_args(args).err()
    }

    async fn preview_changes(&self, call: &ToolCall) -> Option<ChangePreview> {
        let (path, op, line, content) = Self::parse_args(&call.args).ok()?;
        let old = tokio::fs::read_to_string(&path).await.ok()?;
        let mut lines: Vec<String> = old.lines().map(str::to_string).collect();
        if line > lines.len() + 1 || (matches!(op, Op::Replace | Op::Delete) && line > lines.len())
        {
            return None;
        }
        Self::apply(&mut lines, op, line, &content);
        let mut new = lines.join("\n");
        if old.ends_with('\n') {
            new.push('\n');
        }
        Some(ChangePreview {
            diff: unified_diff(&path, &old, &new),
            path,
        })
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolResult {
        let (path, op, line, content) = match Self::parse_args(&call.args) {
            Ok(t) => t,
            Err(r) => return r,
        };

        let old = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolResult::err(ErrorKind::UserError, format!("file not found: {path}"))
            }
            Err(e) => {
                return ToolResult::err(ErrorKind::SystemError, format!("read error: {e}"))
            }
        };
        let mut lines: Vec<String> = old.lines().map(str::to_string).collect();

        let max_line = match op {
            Op::Insert => lines.len() + 1,
            _ => lines.len(),
        };
        if line > max_line {
            return ToolResult::err(
                ErrorKind::ValidationError,
                format!("line {line} is out of range; {path} has {} lines", lines.len()),
            );
        }

        // Read-before-edit: the model must have seen the line it is touching.
        // Inserting at end-of-file validates the last existing line instead.
        let check_line = line.min(lines.len().max(1));
        if !lines.is_empty() {
            if let Err(missing) = self.tracker.validate_lines_read(Path::new(&path), check_line, check_line)
            {
                return ToolResult::err(
                    ErrorKind::ValidationError,
                    format!(
                        "Lines {} of {path} have not been read. \
                         Read them with read_file before editing.",
                        ranges_text(&missing)
                    ),
                );
            }
        }

        debug!(path = %path, ?op, line, "line_edit tool");

        let delta = Self::apply(&mut lines, op, line, &content);
        let mut new = lines.join("\n");
        if old.ends_with('\n') || new.is_empty() {
            new.push('\n');
        }
        if let Err(e) = tokio::fs::write(&path, &new).await {
            return ToolResult::err(ErrorKind::SystemError, format!("write failed: {e}"));
        }

        self.journal
            .record(Path::new(&path), PatchKind::LineEdit, Some(old));
        // Coverage at and after the edit point is stale either way: shifted
        // lines moved, and an in-place replacement changed what the model
        // believes the line says.
        if delta != 0 {
            self.tracker.invalidate_after_edit(Path::new(&path), line, delta);
        } else {
            self.tracker.truncate_from(Path::new(&path), line);
        }

        ToolResult::ok()
            .with("path", path)
            .with("line", line)
            .with("line_delta", delta)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> (LineEditTool, Arc<ReadStateTracker>, Arc<PatchJournal>) {
        let tracker = Arc::new(ReadStateTracker::new());
        let journal = Arc::new(PatchJournal::new(50, 1024 * 1024));
        (
            LineEditTool::new(tracker.clone(), journal.clone()),
            tracker,
            journal,
        )
    }

    fn fixture(content: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, content).unwrap();
        (dir, path.to_string_lossy().into_owned())
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "le1".into(),
            name: "line_edit".into(),
            args,
        }
    }

    #[tokio::test]
    async fn unread_line_is_rejected() {
        let (_d, path) = fixture("a\nb\nc\n");
        let (t, _, _) = tool();
        let out = t
            .execute(
                &call(json!({"path": path, "operation": "replace", "line": 2, "content": "B"})),
                &ToolCtx::test(),
            )
            .await;
        assert_eq!(out.error_kind, Some(ErrorKind::ValidationError));
        assert!(out.error.contains("not been read"), "{}", out.error);
        assert!(out.error.contains('2'), "{}", out.error);
    }

    #[tokio::test]
    async fn replace_after_read_succeeds_then_requires_re_read() {
        let (_d, path) = fixture("a\nb\nc\n");
        let (t, tracker, _) = tool();
        tracker.track_read(Path::new(&path), 1, 3);

        let out = t
            .execute(
                &call(json!({"path": path, "operation": "replace", "line": 2, "content": "B"})),
                &ToolCtx::test(),
            )
            .await;
        assert!(out.success, "{}", out.error);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nB\nc\n");

        // Line 3 was read before, but the edit at line 2 invalidated it.
        let out2 = t
            .execute(
                &call(json!({"path": path, "operation": "replace", "line": 3, "content": "C"})),
                &ToolCtx::test(),
            )
            .await;
        assert_eq!(out2.error_kind, Some(ErrorKind::ValidationError));
        assert!(out2.error.contains("not been read") || out2.error.contains('3'));
    }

    #[tokio::test]
    async fn lines_before_edit_stay_editable() {
        let (_d, path) = fixture("a\nb\nc\n");
        let (t, tracker, _) = tool();
        tracker.track_read(Path::new(&path), 1, 3);
        t.execute(
            &call(json!({"path": path, "operation": "replace", "line": 2, "content": "B"})),
            &ToolCtx::test(),
        )
        .await;
        let out = t
            .execute(
                &call(json!({"path": path, "operation": "replace", "line": 1, "content": "A"})),
                &ToolCtx::test(),
            )
            .await;
        assert!(out.success, "{}", out.error);
    }

    #[tokio::test]
    async fn insert_shifts_and_reports_delta() {
        let (_d, path) = fixture("a\nc\n");
        let (t, tracker, _) = tool();
        tracker.track_read(Path::new(&path), 1, 2);
        let out = t
            .execute(
                &call(json!({"path": path, "operation": "insert", "line": 2, "content": "b"})),
                &ToolCtx::test(),
            )
            .await;
        assert!(out.success, "{}", out.error);
        assert_eq!(out.get("line_delta").unwrap(), &json!(1));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\nc\n");
    }

    #[tokio::test]
    async fn multi_line_replace_reports_positive_delta() {
        let (_d, path) = fixture("one\ntwo\n");
        let (t, tracker, _) = tool();
        tracker.track_read(Path::new(&path), 1, 2);
        let out = t
            .execute(
                &call(json!({
                    "path": path, "operation": "replace", "line": 2, "content": "two\nthree\nfour"
                })),
                &ToolCtx::test(),
            )
            .await;
        assert!(out.success);
        assert_eq!(out.get("line_delta").unwrap(), &json!(2));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "one\ntwo\nthree\nfour\n"
        );
    }

    #[tokio::test]
    async fn delete_removes_line() {
        let (_d, path) = fixture("a\nb\nc\n");
        let (t, tracker, _) = tool();
        tracker.track_read(Path::new(&path), 1, 3);
        let out = t
            .execute(
                &call(json!({"path": path, "operation": "delete", "line": 2})),
                &ToolCtx::test(),
            )
            .await;
        assert!(out.success);
        assert_eq!(out.get("line_delta").unwrap(), &json!(-1));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nc\n");
    }

    #[tokio::test]
    async fn out_of_range_line_is_validation_error() {
        let (_d, path) = fixture("only\n");
        let (t, tracker, _) = tool();
        tracker.track_read(Path::new(&path), 1, 1);
        let out = t
            .execute(
                &call(json!({"path": path, "operation": "replace", "line": 9, "content": "x"})),
                &ToolCtx::test(),
            )
            .await;
        assert_eq!(out.error_kind, Some(ErrorKind::ValidationError));
        assert!(out.error.contains("out of range"));
    }

    #[tokio::test]
    async fn insert_at_end_of_file_is_allowed() {
        let (_d, path) = fixture("a\n");
        let (t, tracker, _) = tool();
        tracker.track_read(Path::new(&path), 1, 1);
        let out = t
            .execute(
                &call(json!({"path": path, "operation": "insert", "line": 2, "content": "b"})),
                &ToolCtx::test(),
            )
            .await;
        assert!(out.success, "{}", out.error);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
    }

    #[tokio::test]
    async fn edit_is_undoable() {
        let (_d, path) = fixture("a\nb\n");
        let (t, tracker, journal) = tool();
        tracker.track_read(Path::new(&path), 1, 2);
        t.execute(
            &call(json!({"path": path, "operation": "delete", "line": 1})),
            &ToolCtx::test(),
        )
        .await;
        journal.undo_last().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
    }

    #[tokio::test]
    async fn unknown_operation_fails_validation() {
        let (t, _, _) = tool();
        let r = t
            .validate_before_permission(&json!({"path": "/f", "operation": "munge", "line": 1}))
            .unwrap();
        assert!(r.error.contains("operation"));
    }

    #[tokio::test]
    async fn write_then_line_edit_needs_no_read() {
        // Companion to the write tool's contract: a fresh write marks all
        // lines read, so line_edit works immediately.
        let (_d, path) = fixture("seed\n");
        let (t, tracker, _) = tool();
        tracker.clear_file(Path::new(&path));
        tracker.track_read(Path::new(&path), 1, 1);
        let out = t
            .execute(
                &call(json!({"path": path, "operation": "replace", "line": 1, "content": "grown"})),
                &ToolCtx::test(),
            )
            .await;
        assert!(out.success);
    }
}
