// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::diffs::{nearest_match, unified_diff};
use crate::patch::{PatchJournal, PatchKind};
use crate::read_state::ReadStateTracker;
use crate::tool::{ChangePreview, ErrorKind, Tool, ToolCall, ToolCtx, ToolResult};

/// Whole-file string replacement.
///
/// The workhorse edit: replace one exact occurrence of `old_string` (or all
/// of them with `replace_all`).  Because the replacement can move arbitrary
/// line numbers, a successful edit clears the file's read-state; follow-up
/// line edits must re-read.
pub struct EditFileTool {
    tracker: Arc<ReadStateTracker>,
    journal: Arc<PatchJournal>,
}

impl EditFileTool {
    pub fn new(tracker: Arc<ReadStateTracker>, journal: Arc<PatchJournal>) -> Self {
        Self { tracker, journal }
    }

    async fn rewritten(&self, args: &Value) -> Result<(String, String, usize), ToolResult> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ToolResult::err(ErrorKind::ValidationError, "missing required parameter 'path'")
            })?;
        let old_string = args
            .get("old_string")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ToolResult::err(
                    ErrorKind::ValidationError,
                    "missing required parameter 'old_string'",
                )
            })?;
        let new_string = args.get("new_string").and_then(Value::as_str).unwrap_or("");
        let replace_all = args
            .get("replace_all")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolResult::err(
                    ErrorKind::UserError,
                    format!("file not found: {path}"),
                ))
            }
            Err(e) => {
                return Err(ToolResult::err(
                    ErrorKind::SystemError,
                    format!("read error: {e}"),
                ))
            }
        };

        let occurrences = content.matches(old_string).count();
        if occurrences == 0 {
            let mut msg = format!("old_string not found in {path}.");
            if let Some((line, snippet)) = nearest_match(&content, old_string) {
                msg.push_str(&format!("\nNearest match at line {line}:\n{snippet}"));
            }
            msg.push_str("\nRe-read the file and copy the exact text to replace.");
            return Err(ToolResult::err(ErrorKind::ValidationError, msg));
        }
        if occurrences > 1 && !replace_all {
            return Err(ToolResult::err(
                ErrorKind::ValidationError,
                format!(
                    "old_string appears {occurrences} times in {path}. \
                     Add surrounding context to make it unique, or set replace_all."
                ),
            ));
        }

        let new_content = if replace_all {
            content.replace(old_string, new_string)
        } else {
            content.replacen(old_string, new_string, 1)
        };
        Ok((content, new_content, occurrences))
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact string in a file.\n\
         `old_string` must match the file content exactly (including\n\
         whitespace) and must be unique unless `replace_all` is set.\n\
         Include enough surrounding lines to disambiguate.\n\
         After this edit the file's line numbers may have shifted;\n\
         re-read before using line_edit on it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file to edit"
                },
                "old_string": {
                    "type": "string",
                    "description": "Exact text to replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "Replacement text (may be empty to delete)"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default false)"
                }
            },
            "required": ["path", "old_string", "new_string"],
            "additionalProperties": false
        })
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    fn validate_before_permission(&self, args: &Value) -> Option<ToolResult> {
        match args.get("old_string").and_then(Value::as_str) {
            None => Some(ToolResult::err(
                ErrorKind::ValidationError,
                "missing required parameter 'old_string'",
            )),
            Some("") => Some(ToolResult::err(
                ErrorKind::ValidationError,
                "old_string must not be empty; use write_file to create content",
            )),
            Some(old) if Some(old) == args.get("new_string").and_then(Value::as_str) => {
                Some(ToolResult::err(
                    ErrorKind::ValidationError,
                    "old_string and new_string are identical",
                ))
            }
            _ => None,
        }
    }

    async fn preview_changes(&self, call: &ToolCall) -> Option<ChangePreview> {
        let path = call.args.get("path").and_then(Value::as_str)?;
        match self.rewritten(&call.args).await {
            Ok((old, new, _)) => Some(ChangePreview {
                path: path.to_string(),
                diff: unified_diff(path, &old, &new),
            }),
            Err(_) => None,
        }
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolResult {
        let (old, new, occurrences) = match self.rewritten(&call.args).await {
            Ok(t) => t,
            Err(r) => return r,
        };
        let path = call.args.get("path").and_then(Value::as_str).unwrap_or("");
        debug!(path = %path, occurrences, "edit_file tool");

        if let Err(e) = tokio::fs::write(path, &new).await {
            return ToolResult::err(ErrorKind::SystemError, format!("write failed: {e}"));
        }
        self.journal.record(Path::new(path), PatchKind::Edit, Some(old));
        // The whole file's line layout may have changed.
        self.tracker.clear_file(Path::new(path));

        ToolResult::ok()
            .with("path", path)
            .with("replacements", occurrences)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
