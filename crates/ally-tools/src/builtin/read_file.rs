// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::read_state::ReadStateTracker;
use crate::tool::{ErrorKind, OutputCategory, Tool, ToolCall, ToolCtx, ToolResult};

/// Default number of lines returned when the caller does not specify a limit.
/// Kept small to avoid flooding the model context on the first read; the
/// model can paginate with offset + limit.
const DEFAULT_LINE_LIMIT: usize = 200;

/// Hard byte ceiling applied in addition to the line limit.
const MAX_BYTES: usize = 20_000;

pub struct ReadFileTool {
    tracker: Arc<ReadStateTracker>,
}

impl ReadFileTool {
    pub fn new(tracker: Arc<ReadStateTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file. Default: 200 lines / 20 KB, whichever comes first.\n\
         Lines are formatted as L{n}: content (1-indexed).\n\
         A pagination notice shows the next offset when more lines exist.\n\
         Reading a line range is required before editing it with line_edit.\n\
         Strategy: grep for the relevant region first, then read only those\n\
         lines with offset + limit instead of whole large files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-indexed line number to start reading from (default 1)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default 200)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn is_exploratory(&self) -> bool {
        true
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::FileContent
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolResult {
        let path = match call.args.get("path").and_then(Value::as_str) {
            Some(p) => p.to_string(),
            None => {
                return ToolResult::err(
                    ErrorKind::ValidationError,
                    "missing required parameter 'path'",
                )
            }
        };
        // Offset 0 and 1 both mean "start of file".
        let offset = call
            .args
            .get("offset")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .max(1) as usize;
        let limit = call
            .args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_LINE_LIMIT as u64) as usize;

        debug!(path = %path, offset, limit, "read_file tool");

        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolResult::err(ErrorKind::UserError, format!("file not found: {path}"))
            }
            Err(e) => {
                return ToolResult::err(ErrorKind::SystemError, format!("read error: {e}"))
            }
        };

        let lines: Vec<&str> = raw.lines().collect();
        let total = lines.len();
        if offset > total && total > 0 {
            return ToolResult::err(
                ErrorKind::ValidationError,
                format!("offset {offset} is past the end of the file ({total} lines)"),
            );
        }

        let mut out = String::new();
        let mut end = offset.saturating_sub(1);
        for (idx, line) in lines.iter().enumerate().skip(offset - 1).take(limit) {
            let rendered = format!("L{}: {}\n", idx + 1, line);
            if out.len() + rendered.len() > MAX_BYTES && !out.is_empty() {
                break;
            }
            out.push_str(&rendered);
            end = idx + 1;
        }

        if end >= offset {
            self.tracker.track_read(Path::new(&path), offset, end);
        }

        let mut result = ToolResult::ok()
            .with("content", out)
            .with("start_line", offset)
            .with("end_line", end)
            .with("total_lines", total);
        if end < total {
            result = result.with(
                "note",
                format!("{} more lines; continue with offset={}", total - end, end + 1),
            );
        }
        result
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
