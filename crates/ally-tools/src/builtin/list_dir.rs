// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{ErrorKind, Tool, ToolCall, ToolCtx, ToolResult};

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a directory's entries, directories first, each directory\n\
         suffixed with '/'. Not recursive; use glob for that."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: current directory)"
                }
            },
            "additionalProperties": false
        })
    }

    fn is_exploratory(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolResult {
        let path = call
            .args
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(".")
            .to_string();

        let mut reader = match tokio::fs::read_dir(&path).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolResult::err(
                    ErrorKind::UserError,
                    format!("directory not found: {path}"),
                )
            }
            Err(e) => {
                return ToolResult::err(ErrorKind::SystemError, format!("read_dir error: {e}"))
            }
        };

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => dirs.push(format!("{name}/")),
                _ => files.push(name),
            }
        }
        dirs.sort();
        files.sort();

        let count = dirs.len() + files.len();
        let listing: Vec<String> = dirs.into_iter().chain(files).collect();
        ToolResult::ok()
            .with("path", path)
            .with("entries", count)
            .with("content", listing.join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
