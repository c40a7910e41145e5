// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::tool::{ErrorKind, OutputCategory, Tool, ToolCall, ToolCtx, ToolResult};

/// Matches reported before the search stops.  Leading matches are the most
/// relevant ones for the model; a runaway pattern should not flood context.
const MAX_RESULTS: usize = 100;

/// Files larger than this are skipped (generated bundles, archives).
const MAX_FILE_BYTES: u64 = 1024 * 1024;

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression.\n\
         Results are `path:line: text`, capped at 100 matches.\n\
         Use `include` (glob like *.rs) to restrict file types.\n\
         Hidden directories, .git and files over 1 MB are skipped."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "Directory or file to search (default: current directory)"
                },
                "include": {
                    "type": "string",
                    "description": "Only search files matching this glob, e.g. *.rs"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    fn is_exploratory(&self) -> bool {
        true
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::MatchList
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolResult {
        let pattern = match call.args.get("pattern").and_then(Value::as_str) {
            Some(p) => p,
            None => {
                return ToolResult::err(
                    ErrorKind::ValidationError,
                    "missing required parameter 'pattern'",
                )
            }
        };
        let root = call
            .args
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(".")
            .to_string();
        let include = call.args.get("include").and_then(Value::as_str);

        let re = match Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => {
                return ToolResult::err(
                    ErrorKind::ValidationError,
                    format!("invalid regex: {e}"),
                )
            }
        };
        let include_re = match include.map(super::glob::glob_to_path_regex) {
            Some(Ok(r)) => Some(r),
            Some(Err(e)) => {
                return ToolResult::err(ErrorKind::ValidationError, format!("invalid include glob: {e}"))
            }
            None => None,
        };

        debug!(pattern, root = %root, "grep tool");

        let mut matches = Vec::new();
        let mut truncated = false;
        'walk: for entry in WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| !is_hidden_or_ignored(e))
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            if ctx.cancel.is_cancelled() {
                return ToolResult::interrupted();
            }
            let path = entry.path();
            if let Some(re) = &include_re {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if !re.is_match(name) {
                    continue;
                }
            }
            if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(path) else {
                continue; // binary or unreadable
            };
            for (idx, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    matches.push(format!("{}:{}: {}", path.display(), idx + 1, line.trim_end()));
                    if matches.len() >= MAX_RESULTS {
                        truncated = true;
                        break 'walk;
                    }
                }
            }
        }

        let mut result = ToolResult::ok()
            .with("matches", matches.len())
            .with("content", matches.join("\n"));
        if truncated {
            result = result.with(
                "note",
                format!("stopped after {MAX_RESULTS} matches; narrow the pattern or path"),
            );
        }
        result
    }
}

fn is_hidden_or_ignored(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| {
            (name.starts_with('.') && name.len() > 1 && entry.file_type().is_dir())
                || name == "target"
                || name == "node_modules"
        })
        .unwrap_or(false)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
