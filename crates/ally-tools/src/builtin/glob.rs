// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::tool::{ErrorKind, OutputCategory, Tool, ToolCall, ToolCtx, ToolResult};

const MAX_RESULTS: usize = 200;

/// Find files by glob pattern (`*`, `?`, `**`).
pub struct GlobTool;

/// Convert a path glob to a regex.  `**` crosses directory separators,
/// `*` and `?` do not.
pub(crate) fn glob_to_path_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Swallow a following '/' so `**/foo` also matches `foo`.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files whose relative path matches a glob pattern.\n\
         `*` matches within a path segment, `?` one character, `**` crosses\n\
         directories (e.g. src/**/*.rs). Results are sorted, capped at 200."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern, e.g. **/*.rs"
                },
                "path": {
                    "type": "string",
                    "description": "Root directory to search from (default: current directory)"
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

        let re = match glob_to_path_regex(pattern) {
            Ok(r) => r,
            Err(e) => {
                return ToolResult::err(ErrorKind::ValidationError, format!("invalid glob: {e}"))
            }
        };

        debug!(pattern, root = %root, "glob tool");

        let mut found = Vec::new();
        let mut truncated = false;
        for entry in WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| !is_ignored(e))
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            if ctx.cancel.is_cancelled() {
                return ToolResult::interrupted();
            }
            let rel = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if re.is_match(&rel) {
                found.push(rel);
                if found.len() >= MAX_RESULTS {
                    truncated = true;
                    break;
                }
            }
        }
        found.sort();

        let mut result = ToolResult::ok()
            .with("matches", found.len())
            .with("content", found.join("\n"));
        if truncated {
            result = result.with("note", format!("stopped after {MAX_RESULTS} files"));
        }
        result
    }
}

fn is_ignored(entry: &walkdir::DirEntry) -> bool {
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
