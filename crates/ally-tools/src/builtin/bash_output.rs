// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use crate::background::BackgroundShellSupervisor;
use crate::tool::{ErrorKind, OutputCategory, Tool, ToolCall, ToolCtx, ToolResult};

/// Read buffered output of a background shell started with
/// `bash(run_in_background=true)`.
pub struct BashOutputTool {
    supervisor: Arc<BackgroundShellSupervisor>,
}

impl BashOutputTool {
    pub fn new(supervisor: Arc<BackgroundShellSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Tool for BashOutputTool {
    fn name(&self) -> &str {
        "bash_output"
    }

    fn description(&self) -> &str {
        "Read the buffered output of a background shell.\n\
         `lines` returns only the last N lines (default: everything buffered);\n\
         `filter` keeps only lines matching a regex.\n\
         The buffer survives process exit, so the tail of a finished command\n\
         can still be read."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "shell_id": {
                    "type": "string",
                    "description": "Id returned by bash(run_in_background=true)"
                },
                "lines": {
                    "type": "integer",
                    "description": "Return only the last N lines"
                },
                "filter": {
                    "type": "string",
                    "description": "Regex; only matching lines are returned"
                }
            },
            "required": ["shell_id"],
            "additionalProperties": false
        })
    }

    /// Polling a background task is housekeeping, not exploration.
    fn breaks_exploratory_streak(&self) -> bool {
        false
    }

    fn should_collapse(&self) -> bool {
        true
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::HeadTail
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolCtx) -> ToolResult {
        let shell_id = match call.args.get("shell_id").and_then(Value::as_str) {
            Some(s) => s,
            None => {
                return ToolResult::err(
                    ErrorKind::ValidationError,
                    "missing required parameter 'shell_id'",
                )
            }
        };
        let count = call.args.get("lines").and_then(Value::as_u64).map(|n| n as usize);
        let filter = match call.args.get("filter").and_then(Value::as_str) {
            Some(f) => match Regex::new(f) {
                Ok(re) => Some(re),
                Err(e) => {
                    return ToolResult::err(
                        ErrorKind::ValidationError,
                        format!("invalid filter regex: {e}"),
                    )
                }
            },
            None => None,
        };

        let Some((lines, exit_code)) = self.supervisor.read_output(shell_id, count, filter.as_ref())
        else {
            return ToolResult::err(
                ErrorKind::UserError,
                format!("unknown shell_id: {shell_id}"),
            )
            .with_suggestion("list running tasks with /task list");
        };

        let status = match exit_code {
            None => "running".to_string(),
            Some(code) => format!("exited ({code})"),
        };
        ToolResult::ok()
            .with("output", lines.join("\n"))
            .with("lines", lines.len())
            .with("status", status)
            .with(
                "exit_code",
                exit_code.map(|c| json!(c)).unwrap_or(Value::Null),
            )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tools() -> (BashOutputTool, Arc<BackgroundShellSupervisor>) {
        let sup = Arc::new(BackgroundShellSupervisor::new(
            1000,
            Duration::from_millis(200),
        ));
        (BashOutputTool::new(sup.clone()), sup)
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "bo1".into(),
            name: "bash_output".into(),
            args,
        }
    }

    #[tokio::test]
    async fn reads_filtered_tail_of_running_process() {
        let (t, sup) = tools();
        let s = sup
            .spawn("for i in $(seq 1 50); do echo x; echo noise; done; sleep 3", None)
            .unwrap();
        // Wait for output to accumulate.
        for _ in 0..100 {
            if !sup.read_output(&s.id, None, None).unwrap().0.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let out = t
            .execute(
                &call(json!({"shell_id": s.id, "lines": 10, "filter": "x"})),
                &ToolCtx::test(),
            )
            .await;
        assert!(out.success, "{}", out.error);
        assert_eq!(out.get("status").unwrap(), &json!("running"));
        let text = out.get("output").unwrap().as_str().unwrap();
        assert!(!text.is_empty());
        assert!(text.lines().all(|l| l == "x"));
        assert!(text.lines().count() <= 10);
        sup.kill(&s.id, "SIGKILL").unwrap();
    }

    #[tokio::test]
    async fn exited_process_reports_exit_status() {
        let (t, sup) = tools();
        let s = sup.spawn("echo done", None).unwrap();
        for _ in 0..100 {
            if sup.get(&s.id).unwrap().exit_code.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let out = t
            .execute(&call(json!({"shell_id": s.id})), &ToolCtx::test())
            .await;
        assert_eq!(out.get("status").unwrap(), &json!("exited (0)"));
        assert_eq!(out.get("exit_code").unwrap(), &json!(0));
    }

    #[tokio::test]
    async fn unknown_shell_id_is_user_error() {
        let (t, _) = tools();
        let out = t
            .execute(&call(json!({"shell_id": "shell-0-none"})), &ToolCtx::test())
            .await;
        assert_eq!(out.error_kind, Some(ErrorKind::UserError));
        assert!(out.error.contains("shell-0-none"));
    }

    #[tokio::test]
    async fn invalid_filter_is_validation_error() {
        let (t, sup) = tools();
        let s = sup.spawn("true", None).unwrap();
        let out = t
            .execute(
                &call(json!({"shell_id": s.id, "filter": "(bad"})),
                &ToolCtx::test(),
            )
            .await;
        assert_eq!(out.error_kind, Some(ErrorKind::ValidationError));
    }

    #[test]
    fn polling_does_not_break_the_streak() {
        let (t, _) = tools();
        assert!(!t.breaks_exploratory_streak());
    }
}
