// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::background::BackgroundShellSupervisor;
use crate::tool::{ErrorKind, OutputCategory, Tool, ToolCall, ToolCtx, ToolResult};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
/// 20 KB ≈ 5,000 tokens, which keeps output well within a small context window.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

/// Lines kept from the head of oversized output.
const HEAD_LINES: usize = 100;

/// Lines kept from the tail.  Errors and summaries almost always appear at
/// the end of build/test output, so the tail matters at least as much as
/// the head.
const TAIL_LINES: usize = 100;

/// Run a shell command, foreground or fire-and-forget.
pub struct BashTool {
    supervisor: Arc<BackgroundShellSupervisor>,
    pub timeout_secs: u64,
}

impl BashTool {
    pub fn new(supervisor: Arc<BackgroundShellSupervisor>, timeout_secs: u64) -> Self {
        Self {
            supervisor,
            timeout_secs,
        }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr.\n\
         Output is capped at ~20 KB; when larger, the first 100 and last 100\n\
         lines are preserved with an omission marker in the middle.\n\
         Set run_in_background=true for servers and long builds: the call\n\
         returns a shell_id immediately and bash_output reads the buffered\n\
         output later.\n\
         Prefer non-interactive commands; avoid anything that needs a TTY.\n\
         Do NOT use bash for file operations:\n\
         - Read files  → read_file  (not cat / head / tail)\n\
         - Search text → grep tool  (not grep / rg)\n\
         - Find files  → glob tool  (not find)\n\
         - Edit files  → edit_file / line_edit (not sed / awk)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash one-liner to execute"
                },
                "run_in_background": {
                    "type": "boolean",
                    "description": "Detach and return a shell_id immediately (default false)"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory (optional, defaults to cwd)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Foreground execution timeout in seconds (optional)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::HeadTail
    }

    fn permission_hint(&self, args: &Value) -> Option<String> {
        args.get("command").and_then(Value::as_str).map(str::to_string)
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolResult {
        let command = match call.args.get("command").and_then(Value::as_str) {
            Some(c) => c.to_string(),
            None => {
                return ToolResult::err(
                    ErrorKind::ValidationError,
                    "missing required parameter 'command'",
                )
            }
        };
        let workdir = call
            .args
            .get("workdir")
            .and_then(Value::as_str)
            .map(str::to_string);
        let background = call
            .args
            .get("run_in_background")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let timeout = call
            .args
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(self.timeout_secs);

        if background {
            return match self.supervisor.spawn(&command, workdir.as_deref()) {
                Ok(summary) => ToolResult::ok()
                    .with("shell_id", summary.id)
                    .with("pid", summary.pid.map(|p| json!(p)).unwrap_or(Value::Null))
                    .with("note", "running in background; read output with bash_output"),
                Err(e) => ToolResult::err(ErrorKind::SystemError, format!("spawn error: {e}")),
            };
        }

        debug!(cmd = %command, timeout, "bash tool");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        // Isolate the subprocess from the caller's terminal: no stdin, and
        // SIGKILL on drop so a timeout or cancellation cannot leak a child
        // that keeps writing to the TTY.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        if let Some(wd) = &workdir {
            cmd.current_dir(wd);
        }

        let output = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return ToolResult::interrupted(),
            result = tokio::time::timeout(
                std::time::Duration::from_secs(timeout),
                cmd.output(),
            ) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return ToolResult::err(ErrorKind::SystemError, format!("spawn error: {e}"))
                }
                Err(_) => {
                    return ToolResult::err(
                        ErrorKind::SystemError,
                        format!("timeout after {timeout}s"),
                    )
                    .with_suggestion("re-run with run_in_background=true for long commands")
                }
            },
        };

        let mut content = String::new();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.is_empty() {
            content.push_str(&head_tail_truncate(&stdout));
        }
        if !stderr.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str("[stderr]\n");
            content.push_str(&head_tail_truncate(&stderr));
        }

        let code = output.status.code().unwrap_or(-1);
        match code {
            0 => ToolResult::ok().with("content", content).with("exit_code", 0),
            // Exit code 1 is the Unix convention for "no matches" (grep) and
            // "condition false" (test).  Flagging it as an error inflates the
            // model's failure count and confuses it into retrying a command
            // that worked.
            1 => ToolResult::ok()
                .with("content", content)
                .with("exit_code", 1),
            _ => ToolResult::err(ErrorKind::SystemError, format!("[exit {code}]\n{content}"))
                .with("exit_code", code),
        }
    }
}

/// Truncate `s` to fit within `OUTPUT_LIMIT_BYTES`.
///
/// When truncation is needed, the first `HEAD_LINES` and last `TAIL_LINES`
/// are kept verbatim with an omission marker in the middle, so the model
/// always sees both the start of the output and the errors at its end.
pub(crate) fn head_tail_truncate(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }

    let lines: Vec<&str> = s.lines().collect();
    let total = lines.len();

    if total <= HEAD_LINES + TAIL_LINES {
        // Few but very long lines: byte-level head + tail.
        let head = &s[..OUTPUT_LIMIT_BYTES / 2];
        let tail = &s[s.len() - OUTPUT_LIMIT_BYTES / 2..];
        let omitted = s.len() - head.len() - tail.len();
        return format!("{head}\n...[{omitted} bytes omitted]...\n{tail}");
    }

    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[total - TAIL_LINES..].join("\n");
    let omitted_lines = total - HEAD_LINES - TAIL_LINES;
    let omitted_bytes = s.len().saturating_sub(head.len() + tail.len());
    format!("{head}\n...[{omitted_lines} lines / ~{omitted_bytes} bytes omitted]...\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tool() -> (BashTool, Arc<BackgroundShellSupervisor>) {
        let sup = Arc::new(BackgroundShellSupervisor::new(
            1000,
            Duration::from_millis(200),
        ));
        (BashTool::new(sup.clone(), 10), sup)
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "b1".into(),
            name: "bash".into(),
            args,
        }
    }

    // ── Foreground ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn echo_returns_stdout() {
        let (t, _) = tool();
        let out = t
            .execute(&call(json!({"command": "echo hello"})), &ToolCtx::test())
            .await;
        assert!(out.success, "{}", out.error);
        assert!(out.get("content").unwrap().as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn stderr_is_labelled() {
        let (t, _) = tool();
        let out = t
            .execute(
                &call(json!({"command": "echo out && echo err >&2"})),
                &ToolCtx::test(),
            )
            .await;
        let content = out.get("content").unwrap().as_str().unwrap();
        assert!(content.contains("out"));
        assert!(content.contains("[stderr]"));
        assert!(content.contains("err"));
    }

    #[tokio::test]
    async fn exit_1_is_not_an_error() {
        let (t, _) = tool();
        let out = t
            .execute(&call(json!({"command": "exit 1"})), &ToolCtx::test())
            .await;
        assert!(out.success, "exit 1 must not count as failure");
        assert_eq!(out.get("exit_code").unwrap(), &json!(1));
    }

    #[tokio::test]
    async fn exit_2_is_an_error() {
        let (t, _) = tool();
        let out = t
            .execute(&call(json!({"command": "exit 2"})), &ToolCtx::test())
            .await;
        assert!(!out.success);
        assert_eq!(out.error_kind, Some(ErrorKind::SystemError));
        assert!(out.error.contains("[exit 2]"));
    }

    #[tokio::test]
    async fn timeout_suggests_background() {
        let (t, _) = tool();
        let out = t
            .execute(
                &call(json!({"command": "sleep 60", "timeout_secs": 1})),
                &ToolCtx::test(),
            )
            .await;
        assert!(!out.success);
        assert!(out.error.contains("timeout"));
        assert!(out.suggestion.as_deref().unwrap_or("").contains("background"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_foreground_command() {
        let (t, _) = tool();
        let ctx = ToolCtx::test();
        let cancel = ctx.cancel.clone();
        let handle = tokio::spawn(async move {
            t.execute(&call(json!({"command": "sleep 30"})), &ctx).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let out = handle.await.unwrap();
        assert_eq!(out.error_kind, Some(ErrorKind::Interrupted));
    }

    #[tokio::test]
    async fn workdir_changes_cwd() {
        let (t, _) = tool();
        let out = t
            .execute(
                &call(json!({"command": "pwd", "workdir": "/tmp"})),
                &ToolCtx::test(),
            )
            .await;
        assert!(out.get("content").unwrap().as_str().unwrap().contains("tmp"));
    }

    // ── Background ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn background_returns_shell_id_immediately() {
        let (t, sup) = tool();
        let out = t
            .execute(
                &call(json!({"command": "sleep 5", "run_in_background": true})),
                &ToolCtx::test(),
            )
            .await;
        assert!(out.success, "{}", out.error);
        let id = out.get("shell_id").unwrap().as_str().unwrap().to_string();
        assert!(id.starts_with("shell-"));
        assert!(sup.get(&id).is_some());
        sup.kill(&id, "SIGKILL").unwrap();
    }

    #[tokio::test]
    async fn permission_hint_is_the_command() {
        let (t, _) = tool();
        assert_eq!(
            t.permission_hint(&json!({"command": "rm -rf /tmp/x"})),
            Some("rm -rf /tmp/x".into())
        );
    }

    // ── Truncation ────────────────────────────────────────────────────────────

    #[test]
    fn short_output_passes_through() {
        assert_eq!(head_tail_truncate("a\nb\n"), "a\nb\n");
    }

    #[test]
    fn head_and_tail_survive_truncation() {
        let mut lines = vec!["BUILD START".to_string()];
        for i in 0..800 {
            lines.push(format!("middle {i} padding padding padding padding"));
        }
        lines.push("BUILD ERROR".to_string());
        let content = lines.join("\n");
        let result = head_tail_truncate(&content);
        assert!(result.contains("BUILD START"));
        assert!(result.contains("BUILD ERROR"));
        assert!(result.contains("omitted"));
        assert!(result.len() < content.len());
    }
}
