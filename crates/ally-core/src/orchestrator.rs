// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-call tool lifecycle.
//!
//! One place owns the sequence every tool call goes through:
//! start event → pre-permission validation → change preview → permission →
//! execution (with its own cancellation scope and panic containment) →
//! end event.  Tools themselves only implement `execute` and the optional
//! hooks; they never talk to the bus or the broker directly.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ally_tools::{
    Decision, PermissionBroker, PermissionRequest, ToolCall, ToolCtx, ToolRegistry, ToolResult,
};

use crate::bus::{ActivityBus, ActivityPayload};

/// How long a tool gets to notice cancellation before its task is abandoned.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

pub struct ToolOrchestrator {
    registry: Arc<ToolRegistry>,
    broker: Arc<PermissionBroker>,
    bus: Arc<ActivityBus>,
}

impl ToolOrchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        broker: Arc<PermissionBroker>,
        bus: Arc<ActivityBus>,
    ) -> Self {
        Self {
            registry,
            broker,
            bus,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Drive one tool call through its full lifecycle.
    ///
    /// `parent_id` is the enclosing call id when this runs inside a
    /// delegation; it is attached to every event so the UI can nest output.
    pub async fn execute(
        &self,
        call: &ToolCall,
        parent_id: Option<String>,
        cancel: &CancellationToken,
        user_initiated: bool,
    ) -> ToolResult {
        self.bus.emit_with_parent(
            parent_id.clone(),
            ActivityPayload::ToolCallStart {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                args: call.args.clone(),
            },
        );

        let result = self
            .run_lifecycle(call, parent_id.clone(), cancel, user_initiated)
            .await;

        self.bus.emit_with_parent(
            parent_id,
            ActivityPayload::ToolCallEnd {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                success: result.success,
                error_kind: result
                    .error_kind
                    .map(|k| serde_json::to_value(k).unwrap().as_str().unwrap().to_string()),
            },
        );
        result
    }

    async fn run_lifecycle(
        &self,
        call: &ToolCall,
        parent_id: Option<String>,
        cancel: &CancellationToken,
        user_initiated: bool,
    ) -> ToolResult {
        let Some(tool) = self.registry.get(&call.name) else {
            return ToolResult::err(
                ally_tools::ErrorKind::UserError,
                format!("unknown tool: {}", call.name),
            );
        };

        if let Some(failure) = tool.validate_before_permission(&call.args) {
            debug!(tool = %call.name, "pre-permission validation failed");
            return failure;
        }

        // Preview file mutations before asking for permission, so the user
        // decides with the diff on screen.
        let preview = tool.preview_changes(call).await;
        if let Some(p) = &preview {
            self.bus.emit_with_parent(
                parent_id.clone(),
                ActivityPayload::DiffPreview {
                    call_id: call.id.clone(),
                    path: p.path.clone(),
                    diff: p.diff.clone(),
                },
            );
        }

        if tool.requires_confirmation() && !user_initiated {
            let request = PermissionRequest {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                summary: summarize_args(&call.args),
                preview: preview.as_ref().map(|p| p.diff.clone()),
            };
            self.bus.emit_with_parent(
                parent_id.clone(),
                ActivityPayload::PermissionRequest {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    summary: request.summary.clone(),
                },
            );
            let hint = tool.permission_hint(&call.args);
            match self.broker.authorize(&request, hint.as_deref()).await {
                Decision::Approved => {}
                Decision::Denied => return ToolResult::permission_denied(),
                Decision::Forbidden => {
                    // Same user-facing surface as a denial; the kind differs
                    // so the taxonomy stays honest.
                    let mut r = ToolResult::permission_denied();
                    r.error_kind = Some(ally_tools::ErrorKind::SecurityError);
                    return r;
                }
            }
        }

        // Fresh cancellation scope tied to this call, plus a chunk sink that
        // forwards streamed output to the bus in emission order.
        let call_cancel = cancel.child_token();
        let mut ctx = ToolCtx::new(call_cancel.clone());
        ctx.user_initiated = user_initiated;
        let chunk_bus = self.bus.clone();
        let chunk_call_id = call.id.clone();
        let chunk_parent = parent_id.clone();
        ctx.chunks = Some(Arc::new(move |chunk: &str| {
            chunk_bus.emit_with_parent(
                chunk_parent.clone(),
                ActivityPayload::OutputChunk {
                    call_id: chunk_call_id.clone(),
                    chunk: chunk.to_string(),
                },
            );
        }));

        // Run in a task so a panicking tool becomes a system_error result
        // instead of tearing down the agent loop.
        let task_call = call.clone();
        let mut task = tokio::spawn(async move { tool.execute(&task_call, &ctx).await });

        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = cancel.cancelled() => {
                // Give the tool a bounded window to observe its token and
                // return `interrupted` itself; then abandon it.
                match tokio::time::timeout(CANCEL_GRACE, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(tool = %call.name, "tool ignored cancellation; abandoning task");
                        task.abort();
                        return ToolResult::interrupted();
                    }
                }
            }
        };

        match joined {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool task failed");
                ToolResult::err(
                    ally_tools::ErrorKind::SystemError,
                    format!("tool execution panicked: {e}"),
                )
            }
        }
    }
}

/// Compact one-line argument summary for permission prompts and logs.
fn summarize_args(args: &Value) -> String {
    let rendered = args.to_string();
    if rendered.len() <= 120 {
        rendered
    } else {
        let mut cut = 117;
        while cut > 0 && !rendered.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &rendered[..cut])
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
