// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The `agent` tool: delegate a focused task to a pooled sub-agent.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use ally_config::{Config, Thoroughness};
use ally_tools::{ErrorKind, Tool, ToolCall, ToolCtx, ToolResult};

use crate::agent::AgentSpawnConfig;
use crate::background::BackgroundAgentSupervisor;
use crate::delegation::DelegationTree;
use crate::pool::AgentPool;
use crate::watchdog::ActivityWatchdog;

/// Agent types with their own behavior contracts.  "plan" must produce a
/// todo list before its answer counts.
fn required_tools_for(agent_type: &str) -> Vec<String> {
    match agent_type {
        "plan" => vec!["todo_write".to_string()],
        _ => Vec::new(),
    }
}

pub struct AgentTool {
    pool: Arc<AgentPool>,
    background: Arc<BackgroundAgentSupervisor>,
    /// The owning agent's delegation tree; interjections route through it.
    owner_tree: Arc<DelegationTree>,
    /// The owning agent's watchdog, paused while the child works.
    owner_watchdog: Arc<ActivityWatchdog>,
    config: Arc<Config>,
    /// The owning agent's nesting depth.
    depth: usize,
}

impl AgentTool {
    pub fn new(
        pool: Arc<AgentPool>,
        background: Arc<BackgroundAgentSupervisor>,
        owner_tree: Arc<DelegationTree>,
        owner_watchdog: Arc<ActivityWatchdog>,
        config: Arc<Config>,
        depth: usize,
    ) -> Self {
        Self {
            pool,
            background,
            owner_tree,
            owner_watchdog,
            config,
            depth,
        }
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        "agent"
    }

    fn description(&self) -> &str {
        "Delegate a focused task to a sub-agent and return its final answer.\n\
         Use for self-contained work: investigating a subsystem, planning a\n\
         change, running a long search. The sub-agent has the standard tool\n\
         set and its own context window.\n\
         agent_type: general (default) or plan (produces a todo list).\n\
         thoroughness: quick (~1 min), medium (~5 min), thorough (~10 min),\n\
         uncapped.\n\
         background=true returns a bg-agent id immediately; poll it with\n\
         /task list and read its output later."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Complete, self-contained task description"
                },
                "agent_type": {
                    "type": "string",
                    "enum": ["general", "plan"],
                    "description": "Specialization of the sub-agent (default general)"
                },
                "thoroughness": {
                    "type": "string",
                    "enum": ["quick", "medium", "thorough", "uncapped"],
                    "description": "Time budget for the sub-agent (default medium)"
                },
                "background": {
                    "type": "boolean",
                    "description": "Run fire-and-forget and return an id immediately"
                }
            },
            "required": ["task"],
            "additionalProperties": false
        })
    }

    /// Delegation output is usually long; collapse it in the transcript.
    fn should_collapse(&self) -> bool {
        true
    }

    fn validate_before_permission(&self, args: &Value) -> Option<ToolResult> {
        match args.get("task").and_then(Value::as_str) {
            None | Some("") => Some(ToolResult::err(
                ErrorKind::ValidationError,
                "missing required parameter 'task'",
            )),
            _ => None,
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolCtx) -> ToolResult {
        let task = match call.args.get("task").and_then(Value::as_str) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => {
                return ToolResult::err(
                    ErrorKind::ValidationError,
                    "missing required parameter 'task'",
                )
            }
        };
        let agent_type = call
            .args
            .get("agent_type")
            .and_then(Value::as_str)
            .unwrap_or("general")
            .to_string();
        let thoroughness = match call.args.get("thoroughness").and_then(Value::as_str) {
            None => self.config.agent.thoroughness,
            Some("quick") => Thoroughness::Quick,
            Some("medium") => Thoroughness::Medium,
            Some("thorough") => Thoroughness::Thorough,
            Some("uncapped") => Thoroughness::Uncapped,
            Some(other) => {
                return ToolResult::err(
                    ErrorKind::ValidationError,
                    format!("unknown thoroughness: {other}"),
                )
            }
        };
        let run_in_background = call
            .args
            .get("background")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let child_depth = self.depth + 1;
        if child_depth >= self.config.agent.max_agent_depth {
            return ToolResult::err(
                ErrorKind::ValidationError,
                format!(
                    "maximum agent nesting depth ({}) reached; do this work yourself",
                    self.config.agent.max_agent_depth
                ),
            );
        }

        let spawn = AgentSpawnConfig {
            specialized: true,
            task_prompt: Some(task.clone()),
            parent_call_id: Some(call.id.clone()),
            max_duration: thoroughness.max_duration_secs().map(std::time::Duration::from_secs),
            required_tools: required_tools_for(&agent_type),
            pool_key: (agent_type != "general").then(|| format!("agent-type-{agent_type}")),
            depth: child_depth,
            parent_watchdog: Some(self.owner_watchdog.clone()),
            ..Default::default()
        };

        debug!(agent_type = %agent_type, depth = child_depth, background = run_in_background, "delegating task");
        let lease = self.pool.acquire(spawn);

        if run_in_background {
            let id = self.background.start(lease, &agent_type, &task);
            return ToolResult::ok()
                .with("bg_agent_id", id)
                .with("note", "running in background; check /task list for status");
        }

        self.owner_tree
            .register(&call.id, self.name(), lease.handle.clone());

        // Forward a cancellation of this call into the child agent.
        let child = lease.handle.clone();
        let cancel = ctx.cancel.clone();
        let forwarder = tokio::spawn(async move {
            cancel.cancelled().await;
            child.interrupt("parent call cancelled");
        });

        let outcome = {
            let mut agent = lease.agent.lock().await;
            agent.retarget(lease.spawn.clone());
            agent.send_message(&task).await
        };
        forwarder.abort();

        self.owner_tree.transition_to_completing(&call.id);
        let interrupted = lease.handle.current_cancel().is_cancelled();
        self.pool.release(&lease.agent_id);
        self.owner_tree.clear(&call.id);

        match outcome {
            _ if interrupted => ToolResult::interrupted(),
            Ok(reply) if reply.is_empty() => {
                ToolResult::ok().with("response", "(sub-agent produced no text output)")
            }
            Ok(reply) => ToolResult::ok().with("response", reply),
            Err(e) => ToolResult::err(ErrorKind::SystemError, format!("sub-agent error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use ally_model::mock::{ScriptedCall, ScriptedEndpoint};
    use ally_model::{ChatClient, ChatFrame};
    use ally_config::ToolsConfig;
    use ally_tools::{AutoApproveUi, PermissionBroker, ToolRegistry};
    use tokio::sync::mpsc;

    use crate::agent::{Agent, AgentHandle};
    use crate::bus::ActivityBus;
    use crate::orchestrator::ToolOrchestrator;
    use crate::pool::AgentFactory;

    fn build_fixture(rounds: Vec<ScriptedCall>) -> (AgentTool, Arc<DelegationTree>) {
        let bus = Arc::new(ActivityBus::new());
        let scripts = Arc::new(Mutex::new(rounds));
        let factory_bus = bus.clone();
        let factory: AgentFactory = Box::new(move |cfg| {
            let rounds: Vec<ScriptedCall> = scripts.lock().unwrap().drain(..).collect();
            let endpoint = ScriptedEndpoint::new(rounds);
            let client = Arc::new(ChatClient::new(
                endpoint,
                ally_config::ModelConfig::default(),
            ));
            let watchdog =
                ActivityWatchdog::new(Duration::from_secs(120), Duration::from_secs(10));
            let handle = AgentHandle::new(
                format!("child-{}", uuid::Uuid::new_v4().simple()),
                client,
                watchdog,
            );
            let registry = Arc::new(ToolRegistry::new());
            let broker = Arc::new(PermissionBroker::new(
                Arc::new(AutoApproveUi),
                &ToolsConfig::default(),
            ));
            let orchestrator =
                ToolOrchestrator::new(registry.clone(), broker, factory_bus.clone());
            let (_tx, rx) = mpsc::channel(4);
            let agent = Agent::new(
                Arc::new(Config::default()),
                cfg.clone(),
                registry,
                orchestrator,
                factory_bus.clone(),
                handle.clone(),
                rx,
                vec![],
            );
            (agent, handle)
        });
        let pool = Arc::new(AgentPool::new(5, factory));
        let background = Arc::new(BackgroundAgentSupervisor::new(pool.clone(), bus));
        let owner_tree = DelegationTree::new();
        let owner_watchdog =
            ActivityWatchdog::new(Duration::from_secs(120), Duration::from_secs(10));
        let tool = AgentTool::new(
            pool,
            background,
            owner_tree.clone(),
            owner_watchdog,
            Arc::new(Config::default()),
            0,
        );
        (tool, owner_tree)
    }

    fn text_round(text: &str) -> ScriptedCall {
        ScriptedCall::Frames(vec![ChatFrame {
            content: text.into(),
            done: true,
            ..Default::default()
        }])
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "deleg-1".into(),
            name: "agent".into(),
            args,
        }
    }

    #[tokio::test]
    async fn delegation_returns_child_answer() {
        let (tool, tree) = build_fixture(vec![text_round("child says done")]);
        let out = tool
            .execute(&call(json!({"task": "look into it"})), &ToolCtx::test())
            .await;
        assert!(out.success, "{}", out.error);
        assert_eq!(
            out.get("response").unwrap().as_str().unwrap(),
            "child says done"
        );
        // Delegation context cleaned up after completion.
        assert!(tree.is_empty());
    }

    #[tokio::test]
    async fn missing_task_is_validation_error() {
        let (tool, _) = build_fixture(vec![]);
        let out = tool.execute(&call(json!({})), &ToolCtx::test()).await;
        assert_eq!(out.error_kind, Some(ErrorKind::ValidationError));
    }

    #[tokio::test]
    async fn depth_cap_refuses_delegation() {
        let (mut tool, _) = build_fixture(vec![]);
        // Default max depth is 4; an owner already at depth 3 may not spawn.
        tool.depth = 3;
        let out = tool
            .execute(&call(json!({"task": "go deeper"})), &ToolCtx::test())
            .await;
        assert_eq!(out.error_kind, Some(ErrorKind::ValidationError));
        assert!(out.error.contains("nesting depth"));
    }

    #[tokio::test]
    async fn background_mode_returns_id_immediately() {
        let (tool, tree) = build_fixture(vec![text_round("bg done")]);
        let out = tool
            .execute(
                &call(json!({"task": "long job", "background": true})),
                &ToolCtx::test(),
            )
            .await;
        assert!(out.success);
        let id = out.get("bg_agent_id").unwrap().as_str().unwrap();
        assert!(id.starts_with("bg-agent-"));
        // Background delegations are not routable for interjections.
        assert!(tree.is_empty());
    }

    #[tokio::test]
    async fn cancelling_the_call_interrupts_the_child() {
        let (tool, _) = build_fixture(vec![ScriptedCall::Hang]);
        let ctx = ToolCtx::test();
        let cancel = ctx.cancel.clone();
        let task = tokio::spawn(async move {
            tool.execute(&call(json!({"task": "never ends"})), &ctx).await
        });
        tokio::time::sleep(Duration::from_millis(80)).await;
        cancel.cancel();
        let out = task.await.unwrap();
        assert_eq!(out.error_kind, Some(ErrorKind::Interrupted));
    }

    #[tokio::test]
    async fn unknown_thoroughness_is_rejected() {
        let (tool, _) = build_fixture(vec![]);
        let out = tool
            .execute(
                &call(json!({"task": "x", "thoroughness": "extreme"})),
                &ToolCtx::test(),
            )
            .await;
        assert_eq!(out.error_kind, Some(ErrorKind::ValidationError));
    }

    #[test]
    fn plan_agents_require_todo_write() {
        assert_eq!(required_tools_for("plan"), vec!["todo_write"]);
        assert!(required_tools_for("general").is_empty());
    }
}
