// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Process-wide wiring.
//!
//! One [`Services`] instance owns every singleton (bus, trackers, journal,
//! supervisors, broker, pool) with compile-time typed fields instead of a
//! string-keyed registry, and knows how to assemble an agent: a fresh
//! client, watchdog, handle and tool registry scoped to that agent, sharing
//! the process-wide state.  Shutdown runs in a fixed order: background work
//! first, the bus last.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::debug;

use ally_config::{Config, PluginManifest};
use ally_model::{ChatClient, ChatEndpoint};
use ally_tools::{
    BackgroundShellSupervisor, BashOutputTool, BashTool, DeleteFileTool, EditFileTool, GlobTool,
    GrepTool, LineEditTool, ListDirTool, PatchJournal, PermissionBroker, PermissionUi,
    ReadFileTool, ReadStateTracker, TodoItem, TodoWriteTool, ToolEvent, ToolRegistry,
    WriteFileTool,
};

use crate::agent::{Agent, AgentHandle, AgentSpawnConfig};
use crate::background::BackgroundAgentSupervisor;
use crate::bus::ActivityBus;
use crate::commands::CommandDispatcher;
use crate::delegate_tool::AgentTool;
use crate::orchestrator::ToolOrchestrator;
use crate::pool::{AgentFactory, AgentPool};
use crate::watchdog::ActivityWatchdog;

pub struct Services {
    pub config: Arc<Config>,
    pub endpoint: Arc<dyn ChatEndpoint>,
    pub bus: Arc<ActivityBus>,
    pub tracker: Arc<ReadStateTracker>,
    pub journal: Arc<PatchJournal>,
    pub shells: Arc<BackgroundShellSupervisor>,
    pub broker: Arc<PermissionBroker>,
    pub pool: Arc<AgentPool>,
    pub bg_agents: Arc<BackgroundAgentSupervisor>,
    pub plugins: Vec<PluginManifest>,
    /// The root conversation's todo list, shared with the session store.
    pub todos: Arc<TokioMutex<Vec<TodoItem>>>,
}

impl Services {
    pub fn new(
        config: Arc<Config>,
        endpoint: Arc<dyn ChatEndpoint>,
        ui: Arc<dyn PermissionUi>,
        plugins: Vec<PluginManifest>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Services>| {
            let bus = Arc::new(ActivityBus::new());
            let tracker = Arc::new(ReadStateTracker::new());
            let journal = Arc::new(PatchJournal::new(
                config.tools.patch_max_count,
                config.tools.patch_max_total_bytes,
            ));
            let shells = Arc::new(BackgroundShellSupervisor::new(
                config.tools.background_buffer_lines,
                Duration::from_millis(config.tools.kill_grace_ms),
            ));
            let broker = Arc::new(PermissionBroker::new(ui, &config.tools));

            // The pool factory calls back into Services to assemble agents;
            // the weak reference breaks the ownership cycle.
            let factory_weak = weak.clone();
            let factory: AgentFactory = Box::new(move |cfg: &AgentSpawnConfig| {
                let services = factory_weak
                    .upgrade()
                    .expect("agent pool outlived its services");
                services.assemble_agent(cfg.clone())
            });
            let pool_size = config.agent.pool_size.max(1);
            let pool = Arc::new(AgentPool::new(pool_size, factory));
            let bg_agents = Arc::new(BackgroundAgentSupervisor::new(pool.clone(), bus.clone()));

            Services {
                config: config.clone(),
                endpoint,
                bus,
                tracker,
                journal,
                shells,
                broker,
                pool,
                bg_agents,
                plugins,
                todos: Arc::new(TokioMutex::new(Vec::new())),
            }
        })
    }

    /// Build the root conversation agent.
    pub fn root_agent(self: &Arc<Self>) -> (Agent, Arc<AgentHandle>) {
        self.assemble_agent(AgentSpawnConfig {
            specialized: false,
            depth: 0,
            ..Default::default()
        })
    }

    /// Assemble a fully wired agent: fresh client/watchdog/handle plus a
    /// registry scoped to it, sharing the process-wide singletons.
    pub fn assemble_agent(self: &Arc<Self>, spawn: AgentSpawnConfig) -> (Agent, Arc<AgentHandle>) {
        let client = Arc::new(ChatClient::new(
            self.endpoint.clone(),
            self.config.model.clone(),
        ));
        let watchdog = ActivityWatchdog::new(
            Duration::from_secs(self.config.agent.watchdog_timeout_secs),
            Duration::from_secs(self.config.agent.watchdog_interval_secs),
        );
        let agent_id = format!("agent-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let handle = AgentHandle::new(agent_id, client, watchdog);

        let todos = if spawn.depth == 0 {
            self.todos.clone()
        } else {
            Arc::new(TokioMutex::new(Vec::new()))
        };
        let (tool_event_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(64);
        let registry = Arc::new(self.build_registry(&spawn, &handle, todos, tool_event_tx));
        let orchestrator =
            ToolOrchestrator::new(registry.clone(), self.broker.clone(), self.bus.clone());

        debug!(agent_id = %handle.agent_id, depth = spawn.depth, "assembled agent");
        let agent = Agent::new(
            self.config.clone(),
            spawn,
            registry,
            orchestrator,
            self.bus.clone(),
            handle.clone(),
            tool_event_rx,
            self.plugins.clone(),
        );
        (agent, handle)
    }

    /// The per-agent tool registry: shared file/process state, this agent's
    /// todo list and event channel, and a delegate tool bound to this
    /// agent's delegation tree and watchdog (omitted at the nesting cap).
    fn build_registry(
        self: &Arc<Self>,
        spawn: &AgentSpawnConfig,
        handle: &Arc<AgentHandle>,
        todos: Arc<TokioMutex<Vec<TodoItem>>>,
        tool_event_tx: mpsc::Sender<ToolEvent>,
    ) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(ReadFileTool::new(self.tracker.clone()));
        registry.register(WriteFileTool::new(self.tracker.clone(), self.journal.clone()));
        registry.register(EditFileTool::new(self.tracker.clone(), self.journal.clone()));
        registry.register(LineEditTool::new(self.tracker.clone(), self.journal.clone()));
        registry.register(DeleteFileTool::new(self.tracker.clone(), self.journal.clone()));
        registry.register(GrepTool);
        registry.register(GlobTool);
        registry.register(ListDirTool);
        registry.register(BashTool::new(
            self.shells.clone(),
            self.config.tools.timeout_secs,
        ));
        registry.register(BashOutputTool::new(self.shells.clone()));
        registry.register(TodoWriteTool::new(todos, tool_event_tx));

        if spawn.depth + 1 < self.config.agent.max_agent_depth {
            registry.register(AgentTool::new(
                self.pool.clone(),
                self.bg_agents.clone(),
                handle.delegation_tree.clone(),
                handle.watchdog.clone(),
                self.config.clone(),
                spawn.depth,
            ));
        }
        registry
    }

    /// Dispatcher for the root conversation.
    pub fn command_dispatcher(self: &Arc<Self>, root: Arc<AgentHandle>) -> CommandDispatcher {
        let client = Arc::new(ChatClient::new(
            self.endpoint.clone(),
            self.config.model.clone(),
        ));
        CommandDispatcher::new(
            self.shells.clone(),
            self.bg_agents.clone(),
            self.pool.clone(),
            self.journal.clone(),
            client,
            self.plugins.clone(),
            root,
        )
    }

    /// Tear everything down: supervisors first, the registry-like shared
    /// state in the middle, the bus last so teardown events still render.
    pub async fn shutdown(&self) {
        self.bg_agents.shutdown();
        self.shells.shutdown();
        self.pool.cleanup().await;
        self.tracker.reset();
        self.bus.shutdown();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ally_model::mock::ScriptedEndpoint;
    use ally_tools::AutoApproveUi;

    fn services() -> Arc<Services> {
        Services::new(
            Arc::new(Config::default()),
            ScriptedEndpoint::new(vec![]),
            Arc::new(AutoApproveUi),
            vec![],
        )
    }

    #[tokio::test]
    async fn root_agent_has_the_full_tool_set() {
        let s = services();
        let (agent, handle) = s.root_agent();
        assert!(agent.session().messages.is_empty());
        assert!(handle.delegation_tree.is_empty());

        let (tx, _rx) = mpsc::channel(4);
        let reg = s.build_registry(
            &AgentSpawnConfig::default(),
            &AgentHandle::for_tests("x"),
            Arc::new(TokioMutex::new(Vec::new())),
            tx,
        );
        let names = reg.names();
        for expected in [
            "agent",
            "bash",
            "bash_output",
            "delete_file",
            "edit_file",
            "glob",
            "grep",
            "line_edit",
            "list_dir",
            "read_file",
            "todo_write",
            "write_file",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn delegate_tool_is_dropped_at_the_nesting_cap() {
        let s = services();
        let (tx, _rx) = mpsc::channel(4);
        let deep = AgentSpawnConfig {
            depth: s.config.agent.max_agent_depth - 1,
            ..Default::default()
        };
        let reg = s.build_registry(
            &deep,
            &AgentHandle::for_tests("deep"),
            Arc::new(TokioMutex::new(Vec::new())),
            tx,
        );
        assert!(!reg.names().contains(&"agent".to_string()));
    }

    #[tokio::test]
    async fn pool_factory_assembles_agents_through_services() {
        let s = services();
        let lease = s.pool.acquire(AgentSpawnConfig {
            specialized: true,
            depth: 1,
            ..Default::default()
        });
        assert!(lease.agent_id.starts_with("agent-"));
        s.pool.release(&lease.agent_id);
    }

    #[tokio::test]
    async fn shutdown_silences_the_bus() {
        let s = services();
        s.shutdown().await;
        // Emission after shutdown must be a no-op, not a panic.
        s.bus.emit(crate::bus::ActivityPayload::Error {
            message: "late".into(),
        });
    }
}
