// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Fire-and-forget background agents.
//!
//! A delegation the model chose to run in the background is still a pooled
//! agent: leased for the lifetime of the task, its streamed text captured
//! off the activity bus, its lease returned when the task settles.  The
//! caller gets an id (`bg-agent-<unix-ms>-<rand>`) to poll, read or kill.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::agent::AgentHandle;
use crate::bus::{ActivityBus, ActivityKind, ActivityPayload};
use crate::pool::{AgentLease, AgentPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundAgentStatus {
    Executing,
    Done,
    Failed,
    Killed,
}

#[derive(Debug, Clone)]
pub struct BackgroundAgentInfo {
    pub id: String,
    pub agent_type: String,
    pub task_prompt: String,
    pub status: BackgroundAgentStatus,
    pub start_time: DateTime<Utc>,
    /// Final text once the task settles.
    pub result: Option<String>,
}

struct BgEntry {
    info: Mutex<BackgroundAgentInfo>,
    handle: Arc<AgentHandle>,
    output: Mutex<String>,
}

pub struct BackgroundAgentSupervisor {
    entries: Mutex<HashMap<String, Arc<BgEntry>>>,
    pool: Arc<AgentPool>,
    bus: Arc<ActivityBus>,
}

impl BackgroundAgentSupervisor {
    pub fn new(pool: Arc<AgentPool>, bus: Arc<ActivityBus>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            pool,
            bus,
        }
    }

    /// Launch `prompt` on the leased agent and return the background id
    /// immediately.
    pub fn start(&self, lease: AgentLease, agent_type: &str, prompt: &str) -> String {
        let id = format!(
            "bg-agent-{}-{}",
            Utc::now().timestamp_millis(),
            &uuid::Uuid::new_v4().simple().to_string()[..6]
        );
        let entry = Arc::new(BgEntry {
            info: Mutex::new(BackgroundAgentInfo {
                id: id.clone(),
                agent_type: agent_type.to_string(),
                task_prompt: prompt.to_string(),
                status: BackgroundAgentStatus::Executing,
                start_time: Utc::now(),
                result: None,
            }),
            handle: lease.handle.clone(),
            output: Mutex::new(String::new()),
        });
        self.entries.lock().unwrap().insert(id.clone(), entry.clone());

        // Capture the agent's streamed text off the bus for later reads.
        let capture_entry = entry.clone();
        let capture_agent = lease.handle.agent_id.clone();
        let token = self.bus.subscribe(Some(ActivityKind::TextChunk), move |e| {
            if let ActivityPayload::TextChunk { agent_id, text } = &e.payload {
                if *agent_id == capture_agent {
                    capture_entry.output.lock().unwrap().push_str(text);
                }
            }
        });

        let pool = self.pool.clone();
        let bus = self.bus.clone();
        let prompt = prompt.to_string();
        let task_entry = entry;
        debug!(id = %id, agent = %lease.agent_id, "starting background agent");
        tokio::spawn(async move {
            let outcome = {
                let mut agent = lease.agent.lock().await;
                agent.retarget(lease.spawn.clone());
                agent.send_message(&prompt).await
            };
            {
                let mut info = task_entry.info.lock().unwrap();
                // A kill may have landed while we were finishing; it wins.
                if info.status == BackgroundAgentStatus::Executing {
                    match outcome {
                        Ok(reply) => {
                            info.status = BackgroundAgentStatus::Done;
                            info.result = Some(reply);
                        }
                        Err(e) => {
                            warn!(id = %info.id, error = %e, "background agent failed");
                            info.status = BackgroundAgentStatus::Failed;
                            info.result = Some(e.to_string());
                        }
                    }
                } else if let Ok(reply) = outcome {
                    info.result = Some(reply);
                }
            }
            pool.release(&lease.agent_id);
            bus.unsubscribe(token);
        });
        id
    }

    pub fn list(&self) -> Vec<BackgroundAgentInfo> {
        let mut all: Vec<BackgroundAgentInfo> = self
            .entries
            .lock()
            .unwrap()
            .values()
            .map(|e| e.info.lock().unwrap().clone())
            .collect();
        all.sort_by_key(|i| i.start_time);
        all
    }

    pub fn get(&self, id: &str) -> Option<BackgroundAgentInfo> {
        self.entries
            .lock()
            .unwrap()
            .get(id)
            .map(|e| e.info.lock().unwrap().clone())
    }

    /// Aggregated streamed output so far (plus the result once settled).
    pub fn read_output(&self, id: &str) -> Option<String> {
        let entry = self.entries.lock().unwrap().get(id).cloned()?;
        let mut out = entry.output.lock().unwrap().clone();
        let info = entry.info.lock().unwrap();
        if let Some(result) = &info.result {
            if !result.is_empty() && !out.contains(result.as_str()) {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(result);
            }
        }
        Some(out)
    }

    /// Cancel the agent's model client and interrupt its loop.
    pub fn kill(&self, id: &str) -> bool {
        let Some(entry) = self.entries.lock().unwrap().get(id).cloned() else {
            return false;
        };
        {
            let mut info = entry.info.lock().unwrap();
            if info.status != BackgroundAgentStatus::Executing {
                return true;
            }
            info.status = BackgroundAgentStatus::Killed;
        }
        entry.handle.interrupt("background agent killed");
        true
    }

    /// Kill everything still executing.  Entries stay readable.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.entries.lock().unwrap().keys().cloned().collect();
        for id in ids {
            self.kill(&id);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ally_model::mock::{ScriptedCall, ScriptedEndpoint};
    use ally_model::{ChatClient, ChatFrame};
    use ally_config::ToolsConfig;
    use ally_tools::{AutoApproveUi, PermissionBroker, ToolRegistry};
    use tokio::sync::mpsc;

    use crate::agent::{Agent, AgentSpawnConfig};
    use crate::orchestrator::ToolOrchestrator;
    use crate::pool::AgentFactory;
    use crate::watchdog::ActivityWatchdog;

    /// Pool whose first agent answers from the given scripted rounds; later
    /// agents fall back to the mock's exhausted-scripts marker.
    fn pool_with_rounds(bus: Arc<ActivityBus>, rounds: Vec<ScriptedCall>) -> Arc<AgentPool> {
        let scripts = Arc::new(Mutex::new(rounds));
        let factory: AgentFactory = Box::new(move |cfg: &AgentSpawnConfig| {
            let rounds: Vec<ScriptedCall> = scripts.lock().unwrap().drain(..).collect();
            let endpoint = ScriptedEndpoint::new(rounds);
            let client = Arc::new(ChatClient::new(
                endpoint,
                ally_config::ModelConfig::default(),
            ));
            let watchdog = ActivityWatchdog::new(
                Duration::from_secs(120),
                Duration::from_secs(10),
            );
            let handle = AgentHandle::new(
                format!("bg-{}", uuid::Uuid::new_v4().simple()),
                client,
                watchdog,
            );
            let registry = Arc::new(ToolRegistry::new());
            let broker = Arc::new(PermissionBroker::new(
                Arc::new(AutoApproveUi),
                &ToolsConfig::default(),
            ));
            let orchestrator =
                ToolOrchestrator::new(registry.clone(), broker, bus.clone());
            let (_tx, rx) = mpsc::channel(4);
            let agent = Agent::new(
                Arc::new(ally_config::Config::default()),
                cfg.clone(),
                registry,
                orchestrator,
                bus.clone(),
                handle.clone(),
                rx,
                vec![],
            );
            (agent, handle)
        });
        Arc::new(AgentPool::new(5, factory))
    }

    fn text_round(text: &str) -> ScriptedCall {
        ScriptedCall::Frames(vec![ChatFrame {
            content: text.into(),
            done: true,
            ..Default::default()
        }])
    }

    async fn wait_status(
        sup: &BackgroundAgentSupervisor,
        id: &str,
        status: BackgroundAgentStatus,
    ) -> bool {
        for _ in 0..200 {
            if sup.get(id).map(|i| i.status) == Some(status) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn background_agent_runs_to_done_with_result() {
        let bus = Arc::new(ActivityBus::new());
        let pool = pool_with_rounds(bus.clone(), vec![text_round("background answer")]);
        let sup = BackgroundAgentSupervisor::new(pool.clone(), bus);

        let lease = pool.acquire(AgentSpawnConfig {
            specialized: true,
            ..Default::default()
        });
        let id = sup.start(lease, "general", "summarize the repo");
        assert!(id.starts_with("bg-agent-"));
        assert_eq!(sup.get(&id).unwrap().status, BackgroundAgentStatus::Executing);

        assert!(wait_status(&sup, &id, BackgroundAgentStatus::Done).await);
        let info = sup.get(&id).unwrap();
        assert_eq!(info.result.as_deref(), Some("background answer"));
        assert!(sup.read_output(&id).unwrap().contains("background answer"));
        // The lease went back to the pool.
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn killed_agent_reports_killed_not_done() {
        let bus = Arc::new(ActivityBus::new());
        // A hanging model stream keeps the agent executing until the kill.
        let pool = pool_with_rounds(bus.clone(), vec![ScriptedCall::Hang]);
        let sup = BackgroundAgentSupervisor::new(pool.clone(), bus);

        let lease = pool.acquire(AgentSpawnConfig {
            specialized: true,
            ..Default::default()
        });
        let id = sup.start(lease, "general", "never finishes");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sup.kill(&id));
        assert!(wait_status(&sup, &id, BackgroundAgentStatus::Killed).await);
    }

    #[tokio::test]
    async fn unknown_ids_are_handled() {
        let bus = Arc::new(ActivityBus::new());
        let pool = pool_with_rounds(bus.clone(), vec![]);
        let sup = BackgroundAgentSupervisor::new(pool, bus);
        assert!(sup.get("bg-agent-0-zzz").is_none());
        assert!(sup.read_output("bg-agent-0-zzz").is_none());
        assert!(!sup.kill("bg-agent-0-zzz"));
    }

    #[tokio::test]
    async fn list_orders_by_start_time() {
        let bus = Arc::new(ActivityBus::new());
        let pool = pool_with_rounds(bus.clone(), vec![text_round("one")]);
        let sup = BackgroundAgentSupervisor::new(pool.clone(), bus);
        let a = sup.start(
            pool.acquire(AgentSpawnConfig { specialized: true, ..Default::default() }),
            "general",
            "a",
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = sup.start(
            pool.acquire(AgentSpawnConfig { specialized: true, ..Default::default() }),
            "general",
            "b",
        );
        let listed = sup.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, a);
        assert_eq!(listed[1].id, b);
    }
}
