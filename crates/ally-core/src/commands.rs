// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Slash-command façade.
//!
//! Pure dispatch over the managers that already exist: parsing a line,
//! calling the right supervisor/pool/journal method, rendering a text
//! answer.  The binary decides what to do with the outcome (print, clear
//! the session, exit with a usage code).

use std::sync::Arc;

use ally_config::PluginManifest;
use ally_model::ChatClient;
use ally_tools::{BackgroundShellSupervisor, PatchJournal};

use crate::agent::AgentHandle;
use crate::background::BackgroundAgentSupervisor;
use crate::pool::AgentPool;

/// What the caller should do after a command ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Print this and continue.
    Text(String),
    /// Wipe the conversation.
    ClearSession,
    /// Trim the conversation to its recent tail.
    CompactSession,
    /// Bad invocation; print and exit 2 in single-shot mode.
    Usage(String),
}

pub struct CommandDispatcher {
    shells: Arc<BackgroundShellSupervisor>,
    bg_agents: Arc<BackgroundAgentSupervisor>,
    pool: Arc<AgentPool>,
    journal: Arc<PatchJournal>,
    client: Arc<ChatClient>,
    plugins: Vec<PluginManifest>,
    root: Arc<AgentHandle>,
}

impl CommandDispatcher {
    pub fn new(
        shells: Arc<BackgroundShellSupervisor>,
        bg_agents: Arc<BackgroundAgentSupervisor>,
        pool: Arc<AgentPool>,
        journal: Arc<PatchJournal>,
        client: Arc<ChatClient>,
        plugins: Vec<PluginManifest>,
        root: Arc<AgentHandle>,
    ) -> Self {
        Self {
            shells,
            bg_agents,
            pool,
            journal,
            client,
            plugins,
            root,
        }
    }

    pub fn is_command(line: &str) -> bool {
        line.trim_start().starts_with('/')
    }

    /// Route user text typed while the model runs to the deepest currently
    /// executing agent (or the root when nothing is delegated), then break
    /// its in-flight model call so the text takes effect immediately.
    pub fn interject(&self, text: &str) {
        match self.root.delegation_tree.active_delegation() {
            Some(active) => {
                active.agent.add_user_interjection(text);
                active.agent.interrupt("interjection");
            }
            None => {
                self.root.add_user_interjection(text);
                self.root.interrupt("interjection");
            }
        }
    }

    pub async fn dispatch(&self, line: &str) -> CommandOutcome {
        let trimmed = line.trim();
        let mut parts = trimmed.split_whitespace();
        let command = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();

        match command {
            "/help" => CommandOutcome::Text(HELP.to_string()),
            "/model" => self.model_command(&args).await,
            "/task" => self.task_command(&args),
            "/agent" => self.agent_command(&args),
            "/plugin" => self.plugin_command(&args),
            "/undo" => match self.journal.undo_last() {
                Ok(Some(path)) => {
                    CommandOutcome::Text(format!("reverted last change to {}", path.display()))
                }
                Ok(None) => CommandOutcome::Text("nothing to undo".into()),
                Err(e) => CommandOutcome::Text(format!("undo failed: {e}")),
            },
            "/clear" => CommandOutcome::ClearSession,
            "/compact" => CommandOutcome::CompactSession,
            other => CommandOutcome::Usage(format!("unknown command: {other} (try /help)")),
        }
    }

    async fn model_command(&self, args: &[&str]) -> CommandOutcome {
        match args {
            [] | ["list"] => match self.client.list_models().await {
                Ok(models) if models.is_empty() => {
                    CommandOutcome::Text("no models reported by the endpoint".into())
                }
                Ok(models) => {
                    let mut out =
                        format!("current model: {}\navailable:\n", self.client.model_name());
                    for m in models {
                        out.push_str(&format!("  {}  ({} MB)\n", m.name, m.size / 1_000_000));
                    }
                    CommandOutcome::Text(out)
                }
                Err(e) => CommandOutcome::Text(format!("could not list models: {e}")),
            },
            [name] => CommandOutcome::Text(format!(
                "switching to '{name}' requires a restart: ally --model {name}"
            )),
            _ => CommandOutcome::Usage("usage: /model [name]".into()),
        }
    }

    fn task_command(&self, args: &[&str]) -> CommandOutcome {
        match args {
            [] | ["list"] => {
                let mut out = String::new();
                let shells = self.shells.list();
                let agents = self.bg_agents.list();
                if shells.is_empty() && agents.is_empty() {
                    return CommandOutcome::Text("no background tasks".into());
                }
                for s in shells {
                    let status = match s.exit_code {
                        None => "running".to_string(),
                        Some(code) => format!("exited ({code})"),
                    };
                    out.push_str(&format!(
                        "{}  {}  [{}]  {} buffered lines\n",
                        s.id, s.command, status, s.buffer_size
                    ));
                }
                for a in agents {
                    out.push_str(&format!(
                        "{}  {}  [{:?}]\n",
                        a.id,
                        a.task_prompt.lines().next().unwrap_or(""),
                        a.status
                    ));
                }
                CommandOutcome::Text(out)
            }
            ["kill", id] => {
                if id.starts_with("shell-") {
                    match self.shells.kill(id, "SIGTERM") {
                        Ok(Some(_)) => CommandOutcome::Text(format!("sent SIGTERM to {id}")),
                        Ok(None) => CommandOutcome::Text(format!("unknown task: {id}")),
                        Err(e) => CommandOutcome::Text(format!("kill failed: {e}")),
                    }
                } else if id.starts_with("bg-agent-") {
                    if self.bg_agents.kill(id) {
                        CommandOutcome::Text(format!("killed {id}"))
                    } else {
                        CommandOutcome::Text(format!("unknown task: {id}"))
                    }
                } else {
                    CommandOutcome::Usage(format!("not a task id: {id}"))
                }
            }
            _ => CommandOutcome::Usage("usage: /task [list|kill <id>]".into()),
        }
    }

    fn agent_command(&self, args: &[&str]) -> CommandOutcome {
        match args {
            [] | ["list"] => {
                let rows = self.pool.stats();
                if rows.is_empty() {
                    return CommandOutcome::Text("agent pool is empty".into());
                }
                let mut out = String::from("pooled agents:\n");
                for (id, in_use, uses, age) in rows {
                    out.push_str(&format!(
                        "  {id}  {}  {uses} uses  {:.0}s old\n",
                        if in_use { "leased" } else { "idle" },
                        age.as_secs_f64()
                    ));
                }
                CommandOutcome::Text(out)
            }
            _ => CommandOutcome::Usage("usage: /agent list".into()),
        }
    }

    fn plugin_command(&self, args: &[&str]) -> CommandOutcome {
        match args {
            [] | ["list"] | ["active"] => {
                if self.plugins.is_empty() {
                    return CommandOutcome::Text("no plugins installed".into());
                }
                let mut out = String::from("plugins:\n");
                for p in &self.plugins {
                    out.push_str(&format!(
                        "  {} {}  tools [{}]  agents [{}]\n",
                        p.name,
                        p.version,
                        p.tools.join(", "),
                        p.agents.join(", ")
                    ));
                }
                CommandOutcome::Text(out)
            }
            _ => CommandOutcome::Usage(
                "usage: /plugin [list|active] (install/uninstall are done outside the session)"
                    .into(),
            ),
        }
    }
}

const HELP: &str = "\
commands:
  /help                 this text
  /model [name]         list models / how to switch
  /task [list|kill ID]  background shells and agents
  /agent list           pooled sub-agents
  /plugin list          installed plugins
  /undo                 revert the last file mutation
  /clear                wipe the conversation
  /compact              trim old conversation history
";

// ─── Unit tests ──────────────────────────────────────────────────────────────
