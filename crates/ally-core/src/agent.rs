// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent loop: model step → tool step → repeat.
//!
//! One [`Agent`] owns one conversation and drives it to completion per user
//! message, injecting system reminders (time pressure, cycles, validation
//! failures) as steering.  External parties (the command dispatcher, the
//! watchdog, the loop detector) talk to a running agent only through its
//! shared [`AgentHandle`].

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ally_config::{Config, PluginManifest};
use ally_model::{ChatClient, ChatDelta, ChatMessage, ChatResponse, SendOptions, ToolCallRequest};
use ally_tools::{ErrorKind, ToolCall, ToolEvent, ToolRegistry};

use crate::bus::{ActivityBus, ActivityPayload};
use crate::compact::{emergency_trim, smart_truncate};
use crate::delegation::DelegationTree;
use crate::loop_detect::{LoopDetector, LoopDetectorConfig};
use crate::orchestrator::ToolOrchestrator;
use crate::prompts;
use crate::session::Session;
use crate::watchdog::ActivityWatchdog;

/// How an agent instance is to be spawned and constrained.
#[derive(Clone, Default)]
pub struct AgentSpawnConfig {
    /// Delegated special-purpose agent (vs the root conversation).
    pub specialized: bool,
    /// Full system prompt override.
    pub system_prompt: Option<String>,
    /// Task description appended to the system prompt for delegations.
    pub task_prompt: Option<String>,
    /// Tool call that spawned this agent; events nest under it.
    pub parent_call_id: Option<String>,
    /// Wall-clock budget; crossing 50/75/90/100 % injects reminders and the
    /// last threshold forces wrap-up.
    pub max_duration: Option<Duration>,
    /// Seed context.  Non-empty means the agent must never be pool-reused.
    pub initial_messages: Vec<ChatMessage>,
    /// Pool identity for safe reuse across semantically identical tasks.
    pub pool_key: Option<String>,
    /// Tools this agent must call before its answer is accepted.
    pub required_tools: Vec<String>,
    /// Nesting depth; delegation refuses to go past the configured cap.
    pub depth: usize,
    /// The spawning agent's watchdog.  Paused while this agent runs tool
    /// batches, resumed with the delegation outcome when the turn ends.
    pub parent_watchdog: Option<Arc<ActivityWatchdog>>,
    pub verbose: bool,
}

/// Shared control surface of a (possibly running) agent.
pub struct AgentHandle {
    pub agent_id: String,
    pub client: Arc<ChatClient>,
    pub delegation_tree: Arc<DelegationTree>,
    pub watchdog: Arc<ActivityWatchdog>,
    cancel: Mutex<CancellationToken>,
    interjections: Mutex<Vec<String>>,
    reminders: Mutex<Vec<String>>,
    reset_requested: AtomicBool,
}

impl AgentHandle {
    pub fn new(
        agent_id: impl Into<String>,
        client: Arc<ChatClient>,
        watchdog: Arc<ActivityWatchdog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent_id: agent_id.into(),
            client,
            delegation_tree: DelegationTree::new(),
            watchdog,
            cancel: Mutex::new(CancellationToken::new()),
            interjections: Mutex::new(Vec::new()),
            reminders: Mutex::new(Vec::new()),
            reset_requested: AtomicBool::new(false),
        })
    }

    /// Handle wired to a scripted client; for tests across the crate.
    pub fn for_tests(agent_id: &str) -> Arc<Self> {
        let endpoint = ally_model::mock::ScriptedEndpoint::new(vec![]);
        let client = Arc::new(ChatClient::new(endpoint, ally_config::ModelConfig::default()));
        let watchdog = ActivityWatchdog::new(Duration::from_secs(120), Duration::from_secs(10));
        Self::new(agent_id, client, watchdog)
    }

    /// Queue user text typed while the agent is running.  Follow with
    /// [`interrupt`] to break the in-flight model call; the text becomes a
    /// user message on the next loop iteration rather than being dropped.
    pub fn add_user_interjection(&self, text: &str) {
        self.interjections.lock().unwrap().push(text.to_string());
    }

    /// Cancel the current turn's in-flight work.
    pub fn interrupt(&self, reason: &str) {
        debug!(agent = %self.agent_id, reason, "interrupting agent");
        self.cancel.lock().unwrap().cancel();
        self.client.cancel();
    }

    /// Post a system reminder consumed at the next loop iteration.
    pub fn post_reminder(&self, text: String) {
        self.reminders.lock().unwrap().push(text);
    }

    /// Ask the agent to clear its conversation before the next message
    /// (pool reuse).
    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::Release);
    }

    pub fn current_cancel(&self) -> CancellationToken {
        self.cancel.lock().unwrap().clone()
    }

    pub fn has_interjections(&self) -> bool {
        !self.interjections.lock().unwrap().is_empty()
    }

    fn begin_turn(&self) -> CancellationToken {
        let mut guard = self.cancel.lock().unwrap();
        *guard = CancellationToken::new();
        guard.clone()
    }

    fn take_interjections(&self) -> Vec<String> {
        std::mem::take(&mut self.interjections.lock().unwrap())
    }

    fn take_reminders(&self) -> Vec<String> {
        std::mem::take(&mut self.reminders.lock().unwrap())
    }

    fn take_reset(&self) -> bool {
        self.reset_requested.swap(false, Ordering::AcqRel)
    }
}

pub struct Agent {
    session: Session,
    config: Arc<Config>,
    spawn: AgentSpawnConfig,
    registry: Arc<ToolRegistry>,
    orchestrator: ToolOrchestrator,
    bus: Arc<ActivityBus>,
    handle: Arc<AgentHandle>,
    tool_event_rx: mpsc::Receiver<ToolEvent>,
    plugins: Vec<PluginManifest>,
    // Cycle detection state survives across turns; a loop does not stop
    // being a loop because the user said "continue".
    cycle_window: VecDeque<String>,
    last_signature: Option<String>,
    distinct_run: usize,
    cycle_warned: bool,
    exploratory_streak: u32,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        spawn: AgentSpawnConfig,
        registry: Arc<ToolRegistry>,
        orchestrator: ToolOrchestrator,
        bus: Arc<ActivityBus>,
        handle: Arc<AgentHandle>,
        tool_event_rx: mpsc::Receiver<ToolEvent>,
        plugins: Vec<PluginManifest>,
    ) -> Self {
        let session = Session::new(config.model.context_size as usize);
        Self {
            session,
            config,
            spawn,
            registry,
            orchestrator,
            bus,
            handle,
            tool_event_rx,
            plugins,
            cycle_window: VecDeque::new(),
            last_signature: None,
            distinct_run: 0,
            cycle_warned: false,
            exploratory_streak: 0,
        }
    }

    pub fn handle(&self) -> Arc<AgentHandle> {
        self.handle.clone()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn spawn_config(&self) -> &AgentSpawnConfig {
        &self.spawn
    }

    /// Reconfigure a pooled agent for its next task.  History is cleared by
    /// the reset flag on the handle; per-task limits come from the new
    /// config.
    pub fn retarget(&mut self, spawn: AgentSpawnConfig) {
        self.spawn = spawn;
    }

    /// One user turn: run the model ↔ tool loop to completion and return the
    /// final assistant text.
    pub async fn send_message(&mut self, user_text: &str) -> anyhow::Result<String> {
        if self.handle.take_reset() {
            self.session.clear();
        }
        let cancel = self.handle.begin_turn();
        let turn_started = Instant::now();

        let watchdog_enabled = self.spawn.depth > 0 || self.config.agent.watchdog_on_root;
        if watchdog_enabled {
            self.arm_watchdog();
            self.handle.watchdog.start();
        }

        // Lifecycle hook: tagged plugins activated by this message.
        if let Some(note) = self.plugin_activation_note(user_text) {
            self.session.push(ChatMessage::system(note));
        }

        if self.session.messages.is_empty() {
            self.session
                .push(ChatMessage::system(self.system_prompt_text()));
            let seed: Vec<ChatMessage> = self
                .spawn
                .initial_messages
                .iter()
                .filter(|m| m.role != ally_model::Role::System)
                .cloned()
                .collect();
            for m in seed {
                self.session.push(m);
            }
        }
        self.session.push(ChatMessage::user(user_text));

        let outcome = self.run_loop(cancel, turn_started).await;

        if watchdog_enabled {
            self.handle.watchdog.stop();
        }
        self.post_response_housekeeping();
        self.bus.emit(ActivityPayload::TurnComplete {
            agent_id: self.handle.agent_id.clone(),
        });
        outcome
    }

    async fn run_loop(
        &mut self,
        mut cancel: CancellationToken,
        turn_started: Instant,
    ) -> anyhow::Result<String> {
        let agent_cfg = self.config.agent.clone();
        let mut rounds: u32 = 0;
        let mut continuation_attempts: u32 = 0;
        let mut requirements_warnings: u32 = 0;
        let mut thresholds_sent = [false; 4];
        let mut wrap_up = false;
        let mut called_tools: HashSet<String> = HashSet::new();
        let mut paused_parent = false;
        let mut outcome_ok = true;
        let reply;

        // Streak nudges fire once per streak run.
        let mut gentle_sent = false;
        let mut stern_sent = false;

        loop {
            for r in self.handle.take_reminders() {
                self.session.push(ChatMessage::system(r));
            }
            let interjections = self.handle.take_interjections();
            let had_interjection = !interjections.is_empty();
            for text in interjections {
                debug!(agent = %self.handle.agent_id, "applying queued interjection");
                self.session.push(ChatMessage::user(text));
            }
            // A root-agent interjection is a new user turn, not a
            // termination: refresh the cancelled token and keep looping.
            // Delegated agents instead return interrupted so the parent can
            // observe the failed delegation.
            if had_interjection && self.spawn.depth == 0 && cancel.is_cancelled() {
                cancel = self.handle.begin_turn();
            }

            if let Some(max) = self.spawn.max_duration {
                let pct =
                    (turn_started.elapsed().as_secs_f64() / max.as_secs_f64() * 100.0) as u32;
                for (idx, threshold) in [50u32, 75, 90, 100].iter().enumerate() {
                    if pct >= *threshold && !thresholds_sent[idx] {
                        thresholds_sent[idx] = true;
                        self.session.push(ChatMessage::system(
                            prompts::reminder_time_pressure(*threshold),
                        ));
                        if *threshold == 100 {
                            wrap_up = true;
                        }
                    }
                }
            }

            rounds += 1;
            if rounds > agent_cfg.max_tool_rounds {
                self.session
                    .push(ChatMessage::system(prompts::wrap_up_request(
                        agent_cfg.max_tool_rounds,
                    )));
                wrap_up = true;
            }
            if wrap_up {
                // One final tool-free turn so the model can summarize
                // instead of being cut off mid-task.
                let (response, _) = self.model_turn(false).await;
                if !response.content.is_empty() {
                    self.session
                        .push(ChatMessage::assistant(response.content.clone()));
                }
                reply = response.content;
                break;
            }

            if cancel.is_cancelled() {
                self.session
                    .push(ChatMessage::system(prompts::reminder_interrupted()));
                outcome_ok = false;
                reply = String::new();
                break;
            }

            if self.session.is_near_limit(0.85) {
                let before = self.session.token_count;
                emergency_trim(&mut self.session.messages, agent_cfg.trim_keep_recent);
                self.session.recalculate_tokens();
                self.bus.emit(ActivityPayload::ContextTrimmed {
                    tokens_before: before,
                    tokens_after: self.session.token_count,
                });
            }

            let (response, loop_fired) = self.model_turn(true).await;

            if response.interrupted {
                // Only the turn token distinguishes a user interrupt from a
                // nudge-cancel (loop detector, watchdog): those cancel the
                // client alone so the loop can continue with a reminder.
                if !cancel.is_cancelled()
                    && continuation_attempts < agent_cfg.max_timeout_continuations
                {
                    continuation_attempts += 1;
                    if !response.content.is_empty() {
                        self.session
                            .push(ChatMessage::assistant(response.content.clone()));
                    }
                    if loop_fired {
                        self.session
                            .push(ChatMessage::system(prompts::reminder_thinking_loop()));
                    }
                    continue;
                }
                // A root interjection continues as a fresh user turn; the
                // loop top drains the queue and refreshes the token.
                if self.spawn.depth == 0 && self.handle.has_interjections() {
                    if !response.content.is_empty() {
                        self.session
                            .push(ChatMessage::assistant(response.content.clone()));
                    }
                    continue;
                }
                if !response.content.is_empty() {
                    self.session
                        .push(ChatMessage::assistant(response.content.clone()));
                }
                self.session
                    .push(ChatMessage::system(prompts::reminder_interrupted()));
                outcome_ok = false;
                reply = response.content;
                break;
            }

            if let Some(error) = &response.error {
                let mut text = format!("Model request failed: {error}");
                if let Some(s) = &response.suggestion {
                    text.push_str(&format!("\n{s}"));
                }
                self.bus.emit(ActivityPayload::Error {
                    message: text.clone(),
                });
                outcome_ok = false;
                reply = text;
                break;
            }

            if response.validation_failed {
                continuation_attempts += 1;
                if continuation_attempts > agent_cfg.max_timeout_continuations {
                    outcome_ok = false;
                    reply = "The model kept producing malformed tool calls.".to_string();
                    break;
                }
                self.session
                    .push(ChatMessage::system(prompts::reminder_validation_failed(
                        &response.validation_errors,
                    )));
                continue;
            }

            if response.tool_calls.is_empty() {
                if response.content.is_empty() {
                    continuation_attempts += 1;
                    if continuation_attempts > agent_cfg.max_timeout_continuations {
                        reply = String::new();
                        break;
                    }
                    self.session
                        .push(ChatMessage::system(prompts::reminder_empty_response()));
                    continue;
                }
                if text_contains_malformed_tool_call(&response.content)
                    && continuation_attempts < agent_cfg.max_timeout_continuations
                {
                    continuation_attempts += 1;
                    self.session
                        .push(ChatMessage::assistant(response.content.clone()));
                    self.session.push(ChatMessage::system(
                        prompts::reminder_malformed_inline_tool_call(),
                    ));
                    continue;
                }

                // Required-tool enforcement for specialized delegations.
                let missing: Vec<String> = self
                    .spawn
                    .required_tools
                    .iter()
                    .filter(|t| !called_tools.contains(*t))
                    .cloned()
                    .collect();
                if self.spawn.specialized
                    && !missing.is_empty()
                    && requirements_warnings < agent_cfg.requirement_max_retries
                {
                    requirements_warnings += 1;
                    self.session
                        .push(ChatMessage::assistant(response.content.clone()));
                    self.session
                        .push(ChatMessage::system(prompts::reminder_requirements_unmet(
                            &missing,
                        )));
                    continue;
                }

                self.session
                    .push(ChatMessage::assistant(response.content.clone()));
                reply = response.content;
                break;
            }

            // Tool step.
            continuation_attempts = 0;
            self.session.push(ChatMessage::assistant_with_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            if let Some(parent) = &self.spawn.parent_watchdog {
                if !paused_parent {
                    parent.pause();
                    paused_parent = true;
                }
            }

            let mut interrupted_mid_tools = false;
            for request in &response.tool_calls {
                called_tools.insert(request.function.name.clone());
                let tc = to_tool_call(request);

                let result = self
                    .orchestrator
                    .execute(&tc, self.spawn.parent_call_id.clone(), &cancel, false)
                    .await;
                if result.success {
                    self.handle.watchdog.record_activity();
                }

                self.update_streaks(&tc, &mut gentle_sent, &mut stern_sent);
                if let Some(tool_name) = self.track_cycle(&tc) {
                    self.session
                        .push(ChatMessage::system(prompts::reminder_cycle(&tool_name)));
                }

                let category = self
                    .registry
                    .get(&tc.name)
                    .map(|t| t.output_category())
                    .unwrap_or_default();
                let mut wire = result.to_wire_json();
                for key in ["content", "output"] {
                    let truncated = match wire.get(key) {
                        Some(serde_json::Value::String(s)) => {
                            let t = smart_truncate(s, category, agent_cfg.tool_result_token_cap);
                            (t.len() != s.len()).then_some(t)
                        }
                        _ => None,
                    };
                    if let Some(t) = truncated {
                        wire[key] = serde_json::Value::String(t);
                    }
                }
                self.session.push(ChatMessage::tool_result(
                    tc.id.clone(),
                    tc.name.clone(),
                    wire.to_string(),
                ));

                self.drain_tool_events();

                if result.error_kind == Some(ErrorKind::Interrupted) {
                    interrupted_mid_tools = true;
                    break;
                }
            }

            if interrupted_mid_tools {
                if self.spawn.depth == 0 && self.handle.has_interjections() {
                    continue;
                }
                self.session
                    .push(ChatMessage::system(prompts::reminder_interrupted()));
                outcome_ok = false;
                reply = String::new();
                break;
            }
        }

        if paused_parent {
            if let Some(parent) = &self.spawn.parent_watchdog {
                parent.resume(outcome_ok);
            }
        }
        Ok(reply)
    }

    /// One model call with streaming fan-out to the bus and the loop
    /// detector.  Returns the response plus whether the detector fired.
    async fn model_turn(&self, with_tools: bool) -> (ChatResponse, bool) {
        let tools: Vec<ally_model::ToolSchema> =
            if with_tools && self.handle.client.tools_supported() {
                self.registry
                    .schemas()
                    .into_iter()
                    .map(|s| ally_model::ToolSchema {
                        name: s.name,
                        description: s.description,
                        parameters: s.parameters,
                    })
                    .collect()
            } else {
                Vec::new()
            };

        let weak = Arc::downgrade(&self.handle);
        let detector = LoopDetector::start(
            LoopDetectorConfig::default(),
            Arc::new(move |_description: &str| {
                if let Some(handle) = weak.upgrade() {
                    handle.client.cancel();
                }
            }),
        );

        let (tx, mut rx) = mpsc::channel::<ChatDelta>(64);
        let bus = self.bus.clone();
        let agent_id = self.handle.agent_id.clone();
        let det = detector.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(delta) = rx.recv().await {
                match delta {
                    ChatDelta::Text(text) => {
                        det.feed(&text);
                        bus.emit(ActivityPayload::TextChunk {
                            agent_id: agent_id.clone(),
                            text,
                        });
                    }
                    ChatDelta::Thinking(text) => {
                        det.feed(&text);
                        bus.emit(ActivityPayload::ThoughtChunk {
                            agent_id: agent_id.clone(),
                            text,
                        });
                    }
                }
            }
        });

        let response = self
            .handle
            .client
            .send(
                &self.session.messages,
                SendOptions {
                    tools,
                    stream: true,
                    max_retries: None,
                },
                Some(&tx),
            )
            .await;
        drop(tx);
        let _ = forwarder.await;
        detector.stop();

        self.bus.emit(ActivityPayload::TokenUsage {
            used: self.session.token_count,
            budget: self.session.max_tokens,
        });
        (response, detector.has_fired())
    }

    /// Wire the watchdog callback to this agent's handle.  The callback
    /// holds a weak reference; the watchdog must not keep the handle alive.
    fn arm_watchdog(&self) {
        let weak: Weak<AgentHandle> = Arc::downgrade(&self.handle);
        let max_continuations = self.config.agent.max_timeout_continuations;
        self.handle.watchdog.set_on_timeout(Arc::new(move |count| {
            let Some(handle) = weak.upgrade() else {
                return;
            };
            if count > max_continuations {
                warn!(agent = %handle.agent_id, count, "activity timeouts exhausted; interrupting");
                handle.interrupt("activity timeout");
            } else {
                handle.post_reminder(prompts::reminder_activity_timeout().to_string());
                handle.client.cancel();
            }
        }));
    }

    fn update_streaks(&mut self, tc: &ToolCall, gentle_sent: &mut bool, stern_sent: &mut bool) {
        let Some(tool) = self.registry.get(&tc.name) else {
            return;
        };
        if tool.is_exploratory() {
            self.exploratory_streak += 1;
            let cfg = &self.config.agent;
            if self.exploratory_streak >= cfg.exploratory_stern_threshold && !*stern_sent {
                *stern_sent = true;
                self.session
                    .push(ChatMessage::system(prompts::reminder_exploratory_stern()));
            } else if self.exploratory_streak >= cfg.exploratory_gentle_threshold && !*gentle_sent
            {
                *gentle_sent = true;
                self.session
                    .push(ChatMessage::system(prompts::reminder_exploratory_gentle()));
            }
        } else if tool.breaks_exploratory_streak() {
            self.exploratory_streak = 0;
            *gentle_sent = false;
            *stern_sent = false;
        }
    }

    /// Sliding-window repetition check over tool-call signatures.
    /// Returns the tool name when a cycle warning should be injected.
    fn track_cycle(&mut self, tc: &ToolCall) -> Option<String> {
        let cfg = &self.config.agent;
        // serde_json orders object keys, so equal argument sets canonicalize
        // to equal strings regardless of emission order.
        let signature = format!("{}:{}", tc.name, tc.args);

        if self.last_signature.as_deref() == Some(signature.as_str()) {
            self.distinct_run = 0;
        } else {
            self.distinct_run += 1;
        }
        self.last_signature = Some(signature.clone());
        if self.distinct_run >= cfg.cycle_break_threshold {
            self.cycle_window.clear();
            self.distinct_run = 0;
            self.cycle_warned = false;
        }

        self.cycle_window.push_back(signature.clone());
        while self.cycle_window.len() > cfg.cycle_window {
            self.cycle_window.pop_front();
        }

        let occurrences = self
            .cycle_window
            .iter()
            .filter(|s| **s == signature)
            .count();
        if occurrences >= cfg.cycle_threshold && !self.cycle_warned {
            self.cycle_warned = true;
            warn!(tool = %tc.name, occurrences, "tool-call cycle detected");
            return Some(tc.name.clone());
        }
        None
    }

    fn drain_tool_events(&mut self) {
        while let Ok(event) = self.tool_event_rx.try_recv() {
            match event {
                ToolEvent::TodoUpdate(todos) => {
                    self.bus.emit(ActivityPayload::TodoUpdate { todos });
                }
            }
        }
    }

    fn system_prompt_text(&self) -> String {
        let names: Vec<String> = self.registry.names();
        prompts::system_prompt(
            self.spawn.system_prompt.as_deref(),
            self.spawn.task_prompt.as_deref(),
            &names,
        )
    }

    fn plugin_activation_note(&self, user_text: &str) -> Option<String> {
        let active: Vec<&PluginManifest> = self
            .plugins
            .iter()
            .filter(|p| {
                p.activation_mode == ally_config::ActivationMode::Tagged
                    && p.is_active_for(user_text)
            })
            .collect();
        prompts::plugin_activation_note(&active)
    }

    /// Post-response cleanups queued during the turn (stale delegation
    /// contexts whose tool calls completed).
    fn post_response_housekeeping(&mut self) {
        for call_id in std::mem::take(&mut self.session.pending_tool_cleanups) {
            self.handle.delegation_tree.clear(&call_id);
        }
    }
}

fn to_tool_call(request: &ToolCallRequest) -> ToolCall {
    ToolCall {
        id: request.id.clone(),
        name: request.function.name.clone(),
        args: request.function.arguments.clone(),
    }
}

/// Detect tool-call markup written into the text stream instead of being
/// emitted through the structured protocol.  Some fine-tuned models fall
/// back to XML-style or bracket-style function syntax under pressure.
fn text_contains_malformed_tool_call(text: &str) -> bool {
    text.contains("<tool_call>")
        || text.contains("</tool_call>")
        || text.contains("<function=")
        || text.contains("[TOOL_CALL]")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
