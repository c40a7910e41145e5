// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper returning `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be on unless explicitly disabled
/// need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

// ── Model ─────────────────────────────────────────────────────────────────────

fn default_endpoint() -> String {
    "http://localhost:11434".into()
}
fn default_model_name() -> String {
    "qwen2.5-coder:14b".into()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_context_size() -> u32 {
    32_768
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_timeout_secs() -> u64 {
    240
}
fn default_retry_timeout_increment_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL of the chat endpoint (Ollama-style API).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Model name forwarded to the endpoint.
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Sampling temperature (0.0–2.0).
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Context window requested from the server (`num_ctx`).
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    /// Maximum tokens to generate in one completion (`num_predict`).
    /// `None` leaves the server default in place.
    pub max_tokens: Option<u32>,
    /// Keep-alive duration forwarded verbatim (e.g. "5m").  Controls how long
    /// the server keeps the model loaded between requests.
    pub keep_alive: Option<String>,
    /// Reasoning-effort hint forwarded to servers that understand it
    /// ("low" | "medium" | "high").  Ignored by servers that do not.
    pub reasoning_effort: Option<String>,
    /// Maximum request attempts before a send is reported as failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base per-attempt request timeout.  Each retry adds
    /// `retry_timeout_increment_secs` so slow local models get progressively
    /// more headroom instead of failing the same way three times.
    #[serde(default = "default_base_timeout_secs")]
    pub base_timeout_secs: u64,
    #[serde(default = "default_retry_timeout_increment_secs")]
    pub retry_timeout_increment_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            name: default_model_name(),
            temperature: default_temperature(),
            context_size: default_context_size(),
            max_tokens: None,
            keep_alive: None,
            reasoning_effort: None,
            max_retries: default_max_retries(),
            base_timeout_secs: default_base_timeout_secs(),
            retry_timeout_increment_secs: default_retry_timeout_increment_secs(),
        }
    }
}

// ── Agent ─────────────────────────────────────────────────────────────────────

fn default_max_tool_rounds() -> u32 {
    200
}
fn default_max_agent_depth() -> usize {
    4
}
fn default_pool_size() -> usize {
    5
}
fn default_nested_pool_size() -> usize {
    15
}
fn default_watchdog_timeout_secs() -> u64 {
    120
}
fn default_watchdog_interval_secs() -> u64 {
    10
}
fn default_max_timeout_continuations() -> u32 {
    3
}
fn default_exploratory_gentle() -> u32 {
    6
}
fn default_exploratory_stern() -> u32 {
    10
}
fn default_cycle_window() -> usize {
    15
}
fn default_cycle_threshold() -> usize {
    3
}
fn default_cycle_break_threshold() -> usize {
    5
}
fn default_requirement_max_retries() -> u32 {
    2
}
fn default_tool_result_token_cap() -> usize {
    2_000
}
fn default_trim_keep_recent() -> usize {
    8
}

/// How long a delegated agent may run before time-pressure reminders and,
/// finally, termination kick in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Thoroughness {
    Quick,
    #[default]
    Medium,
    Thorough,
    Uncapped,
}

impl Thoroughness {
    /// Wall-clock budget for a delegated agent, `None` = uncapped.
    pub fn max_duration_secs(self) -> Option<u64> {
        match self {
            Thoroughness::Quick => Some(60),
            Thoroughness::Medium => Some(300),
            Thoroughness::Thorough => Some(600),
            Thoroughness::Uncapped => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of autonomous tool-call rounds before the wrap-up turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Delegation tools refuse to spawn children at or beyond this depth.
    #[serde(default = "default_max_agent_depth")]
    pub max_agent_depth: usize,
    /// Reusable sub-agent pool size for a root agent.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Pool size when delegations themselves delegate.
    #[serde(default = "default_nested_pool_size")]
    pub nested_pool_size: usize,
    /// Seconds without a tool call before the watchdog posts a continuation
    /// reminder.
    #[serde(default = "default_watchdog_timeout_secs")]
    pub watchdog_timeout_secs: u64,
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    /// Consecutive watchdog timeouts tolerated before the agent gives up.
    #[serde(default = "default_max_timeout_continuations")]
    pub max_timeout_continuations: u32,
    /// Consecutive exploratory tool calls before the gentle delegation nudge.
    #[serde(default = "default_exploratory_gentle")]
    pub exploratory_gentle_threshold: u32,
    /// ... and before the stern one.
    #[serde(default = "default_exploratory_stern")]
    pub exploratory_stern_threshold: u32,
    /// Sliding window of tool-call signatures inspected for cycles.
    #[serde(default = "default_cycle_window")]
    pub cycle_window: usize,
    /// Repetitions of one signature within the window that trigger a warning.
    #[serde(default = "default_cycle_threshold")]
    pub cycle_threshold: usize,
    /// Consecutive distinct signatures that reset the window.
    #[serde(default = "default_cycle_break_threshold")]
    pub cycle_break_threshold: usize,
    /// Retries granted to a delegated agent that terminated without calling
    /// its required tools.
    #[serde(default = "default_requirement_max_retries")]
    pub requirement_max_retries: u32,
    /// Approximate token cap applied to a single tool result before it is
    /// appended to history.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// Recent non-system messages preserved verbatim by the emergency trim.
    #[serde(default = "default_trim_keep_recent")]
    pub trim_keep_recent: usize,
    /// Default time budget for delegated agents.
    #[serde(default)]
    pub thoroughness: Thoroughness,
    /// Start the watchdog on the root agent too (it is always started on
    /// delegated agents).
    #[serde(default)]
    pub watchdog_on_root: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            max_agent_depth: default_max_agent_depth(),
            pool_size: default_pool_size(),
            nested_pool_size: default_nested_pool_size(),
            watchdog_timeout_secs: default_watchdog_timeout_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            max_timeout_continuations: default_max_timeout_continuations(),
            exploratory_gentle_threshold: default_exploratory_gentle(),
            exploratory_stern_threshold: default_exploratory_stern(),
            cycle_window: default_cycle_window(),
            cycle_threshold: default_cycle_threshold(),
            cycle_break_threshold: default_cycle_break_threshold(),
            requirement_max_retries: default_requirement_max_retries(),
            tool_result_token_cap: default_tool_result_token_cap(),
            trim_keep_recent: default_trim_keep_recent(),
            thoroughness: Thoroughness::default(),
            watchdog_on_root: false,
        }
    }
}

// ── Tools ─────────────────────────────────────────────────────────────────────

fn default_tool_timeout_secs() -> u64 {
    30
}
fn default_permission_timeout_secs() -> u64 {
    30
}
fn default_background_buffer_lines() -> usize {
    10_000
}
fn default_kill_grace_ms() -> u64 {
    2_000
}
fn default_patch_max_count() -> usize {
    50
}
fn default_patch_max_total_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_auto_approve_patterns() -> Vec<String> {
    vec![
        "cat *".into(),
        "ls*".into(),
        "git status*".into(),
        "git log*".into(),
        "git diff*".into(),
    ]
}
fn default_deny_patterns() -> Vec<String> {
    vec!["rm -rf /*".into(), "sudo *".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default foreground shell timeout.
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// Skip the permission prompt entirely (`--auto-confirm`).
    #[serde(default)]
    pub auto_confirm: bool,
    /// Seconds the broker waits for the UI before treating the request as
    /// denied.
    #[serde(default = "default_permission_timeout_secs")]
    pub permission_timeout_secs: u64,
    /// Shell command globs that run without asking.
    #[serde(default = "default_auto_approve_patterns")]
    pub auto_approve_patterns: Vec<String>,
    /// Shell command globs that are always refused.
    #[serde(default = "default_deny_patterns")]
    pub deny_patterns: Vec<String>,
    /// Ring-buffer capacity (lines) for each background process.
    #[serde(default = "default_background_buffer_lines")]
    pub background_buffer_lines: usize,
    /// Grace period between SIGTERM and SIGKILL when killing a background
    /// process.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Undo journal caps.
    #[serde(default = "default_patch_max_count")]
    pub patch_max_count: usize,
    #[serde(default = "default_patch_max_total_bytes")]
    pub patch_max_total_bytes: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            auto_confirm: false,
            permission_timeout_secs: default_permission_timeout_secs(),
            auto_approve_patterns: default_auto_approve_patterns(),
            deny_patterns: default_deny_patterns(),
            background_buffer_lines: default_background_buffer_lines(),
            kill_grace_ms: default_kill_grace_ms(),
            patch_max_count: default_patch_max_count(),
            patch_max_total_bytes: default_patch_max_total_bytes(),
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

fn default_profile() -> String {
    "default".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Profile name under `~/.ally/profiles/`.
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Persist the todo list alongside the conversation.
    #[serde(default = "default_true")]
    pub save_todos: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            save_todos: true,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses_from_empty_yaml() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.model.endpoint, "http://localhost:11434");
        assert_eq!(cfg.agent.max_agent_depth, 4);
        assert_eq!(cfg.tools.permission_timeout_secs, 30);
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let cfg: Config = serde_yaml::from_str("model:\n  name: llama3.2\n").unwrap();
        assert_eq!(cfg.model.name, "llama3.2");
        assert_eq!(cfg.model.endpoint, "http://localhost:11434");
    }

    #[test]
    fn thoroughness_budgets() {
        assert_eq!(Thoroughness::Quick.max_duration_secs(), Some(60));
        assert_eq!(Thoroughness::Medium.max_duration_secs(), Some(300));
        assert_eq!(Thoroughness::Thorough.max_duration_secs(), Some(600));
        assert_eq!(Thoroughness::Uncapped.max_duration_secs(), None);
    }

    #[test]
    fn thoroughness_parses_lowercase() {
        let t: Thoroughness = serde_yaml::from_str("thorough").unwrap();
        assert_eq!(t, Thoroughness::Thorough);
    }

    #[test]
    fn deny_patterns_default_includes_sudo() {
        let cfg = ToolsConfig::default();
        assert!(cfg.deny_patterns.iter().any(|p| p.starts_with("sudo")));
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let cfg = Config::default();
        let text = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.model.name, cfg.model.name);
        assert_eq!(back.agent.pool_size, cfg.agent.pool_size);
    }
}
