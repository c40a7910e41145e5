// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use ally_config::ToolsConfig;

/// Per-call approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    /// The user said no (or did not answer in time).
    Denied,
    /// A deny pattern matched; the call never reaches the user.
    Forbidden,
}

/// What the UI collaborator is asked to confirm.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub call_id: String,
    pub tool_name: String,
    /// One-line summary of what the tool is about to do.
    pub summary: String,
    /// Unified diff for file mutators, when available.
    pub preview: Option<String>,
}

/// Seam to whatever is rendering the conversation.  The broker awaits this
/// with a timeout; a hung UI must not wedge the agent loop.
#[async_trait]
pub trait PermissionUi: Send + Sync {
    async fn confirm(&self, request: &PermissionRequest) -> bool;
}

/// UI that approves everything (`--auto-confirm`, tests).
pub struct AutoApproveUi;

#[async_trait]
impl PermissionUi for AutoApproveUi {
    async fn confirm(&self, _request: &PermissionRequest) -> bool {
        true
    }
}

/// UI that denies everything (headless runs without a confirmation channel).
pub struct DenyAllUi;

#[async_trait]
impl PermissionUi for DenyAllUi {
    async fn confirm(&self, _request: &PermissionRequest) -> bool {
        false
    }
}

/// Pattern lists compiled from config.  Deny wins over allow.
#[derive(Debug)]
pub struct ToolPolicy {
    auto_patterns: Vec<Regex>,
    deny_patterns: Vec<Regex>,
}

impl ToolPolicy {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        Self {
            auto_patterns: compile(&cfg.auto_approve_patterns),
            deny_patterns: compile(&cfg.deny_patterns),
        }
    }

    fn is_denied(&self, command: &str) -> bool {
        self.deny_patterns.iter().any(|re| re.is_match(command))
    }

    fn is_auto_approved(&self, command: &str) -> bool {
        self.auto_patterns.iter().any(|re| re.is_match(command))
    }
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

/// Mediates between tools that require confirmation and the UI collaborator.
pub struct PermissionBroker {
    ui: Arc<dyn PermissionUi>,
    policy: ToolPolicy,
    auto_confirm: bool,
    timeout: Duration,
}

impl PermissionBroker {
    pub fn new(ui: Arc<dyn PermissionUi>, cfg: &ToolsConfig) -> Self {
        Self {
            ui,
            policy: ToolPolicy::from_config(cfg),
            auto_confirm: cfg.auto_confirm,
            timeout: Duration::from_secs(cfg.permission_timeout_secs),
        }
    }

    /// Decide whether `request` may proceed.
    ///
    /// `command_hint` carries the shell command (or comparable target string)
    /// so the pattern lists can pre-empt the prompt in both directions.
    /// The deny list is consulted even under `--auto-confirm`.
    pub async fn authorize(
        &self,
        request: &PermissionRequest,
        command_hint: Option<&str>,
    ) -> Decision {
        if let Some(hint) = command_hint {
            if self.policy.is_denied(hint) {
                warn!(tool = %request.tool_name, hint, "command matches deny pattern");
                return Decision::Forbidden;
            }
            if self.policy.is_auto_approved(hint) {
                debug!(tool = %request.tool_name, hint, "command auto-approved by pattern");
                return Decision::Approved;
            }
        }
        if self.auto_confirm {
            return Decision::Approved;
        }

        match tokio::time::timeout(self.timeout, self.ui.confirm(request)).await {
            Ok(true) => Decision::Approved,
            Ok(false) => Decision::Denied,
            Err(_) => {
                warn!(tool = %request.tool_name, "permission request timed out; denying");
                Decision::Denied
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
