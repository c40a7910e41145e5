// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Plugin manifest descriptors.
//!
//! Installation and loading of plugins happens outside the core; the runtime
//! only reads the manifests that installed plugins left under
//! `~/.ally/profiles/<name>/plugins/<plugin>/manifest.json` and consumes a
//! handful of fields: the declared tool and agent names, whether the plugin
//! runs a background agent, its activation mode, and the pool key its agents
//! are leased under.  Everything else is opaque.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// When a plugin's tools become visible to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivationMode {
    /// Active on every turn.
    #[default]
    Always,
    /// Active only on turns whose user message mentions `@<plugin-name>`.
    Tagged,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackgroundSpec {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    /// Tool names the plugin contributes.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Specialized agent names the plugin contributes.
    #[serde(default)]
    pub agents: Vec<String>,
    /// Free-form plugin configuration; not interpreted by the core.
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub background: Option<BackgroundSpec>,
    #[serde(default, alias = "activationMode")]
    pub activation_mode: ActivationMode,
    /// Pool key prefix for the plugin's agents: `plugin-<name>-<agent>`.
    #[serde(default, alias = "_poolKey")]
    pub pool_key: Option<String>,
}

impl PluginManifest {
    /// Pool key for one of this plugin's agents.
    pub fn agent_pool_key(&self, agent: &str) -> String {
        match &self.pool_key {
            Some(k) => k.clone(),
            None => format!("plugin-{}-{agent}", self.name),
        }
    }

    /// True when this plugin's tools should be visible for `user_text`.
    pub fn is_active_for(&self, user_text: &str) -> bool {
        match self.activation_mode {
            ActivationMode::Always => true,
            ActivationMode::Tagged => user_text.contains(&format!("@{}", self.name)),
        }
    }
}

/// Read every `manifest.json` under `plugins_dir`.  Unreadable or invalid
/// manifests are skipped with a warning; a broken plugin must not take the
/// assistant down.
pub fn read_manifests(plugins_dir: &Path) -> Vec<PluginManifest> {
    let mut manifests = Vec::new();
    let entries = match std::fs::read_dir(plugins_dir) {
        Ok(e) => e,
        Err(_) => return manifests,
    };
    for entry in entries.flatten() {
        let manifest_path = entry.path().join("manifest.json");
        if !manifest_path.is_file() {
            continue;
        }
        match std::fs::read_to_string(&manifest_path)
            .map_err(anyhow::Error::from)
            .and_then(|t| serde_json::from_str::<PluginManifest>(&t).map_err(Into::into))
        {
            Ok(m) => manifests.push(m),
            Err(e) => {
                tracing::warn!(path = %manifest_path.display(), error = %e, "skipping invalid plugin manifest");
            }
        }
    }
    manifests.sort_by(|a, b| a.name.cmp(&b.name));
    manifests
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
