// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// The assistant's home directory: `~/.ally`.
pub fn ally_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ally")
}

/// Directory of a named profile: `~/.ally/profiles/<name>`.
///
/// Each profile holds `plugins/`, `agents/`, `cache/` and `config.yaml`.
pub fn profile_dir(profile: &str) -> PathBuf {
    ally_home().join("profiles").join(profile)
}

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones.
fn config_search_paths(profile: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. Profile config
    paths.push(profile_dir(profile).join("config.yaml"));
    paths.push(profile_dir(profile).join("config.yml"));

    // 2. Workspace-local overrides
    paths.push(PathBuf::from(".ally/config.yaml"));
    paths.push(PathBuf::from(".ally.yaml"));
    paths.push(PathBuf::from(".ally.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. a `--config` flag);
/// it is applied last and therefore wins.
pub fn load(profile: &str, extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths(profile) {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        let expanded = shellexpand::tilde(&p.to_string_lossy()).into_owned();
        debug!(path = %expanded, "loading explicit config");
        let text =
            std::fs::read_to_string(&expanded).with_context(|| format!("reading {expanded}"))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {expanded}"))?;
        merge_yaml(&mut merged, layer);
    }

    let config: Config = serde_yaml::from_value(merged).context("deserializing merged config")?;
    Ok(config)
}

/// Deep-merge `layer` into `base`.  Mappings merge key-by-key; any other
/// value type is replaced wholesale.
fn merge_yaml(base: &mut serde_yaml::Value, layer: serde_yaml::Value) {
    match (base, layer) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(layer_map)) => {
            for (k, v) in layer_map {
                match base_map.get_mut(&k) {
                    Some(existing) => merge_yaml(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overrides_scalar() {
        let mut base: serde_yaml::Value = serde_yaml::from_str("model:\n  name: a\n").unwrap();
        let layer: serde_yaml::Value = serde_yaml::from_str("model:\n  name: b\n").unwrap();
        merge_yaml(&mut base, layer);
        assert_eq!(base["model"]["name"].as_str(), Some("b"));
    }

    #[test]
    fn merge_preserves_unrelated_keys() {
        let mut base: serde_yaml::Value =
            serde_yaml::from_str("model:\n  name: a\n  temperature: 0.7\n").unwrap();
        let layer: serde_yaml::Value = serde_yaml::from_str("model:\n  name: b\n").unwrap();
        merge_yaml(&mut base, layer);
        assert_eq!(base["model"]["temperature"].as_f64(), Some(0.7));
    }

    #[test]
    fn merge_replaces_sequences_wholesale() {
        let mut base: serde_yaml::Value =
            serde_yaml::from_str("tools:\n  deny_patterns: [a, b]\n").unwrap();
        let layer: serde_yaml::Value =
            serde_yaml::from_str("tools:\n  deny_patterns: [c]\n").unwrap();
        merge_yaml(&mut base, layer);
        let seq = base["tools"]["deny_patterns"].as_sequence().unwrap();
        assert_eq!(seq.len(), 1);
    }

    #[test]
    fn explicit_config_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("override.yaml");
        std::fs::write(&path, "model:\n  name: override-model\n").unwrap();
        let cfg = load("no-such-profile", Some(&path)).unwrap();
        assert_eq!(cfg.model.name, "override-model");
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let cfg = load("no-such-profile", None).unwrap();
        assert_eq!(cfg.agent.pool_size, 5);
    }

    #[test]
    fn profile_dir_is_under_ally_home() {
        let dir = profile_dir("work");
        assert!(dir.ends_with(".ally/profiles/work") || dir.to_string_lossy().contains(".ally"));
    }
}
