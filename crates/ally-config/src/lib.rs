// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod plugin;
mod schema;

pub use loader::{ally_home, load, profile_dir};
pub use plugin::{read_manifests, ActivationMode, BackgroundSpec, PluginManifest};
pub use schema::{
    AgentConfig, Config, ModelConfig, SessionConfig, Thoroughness, ToolsConfig,
};
