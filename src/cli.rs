// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::Parser;
use std::path::PathBuf;

/// Ally, a local-LLM pair-programming agent.
#[derive(Parser, Debug)]
#[command(name = "ally", version, about)]
pub struct Cli {
    /// Model name on the endpoint (overrides config).
    #[arg(long)]
    pub model: Option<String>,

    /// Chat endpoint base URL (overrides config).
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Sampling temperature (overrides config).
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Context window requested from the server.
    #[arg(long)]
    pub context_size: Option<u32>,

    /// Maximum tokens to generate per completion.
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Reasoning-effort hint: low | medium | high.
    #[arg(long)]
    pub reasoning_effort: Option<String>,

    /// Skip permission prompts (deny patterns still apply).
    #[arg(long)]
    pub auto_confirm: bool,

    /// Named session to load/save through the session store.
    #[arg(long)]
    pub session: Option<String>,

    /// Resume the most recent session (or the named one).
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    pub resume: Option<String>,

    /// Run one request (or slash command) and exit.
    /// Exit codes: 0 success, 1 unhandled error, 2 usage error.
    #[arg(long)]
    pub once: Option<String>,

    /// Config profile under ~/.ally/profiles/.
    #[arg(long, default_value = "default")]
    pub profile: String,

    /// Explicit config file, applied on top of the profile.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Log at debug level to stderr.
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Log at trace level to stderr.
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Fold CLI overrides into the loaded config.
    pub fn apply_to(&self, config: &mut ally_config::Config) {
        if let Some(model) = &self.model {
            config.model.name = model.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.model.endpoint = endpoint.clone();
        }
        if let Some(t) = self.temperature {
            config.model.temperature = t;
        }
        if let Some(n) = self.context_size {
            config.model.context_size = n;
        }
        if let Some(n) = self.max_tokens {
            config.model.max_tokens = Some(n);
        }
        if let Some(effort) = &self.reasoning_effort {
            config.model.reasoning_effort = Some(effort.clone());
        }
        if self.auto_confirm {
            config.tools.auto_confirm = true;
        }
        config.session.profile = self.profile.clone();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
