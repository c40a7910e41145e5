// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use ally_core::{ActivityKind, ActivityPayload, CommandDispatcher, CommandOutcome, Services};
use ally_model::HttpEndpoint;
use ally_tools::{AutoApproveUi, PermissionRequest, PermissionUi};
use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.debug);

    let mut config = ally_config::load(&cli.profile, cli.config.as_deref())?;
    cli.apply_to(&mut config);
    let config = Arc::new(config);

    if cli.session.is_some() || cli.resume.is_some() {
        // The session store is a collaborator interface; this build ships
        // without a disk-backed implementation.
        eprintln!("note: session persistence is not available in this build");
    }

    let endpoint: Arc<dyn ally_model::ChatEndpoint> =
        Arc::new(HttpEndpoint::new(&config.model.endpoint));
    let ui: Arc<dyn PermissionUi> = if config.tools.auto_confirm {
        Arc::new(AutoApproveUi)
    } else {
        Arc::new(StdinUi)
    };
    let plugins = ally_config::read_manifests(
        &ally_config::profile_dir(&config.session.profile).join("plugins"),
    );

    let services = Services::new(config.clone(), endpoint, ui, plugins);
    let (mut agent, root_handle) = services.root_agent();
    let dispatcher = services.command_dispatcher(root_handle.clone());

    // Render the root agent's streamed text as it arrives.
    let stream_agent_id = root_handle.agent_id.clone();
    services.bus.subscribe(Some(ActivityKind::TextChunk), move |event| {
        if let ActivityPayload::TextChunk { agent_id, text } = &event.payload {
            if *agent_id == stream_agent_id {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
        }
    });

    let exit_code = if let Some(request) = &cli.once {
        run_once(&dispatcher, &mut agent, request).await
    } else {
        run_repl(&services, &dispatcher, &mut agent).await?
    };

    services.shutdown().await;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Single-shot mode: one command or request, exit 0/1/2.
async fn run_once(
    dispatcher: &CommandDispatcher,
    agent: &mut ally_core::Agent,
    request: &str,
) -> i32 {
    if CommandDispatcher::is_command(request) {
        match dispatcher.dispatch(request).await {
            CommandOutcome::Text(text) => {
                println!("{text}");
                0
            }
            CommandOutcome::ClearSession | CommandOutcome::CompactSession => 0,
            CommandOutcome::Usage(msg) => {
                eprintln!("{msg}");
                2
            }
        }
    } else {
        match agent.send_message(request).await {
            Ok(_reply) => {
                // Streamed already; just terminate the line.
                println!();
                0
            }
            Err(e) => {
                eprintln!("error: {e:#}");
                1
            }
        }
    }
}

/// Minimal line-oriented REPL.  Anything richer (TUI, highlighting) is a
/// separate collaborator built on the activity bus.
async fn run_repl(
    services: &Arc<Services>,
    dispatcher: &CommandDispatcher,
    agent: &mut ally_core::Agent,
) -> anyhow::Result<i32> {
    println!(
        "ally: model {} at {} (Ctrl-D to exit, /help for commands)",
        services.config.model.name, services.config.model.endpoint
    );
    let stdin = std::io::stdin();
    loop {
        print!("\n> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line).context("reading stdin")? == 0 {
            break; // EOF
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if CommandDispatcher::is_command(line) {
            match dispatcher.dispatch(line).await {
                CommandOutcome::Text(text) => println!("{text}"),
                CommandOutcome::Usage(msg) => eprintln!("{msg}"),
                CommandOutcome::ClearSession => {
                    agent.session_mut().clear();
                    println!("session cleared");
                }
                CommandOutcome::CompactSession => {
                    let session = agent.session_mut();
                    let before = session.token_count;
                    ally_core::emergency_trim(
                        &mut session.messages,
                        services.config.agent.trim_keep_recent,
                    );
                    session.recalculate_tokens();
                    println!(
                        "compacted: ~{} → ~{} tokens",
                        before, session.token_count
                    );
                }
            }
            continue;
        }
        if let Err(e) = agent.send_message(line).await {
            eprintln!("error: {e:#}");
        } else {
            println!();
        }
    }
    Ok(0)
}

/// Permission prompts on stdin, for the plain-terminal collaborator.
struct StdinUi;

#[async_trait::async_trait]
impl PermissionUi for StdinUi {
    async fn confirm(&self, request: &PermissionRequest) -> bool {
        let prompt = format!(
            "\n[permission] {} wants to run: {}\n",
            request.tool_name, request.summary
        );
        let preview = request.preview.clone();
        tokio::task::spawn_blocking(move || {
            print!("{prompt}");
            if let Some(diff) = preview {
                println!("{diff}");
            }
            print!("allow? [y/N] ");
            let _ = std::io::stdout().flush();
            let mut answer = String::new();
            if std::io::stdin().read_line(&mut answer).is_err() {
                return false;
            }
            matches!(answer.trim(), "y" | "Y" | "yes")
        })
        .await
        .unwrap_or(false)
    }
}

fn init_logging(verbose: bool, debug: bool) {
    let default_level = if debug {
        "ally=trace,ally_core=trace,ally_model=trace,ally_tools=trace"
    } else if verbose {
        "ally=debug,ally_core=debug,ally_model=debug,ally_tools=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
