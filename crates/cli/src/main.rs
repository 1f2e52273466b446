// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! car: the codex-autorunner hub CLI.

mod commands;
mod env;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "car", version, about = "codex-autorunner: flows of AI coding agent turns")]
struct Cli {
    /// Repo root (defaults to the current directory).
    #[arg(long, global = true)]
    repo_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage flow runs.
    Flow {
        #[command(subcommand)]
        command: commands::flow::FlowCommands,
    },
    /// The attention inbox.
    Inbox {
        #[command(subcommand)]
        command: Option<commands::inbox::InboxCommands>,
    },
    /// One reconcile pass over this repo's runs.
    Reconcile {
        /// Restrict to one flow type.
        #[arg(long)]
        flow_type: Option<String>,
    },
}

fn init_tracing() {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    // The guard must outlive main; leak it intentionally.
    std::mem::forget(guard);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CAR_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    if env::skip_update_checks() {
        tracing::debug!("self-update integrity checks skipped");
    }
    let cli = Cli::parse();
    let repo_root = match &cli.repo_root {
        Some(root) => root.clone(),
        None => std::env::current_dir()?,
    };
    let runtime = tokio::runtime::Runtime::new()?;
    let exit_code = runtime.block_on(async {
        match cli.command {
            Commands::Flow { command } => commands::flow::run(&repo_root, command).await,
            Commands::Inbox { command } => commands::inbox::run(&repo_root, command).await,
            Commands::Reconcile { flow_type } => {
                commands::reconcile::run(&repo_root, flow_type.as_deref())
            }
        }
    })?;
    std::process::exit(exit_code);
}
