// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `car flow …`: start, drive, and observe flow runs.

use anyhow::Context;
use car_core::{paths, FlowStatus, RunId};
use car_flow::{archive_flow_run_artifacts, run_worker, spawn_flow_worker};
use car_hub::RuntimeServices;
use car_store::FlowRunRecord;
use clap::Subcommand;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum FlowCommands {
    /// Create a run and spawn its detached worker.
    Start {
        #[arg(long)]
        run_id: Option<String>,
        /// Workspace the agents operate on (defaults to the repo root).
        #[arg(long)]
        workspace_root: Option<PathBuf>,
        #[arg(long)]
        runs_dir: Option<PathBuf>,
        /// Create the run without spawning a worker.
        #[arg(long)]
        no_worker: bool,
    },
    /// The worker entrypoint (stable argv contract; spawned detached).
    Worker {
        #[arg(long)]
        run_id: String,
    },
    /// Request a cooperative stop.
    Stop {
        run_id: String,
    },
    /// Resume a paused/stopped/failed run and spawn a fresh worker.
    Resume {
        run_id: String,
        #[arg(long)]
        no_worker: bool,
    },
    Status {
        run_id: String,
    },
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Print a run's events as JSON lines.
    Events {
        run_id: String,
        #[arg(long)]
        after_seq: Option<i64>,
        /// Keep following until the run settles.
        #[arg(long)]
        follow: bool,
    },
    /// Archive a finished run's outbox tree.
    Archive {
        run_id: String,
        /// Also archive paused/stopping runs.
        #[arg(long)]
        force: bool,
        /// Delete the database row afterwards.
        #[arg(long)]
        delete_run: bool,
    },
}

fn print_record(record: &FlowRunRecord) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

pub async fn run(repo_root: &Path, command: FlowCommands) -> anyhow::Result<i32> {
    let services = RuntimeServices::standard(repo_root);
    let result = run_inner(repo_root, command, &services).await;
    services.close().await;
    result
}

async fn run_inner(
    repo_root: &Path,
    command: FlowCommands,
    services: &RuntimeServices,
) -> anyhow::Result<i32> {
    match command {
        FlowCommands::Start { run_id, workspace_root, runs_dir, no_worker } => {
            let controller = services.get_ticket_flow_controller(repo_root).await?;
            let workspace_root =
                workspace_root.unwrap_or_else(|| repo_root.to_path_buf());
            let runs_dir =
                runs_dir.unwrap_or_else(|| PathBuf::from(paths::DEFAULT_RUNS_DIR));
            let record = controller
                .start_flow(
                    json!({
                        "workspace_root": workspace_root,
                        "runs_dir": runs_dir,
                    }),
                    run_id.map(RunId::from_string),
                    None,
                    None,
                )
                .await?;
            if !no_worker {
                spawn_flow_worker(repo_root, record.id.as_str(), None).await?;
            }
            print_record(&record)?;
            Ok(0)
        }
        FlowCommands::Worker { run_id } => {
            let controller = services.get_ticket_flow_controller(repo_root).await?;
            let record = controller
                .get_status(&run_id)?
                .with_context(|| format!("flow run {run_id} not found"))?;
            let workspace_root = record
                .input_str("workspace_root")
                .map(PathBuf::from)
                .unwrap_or_else(|| repo_root.to_path_buf());
            let code = run_worker(controller, repo_root, &run_id, &workspace_root).await;
            Ok(code)
        }
        FlowCommands::Stop { run_id } => {
            let controller = services.get_ticket_flow_controller(repo_root).await?;
            let record = controller.stop_flow(&run_id).await?;
            print_record(&record)?;
            Ok(0)
        }
        FlowCommands::Resume { run_id, no_worker } => {
            let controller = services.get_ticket_flow_controller(repo_root).await?;
            let record = controller.resume_flow(&run_id).await?;
            if record.status == FlowStatus::Running && !no_worker {
                spawn_flow_worker(repo_root, &run_id, None).await?;
            }
            print_record(&record)?;
            Ok(0)
        }
        FlowCommands::Status { run_id } => {
            let controller = services.get_ticket_flow_controller(repo_root).await?;
            match controller.get_status(&run_id)? {
                Some(record) => {
                    print_record(&record)?;
                    Ok(0)
                }
                None => {
                    eprintln!("flow run {run_id} not found");
                    Ok(1)
                }
            }
        }
        FlowCommands::List { status } => {
            let controller = services.get_ticket_flow_controller(repo_root).await?;
            let status = match status.as_deref() {
                Some(raw) => Some(
                    FlowStatus::parse(raw)
                        .with_context(|| format!("unknown status {raw:?}"))?,
                ),
                None => None,
            };
            for record in controller.list_runs(status)? {
                println!(
                    "{}  {:<9}  {}  {}",
                    record.id,
                    record.status,
                    record.created_at,
                    record.error_message.as_deref().unwrap_or("")
                );
            }
            Ok(0)
        }
        FlowCommands::Events { run_id, after_seq, follow } => {
            let controller = services.get_ticket_flow_controller(repo_root).await?;
            if follow {
                let mut stream = controller.stream_events(&run_id, after_seq);
                while let Some(event) = stream.next().await? {
                    println!("{}", serde_json::to_string(&event)?);
                }
            } else {
                for event in controller.get_events(&run_id, after_seq)? {
                    println!("{}", serde_json::to_string(&event)?);
                }
            }
            Ok(0)
        }
        FlowCommands::Archive { run_id, force, delete_run } => {
            let summary = archive_flow_run_artifacts(repo_root, &run_id, force, delete_run)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(0)
        }
    }
}
