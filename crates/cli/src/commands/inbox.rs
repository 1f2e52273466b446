// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `car inbox …`: list attention items and resolve them.

use anyhow::Context;
use car_hub::{build_inbox, record_dismissal, Dismissal, InboxItemType};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum InboxCommands {
    /// List items needing attention (the default).
    List {
        #[arg(long)]
        json: bool,
    },
    /// Dismiss an item so it stops surfacing.
    Resolve {
        run_id: String,
        /// run_dispatch | run_state_attention | run_failed | run_stopped
        item_type: String,
        #[arg(long)]
        seq: Option<u64>,
        #[arg(long)]
        reason: Option<String>,
    },
}

fn repo_id_for(repo_root: &Path) -> String {
    repo_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| repo_root.display().to_string())
}

pub async fn run(repo_root: &Path, command: Option<InboxCommands>) -> anyhow::Result<i32> {
    let repo_id = repo_id_for(repo_root);
    match command.unwrap_or(InboxCommands::List { json: false }) {
        InboxCommands::List { json } => {
            let items = build_inbox(repo_root, &repo_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if items.is_empty() {
                println!("inbox empty");
            } else {
                for item in &items {
                    println!(
                        "{}  {:<19}  {:<9}  seq={}  {}",
                        item.run_id,
                        item.item_type.as_str(),
                        item.status,
                        item.dispatch_seq.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                        item.reason.as_deref().or(item.dispatch_preview.as_deref()).unwrap_or("")
                    );
                }
            }
            Ok(0)
        }
        InboxCommands::Resolve { run_id, item_type, seq, reason } => {
            let item_type = InboxItemType::parse(&item_type)
                .with_context(|| format!("unknown item type {item_type:?}"))?;
            let mut dismissal = Dismissal::new(run_id, item_type, seq);
            dismissal.reason = reason;
            record_dismissal(repo_root, dismissal)?;
            println!("dismissed");
            Ok(0)
        }
    }
}
