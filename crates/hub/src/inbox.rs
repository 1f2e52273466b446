// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The attention inbox: runs needing a human, projected from the flow
//! store plus each run's dispatch/reply history, minus dismissals.

use crate::error::HubError;
use car_core::{
    atomic_write_json, now_iso_utc, paths, read_json, DispatchDoc, DispatchMode, FileLock,
    FlowStatus, RepoConfig,
};
use car_flow::{latest_seq, resolve_outbox_paths, TICKET_FLOW_TYPE};
use car_store::{FlowRunRecord, FlowStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxItemType {
    /// An unanswered dispatch awaits a reply.
    RunDispatch,
    /// The run is parked without an actionable dispatch.
    RunStateAttention,
    RunFailed,
    RunStopped,
}

impl InboxItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunDispatch => "run_dispatch",
            Self::RunStateAttention => "run_state_attention",
            Self::RunFailed => "run_failed",
            Self::RunStopped => "run_stopped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "run_dispatch" => Some(Self::RunDispatch),
            "run_state_attention" => Some(Self::RunStateAttention),
            "run_failed" => Some(Self::RunFailed),
            "run_stopped" => Some(Self::RunStopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InboxItem {
    pub repo_id: String,
    pub run_id: String,
    pub item_type: InboxItemType,
    pub status: FlowStatus,
    pub created_at: String,
    pub dispatch_seq: Option<u64>,
    pub dispatch_mode: Option<DispatchMode>,
    pub dispatch_preview: Option<String>,
    pub replied: bool,
    pub reason: Option<String>,
}

/// A recorded operator dismissal. `seq = None` dismisses the run's
/// item type regardless of dispatch seq.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dismissal {
    pub run_id: String,
    pub item_type: InboxItemType,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub reason: Option<String>,
    pub dismissed_at: String,
}

impl Dismissal {
    pub fn new(run_id: impl Into<String>, item_type: InboxItemType, seq: Option<u64>) -> Self {
        Self {
            run_id: run_id.into(),
            item_type,
            seq,
            reason: None,
            dismissed_at: now_iso_utc(),
        }
    }

    fn matches(&self, item: &InboxItem) -> bool {
        if self.run_id != item.run_id || self.item_type != item.item_type {
            return false;
        }
        match self.seq {
            None => true,
            seq => seq == item.dispatch_seq,
        }
    }
}

pub fn load_dismissals(repo_root: &Path) -> Vec<Dismissal> {
    read_json(&paths::inbox_dismissals_path(repo_root)).ok().flatten().unwrap_or_default()
}

/// Record a dismissal under the repo's dismissal file lock.
pub fn record_dismissal(repo_root: &Path, dismissal: Dismissal) -> Result<(), HubError> {
    let path = paths::inbox_dismissals_path(repo_root);
    let lock_path = path.with_extension("lock");
    let _lock = FileLock::acquire(&lock_path)?;
    let mut dismissals: Vec<Dismissal> = read_json(&path)?.unwrap_or_default();
    if !dismissals
        .iter()
        .any(|d| d.run_id == dismissal.run_id && d.item_type == dismissal.item_type && d.seq == dismissal.seq)
    {
        dismissals.push(dismissal);
        atomic_write_json(&path, &dismissals)?;
    }
    Ok(())
}

/// The best dispatch to surface: the highest `pause`, else the highest
/// non-summary, else the highest summary.
fn select_dispatch(history_dir: &Path) -> Option<(u64, DispatchDoc)> {
    let entries = std::fs::read_dir(history_dir).ok()?;
    let mut best: Option<(u8, u64, DispatchDoc)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Ok(seq) = entry.file_name().to_string_lossy().trim().parse::<u64>() else {
            continue;
        };
        let Ok(doc) = DispatchDoc::load(&path.join("DISPATCH.md")) else {
            continue;
        };
        let rank = match doc.mode {
            DispatchMode::Pause => 2u8,
            DispatchMode::Notify => 1,
            DispatchMode::TurnSummary => 0,
        };
        let better = match &best {
            None => true,
            Some((best_rank, best_seq, _)) => {
                rank > *best_rank || (rank == *best_rank && seq > *best_seq)
            }
        };
        if better {
            best = Some((rank, seq, doc));
        }
    }
    best.map(|(_, seq, doc)| (seq, doc))
}

fn pause_reason(record: &FlowRunRecord) -> String {
    let engine_reason = record
        .state
        .get("ticket_engine")
        .and_then(|e| e.get("reason"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let raw = engine_reason
        .or_else(|| record.error_message.clone())
        .unwrap_or_else(|| "Paused without details.".to_string());
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let capped: String = normalized.chars().take(200).collect();
    if capped.starts_with("Reason: ") {
        capped
    } else {
        format!("Reason: {capped}")
    }
}

fn project_run(repo_root: &Path, repo_id: &str, record: &FlowRunRecord) -> InboxItem {
    let workspace_root = record
        .input_str("workspace_root")
        .map(PathBuf::from)
        .unwrap_or_else(|| repo_root.to_path_buf());
    let runs_dir = record
        .input_str("runs_dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(paths::DEFAULT_RUNS_DIR));
    let outbox = resolve_outbox_paths(&workspace_root, &runs_dir, record.id.as_str());

    let dispatch = select_dispatch(&outbox.dispatch_history_dir);
    let latest_reply = latest_seq(&outbox.reply_history_dir);
    let (dispatch_seq, dispatch_mode, dispatch_preview, replied) = match &dispatch {
        Some((seq, doc)) => (
            Some(*seq),
            Some(doc.mode),
            Some(doc.preview(200)),
            latest_reply >= *seq,
        ),
        None => (None, None, None, false),
    };

    let pending_dispatch = dispatch.is_some() && !replied;
    let item_type = if pending_dispatch {
        InboxItemType::RunDispatch
    } else {
        match record.status {
            FlowStatus::Failed => InboxItemType::RunFailed,
            FlowStatus::Stopped => InboxItemType::RunStopped,
            _ => InboxItemType::RunStateAttention,
        }
    };

    let reason = match record.status {
        FlowStatus::Paused => Some(pause_reason(record)),
        FlowStatus::Failed => record.error_message.clone(),
        _ => None,
    };

    InboxItem {
        repo_id: repo_id.to_string(),
        run_id: record.id.to_string(),
        item_type,
        status: record.status,
        created_at: record.created_at.clone(),
        dispatch_seq,
        dispatch_mode,
        dispatch_preview,
        replied,
        reason,
    }
}

/// Project the inbox for one repo: every non-completed ticket_flow run
/// minus dismissals, newest first.
pub fn build_inbox(repo_root: &Path, repo_id: &str) -> Result<Vec<InboxItem>, HubError> {
    let db_path = paths::flows_db_path(repo_root);
    if !db_path.exists() {
        return Ok(Vec::new());
    }
    let durable = RepoConfig::load(repo_root).map(|c| c.durable_writes).unwrap_or(false);
    let store = FlowStore::open(&db_path, durable)?;
    let dismissals = load_dismissals(repo_root);

    let mut items = Vec::new();
    for record in store.list_flow_runs(Some(TICKET_FLOW_TYPE), None)? {
        if record.status == FlowStatus::Completed {
            continue;
        }
        let item = project_run(repo_root, repo_id, &record);
        if dismissals.iter().any(|d| d.matches(&item)) {
            continue;
        }
        items.push(item);
    }
    // list_flow_runs already orders newest first; keep it stable.
    Ok(items)
}

#[cfg(test)]
#[path = "inbox_tests.rs"]
mod tests;
