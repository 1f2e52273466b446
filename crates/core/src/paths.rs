// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The on-disk layout under `.codex-autorunner/`, defined once.
//!
//! Every component that touches the repo tree resolves its paths here
//! so the layout stays a single contract.

use std::path::{Path, PathBuf};

/// State directory name inside a repo or workspace root.
pub const CAR_DIR: &str = ".codex-autorunner";

/// Default runs directory, relative to the workspace root.
pub const DEFAULT_RUNS_DIR: &str = ".codex-autorunner/runs";

pub fn car_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(CAR_DIR)
}

pub fn config_path(repo_root: &Path) -> PathBuf {
    car_dir(repo_root).join("config.toml")
}

pub fn flows_db_path(repo_root: &Path) -> PathBuf {
    car_dir(repo_root).join("flows.db")
}

/// Root of per-run worker artifacts (`flows/<run_id>/`).
pub fn flow_artifacts_root(repo_root: &Path) -> PathBuf {
    car_dir(repo_root).join("flows")
}

pub fn flow_artifacts_dir(repo_root: &Path, run_id: &str) -> PathBuf {
    flow_artifacts_root(repo_root).join(run_id)
}

pub fn reconcile_lock_path(repo_root: &Path, run_id: &str) -> PathBuf {
    flow_artifacts_dir(repo_root, run_id).join("reconcile.lock")
}

pub fn tickets_dir(repo_root: &Path) -> PathBuf {
    car_dir(repo_root).join("tickets")
}

/// Per-run outbox/reply directory under the workspace.
pub fn run_dir(workspace_root: &Path, runs_dir: &Path, run_id: &str) -> PathBuf {
    if runs_dir.is_absolute() {
        runs_dir.join(run_id)
    } else {
        workspace_root.join(runs_dir).join(run_id)
    }
}

pub fn dispatch_dir(run_dir: &Path) -> PathBuf {
    run_dir.join("dispatch")
}

pub fn dispatch_path(run_dir: &Path) -> PathBuf {
    dispatch_dir(run_dir).join("DISPATCH.md")
}

pub fn dispatch_history_dir(run_dir: &Path) -> PathBuf {
    run_dir.join("dispatch_history")
}

pub fn reply_history_dir(run_dir: &Path) -> PathBuf {
    run_dir.join("reply_history")
}

/// Hub-scope lifecycle event log and its sidecar lock.
pub fn lifecycle_events_path(hub_root: &Path) -> PathBuf {
    car_dir(hub_root).join("lifecycle_events.json")
}

pub fn lifecycle_events_lock_path(hub_root: &Path) -> PathBuf {
    car_dir(hub_root).join("lifecycle_events.lock")
}

/// Managed-process registry directory for one process kind.
pub fn managed_processes_dir(registry_root: &Path, kind: &str) -> PathBuf {
    car_dir(registry_root).join("managed_processes").join(kind)
}

/// Per-handle supervisor lock used while consulting the registry.
pub fn supervisor_lock_path(registry_root: &Path, kind: &str, handle_id: &str) -> PathBuf {
    car_dir(registry_root).join("locks").join(kind).join(format!("{handle_id}.lock"))
}

pub fn inbox_dismissals_path(repo_root: &Path) -> PathBuf {
    car_dir(repo_root).join("inbox_dismissals.json")
}

pub fn safety_audit_path(hub_root: &Path) -> PathBuf {
    car_dir(hub_root).join("pma").join("audit.jsonl")
}

/// Format a dispatch/reply history sequence directory name.
pub fn history_seq_name(seq: u64) -> String {
    format!("{seq:04}")
}

#[cfg(test)]
#[path = "paths_tests.rs"]
mod tests;
