// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Archiving finished runs: move the run's outbox tree under its
//! artifacts directory and optionally delete the database row.

use crate::error::FlowError;
use crate::outbox::resolve_outbox_paths;
use car_core::{paths, FlowStatus, RepoConfig};
use car_store::FlowStore;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRunSummary {
    pub run_id: String,
    pub status: FlowStatus,
    pub run_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub archived_runs: bool,
    pub deleted_run: bool,
}

/// Archive one run's artifacts.
///
/// Only terminal runs archive by default; `force` extends that to
/// paused and stopping runs. `delete_run` also removes the row (events
/// and artifacts cascade).
pub fn archive_flow_run_artifacts(
    repo_root: &Path,
    run_id: &str,
    force: bool,
    delete_run: bool,
) -> Result<ArchiveRunSummary, FlowError> {
    let db_path = paths::flows_db_path(repo_root);
    if !db_path.exists() {
        return Err(FlowError::RunNotFound(run_id.to_string()));
    }
    let durable = RepoConfig::load(repo_root)?.durable_writes;
    let store = FlowStore::open(&db_path, durable)?;
    let record = store
        .get_flow_run(run_id)?
        .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))?;

    let forceable = matches!(record.status, FlowStatus::Paused | FlowStatus::Stopping);
    if !record.status.is_terminal() && !(force && forceable) {
        return Err(FlowError::Worker(format!(
            "can only archive completed/stopped/failed runs (status is {}; use force for paused/stopping)",
            record.status
        )));
    }

    let workspace_root = record
        .input_str("workspace_root")
        .map(PathBuf::from)
        .map(|p| if p.is_absolute() { p } else { repo_root.join(p) })
        .unwrap_or_else(|| repo_root.to_path_buf());
    let runs_dir = record
        .input_str("runs_dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(paths::DEFAULT_RUNS_DIR));
    let outbox = resolve_outbox_paths(&workspace_root, &runs_dir, record.id.as_str());

    let archive_root = paths::flow_artifacts_dir(repo_root, record.id.as_str());
    let mut archive_dir = archive_root.join("archived_runs");
    if archive_dir.exists() {
        let stamp = chrono_free_stamp();
        archive_dir = archive_root.join(format!("archived_runs_{stamp}"));
    }

    let mut archived_runs = false;
    if outbox.run_dir.is_dir() {
        std::fs::create_dir_all(&archive_root)?;
        std::fs::rename(&outbox.run_dir, &archive_dir)?;
        archived_runs = true;
    }

    let deleted_run = if delete_run { store.delete_flow_run(record.id.as_str())? } else { false };

    Ok(ArchiveRunSummary {
        run_id: record.id.to_string(),
        status: record.status,
        run_dir: outbox.run_dir,
        archive_dir,
        archived_runs,
        deleted_run,
    })
}

/// Compact UTC stamp for unique archive directory names.
fn chrono_free_stamp() -> String {
    car_core::now_iso_utc().replace([':', '-'], "")
}

#[cfg(test)]
#[path = "archive_tests.rs"]
mod tests;
