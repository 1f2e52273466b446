// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! On-disk registry of supervised subprocesses.
//!
//! Each subprocess gets two JSON records under
//! `.codex-autorunner/managed_processes/<kind>/`: one keyed by its
//! logical id (workspace id) and one keyed by the pid string, so
//! pid-only cleanup can find it after the logical mapping is lost.

use crate::error::AgentError;
use crate::terminate::{pid_is_running, terminate_record};
use car_core::{atomic_write_json, paths, read_json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Registration of one supervised subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub kind: String,
    /// Logical key. `None` for the pid-keyed twin record.
    pub workspace_id: Option<String>,
    pub pid: Option<i32>,
    pub pgid: Option<i32>,
    pub base_url: Option<String>,
    pub command: Vec<String>,
    /// Hub process that created the subprocess.
    pub owner_pid: i32,
    pub started_at: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ProcessRecord {
    /// The filename key this record is stored under.
    pub fn record_key(&self) -> Option<String> {
        if let Some(workspace_id) = &self.workspace_id {
            return Some(workspace_id.clone());
        }
        self.pid.map(|pid| pid.to_string())
    }

    /// Pid-keyed twin of a workspace-keyed record.
    pub fn pid_twin(&self) -> Option<ProcessRecord> {
        let pid = self.pid?;
        let mut metadata = self.metadata.clone();
        if let Some(workspace_id) = &self.workspace_id {
            metadata.insert("workspace_id".to_string(), workspace_id.clone());
        }
        Some(ProcessRecord { workspace_id: None, metadata, ..self.clone() })
    }

    pub fn is_running(&self) -> bool {
        if let Some(pid) = self.pid {
            if pid_is_running(pid) {
                return true;
            }
        }
        match self.pgid {
            Some(pgid) => crate::terminate::pgid_is_running(pgid),
            None => false,
        }
    }
}

fn record_path(registry_root: &Path, kind: &str, key: &str) -> PathBuf {
    paths::managed_processes_dir(registry_root, kind).join(format!("{key}.json"))
}

pub fn write_process_record(
    registry_root: &Path,
    record: &ProcessRecord,
) -> Result<(), AgentError> {
    let key = record
        .record_key()
        .ok_or_else(|| AgentError::Supervisor("process record has no key".into()))?;
    let path = record_path(registry_root, &record.kind, &key);
    atomic_write_json(&path, record)?;
    Ok(())
}

pub fn read_process_record(
    registry_root: &Path,
    kind: &str,
    key: &str,
) -> Result<Option<ProcessRecord>, AgentError> {
    Ok(read_json(&record_path(registry_root, kind, key))?)
}

pub fn delete_process_record(registry_root: &Path, kind: &str, key: &str) {
    let _ = std::fs::remove_file(record_path(registry_root, kind, key));
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapSummary {
    pub scanned: usize,
    pub removed: usize,
    pub terminated: usize,
}

/// Sweep every record under the registry root: drop records whose pid
/// is dead, and terminate+drop subprocesses whose owning hub is gone.
pub fn reap_managed_processes(registry_root: &Path) -> Result<ReapSummary, AgentError> {
    let mut summary = ReapSummary::default();
    let base = paths::car_dir(registry_root).join("managed_processes");
    let kinds = match std::fs::read_dir(&base) {
        Ok(kinds) => kinds,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(summary),
        Err(e) => return Err(e.into()),
    };
    for kind_entry in kinds {
        let kind_dir = kind_entry?.path();
        if !kind_dir.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&kind_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            summary.scanned += 1;
            let record: Option<ProcessRecord> = match read_json(&path) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable process record");
                    let _ = std::fs::remove_file(&path);
                    summary.removed += 1;
                    continue;
                }
            };
            let Some(record) = record else {
                continue;
            };
            if !record.is_running() {
                let _ = std::fs::remove_file(&path);
                summary.removed += 1;
                continue;
            }
            if !pid_is_running(record.owner_pid) {
                tracing::info!(
                    kind = %record.kind,
                    pid = ?record.pid,
                    owner_pid = record.owner_pid,
                    "reaping orphaned subprocess; owner hub is gone"
                );
                terminate_record(
                    record.pid,
                    record.pgid,
                    Duration::from_millis(500),
                    Duration::from_millis(500),
                );
                let _ = std::fs::remove_file(&path);
                summary.terminated += 1;
                summary.removed += 1;
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
