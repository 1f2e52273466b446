// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Detached worker processes: one OS process per active run.
//!
//! The worker writes `worker.json` at boot, `exit.json` on clean
//! shutdown, and `crash.json` on failure. The health probe inspects
//! those files plus the live pid table so the reconciler can tell
//! alive from dead from pid-reuse.

use crate::controller::FlowController;
use crate::error::FlowError;
use car_agent::pid_is_running;
use car_core::{atomic_write_json, now_iso_utc, paths, read_json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

/// Metadata written by a live worker at boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMeta {
    pub pid: i32,
    pub started_at: String,
    pub workspace_root: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// No worker.json.
    Absent,
    /// The recorded pid is running and is still our worker.
    Alive,
    /// Worker gone (pid dead or metadata missing).
    Dead,
    /// The pid is running but belongs to an unrelated process.
    Mismatch,
    /// worker.json unreadable.
    Invalid,
}

impl WorkerStatus {
    /// True for every status that means "no live worker owns this run".
    pub fn is_dead_enough(self) -> bool {
        matches!(self, Self::Dead | Self::Mismatch | Self::Invalid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Alive => "alive",
            Self::Dead => "dead",
            Self::Mismatch => "mismatch",
            Self::Invalid => "invalid",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerHealth {
    pub status: WorkerStatus,
    pub pid: Option<i32>,
    pub exit_code: Option<i32>,
    pub stderr_tail: Option<String>,
    pub crash_info: Option<Value>,
}

fn meta_path(repo_root: &Path, run_id: &str) -> PathBuf {
    paths::flow_artifacts_dir(repo_root, run_id).join("worker.json")
}

fn exit_path(repo_root: &Path, run_id: &str) -> PathBuf {
    paths::flow_artifacts_dir(repo_root, run_id).join("exit.json")
}

fn crash_path(repo_root: &Path, run_id: &str) -> PathBuf {
    paths::flow_artifacts_dir(repo_root, run_id).join("crash.json")
}

pub fn write_worker_meta(
    repo_root: &Path,
    run_id: &str,
    workspace_root: &Path,
) -> Result<(), FlowError> {
    let meta = WorkerMeta {
        pid: std::process::id() as i32,
        started_at: now_iso_utc(),
        workspace_root: workspace_root.display().to_string(),
    };
    atomic_write_json(&meta_path(repo_root, run_id), &meta)?;
    Ok(())
}

pub fn write_worker_exit(repo_root: &Path, run_id: &str, exit_code: i32) -> Result<(), FlowError> {
    atomic_write_json(
        &exit_path(repo_root, run_id),
        &json!({"exit_code": exit_code, "finished_at": now_iso_utc()}),
    )?;
    Ok(())
}

/// Fields for a crash record; everything optional but the timestamp.
#[derive(Debug, Clone, Default)]
pub struct CrashInfo {
    pub last_event: Option<String>,
    pub exception: Option<String>,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub stderr_tail: Option<String>,
}

pub fn write_worker_crash_info(
    repo_root: &Path,
    run_id: &str,
    info: &CrashInfo,
) -> Result<PathBuf, FlowError> {
    let path = crash_path(repo_root, run_id);
    atomic_write_json(
        &path,
        &json!({
            "timestamp": now_iso_utc(),
            "last_event": info.last_event,
            "exception": info.exception,
            "exit_code": info.exit_code,
            "signal": info.signal,
            "stderr_tail": info.stderr_tail,
        }),
    )?;
    Ok(path)
}

pub fn read_worker_crash_info(repo_root: &Path, run_id: &str) -> Option<Value> {
    read_json(&crash_path(repo_root, run_id)).ok().flatten()
}

/// Remove stale worker metadata once the process is proven dead.
pub fn clear_worker_metadata(repo_root: &Path, run_id: &str) {
    let _ = std::fs::remove_file(meta_path(repo_root, run_id));
}

/// Last `max_bytes` of the worker stderr log, lossily decoded.
pub fn worker_stderr_tail(repo_root: &Path, run_id: &str, max_bytes: usize) -> Option<String> {
    let path = paths::flow_artifacts_dir(repo_root, run_id).join("worker.err.log");
    let bytes = std::fs::read(path).ok()?;
    let start = bytes.len().saturating_sub(max_bytes);
    let tail = String::from_utf8_lossy(&bytes[start..]).trim().to_string();
    if tail.is_empty() {
        None
    } else {
        Some(tail)
    }
}

/// Does the live pid still look like our worker? Reads
/// `/proc/<pid>/cmdline`; on platforms without procfs the probe
/// reports a match and the next pass decides.
fn cmdline_mentions_run(pid: i32, run_id: &str) -> bool {
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(raw) => String::from_utf8_lossy(&raw).contains(run_id),
        Err(_) => true,
    }
}

pub fn check_worker_health(repo_root: &Path, run_id: &str) -> WorkerHealth {
    let meta: Option<WorkerMeta> = match read_json(&meta_path(repo_root, run_id)) {
        Ok(meta) => meta,
        Err(_) => {
            return WorkerHealth {
                status: WorkerStatus::Invalid,
                pid: None,
                exit_code: None,
                stderr_tail: worker_stderr_tail(repo_root, run_id, 4096),
                crash_info: read_worker_crash_info(repo_root, run_id),
            }
        }
    };
    let Some(meta) = meta else {
        return WorkerHealth {
            status: WorkerStatus::Absent,
            pid: None,
            exit_code: None,
            stderr_tail: None,
            crash_info: read_worker_crash_info(repo_root, run_id),
        };
    };

    let crash_info = read_worker_crash_info(repo_root, run_id);
    let exit_code = read_json::<Value>(&exit_path(repo_root, run_id))
        .ok()
        .flatten()
        .and_then(|v| v.get("exit_code").and_then(Value::as_i64))
        .map(|code| code as i32)
        .or_else(|| {
            crash_info
                .as_ref()
                .and_then(|c| c.get("exit_code").and_then(Value::as_i64))
                .map(|code| code as i32)
        });

    if !pid_is_running(meta.pid) {
        return WorkerHealth {
            status: WorkerStatus::Dead,
            pid: Some(meta.pid),
            exit_code,
            stderr_tail: worker_stderr_tail(repo_root, run_id, 4096),
            crash_info,
        };
    }
    if !cmdline_mentions_run(meta.pid, run_id) {
        return WorkerHealth {
            status: WorkerStatus::Mismatch,
            pid: Some(meta.pid),
            exit_code,
            stderr_tail: worker_stderr_tail(repo_root, run_id, 4096),
            crash_info,
        };
    }
    WorkerHealth {
        status: WorkerStatus::Alive,
        pid: Some(meta.pid),
        exit_code: None,
        stderr_tail: None,
        crash_info,
    }
}

/// Spawn a detached worker process for a run.
///
/// Argv is the stable contract `<entrypoint> flow worker --run-id
/// <uuid>` with `cwd = repo_root`; stdout/stderr append to the run's
/// log files. Returns the worker pid.
pub async fn spawn_flow_worker(
    repo_root: &Path,
    run_id: &str,
    entrypoint: Option<&Path>,
) -> Result<u32, FlowError> {
    let artifacts_dir = paths::flow_artifacts_dir(repo_root, run_id);
    std::fs::create_dir_all(&artifacts_dir)?;
    let stdout = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(artifacts_dir.join("worker.out.log"))?;
    let stderr = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(artifacts_dir.join("worker.err.log"))?;

    let program = match entrypoint {
        Some(path) => path.to_path_buf(),
        None => std::env::current_exe()?,
    };
    let mut cmd = tokio::process::Command::new(&program);
    cmd.args(["flow", "worker", "--run-id", run_id])
        .current_dir(repo_root)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0)
        .kill_on_drop(false);
    let mut child = cmd.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| FlowError::Worker("worker pid unavailable after spawn".into()))?;

    // Reap in the background so the worker never zombies while the hub
    // lives.
    let run = run_id.to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                tracing::info!(run_id = %run, %status, "flow worker exited");
            }
            Err(e) => {
                tracing::warn!(run_id = %run, error = %e, "failed to wait on flow worker");
            }
        }
    });

    tracing::info!(run_id, pid, "flow worker spawned");
    Ok(pid)
}

/// The in-process body of `flow worker`: metadata lifecycle, signal
/// handling, and the run itself. Returns the process exit code.
pub async fn run_worker(
    controller: Arc<FlowController>,
    repo_root: &Path,
    run_id: &str,
    workspace_root: &Path,
) -> i32 {
    if let Err(e) = write_worker_meta(repo_root, run_id, workspace_root) {
        tracing::error!(run_id, error = %e, "failed to write worker metadata");
        return 1;
    }

    let result = tokio::select! {
        result = controller.run_flow(run_id, None) => Some(result),
        signal = wait_for_shutdown_signal() => {
            tracing::warn!(run_id, signal = %signal, "worker received shutdown signal");
            None
        }
    };

    match result {
        Some(Ok(record)) => {
            tracing::info!(run_id, status = %record.status, "worker finished");
            if let Err(e) = write_worker_exit(repo_root, run_id, 0) {
                tracing::warn!(run_id, error = %e, "failed to write exit metadata");
            }
            0
        }
        Some(Err(e)) => {
            tracing::error!(run_id, error = %e, "worker run failed");
            let last_event = controller
                .last_event_meta(run_id)
                .ok()
                .flatten()
                .map(|(seq, _)| format!("seq {seq}"));
            let info = CrashInfo {
                last_event,
                exception: Some(e.to_string()),
                exit_code: Some(1),
                signal: None,
                stderr_tail: worker_stderr_tail(repo_root, run_id, 4096),
            };
            if let Err(e) = write_worker_crash_info(repo_root, run_id, &info) {
                tracing::warn!(run_id, error = %e, "failed to write crash metadata");
            }
            1
        }
        None => {
            // Operator hard-stop. Record a clean exit so the reconciler
            // can tell this from a crash.
            if let Err(e) = write_worker_exit(repo_root, run_id, 130) {
                tracing::warn!(run_id, error = %e, "failed to write exit metadata");
            }
            130
        }
    }
}

async fn wait_for_shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(_) => return pending_forever().await,
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(_) => return pending_forever().await,
    };
    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}

async fn pending_forever() -> &'static str {
    std::future::pending::<&'static str>().await
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
