// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The reconciler: detects runs whose workers died and repairs them.
//!
//! A periodic (or on-demand) scan over non-terminal runs. Each run is
//! inspected under a non-blocking per-run lock so a decision never
//! races a live worker or another reconciler.

use crate::controller::LifecycleSink;
use crate::error::FlowError;
use crate::outbox::{
    archive_dispatch, ensure_outbox_dirs, latest_seq, resolve_outbox_paths, ArchiveMeta,
};
use crate::ticket::TICKET_FLOW_TYPE;
use crate::worker::{
    check_worker_health, clear_worker_metadata, read_worker_crash_info, write_worker_crash_info,
    CrashInfo, WorkerHealth, WorkerStatus,
};
use car_core::{
    now_iso_utc, paths, ArtifactId, DispatchDoc, DispatchMode, FileLock, FlowEventId,
    FlowEventType, FlowStatus, FsError, LifecycleEventType, RepoConfig,
};
use car_store::{FlowRunRecord, FlowStore, Patch};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of the transition table for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionDecision {
    pub status: FlowStatus,
    pub error_message: Option<String>,
    pub note: Option<String>,
}

impl TransitionDecision {
    fn noop(record: &FlowRunRecord) -> Self {
        Self {
            status: record.status,
            error_message: record.error_message.clone(),
            note: None,
        }
    }

    pub fn is_noop(&self, record: &FlowRunRecord) -> bool {
        self.status == record.status && self.error_message == record.error_message
    }
}

/// The §reconcile transition table: current status × worker health.
pub fn resolve_flow_transition(
    record: &FlowRunRecord,
    health: &WorkerHealth,
) -> TransitionDecision {
    match record.status {
        FlowStatus::Running => match health.status {
            WorkerStatus::Alive => TransitionDecision::noop(record),
            WorkerStatus::Absent | WorkerStatus::Dead | WorkerStatus::Mismatch
            | WorkerStatus::Invalid => TransitionDecision {
                status: FlowStatus::Failed,
                error_message: Some("worker crashed".to_string()),
                note: Some(format!("worker {}", health.status.as_str())),
            },
        },
        FlowStatus::Stopping => match health.status {
            WorkerStatus::Alive => TransitionDecision::noop(record),
            _ => TransitionDecision {
                status: FlowStatus::Stopped,
                error_message: record.error_message.clone(),
                note: Some(format!("worker {} while stopping", health.status.as_str())),
            },
        },
        // Paused runs keep their status; a dead worker only triggers
        // the synthetic crash dispatch side effect.
        _ => TransitionDecision::noop(record),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlowReconcileSummary {
    pub checked: usize,
    pub active: usize,
    pub updated: usize,
    pub locked: usize,
    pub errors: usize,
}

#[derive(Debug)]
pub struct FlowReconcileResult {
    pub records: Vec<FlowRunRecord>,
    pub summary: FlowReconcileSummary,
}

fn workspace_and_runs_dir(repo_root: &Path, record: &FlowRunRecord) -> (PathBuf, PathBuf) {
    let workspace_root = record
        .input_str("workspace_root")
        .map(PathBuf::from)
        .map(|p| if p.is_absolute() { p } else { repo_root.join(p) })
        .unwrap_or_else(|| repo_root.to_path_buf());
    let runs_dir = record
        .input_str("runs_dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(paths::DEFAULT_RUNS_DIR));
    (workspace_root, runs_dir)
}

fn latest_app_event_details(store: &FlowStore, run_id: &str) -> (Option<String>, Option<String>) {
    let Ok(Some(event)) = store.get_last_event_by_type(run_id, FlowEventType::AppServerEvent)
    else {
        return (None, None);
    };
    let message = event.data.get("message").cloned().unwrap_or(Value::Null);
    let method = message
        .get("method")
        .or_else(|| message.get("type"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let turn_id = event
        .data
        .get("turn_id")
        .or_else(|| message.get("turn_id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    (method, turn_id)
}

/// Make sure a crash record and its store artifact exist for a run
/// whose worker is gone. Returns the crash payload.
fn ensure_crash_payload(
    repo_root: &Path,
    record: &FlowRunRecord,
    store: &FlowStore,
    health: &WorkerHealth,
) -> Option<Value> {
    let mut crash_info = health
        .crash_info
        .clone()
        .or_else(|| read_worker_crash_info(repo_root, record.id.as_str()));
    if crash_info.is_none() && health.status == WorkerStatus::Dead {
        let (last_method, _) = latest_app_event_details(store, record.id.as_str());
        let info = CrashInfo {
            last_event: last_method,
            exception: record.error_message.clone(),
            exit_code: health.exit_code,
            signal: None,
            stderr_tail: health.stderr_tail.clone(),
        };
        if write_worker_crash_info(repo_root, record.id.as_str(), &info).is_ok() {
            crash_info = read_worker_crash_info(repo_root, record.id.as_str());
        }
    }

    let crash_path = paths::flow_artifacts_dir(repo_root, record.id.as_str()).join("crash.json");
    if crash_path.exists() {
        let metadata = crash_info
            .as_ref()
            .map(|c| {
                json!({
                    "summary": c.get("exception"),
                    "timestamp": c.get("timestamp"),
                })
            })
            .unwrap_or_else(|| json!({}));
        if let Err(e) = store.create_artifact(
            ArtifactId::new().as_str(),
            record.id.as_str(),
            "worker_crash",
            &crash_path.display().to_string(),
            metadata,
        ) {
            tracing::warn!(run_id = %record.id, error = %e, "crash artifact write failed");
        }
    }
    crash_info
}

fn crash_dispatch_body(record: &FlowRunRecord, crash_info: Option<&Value>) -> String {
    let mut lines = vec![
        "The ticket worker stopped unexpectedly and no actionable dispatch was available."
            .to_string(),
        String::new(),
        format!("run_id: {}", record.id),
    ];
    if let Some(info) = crash_info {
        if let Some(last_event) = info.get("last_event").and_then(Value::as_str) {
            if !last_event.trim().is_empty() {
                lines.push(format!("last_event: {}", last_event.trim()));
            }
        }
        if let Some(exit_code) = info.get("exit_code").and_then(Value::as_i64) {
            lines.push(format!("exit_code: {exit_code}"));
        }
        if let Some(signal) = info.get("signal").and_then(Value::as_str) {
            if !signal.trim().is_empty() {
                lines.push(format!("signal: {}", signal.trim()));
            }
        }
        if let Some(tail) = info.get("stderr_tail").and_then(Value::as_str) {
            if !tail.trim().is_empty() {
                lines.push(String::new());
                lines.push("stderr tail:".to_string());
                lines.push("```".to_string());
                lines.push(tail.trim().to_string());
                lines.push("```".to_string());
            }
        }
        if let Some(exception) = info.get("exception").and_then(Value::as_str) {
            if !exception.trim().is_empty() {
                lines.push(format!("exception: {}", exception.trim()));
            }
        }
    }
    lines.extend([
        String::new(),
        "Crash artifact:".to_string(),
        format!("- `.codex-autorunner/flows/{}/crash.json`", record.id),
        String::new(),
        "Please inspect the crash artifact and decide whether to resume or restart the run."
            .to_string(),
    ]);
    let mut body = lines.join("\n");
    body.push('\n');
    body
}

/// Archive a synthetic pause dispatch so the inbox has something
/// actionable, unless the newest dispatch is already unanswered.
fn ensure_crash_dispatch(
    repo_root: &Path,
    record: &FlowRunRecord,
    crash_info: Option<&Value>,
) -> Result<(), FlowError> {
    if record.flow_type != TICKET_FLOW_TYPE {
        return Ok(());
    }
    let (workspace_root, runs_dir) = workspace_and_runs_dir(repo_root, record);
    let outbox = resolve_outbox_paths(&workspace_root, &runs_dir, record.id.as_str());
    ensure_outbox_dirs(&outbox)?;
    let latest_dispatch = latest_seq(&outbox.dispatch_history_dir);
    let latest_reply = latest_seq(&outbox.reply_history_dir);
    if latest_dispatch > latest_reply {
        return Ok(());
    }

    let doc = DispatchDoc::new(
        DispatchMode::Pause,
        Some("Worker crashed".to_string()),
        crash_dispatch_body(record, crash_info),
    );
    car_core::atomic_write(&outbox.dispatch_path, doc.render()?.as_bytes())?;
    let current_ticket = record
        .state
        .get("ticket_engine")
        .and_then(|e| e.get("current_ticket"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let repo_id = record
        .metadata
        .get("repo_id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    archive_dispatch(
        &outbox,
        latest_dispatch + 1,
        &ArchiveMeta {
            ticket_id: current_ticket,
            repo_id,
            run_id: record.id.to_string(),
            origin: "reconcile".to_string(),
        },
    )?;
    Ok(())
}

/// Attach crash evidence to `state.failure` before a failed write.
fn failure_state(
    record: &FlowRunRecord,
    decision: &TransitionDecision,
    health: &WorkerHealth,
    crash_info: Option<&Value>,
) -> Value {
    let mut state = match &record.state {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let mut failure = match state.get("failure") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    failure.entry("step_id".to_string()).or_insert(json!(record.current_step));
    failure
        .entry("error".to_string())
        .or_insert(json!(decision.error_message.clone().unwrap_or_default()));
    failure.entry("failed_at".to_string()).or_insert(json!(now_iso_utc()));
    if let Some(note) = &decision.note {
        failure.entry("note".to_string()).or_insert(json!(note));
    }
    if let Some(exit_code) = health.exit_code {
        failure.entry("exit_code".to_string()).or_insert(json!(exit_code));
    }
    if let Some(tail) = &health.stderr_tail {
        failure.entry("stderr_tail".to_string()).or_insert(json!(tail));
    }
    if let Some(crash) = crash_info {
        failure.entry("crash".to_string()).or_insert(crash.clone());
    }
    state.insert("failure".to_string(), Value::Object(failure));
    Value::Object(state)
}

/// Reconcile one run. Returns `(record, updated, locked)`.
pub fn reconcile_flow_run(
    repo_root: &Path,
    record: &FlowRunRecord,
    store: &FlowStore,
    lifecycle: Option<&dyn LifecycleSink>,
) -> (FlowRunRecord, bool, bool) {
    if !record.status.is_active() {
        return (record.clone(), false, false);
    }

    let lock_path = paths::reconcile_lock_path(repo_root, record.id.as_str());
    let _lock = match FileLock::try_acquire(&lock_path) {
        Ok(lock) => lock,
        Err(FsError::LockBusy(_)) => return (record.clone(), false, true),
        Err(e) => {
            tracing::warn!(run_id = %record.id, error = %e, "reconcile lock failed");
            return (record.clone(), false, false);
        }
    };

    let health = check_worker_health(repo_root, record.id.as_str());
    let crash_info = if health.status.is_dead_enough() {
        ensure_crash_payload(repo_root, record, store, &health)
    } else {
        None
    };
    let decision = resolve_flow_transition(record, &health);

    if decision.is_noop(record) {
        if record.status == FlowStatus::Paused && health.status.is_dead_enough() {
            if let Err(e) = ensure_crash_dispatch(repo_root, record, crash_info.as_ref()) {
                tracing::warn!(run_id = %record.id, error = %e, "crash dispatch failed");
            }
        }
        if health.status.is_dead_enough() {
            clear_worker_metadata(repo_root, record.id.as_str());
        }
        return (record.clone(), false, false);
    }

    tracing::info!(
        run_id = %record.id,
        from = %record.status,
        to = %decision.status,
        note = decision.note.as_deref().unwrap_or("reconcile"),
        "reconciling flow run"
    );

    let state_patch = if decision.status == FlowStatus::Failed {
        Patch::set(failure_state(record, &decision, &health, crash_info.as_ref()))
    } else {
        Patch::Keep
    };
    let error_patch = match &decision.error_message {
        Some(message) => Patch::set(message.clone()),
        None => Patch::Keep,
    };
    let updated = match store.update_flow_run_status(
        record.id.as_str(),
        decision.status,
        state_patch,
        Patch::Keep,
        error_patch,
    ) {
        Ok(updated) => updated,
        Err(e) => {
            tracing::warn!(run_id = %record.id, error = %e, "reconcile status write failed");
            return (record.clone(), false, false);
        }
    };

    let event_type = match decision.status {
        FlowStatus::Failed => Some((FlowEventType::FlowFailed, LifecycleEventType::FlowFailed)),
        FlowStatus::Stopped => Some((FlowEventType::FlowStopped, LifecycleEventType::FlowStopped)),
        _ => None,
    };
    if let Some((flow_event, lifecycle_event)) = event_type {
        let (last_method, last_turn_id) = latest_app_event_details(store, record.id.as_str());
        let mut data = json!({
            "reason": decision.note.clone().unwrap_or_else(|| "reconcile".to_string()),
        });
        if let Some(error) = &decision.error_message {
            data["error"] = json!(error);
        }
        if let Some(method) = last_method {
            data["last_app_event_method"] = json!(method);
        }
        if let Some(turn_id) = last_turn_id {
            data["last_turn_id"] = json!(turn_id);
        }
        if let Some(crash) = &crash_info {
            data["worker_crash"] = json!({
                "timestamp": crash.get("timestamp"),
                "last_event": crash.get("last_event"),
                "exception": crash.get("exception"),
                "exit_code": crash.get("exit_code"),
                "signal": crash.get("signal"),
            });
        }
        if let Err(e) = store.create_event(
            FlowEventId::new().as_str(),
            record.id.as_str(),
            flow_event,
            data.clone(),
        ) {
            tracing::warn!(run_id = %record.id, error = %e, "reconcile event write failed");
        }
        if let Some(sink) = lifecycle {
            let repo_id = record
                .metadata
                .get("repo_id")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            sink.emit(lifecycle_event, &repo_id, record.id.as_str(), &data);
        }
    }

    if decision.status == FlowStatus::Failed {
        if let Err(e) = ensure_crash_dispatch(repo_root, &updated, crash_info.as_ref()) {
            tracing::warn!(run_id = %record.id, error = %e, "crash dispatch failed");
        }
    }
    if health.status.is_dead_enough() {
        clear_worker_metadata(repo_root, record.id.as_str());
    }
    (updated, true, false)
}

/// One reconcile pass over every active run of `flow_type`.
pub fn reconcile_flow_runs(
    repo_root: &Path,
    flow_type: Option<&str>,
    lifecycle: Option<&dyn LifecycleSink>,
) -> FlowReconcileResult {
    let mut summary = FlowReconcileSummary::default();
    let mut records = Vec::new();
    let db_path = paths::flows_db_path(repo_root);
    if !db_path.exists() {
        return FlowReconcileResult { records, summary };
    }
    let durable = RepoConfig::load(repo_root).map(|c| c.durable_writes).unwrap_or(false);
    let store = match FlowStore::open(&db_path, durable) {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!(repo_root = %repo_root.display(), error = %e, "reconcile store open failed");
            summary.errors += 1;
            return FlowReconcileResult { records, summary };
        }
    };
    let listed = match store.list_flow_runs(flow_type, None) {
        Ok(listed) => listed,
        Err(e) => {
            tracing::warn!(repo_root = %repo_root.display(), error = %e, "reconcile list failed");
            summary.errors += 1;
            return FlowReconcileResult { records, summary };
        }
    };
    for record in listed {
        if record.status.is_active() {
            summary.active += 1;
            summary.checked += 1;
            let (updated, changed, locked) =
                reconcile_flow_run(repo_root, &record, &store, lifecycle);
            if changed {
                summary.updated += 1;
            }
            if locked {
                summary.locked += 1;
            }
            records.push(updated);
        } else {
            records.push(record);
        }
    }
    FlowReconcileResult { records, summary }
}

/// Periodic reconcile driver. Runs until the token is cancelled;
/// per-pass errors are logged, never raised.
pub async fn run_reconcile_loop(
    repo_root: PathBuf,
    flow_type: Option<String>,
    interval: Duration,
    lifecycle: Option<Arc<dyn LifecycleSink>>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let result = reconcile_flow_runs(
            &repo_root,
            flow_type.as_deref(),
            lifecycle.as_deref(),
        );
        let summary = result.summary;
        if summary.updated > 0 || summary.errors > 0 {
            tracing::info!(
                repo_root = %repo_root.display(),
                checked = summary.checked,
                updated = summary.updated,
                locked = summary.locked,
                errors = summary.errors,
                "reconcile pass"
            );
        }
    }
}

#[cfg(test)]
#[path = "reconciler_tests.rs"]
mod tests;
