// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the reconciler

use super::*;
use car_core::{FlowStatus, RunId};
use car_store::NewFlowRun;
use serde_json::json;
use tempfile::TempDir;

fn dead_pid() -> i32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id() as i32;
    child.wait().unwrap();
    pid
}

struct Fixture {
    repo: TempDir,
    store: FlowStore,
    run_id: RunId,
}

fn fixture(status: FlowStatus) -> Fixture {
    let repo = TempDir::new().unwrap();
    let store = FlowStore::open(&paths::flows_db_path(repo.path()), false).unwrap();
    let run_id = RunId::new();
    store
        .create_flow_run(NewFlowRun {
            run_id: run_id.clone(),
            flow_type: TICKET_FLOW_TYPE.into(),
            input_data: json!({
                "workspace_root": repo.path(),
                "runs_dir": paths::DEFAULT_RUNS_DIR,
            }),
            metadata: Some(json!({"repo_id": "repo-a"})),
            state: Some(json!({"ticket_engine": {"current_ticket": "TICKET-001.md"}})),
            current_step: "run_one_turn".into(),
        })
        .unwrap();
    if status != FlowStatus::Pending {
        store
            .update_flow_run_status(
                run_id.as_str(),
                status,
                Patch::Keep,
                Patch::Keep,
                Patch::Keep,
            )
            .unwrap();
    }
    Fixture { repo, store, run_id }
}

fn write_dead_worker_meta(repo: &Path, run_id: &str) {
    car_core::atomic_write_json(
        &paths::flow_artifacts_dir(repo, run_id).join("worker.json"),
        &crate::worker::WorkerMeta {
            pid: dead_pid(),
            started_at: car_core::now_iso_utc(),
            workspace_root: repo.display().to_string(),
        },
    )
    .unwrap();
}

#[test]
fn running_with_dead_worker_fails_the_run() {
    let f = fixture(FlowStatus::Running);
    write_dead_worker_meta(f.repo.path(), f.run_id.as_str());
    std::fs::write(
        paths::flow_artifacts_dir(f.repo.path(), f.run_id.as_str()).join("worker.err.log"),
        "thread panicked\n",
    )
    .unwrap();

    let record = f.store.get_flow_run(f.run_id.as_str()).unwrap().unwrap();
    let (updated, changed, locked) = reconcile_flow_run(f.repo.path(), &record, &f.store, None);
    assert!(changed);
    assert!(!locked);
    assert_eq!(updated.status, FlowStatus::Failed);
    assert!(updated.error_message.as_deref().unwrap_or("").contains("worker crashed"));
    assert!(updated.finished_at.is_some());

    // Crash evidence: crash.json, failure state, store artifact, event.
    let crash = read_worker_crash_info(f.repo.path(), f.run_id.as_str()).unwrap();
    assert!(crash["stderr_tail"].as_str().unwrap().contains("panicked"));
    assert_eq!(updated.state["failure"]["error"], "worker crashed");
    let artifacts = f.store.get_artifacts(f.run_id.as_str()).unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].kind, "worker_crash");
    let last = f
        .store
        .get_last_event_by_type(f.run_id.as_str(), car_core::FlowEventType::FlowFailed)
        .unwrap()
        .unwrap();
    assert_eq!(last.data["error"], "worker crashed");

    // Synthetic pause dispatch archived for the inbox.
    let run_dir = paths::run_dir(
        f.repo.path(),
        Path::new(paths::DEFAULT_RUNS_DIR),
        f.run_id.as_str(),
    );
    let doc = DispatchDoc::load(&run_dir.join("dispatch_history/0001/DISPATCH.md")).unwrap();
    assert_eq!(doc.mode, DispatchMode::Pause);
    assert_eq!(doc.title.as_deref(), Some("Worker crashed"));
    assert!(doc.body.contains("crash.json"));

    // Stale worker metadata cleared.
    assert_eq!(
        check_worker_health(f.repo.path(), f.run_id.as_str()).status,
        WorkerStatus::Absent
    );
}

#[test]
fn reconcile_is_idempotent_on_failed_runs() {
    let f = fixture(FlowStatus::Running);
    write_dead_worker_meta(f.repo.path(), f.run_id.as_str());
    let record = f.store.get_flow_run(f.run_id.as_str()).unwrap().unwrap();
    let (updated, changed, _) = reconcile_flow_run(f.repo.path(), &record, &f.store, None);
    assert!(changed);

    let events_before = f.store.get_events(f.run_id.as_str(), None, None).unwrap().len();
    let artifacts_before = f.store.get_artifacts(f.run_id.as_str()).unwrap().len();
    let (again, changed, locked) = reconcile_flow_run(f.repo.path(), &updated, &f.store, None);
    assert!(!changed);
    assert!(!locked);
    assert_eq!(again.status, FlowStatus::Failed);
    assert_eq!(
        f.store.get_events(f.run_id.as_str(), None, None).unwrap().len(),
        events_before
    );
    assert_eq!(
        f.store.get_artifacts(f.run_id.as_str()).unwrap().len(),
        artifacts_before
    );
}

#[test]
fn stopping_with_dead_worker_becomes_stopped() {
    let f = fixture(FlowStatus::Stopping);
    write_dead_worker_meta(f.repo.path(), f.run_id.as_str());
    let record = f.store.get_flow_run(f.run_id.as_str()).unwrap().unwrap();
    let (updated, changed, _) = reconcile_flow_run(f.repo.path(), &record, &f.store, None);
    assert!(changed);
    assert_eq!(updated.status, FlowStatus::Stopped);
    // A stop is not a crash: no failure payload.
    assert!(updated.state.get("failure").is_none());
}

#[test]
fn running_with_alive_worker_is_untouched() {
    let f = fixture(FlowStatus::Running);
    let mut child = std::process::Command::new("sh")
        .arg("-c")
        .arg("sleep 30")
        .arg(f.run_id.as_str())
        .stdout(std::process::Stdio::null())
        .spawn()
        .unwrap();
    car_core::atomic_write_json(
        &paths::flow_artifacts_dir(f.repo.path(), f.run_id.as_str()).join("worker.json"),
        &crate::worker::WorkerMeta {
            pid: child.id() as i32,
            started_at: car_core::now_iso_utc(),
            workspace_root: f.repo.path().display().to_string(),
        },
    )
    .unwrap();

    let record = f.store.get_flow_run(f.run_id.as_str()).unwrap().unwrap();
    let (updated, changed, _) = reconcile_flow_run(f.repo.path(), &record, &f.store, None);
    assert!(!changed);
    assert_eq!(updated.status, FlowStatus::Running);

    child.kill().unwrap();
    child.wait().unwrap();
}

#[test]
fn paused_run_with_dead_worker_keeps_status_but_gets_crash_dispatch() {
    let f = fixture(FlowStatus::Paused);
    write_dead_worker_meta(f.repo.path(), f.run_id.as_str());
    let record = f.store.get_flow_run(f.run_id.as_str()).unwrap().unwrap();
    let (updated, changed, _) = reconcile_flow_run(f.repo.path(), &record, &f.store, None);
    assert!(!changed);
    assert_eq!(updated.status, FlowStatus::Paused);

    let run_dir = paths::run_dir(
        f.repo.path(),
        Path::new(paths::DEFAULT_RUNS_DIR),
        f.run_id.as_str(),
    );
    assert!(run_dir.join("dispatch_history/0001/DISPATCH.md").exists());
}

#[test]
fn unanswered_dispatch_suppresses_crash_dispatch() {
    let f = fixture(FlowStatus::Paused);
    write_dead_worker_meta(f.repo.path(), f.run_id.as_str());
    // An unanswered dispatch already sits at seq 1.
    let run_dir = paths::run_dir(
        f.repo.path(),
        Path::new(paths::DEFAULT_RUNS_DIR),
        f.run_id.as_str(),
    );
    std::fs::create_dir_all(run_dir.join("dispatch_history/0001")).unwrap();

    let record = f.store.get_flow_run(f.run_id.as_str()).unwrap().unwrap();
    reconcile_flow_run(f.repo.path(), &record, &f.store, None);
    assert!(!run_dir.join("dispatch_history/0002").exists());
}

#[test]
fn busy_reconcile_lock_skips_the_run() {
    let f = fixture(FlowStatus::Running);
    write_dead_worker_meta(f.repo.path(), f.run_id.as_str());
    let lock =
        FileLock::acquire(&paths::reconcile_lock_path(f.repo.path(), f.run_id.as_str())).unwrap();

    let record = f.store.get_flow_run(f.run_id.as_str()).unwrap().unwrap();
    let (updated, changed, locked) = reconcile_flow_run(f.repo.path(), &record, &f.store, None);
    assert!(!changed);
    assert!(locked);
    assert_eq!(updated.status, FlowStatus::Running);
    drop(lock);
}

#[test]
fn terminal_runs_are_skipped_entirely() {
    let f = fixture(FlowStatus::Running);
    f.store
        .update_flow_run_status(
            f.run_id.as_str(),
            FlowStatus::Completed,
            Patch::Keep,
            Patch::Keep,
            Patch::Keep,
        )
        .unwrap();
    let record = f.store.get_flow_run(f.run_id.as_str()).unwrap().unwrap();
    let (_, changed, locked) = reconcile_flow_run(f.repo.path(), &record, &f.store, None);
    assert!(!changed);
    assert!(!locked);
}

#[test]
fn reconcile_flow_runs_summarizes_a_pass() {
    let f = fixture(FlowStatus::Running);
    write_dead_worker_meta(f.repo.path(), f.run_id.as_str());
    let result = reconcile_flow_runs(f.repo.path(), Some(TICKET_FLOW_TYPE), None);
    assert_eq!(result.summary.checked, 1);
    assert_eq!(result.summary.active, 1);
    assert_eq!(result.summary.updated, 1);
    assert_eq!(result.summary.locked, 0);
    assert_eq!(result.summary.errors, 0);
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.records[0].status, FlowStatus::Failed);
}

#[test]
fn reconcile_without_database_is_empty() {
    let repo = TempDir::new().unwrap();
    let result = reconcile_flow_runs(repo.path(), None, None);
    assert!(result.records.is_empty());
    assert_eq!(result.summary, FlowReconcileSummary::default());
}

#[test]
fn transition_table_matches_the_contract() {
    let f = fixture(FlowStatus::Running);
    let record = f.store.get_flow_run(f.run_id.as_str()).unwrap().unwrap();
    let health = |status| WorkerHealth {
        status,
        pid: None,
        exit_code: None,
        stderr_tail: None,
        crash_info: None,
    };

    let decision = resolve_flow_transition(&record, &health(WorkerStatus::Alive));
    assert!(decision.is_noop(&record));
    for status in [WorkerStatus::Dead, WorkerStatus::Mismatch, WorkerStatus::Invalid] {
        let decision = resolve_flow_transition(&record, &health(status));
        assert_eq!(decision.status, FlowStatus::Failed);
        assert_eq!(decision.error_message.as_deref(), Some("worker crashed"));
    }
}
