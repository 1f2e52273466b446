// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the inbox projection

use super::*;
use car_core::RunId;
use car_store::{NewFlowRun, Patch};
use serde_json::json;
use tempfile::TempDir;

struct Fixture {
    repo: TempDir,
    store: FlowStore,
}

fn fixture() -> Fixture {
    let repo = TempDir::new().unwrap();
    let store = FlowStore::open(&paths::flows_db_path(repo.path()), false).unwrap();
    Fixture { repo, store }
}

impl Fixture {
    fn run(&self, status: FlowStatus, error: Option<&str>) -> RunId {
        let run_id = RunId::new();
        self.store
            .create_flow_run(NewFlowRun {
                run_id: run_id.clone(),
                flow_type: "ticket_flow".into(),
                input_data: json!({
                    "workspace_root": self.repo.path(),
                    "runs_dir": paths::DEFAULT_RUNS_DIR,
                }),
                metadata: None,
                state: None,
                current_step: "run_one_turn".into(),
            })
            .unwrap();
        if status != FlowStatus::Pending {
            self.store
                .update_flow_run_status(
                    run_id.as_str(),
                    status,
                    Patch::Keep,
                    Patch::Keep,
                    match error {
                        Some(e) => Patch::set(e.to_string()),
                        None => Patch::Keep,
                    },
                )
                .unwrap();
        }
        run_id
    }

    fn archive(&self, run_id: &RunId, seq: u64, mode: &str, body: &str) {
        let run_dir = paths::run_dir(
            self.repo.path(),
            Path::new(paths::DEFAULT_RUNS_DIR),
            run_id.as_str(),
        );
        let dir = run_dir.join("dispatch_history").join(paths::history_seq_name(seq));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("DISPATCH.md"),
            format!("---\nmode: {mode}\n---\n{body}\n"),
        )
        .unwrap();
    }

    fn reply(&self, run_id: &RunId, seq: u64) {
        let run_dir = paths::run_dir(
            self.repo.path(),
            Path::new(paths::DEFAULT_RUNS_DIR),
            run_id.as_str(),
        );
        let dir = run_dir.join("reply_history").join(paths::history_seq_name(seq));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("USER_REPLY.md"), "ack\n").unwrap();
    }
}

#[test]
fn empty_repo_has_empty_inbox() {
    let repo = TempDir::new().unwrap();
    assert!(build_inbox(repo.path(), "repo-a").unwrap().is_empty());
}

#[test]
fn paused_run_with_unanswered_pause_dispatch_is_run_dispatch() {
    let f = fixture();
    let run = f.run(FlowStatus::Paused, Some("Reason: need credentials"));
    f.archive(&run, 1, "pause", "need credentials");

    let items = build_inbox(f.repo.path(), "repo-a").unwrap();
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.item_type, InboxItemType::RunDispatch);
    assert_eq!(item.dispatch_seq, Some(1));
    assert_eq!(item.dispatch_mode, Some(DispatchMode::Pause));
    assert!(!item.replied);
    assert_eq!(item.reason.as_deref(), Some("Reason: need credentials"));
}

#[test]
fn replied_dispatch_downgrades_to_state_attention() {
    let f = fixture();
    let run = f.run(FlowStatus::Paused, Some("Reason: waiting"));
    f.archive(&run, 1, "pause", "waiting");
    f.reply(&run, 1);

    let items = build_inbox(f.repo.path(), "repo-a").unwrap();
    assert_eq!(items[0].item_type, InboxItemType::RunStateAttention);
    assert!(items[0].replied);
}

#[test]
fn failed_run_without_dispatch_is_run_failed() {
    let f = fixture();
    f.run(FlowStatus::Failed, Some("worker crashed"));
    let items = build_inbox(f.repo.path(), "repo-a").unwrap();
    assert_eq!(items[0].item_type, InboxItemType::RunFailed);
    assert_eq!(items[0].reason.as_deref(), Some("worker crashed"));
}

#[test]
fn stopped_run_is_run_stopped_and_completed_is_hidden() {
    let f = fixture();
    f.run(FlowStatus::Stopped, None);
    f.run(FlowStatus::Completed, None);
    let items = build_inbox(f.repo.path(), "repo-a").unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].item_type, InboxItemType::RunStopped);
}

#[test]
fn pause_dispatch_preferred_over_newer_summary() {
    let f = fixture();
    let run = f.run(FlowStatus::Paused, None);
    f.archive(&run, 1, "pause", "blocked on keys");
    f.archive(&run, 2, "turn_summary", "made progress");

    let items = build_inbox(f.repo.path(), "repo-a").unwrap();
    assert_eq!(items[0].dispatch_seq, Some(1));
    assert_eq!(items[0].dispatch_mode, Some(DispatchMode::Pause));
}

#[test]
fn notify_preferred_over_summary_and_highest_seq_wins_within_rank() {
    let f = fixture();
    let run = f.run(FlowStatus::Running, None);
    f.archive(&run, 1, "notify", "first note");
    f.archive(&run, 2, "turn_summary", "summary");
    f.archive(&run, 3, "notify", "second note");

    let items = build_inbox(f.repo.path(), "repo-a").unwrap();
    assert_eq!(items[0].dispatch_seq, Some(3));
    assert_eq!(items[0].dispatch_mode, Some(DispatchMode::Notify));
}

#[test]
fn dismissal_hides_the_item() {
    let f = fixture();
    let run = f.run(FlowStatus::Failed, Some("boom"));
    record_dismissal(
        f.repo.path(),
        Dismissal::new(run.as_str(), InboxItemType::RunFailed, None),
    )
    .unwrap();
    assert!(build_inbox(f.repo.path(), "repo-a").unwrap().is_empty());
}

#[test]
fn seq_scoped_dismissal_only_hides_that_dispatch() {
    let f = fixture();
    let run = f.run(FlowStatus::Paused, None);
    f.archive(&run, 1, "pause", "old question");
    record_dismissal(
        f.repo.path(),
        Dismissal::new(run.as_str(), InboxItemType::RunDispatch, Some(1)),
    )
    .unwrap();
    assert!(build_inbox(f.repo.path(), "repo-a").unwrap().is_empty());

    // A newer pause dispatch resurfaces.
    f.archive(&run, 2, "pause", "new question");
    let items = build_inbox(f.repo.path(), "repo-a").unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].dispatch_seq, Some(2));
}

#[test]
fn duplicate_dismissals_are_not_recorded_twice() {
    let f = fixture();
    let run = f.run(FlowStatus::Failed, None);
    let dismissal = Dismissal::new(run.as_str(), InboxItemType::RunFailed, None);
    record_dismissal(f.repo.path(), dismissal.clone()).unwrap();
    record_dismissal(f.repo.path(), dismissal).unwrap();
    assert_eq!(load_dismissals(f.repo.path()).len(), 1);
}

#[test]
fn pause_reason_is_normalized_and_capped() {
    let f = fixture();
    let run = RunId::new();
    f.store
        .create_flow_run(NewFlowRun {
            run_id: run.clone(),
            flow_type: "ticket_flow".into(),
            input_data: json!({"workspace_root": f.repo.path()}),
            metadata: None,
            state: Some(json!({
                "ticket_engine": {"reason": format!("lots   of\n whitespace {}", "x".repeat(400))}
            })),
            current_step: "run_one_turn".into(),
        })
        .unwrap();
    f.store
        .update_flow_run_status(run.as_str(), FlowStatus::Paused, Patch::Keep, Patch::Keep, Patch::Keep)
        .unwrap();

    let items = build_inbox(f.repo.path(), "repo-a").unwrap();
    let reason = items[0].reason.as_deref().unwrap();
    assert!(reason.starts_with("Reason: lots of whitespace"));
    assert!(reason.chars().count() <= 208);
}
