// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn layout_matches_contract() {
    let repo = Path::new("/repo");
    assert_eq!(flows_db_path(repo), Path::new("/repo/.codex-autorunner/flows.db"));
    assert_eq!(tickets_dir(repo), Path::new("/repo/.codex-autorunner/tickets"));
    assert_eq!(
        reconcile_lock_path(repo, "abc"),
        Path::new("/repo/.codex-autorunner/flows/abc/reconcile.lock")
    );
    assert_eq!(
        lifecycle_events_path(repo),
        Path::new("/repo/.codex-autorunner/lifecycle_events.json")
    );
    assert_eq!(
        lifecycle_events_lock_path(repo),
        Path::new("/repo/.codex-autorunner/lifecycle_events.lock")
    );
}

#[test]
fn run_dir_resolves_relative_and_absolute() {
    let ws = Path::new("/w");
    let relative = run_dir(ws, Path::new(".codex-autorunner/runs"), "r1");
    assert_eq!(relative, Path::new("/w/.codex-autorunner/runs/r1"));
    let absolute = run_dir(ws, Path::new("/elsewhere/runs"), "r1");
    assert_eq!(absolute, Path::new("/elsewhere/runs/r1"));
}

#[test]
fn dispatch_paths_nest_under_run_dir() {
    let rd = Path::new("/w/.codex-autorunner/runs/r1");
    assert_eq!(dispatch_path(rd), rd.join("dispatch/DISPATCH.md"));
    assert_eq!(dispatch_history_dir(rd), rd.join("dispatch_history"));
    assert_eq!(reply_history_dir(rd), rd.join("reply_history"));
}

#[test]
fn history_seq_names_are_zero_padded() {
    assert_eq!(history_seq_name(1), "0001");
    assert_eq!(history_seq_name(42), "0042");
    assert_eq!(history_seq_name(12345), "12345");
}
