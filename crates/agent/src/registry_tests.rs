// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the managed-process registry

use super::*;
use car_core::now_iso_utc;
use tempfile::TempDir;

fn record(kind: &str, workspace_id: &str, pid: i32, owner_pid: i32) -> ProcessRecord {
    ProcessRecord {
        kind: kind.to_string(),
        workspace_id: Some(workspace_id.to_string()),
        pid: Some(pid),
        pgid: None,
        base_url: Some("http://127.0.0.1:7777".to_string()),
        command: vec!["fake-agent".to_string(), "serve".to_string()],
        owner_pid,
        started_at: now_iso_utc(),
        metadata: BTreeMap::new(),
    }
}

#[test]
fn write_read_delete_round_trip() {
    let dir = TempDir::new().unwrap();
    let rec = record("opencode", "ws1", 1234, std::process::id() as i32);
    write_process_record(dir.path(), &rec).unwrap();
    let back = read_process_record(dir.path(), "opencode", "ws1").unwrap().unwrap();
    assert_eq!(back, rec);
    delete_process_record(dir.path(), "opencode", "ws1");
    assert!(read_process_record(dir.path(), "opencode", "ws1").unwrap().is_none());
}

#[test]
fn missing_record_reads_none() {
    let dir = TempDir::new().unwrap();
    assert!(read_process_record(dir.path(), "opencode", "nope").unwrap().is_none());
}

#[test]
fn pid_twin_drops_workspace_key_and_remembers_it() {
    let rec = record("opencode", "ws1", 42, 1);
    let twin = rec.pid_twin().unwrap();
    assert!(twin.workspace_id.is_none());
    assert_eq!(twin.record_key().unwrap(), "42");
    assert_eq!(twin.metadata.get("workspace_id").map(String::as_str), Some("ws1"));
}

#[test]
fn both_keys_can_coexist() {
    let dir = TempDir::new().unwrap();
    let rec = record("opencode", "ws1", 4321, std::process::id() as i32);
    write_process_record(dir.path(), &rec).unwrap();
    write_process_record(dir.path(), &rec.pid_twin().unwrap()).unwrap();
    assert!(read_process_record(dir.path(), "opencode", "ws1").unwrap().is_some());
    assert!(read_process_record(dir.path(), "opencode", "4321").unwrap().is_some());
}

#[test]
fn reap_removes_dead_pid_records() {
    let dir = TempDir::new().unwrap();
    let mut child =
        std::process::Command::new("true").stdout(std::process::Stdio::null()).spawn().unwrap();
    let dead_pid = child.id() as i32;
    child.wait().unwrap();

    write_process_record(dir.path(), &record("opencode", "dead", dead_pid, 1)).unwrap();
    let live = record("opencode", "live", std::process::id() as i32, std::process::id() as i32);
    write_process_record(dir.path(), &live).unwrap();

    let summary = reap_managed_processes(dir.path()).unwrap();
    assert_eq!(summary.scanned, 2);
    assert_eq!(summary.removed, 1);
    assert!(read_process_record(dir.path(), "opencode", "dead").unwrap().is_none());
    assert!(read_process_record(dir.path(), "opencode", "live").unwrap().is_some());
}

#[test]
fn reap_terminates_orphans_whose_owner_is_gone() {
    let dir = TempDir::new().unwrap();
    let mut child = std::process::Command::new("sleep")
        .arg("30")
        .stdout(std::process::Stdio::null())
        .spawn()
        .unwrap();
    let pid = child.id() as i32;

    let mut owner = std::process::Command::new("true").spawn().unwrap();
    let dead_owner = owner.id() as i32;
    owner.wait().unwrap();

    write_process_record(dir.path(), &record("opencode", "orphan", pid, dead_owner)).unwrap();
    let summary = reap_managed_processes(dir.path()).unwrap();
    assert_eq!(summary.terminated, 1);
    assert!(read_process_record(dir.path(), "opencode", "orphan").unwrap().is_none());
    // Reap killed the sleeper; wait() reaps the zombie so the pid frees.
    let status = child.wait().unwrap();
    assert!(!status.success());
    assert!(!crate::terminate::pid_is_running(pid));
}

#[test]
fn reap_on_empty_root_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let summary = reap_managed_processes(dir.path()).unwrap();
    assert_eq!(summary, ReapSummary::default());
}
