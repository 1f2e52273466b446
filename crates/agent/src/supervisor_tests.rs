// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the agent supervisor using a shell-script fake agent

use super::*;
use car_core::ServerScope;
use tempfile::TempDir;
use yare::parameterized;

/// A fake agent: announces a listening URL, then sleeps.
fn fake_agent_command() -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        "echo \"listening on http://127.0.0.1:1\"; exec sleep 300".to_string(),
    ]
}

fn config(registry_root: &std::path::Path, max_handles: Option<usize>) -> AgentSupervisorConfig {
    AgentSupervisorConfig {
        kind: "opencode".to_string(),
        command: fake_agent_command(),
        scope: ServerScope::Workspace,
        base_url: None,
        turn_timeout: Duration::from_secs(5),
        startup_timeout: Duration::from_secs(5),
        max_handles,
        idle_ttl: None,
        global_registry_root: registry_root.to_path_buf(),
    }
}

#[parameterized(
    plain = { "listening on http://127.0.0.1:4096", Some("http://127.0.0.1:4096") },
    https = { "listening on https://localhost:8443/api", Some("https://localhost:8443/api") },
    prefixed = { "[info] server listening on http://[::1]:3000 (ready)", Some("http://[::1]:3000") },
    wrong_scheme = { "listening on ftp://example.com", None },
    unrelated = { "starting up...", None },
)]
fn listen_url_parsing(line: &str, expected: Option<&str>) {
    assert_eq!(parse_listen_url(line).as_deref(), expected);
}

#[test]
fn password_env_derives_from_kind() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path(), None);
    assert_eq!(cfg.password_env(), "OPENCODE_SERVER_PASSWORD");
}

#[tokio::test]
async fn get_client_spawns_and_registers() {
    let hub = TempDir::new().unwrap();
    let ws = TempDir::new().unwrap();
    let supervisor = AgentSupervisor::new(config(hub.path(), None));

    let client = supervisor.get_client(ws.path()).await.unwrap();
    assert_eq!(client.base_url(), "http://127.0.0.1:1");

    let canonical = ws.path().canonicalize().unwrap();
    let handle_id = WorkspaceId::for_path(&canonical).as_str().to_string();
    let record = read_process_record(&canonical, "opencode", &handle_id).unwrap().unwrap();
    assert!(record.pid.is_some());
    assert_eq!(record.owner_pid, std::process::id() as i32);
    // Pid-keyed twin exists too.
    let pid = record.pid.unwrap();
    assert!(read_process_record(&canonical, "opencode", &pid.to_string()).unwrap().is_some());

    // Second call reuses the same handle without spawning again.
    let again = supervisor.get_client(ws.path()).await.unwrap();
    assert_eq!(again.base_url(), client.base_url());
    assert_eq!(supervisor.active_handles().await.len(), 1);
    let info = supervisor.describe_handle(ws.path()).await.unwrap();
    assert!(info.started);
    assert_eq!(info.base_url.as_deref(), Some("http://127.0.0.1:1"));
    assert_eq!(info.active_turns, 0);

    supervisor.close_all().await;
    assert!(supervisor.active_handles().await.is_empty());
    assert!(read_process_record(&canonical, "opencode", &handle_id).unwrap().is_none());
    assert!(!crate::terminate::pid_is_running(pid));
}

#[tokio::test]
async fn lru_eviction_at_max_handles() {
    let hub = TempDir::new().unwrap();
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let c = TempDir::new().unwrap();
    let supervisor = AgentSupervisor::new(config(hub.path(), Some(2)));

    supervisor.get_client(a.path()).await.unwrap();
    supervisor.mark_turn_started(a.path()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    supervisor.get_client(b.path()).await.unwrap();
    supervisor.mark_turn_started(b.path()).await;
    assert_eq!(supervisor.active_handles().await.len(), 2);

    // /a becomes idle and is the LRU candidate.
    supervisor.mark_turn_finished(a.path()).await;
    // /b is newer; make /a older by touching /b again.
    supervisor.mark_turn_finished(b.path()).await;

    supervisor.get_client(c.path()).await.unwrap();
    let ids = supervisor.active_handles().await;
    assert_eq!(ids.len(), 2);
    let a_id = WorkspaceId::for_path(&a.path().canonicalize().unwrap()).as_str().to_string();
    let b_id = WorkspaceId::for_path(&b.path().canonicalize().unwrap()).as_str().to_string();
    let c_id = WorkspaceId::for_path(&c.path().canonicalize().unwrap()).as_str().to_string();
    assert!(!ids.contains(&a_id), "LRU idle handle should be evicted");
    assert!(ids.contains(&b_id));
    assert!(ids.contains(&c_id));

    // The evicted workspace's registry record is purged.
    let a_root = a.path().canonicalize().unwrap();
    assert!(read_process_record(&a_root, "opencode", &a_id).unwrap().is_none());

    supervisor.close_all().await;
}

#[tokio::test]
async fn busy_handles_are_not_evicted() {
    let hub = TempDir::new().unwrap();
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let supervisor = AgentSupervisor::new(config(hub.path(), Some(1)));

    supervisor.get_client(a.path()).await.unwrap();
    supervisor.mark_turn_started(a.path()).await;

    // Limit reached and the only handle is busy: /b still gets a handle.
    supervisor.get_client(b.path()).await.unwrap();
    let ids = supervisor.active_handles().await;
    assert_eq!(ids.len(), 2);

    supervisor.close_all().await;
}

#[tokio::test]
async fn prune_idle_respects_ttl_and_active_turns() {
    let hub = TempDir::new().unwrap();
    let ws = TempDir::new().unwrap();
    let mut cfg = config(hub.path(), None);
    cfg.idle_ttl = Some(Duration::from_millis(50));
    let supervisor = AgentSupervisor::new(cfg);

    supervisor.get_client(ws.path()).await.unwrap();
    supervisor.mark_turn_started(ws.path()).await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    // Busy: not pruned even though stale.
    assert_eq!(supervisor.prune_idle().await, 0);

    supervisor.mark_turn_finished(ws.path()).await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(supervisor.prune_idle().await, 1);
    assert!(supervisor.active_handles().await.is_empty());
}

#[tokio::test]
async fn startup_failure_surfaces_and_leaves_no_record() {
    let hub = TempDir::new().unwrap();
    let ws = TempDir::new().unwrap();
    let mut cfg = config(hub.path(), None);
    cfg.command = vec![
        "sh".to_string(),
        "-c".to_string(),
        "echo starting; exit 3".to_string(),
    ];
    cfg.startup_timeout = Duration::from_secs(2);
    let supervisor = AgentSupervisor::new(cfg);

    let err = supervisor.get_client(ws.path()).await.unwrap_err();
    assert!(matches!(err, AgentError::Startup(_)));

    let canonical = ws.path().canonicalize().unwrap();
    let handle_id = WorkspaceId::for_path(&canonical).as_str().to_string();
    assert!(read_process_record(&canonical, "opencode", &handle_id).unwrap().is_none());
}

#[tokio::test]
async fn mark_disconnected_forces_restart() {
    let hub = TempDir::new().unwrap();
    let ws = TempDir::new().unwrap();
    let supervisor = AgentSupervisor::new(config(hub.path(), None));

    supervisor.get_client(ws.path()).await.unwrap();
    supervisor.mark_disconnected(ws.path()).await;
    // A fresh get_client succeeds again (spawns a new server).
    supervisor.get_client(ws.path()).await.unwrap();
    assert_eq!(supervisor.active_handles().await.len(), 1);
    supervisor.close_all().await;
}

#[tokio::test]
async fn dead_registry_record_is_cleared_before_spawn() {
    let hub = TempDir::new().unwrap();
    let ws = TempDir::new().unwrap();
    let canonical = ws.path().canonicalize().unwrap();
    let handle_id = WorkspaceId::for_path(&canonical).as_str().to_string();

    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id() as i32;
    child.wait().unwrap();
    write_process_record(
        &canonical,
        &ProcessRecord {
            kind: "opencode".into(),
            workspace_id: Some(handle_id.clone()),
            pid: Some(dead_pid),
            pgid: None,
            base_url: Some("http://127.0.0.1:1".into()),
            command: vec!["gone".into()],
            owner_pid: 1,
            started_at: now_iso_utc(),
            metadata: Default::default(),
        },
    )
    .unwrap();

    let supervisor = AgentSupervisor::new(config(hub.path(), None));
    supervisor.get_client(ws.path()).await.unwrap();
    // Stale record replaced by the fresh spawn's record.
    let record = read_process_record(&canonical, "opencode", &handle_id).unwrap().unwrap();
    assert_ne!(record.pid, Some(dead_pid));
    supervisor.close_all().await;
}
