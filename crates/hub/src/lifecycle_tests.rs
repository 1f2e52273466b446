// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the lifecycle event bus

use super::*;
use tempfile::TempDir;

fn event(
    event_type: LifecycleEventType,
    repo: &str,
    run: &str,
    token: Option<&str>,
) -> LifecycleEvent {
    let mut data = Map::new();
    if let Some(token) = token {
        data.insert("transition_token".to_string(), json!(token));
    }
    LifecycleEvent::new(event_type, repo, run, data, "system")
}

#[test]
fn append_and_load_preserve_order() {
    let dir = TempDir::new().unwrap();
    let store = LifecycleEventStore::new(dir.path());
    store.append_with_result(event(LifecycleEventType::FlowPaused, "r", "run-1", None)).unwrap();
    store
        .append_with_result(event(LifecycleEventType::DispatchCreated, "r", "run-1", None))
        .unwrap();
    store.append_with_result(event(LifecycleEventType::FlowPaused, "r", "run-2", None)).unwrap();

    let events = store.load().unwrap();
    let runs: Vec<&str> = events.iter().map(|e| e.run_id.as_str()).collect();
    assert_eq!(runs, vec!["run-1", "run-1", "run-2"]);
}

#[test]
fn duplicate_terminal_events_collapse() {
    let dir = TempDir::new().unwrap();
    let store = LifecycleEventStore::new(dir.path());
    let first = store
        .append_with_result(event(LifecycleEventType::FlowCompleted, "R", "X", Some("t1")))
        .unwrap();
    assert!(!first.deduped);
    let second = store
        .append_with_result(event(LifecycleEventType::FlowCompleted, "R", "X", Some("t1")))
        .unwrap();
    assert!(second.deduped);
    // The second emit returns the original event id.
    assert_eq!(second.event_id, first.event_id);

    let events = store.load().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data["duplicate_count"], 1);
    let first_seen = events[0].data["first_seen_at"].as_str().unwrap();
    let last_seen = events[0].data["last_seen_at"].as_str().unwrap();
    assert!(first_seen <= last_seen);

    // A third repeat keeps counting.
    store
        .append_with_result(event(LifecycleEventType::FlowCompleted, "R", "X", Some("t1")))
        .unwrap();
    let events = store.load().unwrap();
    assert_eq!(events[0].data["duplicate_count"], 2);
}

#[test]
fn different_tokens_do_not_collapse() {
    let dir = TempDir::new().unwrap();
    let store = LifecycleEventStore::new(dir.path());
    store
        .append_with_result(event(LifecycleEventType::FlowFailed, "R", "X", Some("t1")))
        .unwrap();
    store
        .append_with_result(event(LifecycleEventType::FlowFailed, "R", "X", Some("t2")))
        .unwrap();
    assert_eq!(store.load().unwrap().len(), 2);
}

#[test]
fn tokenless_terminal_events_collapse_on_the_triple() {
    let dir = TempDir::new().unwrap();
    let store = LifecycleEventStore::new(dir.path());
    store
        .append_with_result(event(LifecycleEventType::FlowFailed, "R", "X", None))
        .unwrap();
    let second = store
        .append_with_result(event(LifecycleEventType::FlowFailed, "R", "X", None))
        .unwrap();
    assert!(second.deduped);
    assert_eq!(store.load().unwrap().len(), 1);
}

#[test]
fn non_terminal_events_never_collapse() {
    let dir = TempDir::new().unwrap();
    let store = LifecycleEventStore::new(dir.path());
    store.append_with_result(event(LifecycleEventType::FlowPaused, "R", "X", None)).unwrap();
    let second =
        store.append_with_result(event(LifecycleEventType::FlowPaused, "R", "X", None)).unwrap();
    assert!(!second.deduped);
    assert_eq!(store.load().unwrap().len(), 2);
}

#[test]
fn mark_processed_and_get_unprocessed() {
    let dir = TempDir::new().unwrap();
    let store = LifecycleEventStore::new(dir.path());
    let a = store
        .append_with_result(event(LifecycleEventType::FlowPaused, "R", "a", None))
        .unwrap();
    store.append_with_result(event(LifecycleEventType::FlowPaused, "R", "b", None)).unwrap();

    let marked = store.mark_processed(a.event_id.as_str()).unwrap().unwrap();
    assert!(marked.processed);
    assert!(store.mark_processed("nope").unwrap().is_none());
    assert!(store.mark_processed("").unwrap().is_none());

    let unprocessed = store.get_unprocessed(10).unwrap();
    assert_eq!(unprocessed.len(), 1);
    assert_eq!(unprocessed[0].run_id, "b");
    assert_eq!(store.get_unprocessed(0).unwrap().len(), 0);
}

#[test]
fn prune_keeps_unprocessed_and_processed_tail() {
    let dir = TempDir::new().unwrap();
    let store = LifecycleEventStore::new(dir.path());
    let mut processed_ids = Vec::new();
    for i in 0..5 {
        let result = store
            .append_with_result(event(LifecycleEventType::FlowPaused, "R", &format!("p{i}"), None))
            .unwrap();
        processed_ids.push(result.event_id);
    }
    for id in &processed_ids {
        store.mark_processed(id.as_str()).unwrap();
    }
    store.append_with_result(event(LifecycleEventType::FlowPaused, "R", "live", None)).unwrap();

    store.prune_processed(2).unwrap();
    let events = store.load().unwrap();
    assert_eq!(events.len(), 3);
    assert!(events.iter().any(|e| e.run_id == "live" && !e.processed));
    let processed: Vec<&str> =
        events.iter().filter(|e| e.processed).map(|e| e.run_id.as_str()).collect();
    assert_eq!(processed, vec!["p3", "p4"]);
}

#[test]
fn load_tolerates_garbage_entries() {
    let dir = TempDir::new().unwrap();
    let store = LifecycleEventStore::new(dir.path());
    let raw = r#"[
        {"event_type": "flow_paused", "repo_id": "r", "run_id": "x"},
        {"event_type": "unknown_kind", "repo_id": "r", "run_id": "y"},
        "not an object",
        {"repo_id": "missing type"}
    ]"#;
    std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    std::fs::write(store.path(), raw).unwrap();

    let events = store.load().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].run_id, "x");
    // A missing id is backfilled.
    assert!(!events[0].event_id.is_empty());
    assert_eq!(events[0].origin, "system");
}

#[test]
fn unreadable_file_loads_empty() {
    let dir = TempDir::new().unwrap();
    let store = LifecycleEventStore::new(dir.path());
    std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    std::fs::write(store.path(), "{{{{").unwrap();
    assert!(store.load().unwrap().is_empty());
}

#[test]
fn emitter_implements_the_flow_sink() {
    use car_flow::LifecycleSink;
    let dir = TempDir::new().unwrap();
    let emitter = LifecycleEmitter::new(dir.path());
    emitter.emit(
        LifecycleEventType::FlowCompleted,
        "repo-a",
        "run-1",
        &json!({"transition_token": "t1"}),
    );
    emitter.emit(
        LifecycleEventType::FlowCompleted,
        "repo-a",
        "run-1",
        &json!({"transition_token": "t1"}),
    );
    let events = emitter.store().load().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data["duplicate_count"], 1);
}
