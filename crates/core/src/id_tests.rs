// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for ID newtypes

use super::*;
use std::path::PathBuf;

#[test]
fn run_id_is_uuid_v4() {
    let id = RunId::new();
    let parsed = uuid::Uuid::parse_str(id.as_str()).unwrap();
    assert_eq!(parsed.get_version_num(), 4);
}

#[test]
fn run_ids_are_unique() {
    assert_ne!(RunId::new(), RunId::new());
}

#[test]
fn id_round_trips_through_serde() {
    let id = RunId::new();
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, format!("\"{}\"", id));
    let back: RunId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

#[test]
fn short_truncates() {
    assert_eq!(short("abcdef", 4), "abcd");
    assert_eq!(short("ab", 4), "ab");
}

#[test]
fn workspace_id_is_stable_for_same_path() {
    let dir = tempfile::TempDir::new().unwrap();
    let a = WorkspaceId::for_path(dir.path());
    let b = WorkspaceId::for_path(dir.path());
    assert_eq!(a, b);
    assert_eq!(a.as_str().len(), 16);
}

#[test]
fn workspace_id_canonicalizes() {
    let dir = tempfile::TempDir::new().unwrap();
    let sub = dir.path().join("sub");
    std::fs::create_dir(&sub).unwrap();
    let direct = WorkspaceId::for_path(&sub);
    let dotted = WorkspaceId::for_path(&sub.join("..").join("sub"));
    assert_eq!(direct, dotted);
}

#[test]
fn workspace_id_differs_per_path() {
    let a = WorkspaceId::for_path(&PathBuf::from("/nonexistent/a"));
    let b = WorkspaceId::for_path(&PathBuf::from("/nonexistent/b"));
    assert_ne!(a, b);
}

#[test]
fn global_workspace_id() {
    let id = WorkspaceId::global();
    assert!(id.is_global());
    assert_eq!(id.as_str(), "__global__");
    assert!(!WorkspaceId::for_path(&PathBuf::from("/tmp")).is_global());
}
