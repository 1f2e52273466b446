// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for atomic writes and file locks

use super::*;
use tempfile::TempDir;

#[test]
fn atomic_write_round_trips() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.json");
    atomic_write(&path, b"hello").unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"hello");
}

#[test]
fn atomic_write_replaces_existing_contents() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.txt");
    atomic_write(&path, b"old").unwrap();
    atomic_write(&path, b"new").unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
}

#[test]
fn atomic_write_creates_parent_dirs_and_leaves_no_tmp() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a/b/c.txt");
    atomic_write(&path, b"x").unwrap();
    assert!(path.exists());
    let siblings: Vec<_> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(siblings, vec![std::ffi::OsString::from("c.txt")]);
}

#[test]
fn json_helpers_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data.json");
    let value = serde_json::json!({"k": "v", "n": 3});
    atomic_write_json(&path, &value).unwrap();
    let back: serde_json::Value = read_json(&path).unwrap().unwrap();
    assert_eq!(back, value);
}

#[test]
fn read_json_absent_is_none() {
    let dir = TempDir::new().unwrap();
    let missing: Option<serde_json::Value> = read_json(&dir.path().join("nope.json")).unwrap();
    assert!(missing.is_none());
}

#[test]
fn try_acquire_conflicts_with_held_lock() {
    let dir = TempDir::new().unwrap();
    let lock_path = dir.path().join("x.lock");
    let held = FileLock::acquire(&lock_path).unwrap();
    let err = FileLock::try_acquire(&lock_path).unwrap_err();
    assert!(matches!(err, FsError::LockBusy(_)));
    drop(held);
    // Released on drop: a second acquisition succeeds.
    FileLock::try_acquire(&lock_path).unwrap();
}

#[test]
fn lock_creates_parent_dirs() {
    let dir = TempDir::new().unwrap();
    let lock_path = dir.path().join("locks/deep/x.lock");
    let guard = FileLock::acquire(&lock_path).unwrap();
    assert_eq!(guard.path(), lock_path);
    assert!(lock_path.exists());
}
