// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use car_core::{FlowStatus, RunId};

#[test]
fn patch_resolves_against_current() {
    let keep: Patch<String> = Patch::Keep;
    assert_eq!(keep.resolve(Some("old".into())), Some("old".to_string()));

    let set = Patch::set("new".to_string());
    assert_eq!(set.resolve(Some("old".into())), Some("new".to_string()));

    let clear: Patch<String> = Patch::clear();
    assert_eq!(clear.resolve(Some("old".into())), None);
}

#[test]
fn patch_default_is_keep() {
    let patch: Patch<i64> = Patch::default();
    assert!(patch.is_keep());
}

#[test]
fn patch_from_value_sets() {
    let patch: Patch<i64> = 7.into();
    assert_eq!(patch.resolve(None), Some(7));
}

#[test]
fn input_str_trims_and_rejects_empty() {
    let record = FlowRunRecord {
        id: RunId::new(),
        flow_type: "ticket_flow".into(),
        status: FlowStatus::Pending,
        current_step: "run_one_turn".into(),
        input_data: serde_json::json!({"workspace_root": "  /w  ", "runs_dir": "", "n": 4}),
        state: serde_json::json!({}),
        metadata: serde_json::json!({}),
        error_message: None,
        created_at: "2026-01-01T00:00:00Z".into(),
        started_at: None,
        finished_at: None,
        stop_requested: false,
    };
    assert_eq!(record.input_str("workspace_root"), Some("/w"));
    assert_eq!(record.input_str("runs_dir"), None);
    assert_eq!(record.input_str("n"), None);
    assert_eq!(record.input_str("missing"), None);
}
