// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `car reconcile`: one repair pass over this repo's runs.

use car_hub::LifecycleEmitter;
use std::path::Path;

pub fn run(repo_root: &Path, flow_type: Option<&str>) -> anyhow::Result<i32> {
    let lifecycle = LifecycleEmitter::new(repo_root);
    let result = car_flow::reconcile_flow_runs(repo_root, flow_type, Some(&lifecycle));
    let summary = result.summary;
    println!(
        "checked={} active={} updated={} locked={} errors={}",
        summary.checked, summary.active, summary.updated, summary.locked, summary.errors
    );
    Ok(if summary.errors > 0 { 1 } else { 0 })
}
