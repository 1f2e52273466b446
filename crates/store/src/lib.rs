// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! car-store: per-repo SQLite persistence for flow runs, events, and
//! artifacts.

pub mod db;
pub mod flows;
pub mod records;

pub use db::{open_flows_db, StoreError};
pub use flows::FlowStore;
pub use records::{FlowArtifactRecord, FlowEventRecord, FlowRunRecord, NewFlowRun, Patch};
