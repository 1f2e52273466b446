// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! car-agent: supervision of external agent server subprocesses.
//!
//! A supervisor keeps at most one live handle per workspace, reuses
//! servers registered by earlier hub processes, and knows how to kill
//! whole process groups so agent children never leak.

pub mod client;
pub mod error;
pub mod registry;
pub mod supervisor;
pub mod terminate;

pub use client::{AgentClient, HealthInfo, TurnEventSink, TurnOutcome, TurnRequest};
pub use error::AgentError;
pub use registry::{
    delete_process_record, read_process_record, reap_managed_processes, write_process_record,
    ProcessRecord, ReapSummary,
};
pub use supervisor::{AgentSupervisor, AgentSupervisorConfig, HandleInfo};
pub use terminate::{pid_is_running, terminate_record};
