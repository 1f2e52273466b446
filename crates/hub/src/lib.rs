// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! car-hub: hub-scope services on top of the flow engine.
//!
//! The append-only lifecycle event bus with terminal-event
//! deduplication, the attention inbox projected from runs and their
//! dispatch history, the PMA safety layer guarding reactive agent
//! turns, and the lazy per-repo runtime service registry.

pub mod error;
pub mod inbox;
pub mod lifecycle;
pub mod safety;
pub mod services;

pub use error::HubError;
pub use inbox::{
    build_inbox, load_dismissals, record_dismissal, Dismissal, InboxItem, InboxItemType,
};
pub use lifecycle::{
    AppendResult, LifecycleEmitter, LifecycleEvent, LifecycleEventStore,
};
pub use safety::{SafetyChecker, SafetyConfig, SafetyVerdict};
pub use services::{
    build_ticket_flow_resources, FlowRuntimeResources, RuntimeServices,
};
