// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! car-core: shared vocabulary for the codex-autorunner (car) hub.
//!
//! Ids, clocks, timestamps, atomic file I/O and advisory locks, the
//! flow status/event vocabulary, ticket and dispatch documents, and
//! per-repo configuration.

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod flow;
mod frontmatter;
pub mod fsio;
pub mod id;
pub mod paths;
pub mod ticket;
pub mod time_fmt;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{
    AgentServerConfig, ConfigError, RepoConfig, ServerScope, SupervisorConfig, TicketConfig,
};
pub use dispatch::{DispatchDoc, DispatchError, DispatchMode};
pub use flow::{FlowEventType, FlowStatus, LifecycleEventType};
pub use fsio::{atomic_write, atomic_write_json, read_json, FileLock, FsError};
pub use id::{short, ArtifactId, FlowEventId, LifecycleEventId, RunId, WorkspaceId};
pub use ticket::{
    list_ticket_docs, list_ticket_paths, parse_ticket_index, TicketDoc, TicketError,
    TicketFrontmatter,
};
pub use time_fmt::{format_iso_utc, now_iso_utc, now_iso_utc_micros, parse_iso_utc};
