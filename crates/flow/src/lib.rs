// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! car-flow: the flow execution engine.
//!
//! Static step-graph definitions, a pausable/resumable runtime over the
//! SQLite store, the public controller API, detached worker processes,
//! the reconciler that repairs runs whose workers died, and the ticket
//! engine — the canonical `ticket_flow` definition.

pub mod archive;
pub mod controller;
pub mod definition;
pub mod error;
pub mod outbox;
pub mod reconciler;
pub mod runtime;
pub mod ticket;
pub mod worker;

pub use archive::{archive_flow_run_artifacts, ArchiveRunSummary};
pub use controller::{EventStream, FlowController, LifecycleSink};
pub use definition::{
    FlowDefinition, FlowStep, StepContext, StepEvent, StepEventEmitter, StepOutcome,
};
pub use error::FlowError;
pub use outbox::{
    archive_dispatch, ensure_outbox_dirs, latest_seq, read_unconsumed_reply,
    resolve_outbox_paths, ArchiveMeta, ArchivedDispatch, OutboxPaths,
};
pub use reconciler::{
    reconcile_flow_run, reconcile_flow_runs, resolve_flow_transition, run_reconcile_loop,
    FlowReconcileResult, FlowReconcileSummary, TransitionDecision,
};
pub use runtime::{FlowEventListener, FlowRuntime, NullListener};
pub use ticket::{
    ticket_flow_definition, AgentBackend, AgentPool, SupervisorBackend, TicketEngineState,
    TicketFlowDeps, RUN_ONE_TURN, TICKET_FLOW_TYPE,
};
pub use worker::{
    check_worker_health, clear_worker_metadata, read_worker_crash_info, run_worker,
    spawn_flow_worker, worker_stderr_tail, write_worker_crash_info, write_worker_exit,
    write_worker_meta, CrashInfo, WorkerHealth, WorkerMeta, WorkerStatus,
};
