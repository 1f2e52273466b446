// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for the flow engine

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Store(#[from] car_store::StoreError),
    #[error(transparent)]
    Fs(#[from] car_core::FsError),
    #[error(transparent)]
    Ticket(#[from] car_core::TicketError),
    #[error(transparent)]
    Dispatch(#[from] car_core::DispatchError),
    #[error(transparent)]
    Config(#[from] car_core::ConfigError),
    #[error(transparent)]
    Agent(#[from] car_agent::AgentError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("flow run not found: {0}")]
    RunNotFound(String),
    #[error("flow run already exists: {0}")]
    RunExists(String),
    #[error("flow run is already active: {0}")]
    AlreadyActive(String),
    #[error("flow run cannot be resumed from status {status}: {run_id}")]
    NotResumable { run_id: String, status: String },
    #[error("invalid flow definition: {0}")]
    InvalidDefinition(String),
    #[error("step not found in definition: {0}")]
    StepNotFound(String),
    #[error("dispatch archive seq {seq} already exists at {dir}")]
    ArchiveConflict { seq: u64, dir: PathBuf },
    #[error("worker error: {0}")]
    Worker(String),
}
