// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for agent supervision

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The subprocess failed to announce a base URL or exited early.
    #[error("agent startup failed: {0}")]
    Startup(String),
    /// Attaching to a registered server was rejected as unauthorized.
    #[error("agent attach unauthorized (HTTP {status}); check {password_env}")]
    AttachAuth { status: u16, password_env: String },
    /// The registered server's API shape does not match this client.
    #[error("agent attach endpoint mismatch (HTTP {status})")]
    AttachEndpointMismatch { status: u16 },
    /// The registered server URL was unreachable.
    #[error("agent attach connect failed: {0}")]
    AttachConnect(String),
    /// The agent returned an unparseable or error-shaped payload.
    #[error("agent protocol error: {0}")]
    Protocol(String),
    /// The server went away mid-turn.
    #[error("app server disconnected: {0}")]
    Disconnected(String),
    /// The per-turn deadline elapsed.
    #[error("turn timed out after {seconds}s")]
    TurnTimeout { seconds: u64 },
    /// The turn was aborted by a cooperative stop request.
    #[error("turn aborted by stop request")]
    TurnAborted,
    #[error("supervisor error: {0}")]
    Supervisor(String),
    #[error(transparent)]
    Fs(#[from] car_core::FsError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
