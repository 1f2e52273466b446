// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for hub services

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Flow(#[from] car_flow::FlowError),
    #[error(transparent)]
    Store(#[from] car_store::StoreError),
    #[error(transparent)]
    Config(#[from] car_core::ConfigError),
    #[error(transparent)]
    Fs(#[from] car_core::FsError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("runtime services already closed")]
    Closed,
}
