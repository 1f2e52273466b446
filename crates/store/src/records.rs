// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Row types for the flow store, plus the column-update sentinel.

use car_core::{FlowEventType, FlowStatus, RunId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Column-update sentinel: `Keep` preserves the stored value (the
/// source's `UNSET`), `Set(None)` explicitly nulls it, `Set(Some(_))`
/// overwrites it.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Patch<T> {
    #[default]
    Keep,
    Set(Option<T>),
}

impl<T> Patch<T> {
    pub fn set(value: T) -> Self {
        Self::Set(Some(value))
    }

    pub fn clear() -> Self {
        Self::Set(None)
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep)
    }

    /// Resolve against the currently stored value.
    pub fn resolve(self, current: Option<T>) -> Option<T> {
        match self {
            Self::Keep => current,
            Self::Set(next) => next,
        }
    }
}

impl<T> From<T> for Patch<T> {
    fn from(value: T) -> Self {
        Self::Set(Some(value))
    }
}

/// One flow run row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRunRecord {
    pub id: RunId,
    pub flow_type: String,
    pub status: FlowStatus,
    pub current_step: String,
    pub input_data: Value,
    pub state: Value,
    pub metadata: Value,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub stop_requested: bool,
}

impl FlowRunRecord {
    /// Convenience accessor into `input_data` string fields.
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.input_data.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
    }
}

/// One append-only flow event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEventRecord {
    pub id: String,
    pub run_id: RunId,
    pub seq: i64,
    pub event_type: FlowEventType,
    pub data: Value,
    pub created_at: String,
}

/// One artifact row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowArtifactRecord {
    pub id: String,
    pub run_id: RunId,
    pub kind: String,
    pub path: String,
    pub metadata: Value,
    pub created_at: String,
}

/// Parameters for creating a flow run.
#[derive(Debug, Clone)]
pub struct NewFlowRun {
    pub run_id: RunId,
    pub flow_type: String,
    pub input_data: Value,
    pub metadata: Option<Value>,
    pub state: Option<Value>,
    pub current_step: String,
}

#[cfg(test)]
#[path = "records_tests.rs"]
mod tests;
