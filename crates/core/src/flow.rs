// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Flow status and event vocabulary shared across the store, runtime,
//! reconciler, and lifecycle bus.

use serde::{Deserialize, Serialize};

/// Status of a flow run.
///
/// Terminal statuses (`completed`, `failed`, `stopped`) never
/// transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    Running,
    Paused,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Statuses the reconciler inspects: a worker may exist for these.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Stopping | Self::Paused)
    }

    pub fn is_paused(self) -> bool {
        matches!(self, Self::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of an append-only flow event row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEventType {
    FlowStarted,
    StepStarted,
    StepCompleted,
    FlowPaused,
    FlowStopping,
    FlowCompleted,
    FlowFailed,
    FlowStopped,
    AppServerEvent,
    DispatchCreated,
}

impl FlowEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FlowStarted => "flow_started",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::FlowPaused => "flow_paused",
            Self::FlowStopping => "flow_stopping",
            Self::FlowCompleted => "flow_completed",
            Self::FlowFailed => "flow_failed",
            Self::FlowStopped => "flow_stopped",
            Self::AppServerEvent => "app_server_event",
            Self::DispatchCreated => "dispatch_created",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "flow_started" => Some(Self::FlowStarted),
            "step_started" => Some(Self::StepStarted),
            "step_completed" => Some(Self::StepCompleted),
            "flow_paused" => Some(Self::FlowPaused),
            "flow_stopping" => Some(Self::FlowStopping),
            "flow_completed" => Some(Self::FlowCompleted),
            "flow_failed" => Some(Self::FlowFailed),
            "flow_stopped" => Some(Self::FlowStopped),
            "app_server_event" => Some(Self::AppServerEvent),
            "dispatch_created" => Some(Self::DispatchCreated),
            _ => None,
        }
    }
}

impl std::fmt::Display for FlowEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hub-scope lifecycle event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventType {
    FlowPaused,
    FlowCompleted,
    FlowFailed,
    FlowStopped,
    DispatchCreated,
}

impl LifecycleEventType {
    /// Terminal flow events are deduplicated by the lifecycle store.
    pub fn is_terminal_flow_event(self) -> bool {
        matches!(self, Self::FlowCompleted | Self::FlowFailed | Self::FlowStopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FlowPaused => "flow_paused",
            Self::FlowCompleted => "flow_completed",
            Self::FlowFailed => "flow_failed",
            Self::FlowStopped => "flow_stopped",
            Self::DispatchCreated => "dispatch_created",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "flow_paused" => Some(Self::FlowPaused),
            "flow_completed" => Some(Self::FlowCompleted),
            "flow_failed" => Some(Self::FlowFailed),
            "flow_stopped" => Some(Self::FlowStopped),
            "dispatch_created" => Some(Self::DispatchCreated),
            _ => None,
        }
    }
}

impl std::fmt::Display for LifecycleEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "flow_tests.rs"]
mod tests;
