// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Static flow definitions: a named graph of steps and the outcome
//! vocabulary steps use to drive the runtime.

use crate::error::FlowError;
use async_trait::async_trait;
use car_core::{FlowEventType, RunId};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// An extra event a step asks the runtime to record.
#[derive(Debug, Clone)]
pub struct StepEvent {
    pub event_type: FlowEventType,
    pub data: Value,
}

/// What a step tells the runtime to do next.
///
/// Steps never mutate the store; they return a `state_patch` (merged
/// into the run state at top-level keys) plus one of these outcomes.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Advance to `next_step` and keep running.
    Continue {
        next_step: String,
        state_patch: Option<Map<String, Value>>,
        events: Vec<StepEvent>,
    },
    /// The flow is done.
    Complete { state_patch: Option<Map<String, Value>>, events: Vec<StepEvent> },
    /// Park the run until an external resume.
    Pause {
        reason: String,
        state_patch: Option<Map<String, Value>>,
        events: Vec<StepEvent>,
    },
    /// The flow failed.
    Fail {
        error: String,
        state_patch: Option<Map<String, Value>>,
        events: Vec<StepEvent>,
    },
    /// Response to a stop request.
    Stop {
        reason: String,
        state_patch: Option<Map<String, Value>>,
        events: Vec<StepEvent>,
    },
}

impl StepOutcome {
    pub fn continue_to(next_step: impl Into<String>) -> Self {
        Self::Continue { next_step: next_step.into(), state_patch: None, events: Vec::new() }
    }

    pub fn complete() -> Self {
        Self::Complete { state_patch: None, events: Vec::new() }
    }

    pub fn pause(reason: impl Into<String>) -> Self {
        Self::Pause { reason: reason.into(), state_patch: None, events: Vec::new() }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self::Fail { error: error.into(), state_patch: None, events: Vec::new() }
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        Self::Stop { reason: reason.into(), state_patch: None, events: Vec::new() }
    }

    pub fn with_state_patch(mut self, patch: Map<String, Value>) -> Self {
        match &mut self {
            Self::Continue { state_patch, .. }
            | Self::Complete { state_patch, .. }
            | Self::Pause { state_patch, .. }
            | Self::Fail { state_patch, .. }
            | Self::Stop { state_patch, .. } => *state_patch = Some(patch),
        }
        self
    }

}

/// Records events on behalf of a running step (live streaming during
/// agent turns goes through here, not through returned events).
pub trait StepEventEmitter: Send + Sync {
    fn emit(&self, event_type: FlowEventType, data: Value) -> Result<(), FlowError>;
}

/// Everything a step may look at while running.
pub struct StepContext {
    pub run_id: RunId,
    pub flow_type: String,
    pub input_data: Value,
    pub metadata: Value,
    /// Cooperative cancellation: long-running work must poll this.
    pub should_stop: Arc<dyn Fn() -> bool + Send + Sync>,
    pub events: Arc<dyn StepEventEmitter>,
}

impl StepContext {
    pub fn should_stop(&self) -> bool {
        (*self.should_stop)()
    }
}

/// One node in a flow graph.
#[async_trait]
pub trait FlowStep: Send + Sync {
    /// Execute the step against a snapshot of the run state.
    async fn run(&self, ctx: &StepContext, state: &Value) -> Result<StepOutcome, FlowError>;

    /// Step names this step may `Continue` to, for validation.
    fn next_steps(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A named, static step graph.
pub struct FlowDefinition {
    flow_type: String,
    initial_step: String,
    steps: HashMap<String, Arc<dyn FlowStep>>,
}

impl FlowDefinition {
    pub fn new(flow_type: impl Into<String>, initial_step: impl Into<String>) -> Self {
        Self {
            flow_type: flow_type.into(),
            initial_step: initial_step.into(),
            steps: HashMap::new(),
        }
    }

    pub fn with_step(mut self, name: impl Into<String>, step: Arc<dyn FlowStep>) -> Self {
        self.steps.insert(name.into(), step);
        self
    }

    pub fn flow_type(&self) -> &str {
        &self.flow_type
    }

    pub fn initial_step(&self) -> &str {
        &self.initial_step
    }

    pub fn step(&self, name: &str) -> Option<Arc<dyn FlowStep>> {
        self.steps.get(name).cloned()
    }

    /// Every referenced step must exist.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.steps.is_empty() {
            return Err(FlowError::InvalidDefinition(format!(
                "flow {} has no steps",
                self.flow_type
            )));
        }
        if !self.steps.contains_key(&self.initial_step) {
            return Err(FlowError::InvalidDefinition(format!(
                "initial step {} is not defined",
                self.initial_step
            )));
        }
        for (name, step) in &self.steps {
            for next in step.next_steps() {
                if !self.steps.contains_key(&next) {
                    return Err(FlowError::InvalidDefinition(format!(
                        "step {name} references undefined step {next}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "definition_tests.rs"]
mod tests;
