// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The flow runtime: drives one run through its step graph, persisting
//! every transition and translating step failures into `failed` runs
//! instead of propagating them.

use crate::definition::{FlowDefinition, StepContext, StepEvent, StepEventEmitter, StepOutcome};
use crate::error::FlowError;
use car_core::{FlowEventId, FlowEventType, FlowStatus, RunId};
use car_store::{FlowEventRecord, FlowRunRecord, FlowStore, Patch};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Observes every event the runtime persists. The controller uses this
/// to mirror lifecycle transitions onto the hub bus.
pub trait FlowEventListener: Send + Sync {
    fn on_event(&self, event: &FlowEventRecord);
}

/// Listener that ignores everything.
pub struct NullListener;

impl FlowEventListener for NullListener {
    fn on_event(&self, _event: &FlowEventRecord) {}
}

pub(crate) struct RuntimeEmitter {
    store: Arc<FlowStore>,
    run_id: RunId,
    listener: Arc<dyn FlowEventListener>,
}

impl RuntimeEmitter {
    pub(crate) fn new(
        store: Arc<FlowStore>,
        run_id: RunId,
        listener: Arc<dyn FlowEventListener>,
    ) -> Self {
        Self { store, run_id, listener }
    }
}

impl StepEventEmitter for RuntimeEmitter {
    fn emit(&self, event_type: FlowEventType, data: Value) -> Result<(), FlowError> {
        let event = self.store.create_event(
            FlowEventId::new().as_str(),
            self.run_id.as_str(),
            event_type,
            data,
        )?;
        self.listener.on_event(&event);
        Ok(())
    }
}

pub struct FlowRuntime {
    definition: Arc<FlowDefinition>,
    store: Arc<FlowStore>,
    listener: Arc<dyn FlowEventListener>,
}

impl FlowRuntime {
    pub fn new(
        definition: Arc<FlowDefinition>,
        store: Arc<FlowStore>,
        listener: Arc<dyn FlowEventListener>,
    ) -> Self {
        Self { definition, store, listener }
    }

    /// Run (or resume) a flow to its next terminal or paused state.
    ///
    /// Completed runs refuse to start again; `stopped` and `failed`
    /// runs are resumable. A stop flag raised before the first step
    /// moves the run straight to `stopped` with zero step invocations.
    pub async fn run_flow(
        &self,
        run_id: &str,
        initial_state: Option<Value>,
    ) -> Result<FlowRunRecord, FlowError> {
        let record = self
            .store
            .get_flow_run(run_id)?
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))?;
        if record.status == FlowStatus::Completed {
            return Err(FlowError::NotResumable {
                run_id: run_id.to_string(),
                status: record.status.as_str().to_string(),
            });
        }

        let emitter = Arc::new(RuntimeEmitter::new(
            self.store.clone(),
            record.id.clone(),
            self.listener.clone(),
        ));

        if record.stop_requested {
            let updated = self.store.update_flow_run_status(
                run_id,
                FlowStatus::Stopped,
                Patch::Keep,
                Patch::Keep,
                Patch::Keep,
            )?;
            emitter
                .emit(FlowEventType::FlowStopped, json!({"reason": "stop requested before start"}))?;
            return Ok(updated);
        }

        let state_patch = match initial_state {
            Some(state) => Patch::set(state),
            None => Patch::Keep,
        };
        let mut record = self.store.update_flow_run_status(
            run_id,
            FlowStatus::Running,
            state_patch,
            Patch::Keep,
            Patch::Keep,
        )?;
        emitter.emit(FlowEventType::FlowStarted, json!({"step": record.current_step}))?;
        tracing::info!(run_id, flow_type = %record.flow_type, "flow running");

        loop {
            // Refresh: the stop flag is raised by other processes.
            record = self
                .store
                .get_flow_run(run_id)?
                .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))?;
            let stopping = record.stop_requested;
            if stopping {
                emitter.emit(FlowEventType::FlowStopping, json!({}))?;
                record = self.store.update_flow_run_status(
                    run_id,
                    FlowStatus::Stopping,
                    Patch::Keep,
                    Patch::Keep,
                    Patch::Keep,
                )?;
            }

            let step_name = record.current_step.clone();
            let step = self
                .definition
                .step(&step_name)
                .ok_or_else(|| FlowError::StepNotFound(step_name.clone()))?;
            emitter.emit(FlowEventType::StepStarted, json!({"step": step_name}))?;

            let ctx = StepContext {
                run_id: record.id.clone(),
                flow_type: record.flow_type.clone(),
                input_data: record.input_data.clone(),
                metadata: record.metadata.clone(),
                should_stop: self.should_stop_probe(run_id, stopping),
                events: emitter.clone(),
            };

            // The error boundary: step failures become `Fail`, never
            // propagated panics or errors.
            let outcome = match step.run(&ctx, &record.state).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(run_id, step = %step_name, error = %e, "step errored");
                    StepOutcome::fail(e.to_string())
                }
            };

            match outcome {
                StepOutcome::Continue { next_step, state_patch, events } => {
                    if self.definition.step(&next_step).is_none() {
                        let error = format!("step {step_name} continued to unknown step {next_step}");
                        record = self.finish(
                            &emitter,
                            run_id,
                            &record,
                            FlowStatus::Failed,
                            None,
                            Some(error.clone()),
                            FlowEventType::FlowFailed,
                            json!({"error": error}),
                            Vec::new(),
                        )?;
                        return Ok(record);
                    }
                    let state = merged_state(&record.state, state_patch);
                    self.store.update_flow_run_status(
                        run_id,
                        if stopping { FlowStatus::Stopping } else { FlowStatus::Running },
                        Patch::set(state),
                        Patch::Keep,
                        Patch::Keep,
                    )?;
                    self.store.set_current_step(run_id, &next_step)?;
                    emitter.emit(
                        FlowEventType::StepCompleted,
                        json!({"step": step_name, "next": next_step}),
                    )?;
                    emit_all(&emitter, events)?;
                }
                StepOutcome::Pause { reason, state_patch, events } => {
                    record = self.finish(
                        &emitter,
                        run_id,
                        &record,
                        FlowStatus::Paused,
                        state_patch,
                        Some(reason.clone()),
                        FlowEventType::FlowPaused,
                        json!({"reason": reason}),
                        events,
                    )?;
                    tracing::info!(run_id, "flow paused");
                    return Ok(record);
                }
                StepOutcome::Complete { state_patch, events } => {
                    record = self.finish(
                        &emitter,
                        run_id,
                        &record,
                        FlowStatus::Completed,
                        state_patch,
                        None,
                        FlowEventType::FlowCompleted,
                        json!({}),
                        events,
                    )?;
                    tracing::info!(run_id, "flow completed");
                    return Ok(record);
                }
                StepOutcome::Fail { error, state_patch, events } => {
                    record = self.finish(
                        &emitter,
                        run_id,
                        &record,
                        FlowStatus::Failed,
                        state_patch,
                        Some(error.clone()),
                        FlowEventType::FlowFailed,
                        json!({"error": error}),
                        events,
                    )?;
                    tracing::warn!(run_id, error = %record.error_message.as_deref().unwrap_or(""), "flow failed");
                    return Ok(record);
                }
                StepOutcome::Stop { reason, state_patch, events } => {
                    record = self.finish(
                        &emitter,
                        run_id,
                        &record,
                        FlowStatus::Stopped,
                        state_patch,
                        None,
                        FlowEventType::FlowStopped,
                        json!({"reason": reason}),
                        events,
                    )?;
                    tracing::info!(run_id, "flow stopped");
                    return Ok(record);
                }
            }
        }
    }

    /// Cooperative cancellation probe handed to steps. When the run is
    /// already `stopping` the probe is constantly true.
    fn should_stop_probe(
        &self,
        run_id: &str,
        forced: bool,
    ) -> Arc<dyn Fn() -> bool + Send + Sync> {
        let store = self.store.clone();
        let run_id = run_id.to_string();
        Arc::new(move || {
            forced
                || store
                    .get_flow_run(&run_id)
                    .ok()
                    .flatten()
                    .map(|r| r.stop_requested)
                    .unwrap_or(false)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        emitter: &Arc<RuntimeEmitter>,
        run_id: &str,
        record: &FlowRunRecord,
        status: FlowStatus,
        state_patch: Option<Map<String, Value>>,
        error_message: Option<String>,
        event_type: FlowEventType,
        event_data: Value,
        events: Vec<StepEvent>,
    ) -> Result<FlowRunRecord, FlowError> {
        let state = merged_state(&record.state, state_patch);
        let error_patch = match error_message {
            Some(message) => Patch::set(message),
            None => Patch::Keep,
        };
        let updated = self.store.update_flow_run_status(
            run_id,
            status,
            Patch::set(state),
            Patch::Keep,
            error_patch,
        )?;
        emit_all(emitter, events)?;
        emitter.emit(event_type, event_data)?;
        Ok(updated)
    }
}

fn emit_all(emitter: &Arc<RuntimeEmitter>, events: Vec<StepEvent>) -> Result<(), FlowError> {
    for event in events {
        emitter.emit(event.event_type, event.data)?;
    }
    Ok(())
}

/// Merge a step's patch into the current state at top-level keys.
fn merged_state(current: &Value, patch: Option<Map<String, Value>>) -> Value {
    let mut state = match current {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Some(patch) = patch {
        for (key, value) in patch {
            state.insert(key, value);
        }
    }
    Value::Object(state)
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
