// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The public flow API used by the CLI, web surface, and workers.

use crate::definition::FlowDefinition;
use crate::error::FlowError;
use crate::runtime::{FlowEventListener, FlowRuntime};
use car_core::{FlowEventType, FlowStatus, LifecycleEventType, RunId};
use car_store::{FlowArtifactRecord, FlowEventRecord, FlowRunRecord, FlowStore, NewFlowRun, Patch};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Sink for hub-scope lifecycle mirroring. Implemented by the hub's
/// lifecycle emitter; the controller never talks to the bus directly.
pub trait LifecycleSink: Send + Sync {
    fn emit(&self, event_type: LifecycleEventType, repo_id: &str, run_id: &str, data: &Value);
}

/// Bridges persisted flow events onto the lifecycle bus.
struct LifecycleBridge {
    repo_id: String,
    sink: Arc<dyn LifecycleSink>,
}

impl FlowEventListener for LifecycleBridge {
    fn on_event(&self, event: &FlowEventRecord) {
        let lifecycle_type = match event.event_type {
            FlowEventType::FlowPaused => LifecycleEventType::FlowPaused,
            FlowEventType::FlowCompleted => LifecycleEventType::FlowCompleted,
            FlowEventType::FlowFailed => LifecycleEventType::FlowFailed,
            FlowEventType::FlowStopped => LifecycleEventType::FlowStopped,
            FlowEventType::DispatchCreated => LifecycleEventType::DispatchCreated,
            _ => return,
        };
        self.sink.emit(lifecycle_type, &self.repo_id, event.run_id.as_str(), &event.data);
    }
}

struct NullBridge;

impl FlowEventListener for NullBridge {
    fn on_event(&self, _event: &FlowEventRecord) {}
}

pub struct FlowController {
    definition: Arc<FlowDefinition>,
    store: Arc<FlowStore>,
    artifacts_root: PathBuf,
    listener: Arc<dyn FlowEventListener>,
    /// Serializes run creation and resumption.
    start_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for FlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowController")
            .field("artifacts_root", &self.artifacts_root)
            .finish_non_exhaustive()
    }
}

impl FlowController {
    pub fn new(
        definition: FlowDefinition,
        db_path: &Path,
        artifacts_root: &Path,
        durable: bool,
        repo_id: &str,
        lifecycle: Option<Arc<dyn LifecycleSink>>,
    ) -> Result<Self, FlowError> {
        definition.validate()?;
        let store = Arc::new(FlowStore::open(db_path, durable)?);
        std::fs::create_dir_all(artifacts_root)?;
        let listener: Arc<dyn FlowEventListener> = match lifecycle {
            Some(sink) => Arc::new(LifecycleBridge { repo_id: repo_id.to_string(), sink }),
            None => Arc::new(NullBridge),
        };
        Ok(Self {
            definition: Arc::new(definition),
            store,
            artifacts_root: artifacts_root.to_path_buf(),
            listener,
            start_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn flow_type(&self) -> &str {
        self.definition.flow_type()
    }

    pub fn store(&self) -> &Arc<FlowStore> {
        &self.store
    }

    /// Create a run in `pending` and prepare its artifacts directory.
    /// Does not execute anything.
    pub async fn start_flow(
        &self,
        input_data: Value,
        run_id: Option<RunId>,
        initial_state: Option<Value>,
        metadata: Option<Value>,
    ) -> Result<FlowRunRecord, FlowError> {
        let run_id = run_id.unwrap_or_default();
        let _guard = self.start_lock.lock().await;
        if self.store.get_flow_run(run_id.as_str())?.is_some() {
            return Err(FlowError::RunExists(run_id.to_string()));
        }
        std::fs::create_dir_all(self.artifacts_dir(run_id.as_str()))?;
        let record = self.store.create_flow_run(NewFlowRun {
            run_id: run_id.clone(),
            flow_type: self.definition.flow_type().to_string(),
            input_data,
            metadata,
            state: initial_state,
            current_step: self.definition.initial_step().to_string(),
        })?;
        tracing::info!(run_id = %run_id, flow_type = %record.flow_type, "flow run created");
        Ok(record)
    }

    /// Run or resume a flow in-process (workers and tests).
    pub async fn run_flow(
        &self,
        run_id: &str,
        initial_state: Option<Value>,
    ) -> Result<FlowRunRecord, FlowError> {
        let runtime = FlowRuntime::new(
            self.definition.clone(),
            self.store.clone(),
            self.listener.clone(),
        );
        runtime.run_flow(run_id, initial_state).await
    }

    /// Raise the stop flag. Running flows also move to `stopping`.
    /// Purely a soft signal; no process is touched.
    pub async fn stop_flow(&self, run_id: &str) -> Result<FlowRunRecord, FlowError> {
        let record = self.store.set_stop_requested(run_id, true)?;
        if record.status == FlowStatus::Running {
            return Ok(self.store.update_flow_run_status(
                run_id,
                FlowStatus::Stopping,
                Patch::Keep,
                Patch::Keep,
                Patch::Keep,
            )?);
        }
        Ok(record)
    }

    /// Clear the stop flag and put a parked run back into `running`,
    /// scrubbing stale pause/failure bookkeeping from the engine state.
    pub async fn resume_flow(&self, run_id: &str) -> Result<FlowRunRecord, FlowError> {
        let _guard = self.start_lock.lock().await;
        let record = self
            .store
            .get_flow_run(run_id)?
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))?;
        if record.status == FlowStatus::Running {
            return Err(FlowError::AlreadyActive(run_id.to_string()));
        }
        let cleared = self.store.set_stop_requested(run_id, false)?;
        if record.status == FlowStatus::Completed {
            return Ok(cleared);
        }
        let state = sanitize_resume_state(&cleared.state);
        Ok(self.store.update_flow_run_status(
            run_id,
            FlowStatus::Running,
            Patch::set(state),
            Patch::Keep,
            Patch::clear(),
        )?)
    }

    pub fn get_status(&self, run_id: &str) -> Result<Option<FlowRunRecord>, FlowError> {
        Ok(self.store.get_flow_run(run_id)?)
    }

    pub fn list_runs(&self, status: Option<FlowStatus>) -> Result<Vec<FlowRunRecord>, FlowError> {
        Ok(self.store.list_flow_runs(Some(self.definition.flow_type()), status)?)
    }

    pub fn get_events(
        &self,
        run_id: &str,
        after_seq: Option<i64>,
    ) -> Result<Vec<FlowEventRecord>, FlowError> {
        Ok(self.store.get_events(run_id, after_seq, None)?)
    }

    pub fn last_event_meta(&self, run_id: &str) -> Result<Option<(i64, String)>, FlowError> {
        Ok(self.store.get_last_event_meta(run_id)?)
    }

    pub fn get_artifacts(&self, run_id: &str) -> Result<Vec<FlowArtifactRecord>, FlowError> {
        Ok(self.store.get_artifacts(run_id)?)
    }

    pub fn artifacts_dir(&self, run_id: &str) -> PathBuf {
        self.artifacts_root.join(run_id)
    }

    /// Follow a run's events from `after_seq`, polling the store until
    /// the run is terminal (or paused) with nothing new.
    pub fn stream_events(&self, run_id: &str, after_seq: Option<i64>) -> EventStream {
        EventStream {
            store: self.store.clone(),
            run_id: run_id.to_string(),
            last_seq: after_seq.unwrap_or(0),
            buffered: Vec::new(),
            done: false,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Poll-based event follower returned by [`FlowController::stream_events`].
pub struct EventStream {
    store: Arc<FlowStore>,
    run_id: String,
    last_seq: i64,
    buffered: Vec<FlowEventRecord>,
    done: bool,
    poll_interval: Duration,
}

impl EventStream {
    /// The next event, or `None` once the run has settled.
    pub async fn next(&mut self) -> Result<Option<FlowEventRecord>, FlowError> {
        loop {
            if let Some(event) = self.pop_buffered() {
                return Ok(Some(event));
            }
            if self.done {
                return Ok(None);
            }
            let events = self.store.get_events(&self.run_id, Some(self.last_seq), Some(100))?;
            if events.is_empty() {
                let record = self.store.get_flow_run(&self.run_id)?;
                let settled = record
                    .map(|r| r.status.is_terminal() || r.status.is_paused())
                    .unwrap_or(true);
                if settled {
                    self.done = true;
                    return Ok(None);
                }
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }
            self.buffered = events;
            self.buffered.reverse();
        }
    }

    fn pop_buffered(&mut self) -> Option<FlowEventRecord> {
        let event = self.buffered.pop()?;
        self.last_seq = event.seq;
        Some(event)
    }

    #[cfg(test)]
    pub(crate) fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Scrub pause/failure bookkeeping before a resume: the engine's
/// `reason*` fields go away, a `max_turns` failure resets the turn
/// budget, and the engine status returns to running.
fn sanitize_resume_state(state: &Value) -> Value {
    let mut root = match state {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    root.remove("reason_summary");
    if let Some(Value::Object(engine)) = root.get("ticket_engine") {
        let mut engine = engine.clone();
        if engine.get("reason_code").and_then(Value::as_str) == Some("max_turns") {
            engine.insert("total_turns".to_string(), json!(0));
        }
        engine.insert("status".to_string(), json!("running"));
        engine.remove("reason");
        engine.remove("reason_details");
        engine.remove("reason_code");
        root.insert("ticket_engine".to_string(), Value::Object(engine));
    }
    Value::Object(root)
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
