// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the flow controller

use super::*;
use crate::definition::{FlowStep, StepContext, StepOutcome};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

struct CompleteStep;

#[async_trait]
impl FlowStep for CompleteStep {
    async fn run(&self, _ctx: &StepContext, _state: &Value) -> Result<StepOutcome, FlowError> {
        Ok(StepOutcome::complete())
    }
}

struct PauseOnce {
    paused: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl FlowStep for PauseOnce {
    async fn run(&self, _ctx: &StepContext, _state: &Value) -> Result<StepOutcome, FlowError> {
        if !self.paused.swap(true, std::sync::atomic::Ordering::SeqCst) {
            let mut patch = serde_json::Map::new();
            patch.insert(
                "ticket_engine".to_string(),
                json!({
                    "status": "paused",
                    "reason": "need credentials",
                    "reason_code": "max_turns",
                    "total_turns": 7,
                }),
            );
            Ok(StepOutcome::pause("Reason: need credentials").with_state_patch(patch))
        } else {
            Ok(StepOutcome::complete())
        }
    }
}

fn definition(step: Arc<dyn FlowStep>) -> FlowDefinition {
    FlowDefinition::new("ticket_flow", "run_one_turn").with_step("run_one_turn", step)
}

fn controller(dir: &TempDir, step: Arc<dyn FlowStep>) -> FlowController {
    FlowController::new(
        definition(step),
        &dir.path().join(".codex-autorunner/flows.db"),
        &dir.path().join(".codex-autorunner/flows"),
        false,
        "repo-a",
        None,
    )
    .unwrap()
}

#[tokio::test]
async fn start_flow_creates_pending_run_and_artifacts_dir() {
    let dir = TempDir::new().unwrap();
    let controller = controller(&dir, Arc::new(CompleteStep));
    let record = controller
        .start_flow(json!({"workspace_root": dir.path()}), None, None, None)
        .await
        .unwrap();
    assert_eq!(record.status, FlowStatus::Pending);
    assert_eq!(record.current_step, "run_one_turn");
    assert!(controller.artifacts_dir(record.id.as_str()).is_dir());
}

#[tokio::test]
async fn start_flow_rejects_duplicate_run_id() {
    let dir = TempDir::new().unwrap();
    let controller = controller(&dir, Arc::new(CompleteStep));
    let record = controller.start_flow(json!({}), None, None, None).await.unwrap();
    let err = controller
        .start_flow(json!({}), Some(record.id.clone()), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::RunExists(_)));
}

#[tokio::test]
async fn stop_flow_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let controller = controller(&dir, Arc::new(CompleteStep));
    let record = controller.start_flow(json!({}), None, None, None).await.unwrap();
    let first = controller.stop_flow(record.id.as_str()).await.unwrap();
    let second = controller.stop_flow(record.id.as_str()).await.unwrap();
    assert!(first.stop_requested && second.stop_requested);
    assert_eq!(first.status, second.status);
}

#[tokio::test]
async fn stop_flow_moves_running_to_stopping() {
    let dir = TempDir::new().unwrap();
    let controller = controller(&dir, Arc::new(CompleteStep));
    let record = controller.start_flow(json!({}), None, None, None).await.unwrap();
    controller
        .store()
        .update_flow_run_status(
            record.id.as_str(),
            FlowStatus::Running,
            car_store::Patch::Keep,
            car_store::Patch::Keep,
            car_store::Patch::Keep,
        )
        .unwrap();
    let stopped = controller.stop_flow(record.id.as_str()).await.unwrap();
    assert_eq!(stopped.status, FlowStatus::Stopping);
    assert!(stopped.stop_requested);
}

#[tokio::test]
async fn resume_sanitizes_engine_state() {
    let dir = TempDir::new().unwrap();
    let controller = controller(&dir, Arc::new(PauseOnce {
        paused: std::sync::atomic::AtomicBool::new(false),
    }));
    let record = controller.start_flow(json!({}), None, None, None).await.unwrap();
    let paused = controller.run_flow(record.id.as_str(), None).await.unwrap();
    assert_eq!(paused.status, FlowStatus::Paused);
    assert_eq!(paused.state["ticket_engine"]["reason_code"], "max_turns");

    let resumed = controller.resume_flow(record.id.as_str()).await.unwrap();
    assert_eq!(resumed.status, FlowStatus::Running);
    assert!(resumed.error_message.is_none());
    let engine = &resumed.state["ticket_engine"];
    assert_eq!(engine["status"], "running");
    assert!(engine.get("reason").is_none());
    assert!(engine.get("reason_code").is_none());
    // max_turns failures reset the turn budget.
    assert_eq!(engine["total_turns"], 0);

    let done = controller.run_flow(record.id.as_str(), None).await.unwrap();
    assert_eq!(done.status, FlowStatus::Completed);
}

#[tokio::test]
async fn resume_of_running_run_is_rejected() {
    let dir = TempDir::new().unwrap();
    let controller = controller(&dir, Arc::new(CompleteStep));
    let record = controller.start_flow(json!({}), None, None, None).await.unwrap();
    controller
        .store()
        .update_flow_run_status(
            record.id.as_str(),
            FlowStatus::Running,
            car_store::Patch::Keep,
            car_store::Patch::Keep,
            car_store::Patch::Keep,
        )
        .unwrap();
    let err = controller.resume_flow(record.id.as_str()).await.unwrap_err();
    assert!(matches!(err, FlowError::AlreadyActive(_)));
}

#[tokio::test]
async fn resume_of_completed_run_only_clears_stop_flag() {
    let dir = TempDir::new().unwrap();
    let controller = controller(&dir, Arc::new(CompleteStep));
    let record = controller.start_flow(json!({}), None, None, None).await.unwrap();
    controller.run_flow(record.id.as_str(), None).await.unwrap();
    let resumed = controller.resume_flow(record.id.as_str()).await.unwrap();
    assert_eq!(resumed.status, FlowStatus::Completed);
    assert!(!resumed.stop_requested);
}

#[tokio::test]
async fn stream_events_yields_history_then_ends_on_terminal() {
    let dir = TempDir::new().unwrap();
    let controller = controller(&dir, Arc::new(CompleteStep));
    let record = controller.start_flow(json!({}), None, None, None).await.unwrap();
    controller.run_flow(record.id.as_str(), None).await.unwrap();

    let mut stream = controller
        .stream_events(record.id.as_str(), None)
        .with_poll_interval(Duration::from_millis(10));
    let mut types = Vec::new();
    while let Some(event) = stream.next().await.unwrap() {
        types.push(event.event_type.as_str().to_string());
    }
    assert_eq!(types, vec!["flow_started", "step_started", "flow_completed"]);
}

struct LifecycleCapture(Mutex<Vec<(String, String, String)>>);

impl LifecycleSink for LifecycleCapture {
    fn emit(&self, event_type: LifecycleEventType, repo_id: &str, run_id: &str, _data: &Value) {
        self.0.lock().push((
            event_type.as_str().to_string(),
            repo_id.to_string(),
            run_id.to_string(),
        ));
    }
}

#[tokio::test]
async fn lifecycle_sink_sees_terminal_transitions() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(LifecycleCapture(Mutex::new(Vec::new())));
    let controller = FlowController::new(
        definition(Arc::new(CompleteStep)),
        &dir.path().join(".codex-autorunner/flows.db"),
        &dir.path().join(".codex-autorunner/flows"),
        false,
        "repo-a",
        Some(sink.clone()),
    )
    .unwrap();
    let record = controller.start_flow(json!({}), None, None, None).await.unwrap();
    controller.run_flow(record.id.as_str(), None).await.unwrap();

    let seen = sink.0.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "flow_completed");
    assert_eq!(seen[0].1, "repo-a");
    assert_eq!(seen[0].2, record.id.as_str());
}
