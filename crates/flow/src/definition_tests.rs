// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

struct StaticStep {
    next: Vec<String>,
}

#[async_trait]
impl FlowStep for StaticStep {
    async fn run(&self, _ctx: &StepContext, _state: &Value) -> Result<StepOutcome, FlowError> {
        Ok(StepOutcome::complete())
    }

    fn next_steps(&self) -> Vec<String> {
        self.next.clone()
    }
}

fn step(next: &[&str]) -> Arc<dyn FlowStep> {
    Arc::new(StaticStep { next: next.iter().map(|s| s.to_string()).collect() })
}

#[test]
fn validate_accepts_closed_graph() {
    let definition = FlowDefinition::new("ticket_flow", "a")
        .with_step("a", step(&["b"]))
        .with_step("b", step(&["a"]));
    definition.validate().unwrap();
}

#[test]
fn validate_rejects_missing_initial_step() {
    let definition = FlowDefinition::new("ticket_flow", "missing").with_step("a", step(&[]));
    assert!(matches!(definition.validate(), Err(FlowError::InvalidDefinition(_))));
}

#[test]
fn validate_rejects_dangling_next_reference() {
    let definition = FlowDefinition::new("ticket_flow", "a").with_step("a", step(&["ghost"]));
    assert!(matches!(definition.validate(), Err(FlowError::InvalidDefinition(_))));
}

#[test]
fn validate_rejects_empty_definition() {
    let definition = FlowDefinition::new("ticket_flow", "a");
    assert!(matches!(definition.validate(), Err(FlowError::InvalidDefinition(_))));
}

#[test]
fn with_state_patch_attaches_to_any_variant() {
    let mut patch = Map::new();
    patch.insert("k".to_string(), Value::from(1));
    let outcome = StepOutcome::pause("waiting").with_state_patch(patch.clone());
    match outcome {
        StepOutcome::Pause { reason, state_patch, .. } => {
            assert_eq!(reason, "waiting");
            assert_eq!(state_patch, Some(patch));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn step_lookup_is_by_name() {
    let definition = FlowDefinition::new("ticket_flow", "a").with_step("a", step(&[]));
    assert!(definition.step("a").is_some());
    assert!(definition.step("b").is_none());
    assert_eq!(definition.flow_type(), "ticket_flow");
    assert_eq!(definition.initial_step(), "a");
}
