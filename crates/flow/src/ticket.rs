// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The ticket engine: the `ticket_flow` definition.
//!
//! One logical step, `run_one_turn`, re-enters itself until every
//! ticket is done or something forces a pause, stop, or failure. Each
//! turn dispatches the first not-done ticket to its agent, archives
//! the produced dispatch, and decides what happens next.

use crate::definition::{FlowDefinition, FlowStep, StepContext, StepOutcome};
use crate::error::FlowError;
use crate::outbox::{
    archive_dispatch, ensure_outbox_dirs, latest_seq, read_unconsumed_reply,
    resolve_outbox_paths, ArchiveMeta, ArchivedDispatch, OutboxPaths,
};
use async_trait::async_trait;
use car_agent::{AgentError, AgentSupervisor, TurnEventSink, TurnOutcome, TurnRequest};
use car_core::{
    list_ticket_docs, paths, DispatchDoc, DispatchMode, FlowEventType, TicketConfig, TicketDoc,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const TICKET_FLOW_TYPE: &str = "ticket_flow";
pub const RUN_ONE_TURN: &str = "run_one_turn";

/// Agent id whose tickets are routed to a human instead of a backend.
const USER_AGENT: &str = "user";

/// Required files larger than this are refused.
const MAX_REQUIRED_FILE_BYTES: u64 = 256 * 1024;

/// Engine state persisted under `state.ticket_engine`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketEngineState {
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub current_ticket: Option<String>,
    #[serde(default)]
    pub total_turns: u32,
    #[serde(default)]
    pub turns_by_ticket: BTreeMap<String, u32>,
    #[serde(default)]
    pub last_dispatch_seq: u64,
    #[serde(default)]
    pub last_reply_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_status() -> String {
    "running".to_string()
}

impl Default for TicketEngineState {
    fn default() -> Self {
        Self {
            status: default_status(),
            current_ticket: None,
            total_turns: 0,
            turns_by_ticket: BTreeMap::new(),
            last_dispatch_seq: 0,
            last_reply_seq: 0,
            reason_code: None,
            reason: None,
            extra: Map::new(),
        }
    }
}

impl TicketEngineState {
    /// Parse from the run's state, tolerating absence or junk.
    pub fn from_state(state: &Value) -> Self {
        state
            .get("ticket_engine")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Top-level state patch carrying this engine state.
    pub fn patch(&self) -> Map<String, Value> {
        let mut patch = Map::new();
        patch.insert(
            "ticket_engine".to_string(),
            serde_json::to_value(self).unwrap_or_else(|_| json!({})),
        );
        patch
    }
}

/// A backend capable of running agent turns for a workspace.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn run_turn(
        &self,
        workspace_root: &Path,
        request: &TurnRequest,
        sink: &dyn TurnEventSink,
        should_stop: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<TurnOutcome, AgentError>;

    async fn close(&self) {}
}

/// Supervisor-backed backend with a single mid-turn reattach retry.
pub struct SupervisorBackend {
    supervisor: Arc<AgentSupervisor>,
}

impl SupervisorBackend {
    pub fn new(supervisor: Arc<AgentSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl AgentBackend for SupervisorBackend {
    async fn run_turn(
        &self,
        workspace_root: &Path,
        request: &TurnRequest,
        sink: &dyn TurnEventSink,
        should_stop: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<TurnOutcome, AgentError> {
        let client = self.supervisor.get_client(workspace_root).await?;
        self.supervisor.mark_turn_started(workspace_root).await;
        let mut result = client.run_turn(request, sink, should_stop).await;
        if let Err(AgentError::Disconnected(message)) = &result {
            tracing::warn!(
                kind = %self.supervisor.kind(),
                error = %message,
                "agent died mid-turn; reattaching for one retry"
            );
            self.supervisor.mark_disconnected(workspace_root).await;
            result = match self.supervisor.get_client(workspace_root).await {
                Ok(client) => client.run_turn(request, sink, should_stop).await,
                Err(e) => Err(e),
            };
        }
        self.supervisor.mark_turn_finished(workspace_root).await;
        result
    }

    async fn close(&self) {
        self.supervisor.close_all().await;
    }
}

/// Named agent backends available to the ticket engine.
#[derive(Default)]
pub struct AgentPool {
    backends: HashMap<String, Arc<dyn AgentBackend>>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, id: impl Into<String>, backend: Arc<dyn AgentBackend>) -> Self {
        self.backends.insert(id.into(), backend);
        self
    }

    pub fn backend(&self, id: &str) -> Option<Arc<dyn AgentBackend>> {
        self.backends.get(id).cloned()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.backends.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn close_all(&self) {
        for backend in self.backends.values() {
            backend.close().await;
        }
    }
}

/// Dependencies of the ticket flow definition.
pub struct TicketFlowDeps {
    pub pool: Arc<AgentPool>,
    pub config: TicketConfig,
    pub repo_id: String,
    /// Fallback when `input_data.workspace_root` is absent.
    pub default_workspace_root: PathBuf,
    /// Per-agent model/effort overrides, keyed by agent id.
    pub turn_options: HashMap<String, (Option<String>, Option<String>)>,
}

/// Build the `ticket_flow` definition.
pub fn ticket_flow_definition(deps: TicketFlowDeps) -> FlowDefinition {
    FlowDefinition::new(TICKET_FLOW_TYPE, RUN_ONE_TURN)
        .with_step(RUN_ONE_TURN, Arc::new(RunOneTurn { deps }))
}

struct RunOneTurn {
    deps: TicketFlowDeps,
}

/// Forwards streamed part events into the run's event log.
struct PartEventSink<'a> {
    ctx: &'a StepContext,
}

impl TurnEventSink for PartEventSink<'_> {
    fn on_part(&self, part: &Value) {
        let data = json!({"message": part});
        if let Err(e) = self.ctx.events.emit(FlowEventType::AppServerEvent, data) {
            tracing::warn!(run_id = %self.ctx.run_id, error = %e, "failed to record part event");
        }
    }
}

impl RunOneTurn {
    fn fail(
        &self,
        mut engine: TicketEngineState,
        reason_code: &str,
        reason: impl Into<String>,
    ) -> StepOutcome {
        let reason = reason.into();
        engine.status = "failed".to_string();
        engine.reason_code = Some(reason_code.to_string());
        engine.reason = Some(reason.clone());
        StepOutcome::fail(reason).with_state_patch(engine.patch())
    }

    fn pause(&self, mut engine: TicketEngineState, reason: impl Into<String>) -> StepOutcome {
        let reason = reason.into();
        engine.status = "paused".to_string();
        engine.reason = Some(reason.clone());
        StepOutcome::pause(reason).with_state_patch(engine.patch())
    }

    fn stop(&self, mut engine: TicketEngineState) -> StepOutcome {
        engine.reason_code = Some("stop_requested".to_string());
        StepOutcome::stop("stop requested").with_state_patch(engine.patch())
    }

    fn resolve_roots(&self, ctx: &StepContext) -> (PathBuf, PathBuf) {
        let workspace_root = ctx
            .input_data
            .get("workspace_root")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.deps.default_workspace_root.clone());
        let runs_dir = ctx
            .input_data
            .get("runs_dir")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(paths::DEFAULT_RUNS_DIR));
        (workspace_root, runs_dir)
    }

    fn archive_current_dispatch(
        &self,
        ctx: &StepContext,
        outbox: &OutboxPaths,
        engine: &mut TicketEngineState,
        ticket: Option<&str>,
        origin: &str,
    ) -> Result<Option<ArchivedDispatch>, FlowError> {
        if !outbox.dispatch_path.exists() {
            return Ok(None);
        }
        let next_seq = latest_seq(&outbox.dispatch_history_dir) + 1;
        let archived = archive_dispatch(
            outbox,
            next_seq,
            &ArchiveMeta {
                ticket_id: ticket.map(str::to_string),
                repo_id: self.deps.repo_id.clone(),
                run_id: ctx.run_id.to_string(),
                origin: origin.to_string(),
            },
        )?;
        engine.last_dispatch_seq = archived.seq;
        ctx.events.emit(
            FlowEventType::DispatchCreated,
            json!({
                "seq": archived.seq,
                "mode": archived.doc.mode.as_str(),
                "title": archived.doc.title,
                "ticket": ticket,
                "dir": archived.dir.display().to_string(),
            }),
        )?;
        Ok(Some(archived))
    }

    fn build_prompt(
        &self,
        ticket: &TicketDoc,
        workspace_root: &Path,
        reply: Option<&(u64, String)>,
    ) -> Result<String, String> {
        let mut prompt = ticket.body.trim_end().to_string();
        for required in &ticket.frontmatter.requires {
            let path = workspace_root.join(required);
            let meta = std::fs::metadata(&path)
                .map_err(|_| format!("required file not found: {required}"))?;
            if meta.len() > MAX_REQUIRED_FILE_BYTES {
                return Err(format!(
                    "required file too large ({} bytes): {required}",
                    meta.len()
                ));
            }
            let bytes = std::fs::read(&path)
                .map_err(|e| format!("required file unreadable: {required}: {e}"))?;
            if bytes.iter().take(8192).any(|b| *b == 0) {
                return Err(format!("required file is binary: {required}"));
            }
            let contents = String::from_utf8_lossy(&bytes);
            prompt.push_str(&format!(
                "\n\n--- Required file: {required} ---\n{}",
                contents.trim_end()
            ));
        }
        if let Some((seq, body)) = reply {
            prompt.push_str(&format!(
                "\n\n--- Operator reply (seq {seq}) ---\n{}",
                body.trim_end()
            ));
        }
        prompt.push('\n');
        Ok(prompt)
    }

    /// Best-effort checkpoint commit after a successful turn.
    async fn checkpoint(&self, workspace_root: &Path, ctx: &StepContext, turn: u32, agent: &str) {
        if !self.deps.config.auto_commit {
            return;
        }
        let message = self
            .deps
            .config
            .checkpoint_message_template
            .replace("{run_id}", ctx.run_id.as_str())
            .replace("{turn}", &turn.to_string())
            .replace("{agent}", agent);
        let add = tokio::process::Command::new("git")
            .args(["add", "-A"])
            .current_dir(workspace_root)
            .output()
            .await;
        match add {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                tracing::warn!(
                    run_id = %ctx.run_id,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "checkpoint git add failed"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(run_id = %ctx.run_id, error = %e, "checkpoint git add failed");
                return;
            }
        }
        let commit = tokio::process::Command::new("git")
            .args(["commit", "-m", &message])
            .current_dir(workspace_root)
            .output()
            .await;
        match commit {
            Ok(output) if output.status.success() => {
                tracing::debug!(run_id = %ctx.run_id, "checkpoint committed");
            }
            Ok(output) => {
                // Nothing staged is the common, harmless case.
                tracing::debug!(
                    run_id = %ctx.run_id,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "checkpoint commit skipped"
                );
            }
            Err(e) => {
                tracing::warn!(run_id = %ctx.run_id, error = %e, "checkpoint commit failed");
            }
        }
    }
}

#[async_trait]
impl FlowStep for RunOneTurn {
    async fn run(&self, ctx: &StepContext, state: &Value) -> Result<StepOutcome, FlowError> {
        let mut engine = TicketEngineState::from_state(state);
        engine.status = "running".to_string();
        engine.reason = None;
        engine.reason_code = None;

        let (workspace_root, runs_dir) = self.resolve_roots(ctx);
        let outbox = resolve_outbox_paths(&workspace_root, &runs_dir, ctx.run_id.as_str());
        ensure_outbox_dirs(&outbox)?;

        // 1. Select the first not-done ticket.
        let tickets = match list_ticket_docs(&paths::tickets_dir(&workspace_root)) {
            Ok(tickets) => tickets,
            Err(e) => {
                return Ok(self.fail(engine, "missing_ticket", format!("ticket read failed: {e}")))
            }
        };
        let Some(ticket) = tickets.iter().find(|t| !t.frontmatter.done) else {
            engine.status = "completed".to_string();
            engine.current_ticket = None;
            return Ok(StepOutcome::complete().with_state_patch(engine.patch()));
        };
        let ticket_name = ticket.file_name();
        engine.current_ticket = Some(ticket_name.clone());

        // 2. Guard the turn budget.
        if engine.total_turns >= self.deps.config.max_total_turns {
            return Ok(self.fail(
                engine,
                "max_turns",
                format!(
                    "Reached maximum total turns ({})",
                    self.deps.config.max_total_turns
                ),
            ));
        }

        // 3. Resolve the agent.
        let agent_id = ticket.frontmatter.agent.clone();
        if agent_id == USER_AGENT {
            let doc = DispatchDoc::new(
                DispatchMode::Pause,
                Some(ticket.frontmatter.title.clone().unwrap_or_else(|| ticket_name.clone())),
                format!(
                    "This ticket is assigned to a human.\n\n{}\nReply with direction to continue.\n",
                    ticket.body.trim_end()
                ),
            );
            std::fs::create_dir_all(&outbox.dispatch_dir)?;
            car_core::atomic_write(&outbox.dispatch_path, doc.render()?.as_bytes())?;
            let archived = self
                .archive_current_dispatch(
                    ctx,
                    &outbox,
                    &mut engine,
                    Some(ticket_name.as_str()),
                    "user_ticket",
                )?
                .map(|a| a.doc.preview(200))
                .unwrap_or_default();
            return Ok(self.pause(engine, format!("Reason: {archived}")));
        }
        let Some(backend) = self.deps.pool.backend(&agent_id) else {
            return Ok(self.fail(
                engine,
                "agent_error",
                format!("unknown agent {agent_id:?} in {ticket_name}"),
            ));
        };

        // 4. Honor a stop raised before the turn starts.
        if ctx.should_stop() {
            return Ok(self.stop(engine));
        }

        // 5. Assemble the prompt (ticket body + required files + reply).
        let reply =
            read_unconsumed_reply(&outbox.reply_history_dir, engine.last_reply_seq)?;
        let prompt = match self.build_prompt(ticket, &workspace_root, reply.as_ref()) {
            Ok(prompt) => prompt,
            Err(message) => return Ok(self.fail(engine, "missing_ticket", message)),
        };
        if let Some((seq, _)) = &reply {
            engine.last_reply_seq = *seq;
        }

        // 6. Run the turn, streaming part events into the run log.
        let (model, effort) = self
            .deps
            .turn_options
            .get(&agent_id)
            .cloned()
            .unwrap_or((None, None));
        let request = TurnRequest {
            workspace_root: workspace_root.clone(),
            prompt,
            model,
            effort,
        };
        let sink = PartEventSink { ctx };
        let should_stop = ctx.should_stop.clone();
        let stop_probe = move || (*should_stop)();
        let turn = backend.run_turn(&workspace_root, &request, &sink, &stop_probe).await;

        engine.total_turns += 1;
        *engine.turns_by_ticket.entry(ticket_name.clone()).or_insert(0) += 1;

        match turn {
            Ok(outcome) => {
                tracing::info!(
                    run_id = %ctx.run_id,
                    ticket = %ticket_name,
                    agent = %agent_id,
                    parts = outcome.parts,
                    turn_id = outcome.turn_id.as_deref().unwrap_or(""),
                    "agent turn finished"
                );
            }
            Err(AgentError::TurnAborted) => return Ok(self.stop(engine)),
            Err(e @ AgentError::TurnTimeout { .. }) => {
                return Ok(self.fail(engine, "turn_timeout", e.to_string()));
            }
            Err(e) => return Ok(self.fail(engine, "agent_error", e.to_string())),
        }

        // 7. Observe and archive the dispatch.
        let archived = self.archive_current_dispatch(
            ctx,
            &outbox,
            &mut engine,
            Some(ticket_name.as_str()),
            TICKET_FLOW_TYPE,
        )?;

        // 8. Did the agent mark the ticket done?
        let done_now = TicketDoc::load(&ticket.path).map(|t| t.frontmatter.done).unwrap_or(false);

        self.checkpoint(&workspace_root, ctx, engine.total_turns, &agent_id).await;

        // 9. Decide.
        if let Some(archived) = &archived {
            if archived.doc.mode == DispatchMode::Pause {
                let preview = archived.doc.preview(200);
                return Ok(self.pause(engine, format!("Reason: {preview}")));
            }
        }
        if done_now {
            let any_undone = match list_ticket_docs(&paths::tickets_dir(&workspace_root)) {
                Ok(tickets) => tickets.iter().any(|t| !t.frontmatter.done),
                Err(_) => false,
            };
            if !any_undone {
                engine.status = "completed".to_string();
                engine.current_ticket = None;
                return Ok(StepOutcome::complete().with_state_patch(engine.patch()));
            }
            return Ok(StepOutcome::continue_to(RUN_ONE_TURN).with_state_patch(engine.patch()));
        }
        if archived.is_none() {
            return Ok(self.fail(
                engine,
                "agent_error",
                format!("agent produced no dispatch and made no progress on {ticket_name}"),
            ));
        }
        Ok(StepOutcome::continue_to(RUN_ONE_TURN).with_state_patch(engine.patch()))
    }

    fn next_steps(&self) -> Vec<String> {
        vec![RUN_ONE_TURN.to_string()]
    }
}

#[cfg(test)]
#[path = "ticket_tests.rs"]
mod tests;
