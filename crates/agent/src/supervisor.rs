// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-workspace supervision of agent server subprocesses.
//!
//! One supervisor per agent kind. Guarantees at most one live handle
//! per workspace, reuses registry-recorded servers across hub
//! restarts, evicts idle handles (LRU and TTL), and group-kills
//! subprocesses on teardown.

use crate::client::AgentClient;
use crate::error::AgentError;
use crate::registry::{
    delete_process_record, read_process_record, write_process_record, ProcessRecord,
};
use crate::terminate::{pgid_of, terminate_record};
use car_core::{now_iso_utc, paths, FileLock, ServerScope, WorkspaceId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Startup advertisement scanned from the subprocess stdout.
fn parse_listen_url(line: &str) -> Option<String> {
    let idx = line.find("listening on ")?;
    let rest = &line[idx + "listening on ".len()..];
    let url = rest.split_whitespace().next()?;
    if url.starts_with("http://") || url.starts_with("https://") {
        Some(url.to_string())
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct AgentSupervisorConfig {
    /// Process kind, e.g. `"opencode"` or `"app_server"`.
    pub kind: String,
    /// Argv used to spawn the server. Empty in external (base_url) mode.
    pub command: Vec<String>,
    pub scope: ServerScope,
    /// Attach to a fixed URL instead of spawning.
    pub base_url: Option<String>,
    pub turn_timeout: Duration,
    pub startup_timeout: Duration,
    pub max_handles: Option<usize>,
    pub idle_ttl: Option<Duration>,
    /// Registry root for global-scope servers (workspace-scope records
    /// live under each workspace).
    pub global_registry_root: PathBuf,
}

impl AgentSupervisorConfig {
    pub fn password_env(&self) -> String {
        format!("{}_SERVER_PASSWORD", self.kind.to_uppercase())
    }

    fn auth(&self) -> Option<(String, String)> {
        let password = std::env::var(self.password_env()).ok().filter(|p| !p.is_empty())?;
        Some((self.kind.clone(), password))
    }
}

#[derive(Default)]
struct HandleState {
    process: Option<Child>,
    client: Option<Arc<AgentClient>>,
    base_url: Option<String>,
    version: Option<String>,
    health_info: Option<serde_json::Map<String, serde_json::Value>>,
    started: bool,
    drain_tasks: Vec<JoinHandle<()>>,
}

/// In-memory lease for one workspace's agent server.
pub struct AgentHandle {
    handle_id: String,
    workspace_root: PathBuf,
    last_used_at: parking_lot::Mutex<Instant>,
    active_turns: AtomicU32,
    /// Also serves as the per-handle start lock.
    state: tokio::sync::Mutex<HandleState>,
}

impl AgentHandle {
    fn new(handle_id: String, workspace_root: PathBuf) -> Self {
        Self {
            handle_id,
            workspace_root,
            last_used_at: parking_lot::Mutex::new(Instant::now()),
            active_turns: AtomicU32::new(0),
            state: tokio::sync::Mutex::new(HandleState::default()),
        }
    }

    pub fn handle_id(&self) -> &str {
        &self.handle_id
    }

    pub fn active_turns(&self) -> u32 {
        self.active_turns.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_used_at.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used_at.lock().elapsed()
    }
}

/// Point-in-time view of a handle.
#[derive(Debug, Clone)]
pub struct HandleInfo {
    pub handle_id: String,
    pub base_url: Option<String>,
    pub version: Option<String>,
    pub health_info: Option<serde_json::Map<String, serde_json::Value>>,
    pub started: bool,
    pub active_turns: u32,
}

pub struct AgentSupervisor {
    config: AgentSupervisorConfig,
    handles: tokio::sync::Mutex<HashMap<String, Arc<AgentHandle>>>,
}

impl AgentSupervisor {
    pub fn new(config: AgentSupervisorConfig) -> Self {
        Self { config, handles: tokio::sync::Mutex::new(HashMap::new()) }
    }

    pub fn kind(&self) -> &str {
        &self.config.kind
    }

    fn handle_id_for(&self, canonical_root: &Path) -> String {
        match self.config.scope {
            ServerScope::Global => WorkspaceId::global().as_str().to_string(),
            ServerScope::Workspace => WorkspaceId::for_path(canonical_root).as_str().to_string(),
        }
    }

    fn registry_root(&self, workspace_root: &Path) -> PathBuf {
        match self.config.scope {
            ServerScope::Global => self.config.global_registry_root.clone(),
            ServerScope::Workspace => workspace_root.to_path_buf(),
        }
    }

    /// Ensure a started handle for the workspace and return its client.
    pub async fn get_client(&self, workspace_root: &Path) -> Result<Arc<AgentClient>, AgentError> {
        let canonical_root =
            workspace_root.canonicalize().unwrap_or_else(|_| workspace_root.to_path_buf());
        let handle = self.ensure_handle(&canonical_root).await;
        self.ensure_started(&handle).await?;
        handle.touch();
        let state = handle.state.lock().await;
        state
            .client
            .clone()
            .ok_or_else(|| AgentError::Supervisor("agent client not initialized".into()))
    }

    /// Bookkeeping: a turn began for this workspace.
    pub async fn mark_turn_started(&self, workspace_root: &Path) {
        if let Some(handle) = self.find_handle(workspace_root).await {
            handle.active_turns.fetch_add(1, Ordering::SeqCst);
            handle.touch();
        }
    }

    /// Bookkeeping: a turn finished for this workspace.
    pub async fn mark_turn_finished(&self, workspace_root: &Path) {
        if let Some(handle) = self.find_handle(workspace_root).await {
            let _ = handle.active_turns.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
            handle.touch();
        }
    }

    /// Mark the handle unstarted after a mid-turn disconnect so the
    /// next `get_client` reattempts startup.
    pub async fn mark_disconnected(&self, workspace_root: &Path) {
        if let Some(handle) = self.find_handle(workspace_root).await {
            let mut state = handle.state.lock().await;
            state.started = false;
            state.client = None;
        }
    }

    /// Evict handles idle beyond the TTL. Returns how many closed.
    pub async fn prune_idle(&self) -> usize {
        let Some(idle_ttl) = self.config.idle_ttl else {
            return 0;
        };
        let idle = {
            let mut handles = self.handles.lock().await;
            let ids: Vec<String> = handles
                .values()
                .filter(|h| h.active_turns() == 0 && h.idle_for() > idle_ttl)
                .map(|h| h.handle_id.clone())
                .collect();
            ids.iter().filter_map(|id| handles.remove(id)).collect::<Vec<_>>()
        };
        let closed = idle.len();
        for handle in idle {
            self.close_handle(&handle, "idle_ttl").await;
        }
        closed
    }

    /// Graceful shutdown: terminate every subprocess and purge records.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<AgentHandle>> = {
            let mut handles = self.handles.lock().await;
            handles.drain().map(|(_, h)| h).collect()
        };
        for handle in drained {
            self.close_handle(&handle, "close_all").await;
        }
    }

    /// Handle ids currently held, for diagnostics.
    pub async fn active_handles(&self) -> Vec<String> {
        let handles = self.handles.lock().await;
        let mut ids: Vec<String> = handles.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of one handle's state, for status surfaces.
    pub async fn describe_handle(&self, workspace_root: &Path) -> Option<HandleInfo> {
        let handle = self.find_handle(workspace_root).await?;
        let state = handle.state.lock().await;
        Some(HandleInfo {
            handle_id: handle.handle_id.clone(),
            base_url: state.base_url.clone(),
            version: state.version.clone(),
            health_info: state.health_info.clone(),
            started: state.started,
            active_turns: handle.active_turns(),
        })
    }

    async fn find_handle(&self, workspace_root: &Path) -> Option<Arc<AgentHandle>> {
        let canonical_root =
            workspace_root.canonicalize().unwrap_or_else(|_| workspace_root.to_path_buf());
        let handle_id = self.handle_id_for(&canonical_root);
        self.handles.lock().await.get(&handle_id).cloned()
    }

    async fn ensure_handle(&self, canonical_root: &Path) -> Arc<AgentHandle> {
        let handle_id = self.handle_id_for(canonical_root);
        let mut to_close: Vec<(Arc<AgentHandle>, &'static str)> = Vec::new();
        let handle = {
            let mut handles = self.handles.lock().await;
            if let Some(existing) = handles.get(&handle_id) {
                existing.touch();
                return existing.clone();
            }
            if let Some(idle_ttl) = self.config.idle_ttl {
                let expired: Vec<String> = handles
                    .values()
                    .filter(|h| h.active_turns() == 0 && h.idle_for() > idle_ttl)
                    .map(|h| h.handle_id.clone())
                    .collect();
                for id in expired {
                    if let Some(handle) = handles.remove(&id) {
                        to_close.push((handle, "idle_ttl"));
                    }
                }
            }
            if let Some(max) = self.config.max_handles {
                if handles.len() >= max {
                    if let Some(victim) = lru_candidate(&handles) {
                        if let Some(handle) = handles.remove(&victim) {
                            to_close.push((handle, "max_handles"));
                        }
                    } else {
                        tracing::warn!(
                            kind = %self.config.kind,
                            max_handles = max,
                            "handle limit reached but every handle has active turns"
                        );
                    }
                }
            }
            let handle =
                Arc::new(AgentHandle::new(handle_id.clone(), canonical_root.to_path_buf()));
            handles.insert(handle_id, handle.clone());
            handle
        };
        for (stale, reason) in to_close {
            self.close_handle(&stale, reason).await;
        }
        handle
    }

    async fn ensure_started(&self, handle: &Arc<AgentHandle>) -> Result<(), AgentError> {
        let mut state = handle.state.lock().await;
        if state.started {
            match &mut state.process {
                None => return Ok(()),
                Some(child) => {
                    if child.try_wait().ok().flatten().is_none() {
                        return Ok(());
                    }
                    // Process died since last turn; restart below.
                    state.started = false;
                }
            }
        }
        if let Some(base_url) = self.config.base_url.clone() {
            return self.attach(handle, &mut state, &base_url).await;
        }
        if self.try_reuse_registry(handle, &mut state).await? {
            return Ok(());
        }
        self.spawn_fresh(handle, &mut state).await
    }

    /// Attach to a registered live server, if one exists.
    ///
    /// Auth failures surface to the caller; any other attach failure
    /// terminates the recorded process and falls through to a fresh
    /// spawn.
    async fn try_reuse_registry(
        &self,
        handle: &Arc<AgentHandle>,
        state: &mut HandleState,
    ) -> Result<bool, AgentError> {
        let registry_root = self.registry_root(&handle.workspace_root);
        let lock_path =
            paths::supervisor_lock_path(&registry_root, &self.config.kind, &handle.handle_id);
        let _lock = FileLock::acquire(&lock_path)?;

        let record =
            match read_process_record(&registry_root, &self.config.kind, &handle.handle_id) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        kind = %self.config.kind,
                        handle_id = %handle.handle_id,
                        error = %e,
                        "registry read failed"
                    );
                    return Ok(false);
                }
            };
        let Some(record) = record else {
            return Ok(false);
        };

        if !record.is_running() {
            self.delete_records(&registry_root, &record);
            return Ok(false);
        }
        let Some(base_url) = record.base_url.clone() else {
            self.terminate_recorded(&record).await;
            self.delete_records(&registry_root, &record);
            return Ok(false);
        };

        match self.attach(handle, state, &base_url).await {
            Ok(()) => {
                self.refresh_ownership(&registry_root, &record);
                tracing::info!(
                    kind = %self.config.kind,
                    handle_id = %handle.handle_id,
                    pid = ?record.pid,
                    base_url = %base_url,
                    "reusing registered agent server"
                );
                Ok(true)
            }
            Err(e @ AgentError::AttachAuth { .. }) => Err(e),
            Err(e) => {
                tracing::warn!(
                    kind = %self.config.kind,
                    handle_id = %handle.handle_id,
                    error = %e,
                    "attach failed; replacing registered server"
                );
                self.terminate_recorded(&record).await;
                if record.is_running() {
                    return Err(AgentError::Supervisor(format!(
                        "registered {} server (pid {:?}) would not terminate",
                        self.config.kind, record.pid
                    )));
                }
                self.delete_records(&registry_root, &record);
                Ok(false)
            }
        }
    }

    async fn attach(
        &self,
        _handle: &Arc<AgentHandle>,
        state: &mut HandleState,
        base_url: &str,
    ) -> Result<(), AgentError> {
        let client = Arc::new(AgentClient::new(
            base_url,
            self.config.auth(),
            self.config.password_env(),
            self.config.turn_timeout,
        )?);
        let health = client.health().await?;
        if let Err(e) = client.fetch_api_doc().await {
            tracing::debug!(base_url, error = %e, "api doc fetch failed (non-fatal)");
        }
        state.base_url = Some(base_url.to_string());
        state.version = Some(health.version);
        state.health_info = Some(health.extra);
        state.client = Some(client);
        state.started = true;
        Ok(())
    }

    async fn spawn_fresh(
        &self,
        handle: &Arc<AgentHandle>,
        state: &mut HandleState,
    ) -> Result<(), AgentError> {
        let argv = &self.config.command;
        let Some(program) = argv.first() else {
            return Err(AgentError::Startup(format!(
                "no command configured for agent kind {}",
                self.config.kind
            )));
        };
        let mut cmd = Command::new(program);
        cmd.args(&argv[1..])
            .current_dir(&handle.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(false);
        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::Startup(format!("failed to spawn {program}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Startup("subprocess stdout unavailable".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let base_url = match self.read_base_url(&mut child, &mut lines).await {
            Ok(url) => url,
            Err(e) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(e);
            }
        };

        let client = Arc::new(AgentClient::new(
            &base_url,
            self.config.auth(),
            self.config.password_env(),
            self.config.turn_timeout,
        )?);
        if let Err(e) = client.fetch_api_doc().await {
            tracing::debug!(base_url = %base_url, error = %e, "api doc fetch failed (non-fatal)");
        }

        // Keep both pipes drained so the child never stalls on a full
        // pipe buffer.
        let kind = self.config.kind.clone();
        let handle_id = handle.handle_id.clone();
        state.drain_tasks.push(tokio::spawn(async move {
            let mut lines = lines;
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(kind = %kind, handle_id = %handle_id, line = %car_core::short(&line, 2000), "agent stdout");
            }
        }));
        if let Some(stderr) = child.stderr.take() {
            let kind = self.config.kind.clone();
            let handle_id = handle.handle_id.clone();
            state.drain_tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(kind = %kind, handle_id = %handle_id, line = %car_core::short(&line, 2000), "agent stderr");
                }
            }));
        }

        let pid = child.id().map(|pid| pid as i32);
        state.process = Some(child);
        state.base_url = Some(base_url.clone());
        state.client = Some(client);
        state.started = true;

        if let Some(pid) = pid {
            let registry_root = self.registry_root(&handle.workspace_root);
            let record = ProcessRecord {
                kind: self.config.kind.clone(),
                workspace_id: Some(handle.handle_id.clone()),
                pid: Some(pid),
                pgid: pgid_of(pid),
                base_url: Some(base_url.clone()),
                command: argv.clone(),
                owner_pid: std::process::id() as i32,
                started_at: now_iso_utc(),
                metadata: [(
                    "workspace_root".to_string(),
                    handle.workspace_root.display().to_string(),
                )]
                .into_iter()
                .collect(),
            };
            for rec in [Some(record.clone()), record.pid_twin()].into_iter().flatten() {
                if let Err(e) = write_process_record(&registry_root, &rec) {
                    tracing::warn!(
                        kind = %self.config.kind,
                        handle_id = %handle.handle_id,
                        error = %e,
                        "registry write failed"
                    );
                }
            }
        }

        tracing::info!(
            kind = %self.config.kind,
            handle_id = %handle.handle_id,
            pid = ?pid,
            base_url = %base_url,
            "agent server started"
        );
        Ok(())
    }

    async fn read_base_url(
        &self,
        child: &mut Child,
        lines: &mut tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    ) -> Result<String, AgentError> {
        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(AgentError::Startup(format!(
                    "agent server exited before ready ({status})"
                )));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AgentError::Startup(format!(
                    "agent server did not report a base URL within {:?}",
                    self.config.startup_timeout
                )));
            }
            match tokio::time::timeout(remaining, lines.next_line()).await {
                Err(_) => {
                    return Err(AgentError::Startup(format!(
                        "agent server did not report a base URL within {:?}",
                        self.config.startup_timeout
                    )));
                }
                Ok(Err(e)) => {
                    return Err(AgentError::Startup(format!("stdout read failed: {e}")));
                }
                Ok(Ok(None)) => {
                    let status = child.wait().await?;
                    return Err(AgentError::Startup(format!(
                        "agent server closed stdout before ready ({status})"
                    )));
                }
                Ok(Ok(Some(line))) => {
                    if let Some(url) = parse_listen_url(&line) {
                        return Ok(url);
                    }
                }
            }
        }
    }

    async fn close_handle(&self, handle: &Arc<AgentHandle>, reason: &str) {
        let mut state = handle.state.lock().await;
        for task in state.drain_tasks.drain(..) {
            task.abort();
        }
        tracing::info!(
            kind = %self.config.kind,
            handle_id = %handle.handle_id,
            reason,
            active_turns = handle.active_turns(),
            "closing agent handle"
        );

        if self.config.scope == ServerScope::Global {
            if let Some(client) = &state.client {
                if let Err(e) = client.dispose_instances().await {
                    tracing::debug!(error = %e, "dispose_instances failed (non-fatal)");
                }
            }
        }
        state.client = None;
        state.started = false;

        let Some(mut child) = state.process.take() else {
            return;
        };
        let Some(pid) = child.id().map(|pid| pid as i32) else {
            // Already reaped.
            let _ = child.try_wait();
            return;
        };
        let pgid = pgid_of(pid);
        let terminated = tokio::task::spawn_blocking(move || {
            terminate_record(
                Some(pid),
                pgid,
                Duration::from_millis(500),
                Duration::from_millis(500),
            )
        })
        .await
        .unwrap_or(false);
        if !terminated {
            tracing::warn!(
                kind = %self.config.kind,
                handle_id = %handle.handle_id,
                pid,
                "agent server termination failed"
            );
        }
        if tokio::time::timeout(Duration::from_secs(2), child.wait()).await.is_err() {
            tracing::warn!(
                kind = %self.config.kind,
                handle_id = %handle.handle_id,
                pid,
                "timed out waiting for agent server exit"
            );
        }
        let registry_root = self.registry_root(&handle.workspace_root);
        delete_process_record(&registry_root, &self.config.kind, &handle.handle_id);
        delete_process_record(&registry_root, &self.config.kind, &pid.to_string());
    }

    async fn terminate_recorded(&self, record: &ProcessRecord) {
        let pid = record.pid;
        let pgid = record.pgid;
        let _ = tokio::task::spawn_blocking(move || {
            terminate_record(pid, pgid, Duration::from_millis(500), Duration::from_millis(500))
        })
        .await;
    }

    fn delete_records(&self, registry_root: &Path, record: &ProcessRecord) {
        delete_process_record(registry_root, &self.config.kind, &record.record_key().unwrap_or_default());
        if let Some(pid) = record.pid {
            delete_process_record(registry_root, &self.config.kind, &pid.to_string());
        }
    }

    fn refresh_ownership(&self, registry_root: &Path, record: &ProcessRecord) {
        let refreshed = ProcessRecord { owner_pid: std::process::id() as i32, ..record.clone() };
        for rec in [Some(refreshed.clone()), refreshed.pid_twin()].into_iter().flatten() {
            if let Err(e) = write_process_record(registry_root, &rec) {
                tracing::warn!(error = %e, "registry ownership refresh failed");
            }
        }
    }
}

/// Least-recently-used handle with no active turns.
fn lru_candidate(handles: &HashMap<String, Arc<AgentHandle>>) -> Option<String> {
    handles
        .values()
        .filter(|h| h.active_turns() == 0)
        .min_by_key(|h| *h.last_used_at.lock())
        .map(|h| h.handle_id.clone())
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
