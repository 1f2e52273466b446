// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-local registry of per-repo runtime resources.
//!
//! Controllers and agent pools are constructed lazily per repo and
//! cached by canonical path. `close()` drains everything, tolerating
//! individual failures so one bad repo cannot block shutdown.

use crate::error::HubError;
use crate::lifecycle::LifecycleEmitter;
use car_agent::{AgentSupervisor, AgentSupervisorConfig};
use car_core::{paths, RepoConfig};
use car_flow::{
    ticket_flow_definition, AgentPool, FlowController, LifecycleSink, SupervisorBackend,
    TicketFlowDeps,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Everything one repo's ticket flow needs at runtime.
pub struct FlowRuntimeResources {
    pub controller: Arc<FlowController>,
    pub agent_pool: Arc<AgentPool>,
}

pub type FlowRuntimeBuilder =
    Arc<dyn Fn(&Path) -> Result<FlowRuntimeResources, HubError> + Send + Sync>;

/// Identify a repo by its directory name.
fn repo_id_for(repo_root: &Path) -> String {
    repo_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| repo_root.display().to_string())
}

/// Standard composition: supervisors from the repo config, a
/// supervisor-backed pool, the ticket flow definition, and a
/// controller wired to the hub lifecycle bus.
pub fn build_ticket_flow_resources(
    repo_root: &Path,
    hub_root: &Path,
) -> Result<FlowRuntimeResources, HubError> {
    let config = RepoConfig::load(repo_root)?;
    let repo_id = repo_id_for(repo_root);
    let lifecycle: Arc<dyn LifecycleSink> = Arc::new(LifecycleEmitter::new(hub_root));

    let mut pool = AgentPool::new();
    let mut turn_options = HashMap::new();
    for (kind, agent) in &config.agents {
        let supervisor = Arc::new(AgentSupervisor::new(AgentSupervisorConfig {
            kind: kind.clone(),
            command: agent.command.clone(),
            scope: agent.scope,
            base_url: agent.base_url.clone(),
            turn_timeout: Duration::from_secs(config.turn_timeout_seconds),
            startup_timeout: Duration::from_secs(config.supervisor.startup_timeout_seconds),
            max_handles: config.supervisor.max_handles,
            idle_ttl: config.supervisor.idle_ttl_seconds.map(Duration::from_secs),
            global_registry_root: hub_root.to_path_buf(),
        }));
        pool = pool.with_backend(kind.clone(), Arc::new(SupervisorBackend::new(supervisor)));
        turn_options.insert(kind.clone(), (agent.model.clone(), agent.effort.clone()));
    }
    let pool = Arc::new(pool);

    let definition = ticket_flow_definition(TicketFlowDeps {
        pool: pool.clone(),
        config: config.ticket.clone(),
        repo_id: repo_id.clone(),
        default_workspace_root: repo_root.to_path_buf(),
        turn_options,
    });
    let controller = FlowController::new(
        definition,
        &paths::flows_db_path(repo_root),
        &paths::flow_artifacts_root(repo_root),
        config.durable_writes,
        &repo_id,
        Some(lifecycle),
    )?;

    Ok(FlowRuntimeResources { controller: Arc::new(controller), agent_pool: pool })
}

/// Shared lifecycle owner for long-lived runtime resources.
pub struct RuntimeServices {
    builder: FlowRuntimeBuilder,
    resources: tokio::sync::Mutex<HashMap<PathBuf, Arc<FlowRuntimeResources>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl RuntimeServices {
    pub fn new(builder: FlowRuntimeBuilder) -> Self {
        Self {
            builder,
            resources: tokio::sync::Mutex::new(HashMap::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Services wired with the standard per-repo composition.
    pub fn standard(hub_root: &Path) -> Self {
        let hub_root = hub_root.to_path_buf();
        Self::new(Arc::new(move |repo_root| {
            build_ticket_flow_resources(repo_root, &hub_root)
        }))
    }

    /// The cached (or freshly built) ticket flow controller for a repo.
    pub async fn get_ticket_flow_controller(
        &self,
        repo_root: &Path,
    ) -> Result<Arc<FlowController>, HubError> {
        Ok(self.get_resources(repo_root).await?.controller.clone())
    }

    pub async fn get_resources(
        &self,
        repo_root: &Path,
    ) -> Result<Arc<FlowRuntimeResources>, HubError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(HubError::Closed);
        }
        let canonical = repo_root.canonicalize().unwrap_or_else(|_| repo_root.to_path_buf());
        let mut resources = self.resources.lock().await;
        if let Some(cached) = resources.get(&canonical) {
            return Ok(cached.clone());
        }
        let built = Arc::new((self.builder)(&canonical)?);
        resources.insert(canonical, built.clone());
        Ok(built)
    }

    /// Drain every constructed resource. Idempotent; individual
    /// failures are logged and do not stop the rest.
    pub async fn close(&self) {
        if self.closed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let drained: Vec<(PathBuf, Arc<FlowRuntimeResources>)> = {
            let mut resources = self.resources.lock().await;
            resources.drain().collect()
        };
        for (repo_root, resources) in drained {
            tracing::info!(repo_root = %repo_root.display(), "closing repo resources");
            resources.agent_pool.close_all().await;
        }
    }
}

#[cfg(test)]
#[path = "services_tests.rs"]
mod tests;
