// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-repo configuration from `.codex-autorunner/config.toml`.

use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Scope of an agent server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerScope {
    /// One subprocess per workspace.
    #[default]
    Workspace,
    /// One subprocess shared by all workspaces.
    Global,
}

/// How to launch and talk to one agent kind's server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentServerConfig {
    /// Argv used to spawn the server.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub scope: ServerScope,
    /// Attach to a fixed URL instead of spawning.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub effort: Option<String>,
}

/// Supervisor handle-pool tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub max_handles: Option<usize>,
    #[serde(default)]
    pub idle_ttl_seconds: Option<u64>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_handles: None,
            idle_ttl_seconds: None,
            startup_timeout_seconds: default_startup_timeout(),
        }
    }
}

fn default_startup_timeout() -> u64 {
    20
}

/// Ticket engine constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketConfig {
    #[serde(default = "default_max_total_turns")]
    pub max_total_turns: u32,
    #[serde(default = "default_max_lint_retries")]
    pub max_lint_retries: u32,
    #[serde(default = "default_auto_commit")]
    pub auto_commit: bool,
    #[serde(default = "default_checkpoint_template")]
    pub checkpoint_message_template: String,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            max_total_turns: default_max_total_turns(),
            max_lint_retries: default_max_lint_retries(),
            auto_commit: default_auto_commit(),
            checkpoint_message_template: default_checkpoint_template(),
        }
    }
}

fn default_max_total_turns() -> u32 {
    25
}

fn default_max_lint_retries() -> u32 {
    3
}

fn default_auto_commit() -> bool {
    true
}

fn default_checkpoint_template() -> String {
    "CAR checkpoint: run={run_id} turn={turn} agent={agent}".to_string()
}

/// Per-repo configuration. A missing file yields the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    /// `synchronous=FULL` writes when true, `NORMAL` otherwise.
    #[serde(default)]
    pub durable_writes: bool,
    #[serde(default = "default_turn_timeout")]
    pub turn_timeout_seconds: u64,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentServerConfig>,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub ticket: TicketConfig,
}

fn default_turn_timeout() -> u64 {
    600
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            durable_writes: false,
            turn_timeout_seconds: default_turn_timeout(),
            agents: BTreeMap::new(),
            supervisor: SupervisorConfig::default(),
            ticket: TicketConfig::default(),
        }
    }
}

impl RepoConfig {
    /// Load the config for a repo, validating on construction.
    pub fn load(repo_root: &Path) -> Result<Self, ConfigError> {
        let path = paths::config_path(repo_root);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        let config: Self =
            toml::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ticket.max_total_turns == 0 {
            return Err(ConfigError::Invalid("ticket.max_total_turns must be >= 1".into()));
        }
        if self.turn_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("turn_timeout_seconds must be >= 1".into()));
        }
        for (kind, agent) in &self.agents {
            if agent.command.is_empty() && agent.base_url.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "agents.{kind} needs a command or a base_url"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
