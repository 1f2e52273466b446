// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for repo configuration

use super::*;
use tempfile::TempDir;

fn write_config(dir: &TempDir, contents: &str) {
    let path = paths::config_path(dir.path());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[test]
fn missing_file_yields_defaults() {
    let dir = TempDir::new().unwrap();
    let config = RepoConfig::load(dir.path()).unwrap();
    assert!(!config.durable_writes);
    assert_eq!(config.turn_timeout_seconds, 600);
    assert_eq!(config.ticket.max_total_turns, 25);
    assert_eq!(config.ticket.max_lint_retries, 3);
    assert!(config.ticket.auto_commit);
    assert_eq!(config.supervisor.startup_timeout_seconds, 20);
    assert!(config.agents.is_empty());
}

#[test]
fn parses_full_config() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        r#"
durable_writes = true
turn_timeout_seconds = 120

[supervisor]
max_handles = 4
idle_ttl_seconds = 300

[ticket]
max_total_turns = 5
auto_commit = false

[agents.opencode]
command = ["opencode", "serve"]
scope = "workspace"
model = "gpt-5"

[agents.codex]
command = ["codex", "app-server"]
scope = "global"
"#,
    );
    let config = RepoConfig::load(dir.path()).unwrap();
    assert!(config.durable_writes);
    assert_eq!(config.turn_timeout_seconds, 120);
    assert_eq!(config.supervisor.max_handles, Some(4));
    assert_eq!(config.supervisor.idle_ttl_seconds, Some(300));
    assert_eq!(config.ticket.max_total_turns, 5);
    assert!(!config.ticket.auto_commit);
    let opencode = &config.agents["opencode"];
    assert_eq!(opencode.command, vec!["opencode", "serve"]);
    assert_eq!(opencode.scope, ServerScope::Workspace);
    assert_eq!(opencode.model.as_deref(), Some("gpt-5"));
    assert_eq!(config.agents["codex"].scope, ServerScope::Global);
}

#[test]
fn zero_max_turns_is_invalid() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "[ticket]\nmax_total_turns = 0\n");
    assert!(matches!(RepoConfig::load(dir.path()).unwrap_err(), ConfigError::Invalid(_)));
}

#[test]
fn agent_without_command_or_url_is_invalid() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "[agents.codex]\nscope = \"workspace\"\n");
    assert!(matches!(RepoConfig::load(dir.path()).unwrap_err(), ConfigError::Invalid(_)));
}

#[test]
fn base_url_without_command_is_valid() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "[agents.codex]\nbase_url = \"http://127.0.0.1:9000\"\n");
    let config = RepoConfig::load(dir.path()).unwrap();
    assert_eq!(config.agents["codex"].base_url.as_deref(), Some("http://127.0.0.1:9000"));
}

#[test]
fn malformed_toml_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "durable_writes = [not toml");
    assert!(matches!(RepoConfig::load(dir.path()).unwrap_err(), ConfigError::Parse { .. }));
}

#[test]
fn checkpoint_template_default_interpolates_keys() {
    let config = RepoConfig::default();
    assert!(config.ticket.checkpoint_message_template.contains("{run_id}"));
    assert!(config.ticket.checkpoint_message_template.contains("{turn}"));
    assert!(config.ticket.checkpoint_message_template.contains("{agent}"));
}
