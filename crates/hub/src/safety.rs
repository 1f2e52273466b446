// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The PMA safety layer: pre-flight checks guarding reactive agent
//! turns. Three independent layers — duplicate detection, a sliding
//! rate-limit window, and a consecutive-failure circuit breaker — each
//! individually toggleable. Every attempt lands in an append-only
//! audit log.

use car_core::{Clock, SystemClock};
use parking_lot::Mutex;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// How much of the message feeds the fingerprint.
const FINGERPRINT_CHARS: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct SafetyConfig {
    pub dedup_enabled: bool,
    pub dedup_window: Duration,
    pub max_duplicate_actions: u32,
    pub rate_limit_enabled: bool,
    pub rate_limit_window: Duration,
    pub max_actions_per_window: u32,
    pub breaker_enabled: bool,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            dedup_enabled: true,
            dedup_window: Duration::from_secs(120),
            max_duplicate_actions: 2,
            rate_limit_enabled: true,
            rate_limit_window: Duration::from_secs(60),
            max_actions_per_window: 10,
            breaker_enabled: true,
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(300),
        }
    }
}

/// Structured denial (or approval) returned to the caller. Rejections
/// are never persisted to the flow store.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyVerdict {
    pub allowed: bool,
    pub reason_code: Option<String>,
    pub details: Option<String>,
}

impl SafetyVerdict {
    fn allow() -> Self {
        Self { allowed: true, reason_code: None, details: None }
    }

    fn deny(reason_code: &str, details: String) -> Self {
        Self {
            allowed: false,
            reason_code: Some(reason_code.to_string()),
            details: Some(details),
        }
    }
}

#[derive(Default)]
struct Breaker {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Default)]
struct SafetyState {
    /// `(agent, fingerprint)` → attempt instants inside the window.
    fingerprints: HashMap<(String, String), Vec<Instant>>,
    /// agent → attempt instants inside the window.
    actions: HashMap<String, Vec<Instant>>,
    breakers: HashMap<String, Breaker>,
}

pub fn fingerprint(message: &str) -> String {
    let truncated: String = message.chars().take(FINGERPRINT_CHARS).collect();
    let digest = Sha256::digest(truncated.as_bytes());
    let hex = format!("{:x}", digest);
    car_core::short(&hex, 16).to_string()
}

pub struct SafetyChecker<C: Clock = SystemClock> {
    config: SafetyConfig,
    clock: C,
    audit_path: PathBuf,
    state: Mutex<SafetyState>,
}

impl SafetyChecker<SystemClock> {
    pub fn new(hub_root: &Path, config: SafetyConfig) -> Self {
        Self::with_clock(hub_root, config, SystemClock)
    }
}

impl<C: Clock> SafetyChecker<C> {
    pub fn with_clock(hub_root: &Path, config: SafetyConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            audit_path: car_core::paths::safety_audit_path(hub_root),
            state: Mutex::new(SafetyState::default()),
        }
    }

    /// Evaluate all enabled layers for one attempted action.
    pub fn check(&self, agent: &str, message: &str) -> SafetyVerdict {
        let now = self.clock.now();
        let fp = fingerprint(message);
        let verdict = self.evaluate(agent, &fp, now);
        self.audit(agent, &fp, &verdict);
        verdict
    }

    fn evaluate(&self, agent: &str, fp: &str, now: Instant) -> SafetyVerdict {
        let mut state = self.state.lock();

        if self.config.dedup_enabled {
            let key = (agent.to_string(), fp.to_string());
            let attempts = state.fingerprints.entry(key).or_default();
            attempts.retain(|at| now.duration_since(*at) <= self.config.dedup_window);
            if attempts.len() as u32 >= self.config.max_duplicate_actions {
                return SafetyVerdict::deny(
                    "duplicate_action",
                    format!(
                        "identical action seen {} times within {:?}",
                        attempts.len(),
                        self.config.dedup_window
                    ),
                );
            }
            attempts.push(now);
        }

        if self.config.rate_limit_enabled {
            let attempts = state.actions.entry(agent.to_string()).or_default();
            attempts.retain(|at| now.duration_since(*at) <= self.config.rate_limit_window);
            if attempts.len() as u32 >= self.config.max_actions_per_window {
                return SafetyVerdict::deny(
                    "rate_limited",
                    format!(
                        "{} actions within {:?} (limit {})",
                        attempts.len(),
                        self.config.rate_limit_window,
                        self.config.max_actions_per_window
                    ),
                );
            }
            attempts.push(now);
        }

        if self.config.breaker_enabled {
            let breaker = state.breakers.entry(agent.to_string()).or_default();
            if let Some(opened_at) = breaker.opened_at {
                if now.duration_since(opened_at) < self.config.breaker_cooldown {
                    return SafetyVerdict::deny(
                        "circuit_open",
                        format!(
                            "circuit open after {} consecutive failures",
                            breaker.consecutive_failures
                        ),
                    );
                }
                // Cooldown elapsed: close and start fresh.
                breaker.opened_at = None;
                breaker.consecutive_failures = 0;
            }
        }

        SafetyVerdict::allow()
    }

    /// Feed an action result into the breaker. A success (or neutral
    /// result) resets the failure streak.
    pub fn record_result(&self, agent: &str, ok: bool) {
        if !self.config.breaker_enabled {
            return;
        }
        let mut state = self.state.lock();
        let breaker = state.breakers.entry(agent.to_string()).or_default();
        if ok {
            breaker.consecutive_failures = 0;
            breaker.opened_at = None;
            return;
        }
        breaker.consecutive_failures += 1;
        if breaker.consecutive_failures >= self.config.breaker_threshold
            && breaker.opened_at.is_none()
        {
            breaker.opened_at = Some(self.clock.now());
            tracing::warn!(
                agent,
                failures = breaker.consecutive_failures,
                "safety circuit opened"
            );
        }
    }

    /// Append the attempt to `audit.jsonl`. Best-effort.
    fn audit(&self, agent: &str, fp: &str, verdict: &SafetyVerdict) {
        let line = json!({
            "timestamp": self.clock.now_utc().to_rfc3339(),
            "agent": agent,
            "fingerprint": fp,
            "allowed": verdict.allowed,
            "reason_code": verdict.reason_code,
        });
        if let Err(e) = self.append_audit_line(&line) {
            tracing::warn!(error = %e, "safety audit write failed");
        }
    }

    fn append_audit_line(&self, line: &serde_json::Value) -> std::io::Result<()> {
        if let Some(parent) = self.audit_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.audit_path)?;
        writeln!(file, "{line}")
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }
}

#[cfg(test)]
#[path = "safety_tests.rs"]
mod tests;
