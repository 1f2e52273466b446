// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The hub-scope lifecycle event bus.
//!
//! A single JSON file of events under a sidecar lock. Terminal flow
//! events are deduplicated by `(event_type, repo_id, run_id,
//! transition_token?)`; repeats annotate the first observation instead
//! of appending.

use crate::error::HubError;
use car_core::{
    atomic_write, now_iso_utc, paths, FileLock, LifecycleEventId, LifecycleEventType,
};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

const TRANSITION_TOKEN_KEY: &str = "transition_token";

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub event_id: LifecycleEventId,
    pub event_type: LifecycleEventType,
    pub repo_id: String,
    pub run_id: String,
    pub data: Map<String, Value>,
    pub origin: String,
    pub timestamp: String,
    pub processed: bool,
}

impl LifecycleEvent {
    pub fn new(
        event_type: LifecycleEventType,
        repo_id: impl Into<String>,
        run_id: impl Into<String>,
        data: Map<String, Value>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            event_id: LifecycleEventId::new(),
            event_type,
            repo_id: repo_id.into(),
            run_id: run_id.into(),
            data,
            origin: origin.into(),
            timestamp: now_iso_utc(),
            processed: false,
        }
    }

    fn transition_token(&self) -> Option<&str> {
        self.data
            .get(TRANSITION_TOKEN_KEY)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Dedup key for terminal flow events.
    fn semantic_identity(&self) -> (String, String, String, Option<String>) {
        (
            self.event_type.as_str().to_string(),
            self.repo_id.clone(),
            self.run_id.clone(),
            self.transition_token().map(str::to_string),
        )
    }

    fn to_json(&self) -> Value {
        json!({
            "event_id": self.event_id,
            "event_type": self.event_type.as_str(),
            "repo_id": self.repo_id,
            "run_id": self.run_id,
            "data": Value::Object(self.data.clone()),
            "origin": self.origin,
            "timestamp": self.timestamp,
            "processed": self.processed,
        })
    }

    /// Tolerant parse; `None` drops the entry rather than failing the
    /// whole file.
    fn from_json(entry: &Value) -> Option<Self> {
        let entry = entry.as_object()?;
        let event_type = LifecycleEventType::parse(entry.get("event_type")?.as_str()?)?;
        let event_id = match entry.get("event_id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => LifecycleEventId::from_string(id),
            _ => LifecycleEventId::new(),
        };
        let origin = entry
            .get("origin")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .unwrap_or("system");
        Some(Self {
            event_id,
            event_type,
            repo_id: entry.get("repo_id").and_then(Value::as_str).unwrap_or("").to_string(),
            run_id: entry.get("run_id").and_then(Value::as_str).unwrap_or("").to_string(),
            data: entry
                .get("data")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            origin: origin.to_string(),
            timestamp: entry
                .get("timestamp")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            processed: entry.get("processed").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    fn duplicate_count(&self) -> u64 {
        match self.data.get("duplicate_count") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            Some(Value::Bool(b)) => *b as u64,
            _ => 0,
        }
    }

    fn annotate_duplicate(&mut self, seen_at: &str) {
        let count = self.duplicate_count();
        let first_seen = self
            .data
            .get("first_seen_at")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| {
                let existing = self.timestamp.trim();
                if existing.is_empty() {
                    None
                } else {
                    Some(existing.to_string())
                }
            })
            .unwrap_or_else(|| seen_at.to_string());
        self.data.insert("duplicate_count".to_string(), json!(count + 1));
        self.data.insert("first_seen_at".to_string(), json!(first_seen));
        self.data.insert("last_seen_at".to_string(), json!(seen_at));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendResult {
    pub event_id: LifecycleEventId,
    pub deduped: bool,
}

pub struct LifecycleEventStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl LifecycleEventStore {
    pub fn new(hub_root: &Path) -> Self {
        Self {
            path: paths::lifecycle_events_path(hub_root),
            lock_path: paths::lifecycle_events_lock_path(hub_root),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_unlocked(&self) -> Vec<LifecycleEvent> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "lifecycle read failed");
                return Vec::new();
            }
        };
        let parsed: Value = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "lifecycle parse failed");
                return Vec::new();
            }
        };
        let Value::Array(entries) = parsed else {
            tracing::warn!(path = %self.path.display(), "lifecycle data is not a list");
            return Vec::new();
        };
        entries.iter().filter_map(LifecycleEvent::from_json).collect()
    }

    fn save_unlocked(&self, events: &[LifecycleEvent]) -> Result<(), HubError> {
        let data: Vec<Value> = events.iter().map(LifecycleEvent::to_json).collect();
        let mut body = serde_json::to_vec_pretty(&data)?;
        body.push(b'\n');
        atomic_write(&self.path, &body)?;
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<LifecycleEvent>, HubError> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        Ok(self.load_unlocked())
    }

    pub fn save(&self, events: &[LifecycleEvent]) -> Result<(), HubError> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        self.save_unlocked(events)
    }

    /// Append, collapsing duplicate terminal flow events onto the
    /// first observation.
    pub fn append_with_result(&self, event: LifecycleEvent) -> Result<AppendResult, HubError> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let mut events = self.load_unlocked();
        if event.event_type.is_terminal_flow_event() {
            let key = event.semantic_identity();
            let duplicate = events.iter_mut().find(|existing| {
                existing.event_type.is_terminal_flow_event()
                    && existing.semantic_identity() == key
            });
            if let Some(existing) = duplicate {
                let seen_at = if event.timestamp.trim().is_empty() {
                    now_iso_utc()
                } else {
                    event.timestamp.clone()
                };
                existing.annotate_duplicate(&seen_at);
                let event_id = existing.event_id.clone();
                self.save_unlocked(&events)?;
                return Ok(AppendResult { event_id, deduped: true });
            }
        }
        let event_id = event.event_id.clone();
        events.push(event);
        self.save_unlocked(&events)?;
        Ok(AppendResult { event_id, deduped: false })
    }

    pub fn mark_processed(
        &self,
        event_id: &str,
    ) -> Result<Option<LifecycleEvent>, HubError> {
        if event_id.is_empty() {
            return Ok(None);
        }
        let _lock = FileLock::acquire(&self.lock_path)?;
        let mut events = self.load_unlocked();
        let mut updated = None;
        for event in &mut events {
            if event.event_id.as_str() == event_id {
                event.processed = true;
                updated = Some(event.clone());
                break;
            }
        }
        if updated.is_some() {
            self.save_unlocked(&events)?;
        }
        Ok(updated)
    }

    /// At most `limit` unprocessed events in file order.
    pub fn get_unprocessed(&self, limit: usize) -> Result<Vec<LifecycleEvent>, HubError> {
        let events = self.load()?;
        Ok(events.into_iter().filter(|e| !e.processed).take(limit).collect())
    }

    /// Keep every unprocessed event plus the tail of processed ones.
    pub fn prune_processed(&self, keep_last: usize) -> Result<(), HubError> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let events = self.load_unlocked();
        let (processed, unprocessed): (Vec<_>, Vec<_>) =
            events.into_iter().partition(|e| e.processed);
        let keep_from = processed.len().saturating_sub(keep_last);
        let mut kept = unprocessed;
        kept.extend(processed.into_iter().skip(keep_from));
        self.save_unlocked(&kept)
    }
}

/// Typed emit surface over the store. The bus is best-effort: I/O
/// failures are logged and swallowed, the flow store stays
/// authoritative.
pub struct LifecycleEmitter {
    store: LifecycleEventStore,
}

impl LifecycleEmitter {
    pub fn new(hub_root: &Path) -> Self {
        Self { store: LifecycleEventStore::new(hub_root) }
    }

    pub fn store(&self) -> &LifecycleEventStore {
        &self.store
    }

    pub fn append(&self, event: LifecycleEvent) -> Option<AppendResult> {
        match self.store.append_with_result(event) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(error = %e, "lifecycle emit failed");
                None
            }
        }
    }

    pub fn emit_typed(
        &self,
        event_type: LifecycleEventType,
        repo_id: &str,
        run_id: &str,
        data: Map<String, Value>,
        origin: &str,
    ) -> Option<AppendResult> {
        self.append(LifecycleEvent::new(event_type, repo_id, run_id, data, origin))
    }
}

impl car_flow::LifecycleSink for LifecycleEmitter {
    fn emit(&self, event_type: LifecycleEventType, repo_id: &str, run_id: &str, data: &Value) {
        let data = data.as_object().cloned().unwrap_or_default();
        self.emit_typed(event_type, repo_id, run_id, data, "system");
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
