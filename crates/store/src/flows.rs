// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed flow store over the flows database.
//!
//! All writes run inside IMMEDIATE transactions; cross-process write
//! contention is serialized by SQLite's busy timeout. Readers are safe
//! under WAL.

use crate::db::{open_flows_db, StoreError};
use crate::records::{FlowArtifactRecord, FlowEventRecord, FlowRunRecord, NewFlowRun, Patch};
use car_core::{now_iso_utc, now_iso_utc_micros, FlowEventType, FlowStatus, RunId};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use std::path::Path;

/// Artifact kinds limited to one row per run.
const SINGLETON_ARTIFACT_KINDS: &[&str] = &["worker_crash"];

pub struct FlowStore {
    conn: Mutex<Connection>,
}

impl FlowStore {
    /// Open the store at `path`, migrating the schema if needed.
    pub fn open(path: &Path, durable: bool) -> Result<Self, StoreError> {
        Ok(Self { conn: Mutex::new(open_flows_db(path, durable)?) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self { conn: Mutex::new(crate::db::open_in_memory()?) })
    }

    pub fn create_flow_run(&self, new: NewFlowRun) -> Result<FlowRunRecord, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if get_run_conn(&tx, new.run_id.as_str())?.is_some() {
            return Err(StoreError::RunExists(new.run_id.to_string()));
        }
        let created_at = now_iso_utc();
        tx.execute(
            "INSERT INTO flow_runs (run_id, flow_type, status, current_step,
                 input_data_json, state_json, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.run_id.as_str(),
                new.flow_type,
                FlowStatus::Pending.as_str(),
                new.current_step,
                serde_json::to_string(&new.input_data)?,
                serde_json::to_string(&new.state.unwrap_or_else(empty_object))?,
                serde_json::to_string(&new.metadata.unwrap_or_else(empty_object))?,
                created_at,
            ],
        )?;
        let record = require_run(&tx, new.run_id.as_str())?;
        tx.commit()?;
        Ok(record)
    }

    pub fn get_flow_run(&self, run_id: &str) -> Result<Option<FlowRunRecord>, StoreError> {
        let conn = self.conn.lock();
        get_run_conn(&conn, run_id)
    }

    /// List runs, newest first, optionally filtered.
    pub fn list_flow_runs(
        &self,
        flow_type: Option<&str>,
        status: Option<FlowStatus>,
    ) -> Result<Vec<FlowRunRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT run_id, flow_type, status, current_step, input_data_json, state_json,
                    metadata_json, error_message, created_at, started_at, finished_at,
                    stop_requested
             FROM flow_runs WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(flow_type) = flow_type {
            sql.push_str(" AND flow_type = ?");
            args.push(flow_type.to_string());
        }
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            args.push(status.as_str().to_string());
        }
        sql.push_str(" ORDER BY created_at DESC, run_id DESC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), run_row)?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(raw?.into_record()?);
        }
        Ok(records)
    }

    pub fn delete_flow_run(&self, run_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM flow_runs WHERE run_id = ?1", [run_id])?;
        Ok(deleted > 0)
    }

    /// Update a run's status and related columns.
    ///
    /// `Patch::Keep` preserves a column; `Patch::Set(None)` nulls it.
    /// Terminal → terminal transitions are idempotent no-ops. Moving to
    /// a terminal status with `finished_at = Keep` stamps UTC-now;
    /// moving to a non-terminal status clears `finished_at` unless one
    /// is given explicitly.
    pub fn update_flow_run_status(
        &self,
        run_id: &str,
        status: FlowStatus,
        state: Patch<Value>,
        finished_at: Patch<String>,
        error_message: Patch<String>,
    ) -> Result<FlowRunRecord, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = require_run(&tx, run_id)?;

        if current.status.is_terminal() && status.is_terminal() {
            tx.commit()?;
            return Ok(current);
        }

        let state_json = match state {
            Patch::Keep => serde_json::to_string(&current.state)?,
            Patch::Set(Some(value)) => serde_json::to_string(&value)?,
            Patch::Set(None) => serde_json::to_string(&empty_object())?,
        };
        let finished = if status.is_terminal() {
            match finished_at {
                Patch::Keep => Some(now_iso_utc()),
                Patch::Set(value) => value,
            }
        } else {
            match finished_at {
                Patch::Keep => None,
                Patch::Set(value) => value,
            }
        };
        let started = if status == FlowStatus::Running && current.started_at.is_none() {
            Some(now_iso_utc())
        } else {
            current.started_at.clone()
        };
        let error = error_message.resolve(current.error_message.clone());

        tx.execute(
            "UPDATE flow_runs
             SET status = ?2, state_json = ?3, finished_at = ?4, started_at = ?5,
                 error_message = ?6
             WHERE run_id = ?1",
            params![run_id, status.as_str(), state_json, finished, started, error],
        )?;
        let record = require_run(&tx, run_id)?;
        tx.commit()?;
        Ok(record)
    }

    /// Change the current step without touching status.
    pub fn set_current_step(&self, run_id: &str, step: &str) -> Result<FlowRunRecord, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_run(&tx, run_id)?;
        tx.execute(
            "UPDATE flow_runs SET current_step = ?2 WHERE run_id = ?1",
            params![run_id, step],
        )?;
        let record = require_run(&tx, run_id)?;
        tx.commit()?;
        Ok(record)
    }

    pub fn set_stop_requested(
        &self,
        run_id: &str,
        flag: bool,
    ) -> Result<FlowRunRecord, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_run(&tx, run_id)?;
        tx.execute(
            "UPDATE flow_runs SET stop_requested = ?2 WHERE run_id = ?1",
            params![run_id, flag as i64],
        )?;
        let record = require_run(&tx, run_id)?;
        tx.commit()?;
        Ok(record)
    }

    /// Append an event, assigning the next gap-free sequence number.
    pub fn create_event(
        &self,
        event_id: &str,
        run_id: &str,
        event_type: FlowEventType,
        data: Value,
    ) -> Result<FlowEventRecord, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_run(&tx, run_id)?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM flow_events WHERE run_id = ?1",
            [run_id],
            |row| row.get(0),
        )?;
        let created_at = now_iso_utc_micros();
        tx.execute(
            "INSERT INTO flow_events (event_id, run_id, seq, event_type, data_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event_id,
                run_id,
                seq,
                event_type.as_str(),
                serde_json::to_string(&data)?,
                created_at,
            ],
        )?;
        tx.commit()?;
        Ok(FlowEventRecord {
            id: event_id.to_string(),
            run_id: RunId::from_string(run_id),
            seq,
            event_type,
            data,
            created_at,
        })
    }

    /// Events with `seq > after_seq`, ascending.
    pub fn get_events(
        &self,
        run_id: &str,
        after_seq: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<FlowEventRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT event_id, run_id, seq, event_type, data_json, created_at
             FROM flow_events
             WHERE run_id = ?1 AND seq > ?2
             ORDER BY seq ASC
             LIMIT ?3",
        )?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(params![run_id, after_seq.unwrap_or(0), limit], event_row)?;
        let mut events = Vec::new();
        for raw in rows {
            events.push(raw?.into_record()?);
        }
        Ok(events)
    }

    pub fn get_last_event_by_type(
        &self,
        run_id: &str,
        event_type: FlowEventType,
    ) -> Result<Option<FlowEventRecord>, StoreError> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                "SELECT event_id, run_id, seq, event_type, data_json, created_at
                 FROM flow_events
                 WHERE run_id = ?1 AND event_type = ?2
                 ORDER BY seq DESC LIMIT 1",
                params![run_id, event_type.as_str()],
                event_row,
            )
            .optional()?;
        raw.map(RawEvent::into_record).transpose()
    }

    /// `(seq, created_at)` of the newest event, if any.
    pub fn get_last_event_meta(
        &self,
        run_id: &str,
    ) -> Result<Option<(i64, String)>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT seq, created_at FROM flow_events
                 WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1",
                [run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    /// Create an artifact row. Singleton kinds return the existing row
    /// instead of inserting a duplicate.
    pub fn create_artifact(
        &self,
        artifact_id: &str,
        run_id: &str,
        kind: &str,
        path: &str,
        metadata: Value,
    ) -> Result<FlowArtifactRecord, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_run(&tx, run_id)?;
        if SINGLETON_ARTIFACT_KINDS.contains(&kind) {
            let existing = tx
                .query_row(
                    "SELECT artifact_id, run_id, kind, path, metadata_json, created_at
                     FROM flow_artifacts WHERE run_id = ?1 AND kind = ?2 LIMIT 1",
                    params![run_id, kind],
                    artifact_row,
                )
                .optional()?;
            if let Some(existing) = existing {
                tx.commit()?;
                return existing.into_record();
            }
        }
        let created_at = now_iso_utc();
        tx.execute(
            "INSERT INTO flow_artifacts (artifact_id, run_id, kind, path, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![artifact_id, run_id, kind, path, serde_json::to_string(&metadata)?, created_at],
        )?;
        tx.commit()?;
        Ok(FlowArtifactRecord {
            id: artifact_id.to_string(),
            run_id: RunId::from_string(run_id),
            kind: kind.to_string(),
            path: path.to_string(),
            metadata,
            created_at,
        })
    }

    pub fn get_artifacts(&self, run_id: &str) -> Result<Vec<FlowArtifactRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT artifact_id, run_id, kind, path, metadata_json, created_at
             FROM flow_artifacts WHERE run_id = ?1 ORDER BY created_at ASC, artifact_id ASC",
        )?;
        let rows = stmt.query_map([run_id], artifact_row)?;
        let mut artifacts = Vec::new();
        for raw in rows {
            artifacts.push(raw?.into_record()?);
        }
        Ok(artifacts)
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

struct RawRun {
    run_id: String,
    flow_type: String,
    status: String,
    current_step: String,
    input_data_json: String,
    state_json: String,
    metadata_json: String,
    error_message: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    stop_requested: i64,
}

impl RawRun {
    fn into_record(self) -> Result<FlowRunRecord, StoreError> {
        let status = FlowStatus::parse(&self.status).ok_or(StoreError::InvalidColumn {
            column: "status",
            value: self.status.clone(),
        })?;
        Ok(FlowRunRecord {
            id: RunId::from_string(self.run_id),
            flow_type: self.flow_type,
            status,
            current_step: self.current_step,
            input_data: serde_json::from_str(&self.input_data_json)?,
            state: serde_json::from_str(&self.state_json)?,
            metadata: serde_json::from_str(&self.metadata_json)?,
            error_message: self.error_message,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            stop_requested: self.stop_requested != 0,
        })
    }
}

fn run_row(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        run_id: row.get(0)?,
        flow_type: row.get(1)?,
        status: row.get(2)?,
        current_step: row.get(3)?,
        input_data_json: row.get(4)?,
        state_json: row.get(5)?,
        metadata_json: row.get(6)?,
        error_message: row.get(7)?,
        created_at: row.get(8)?,
        started_at: row.get(9)?,
        finished_at: row.get(10)?,
        stop_requested: row.get(11)?,
    })
}

struct RawEvent {
    event_id: String,
    run_id: String,
    seq: i64,
    event_type: String,
    data_json: String,
    created_at: String,
}

impl RawEvent {
    fn into_record(self) -> Result<FlowEventRecord, StoreError> {
        let event_type =
            FlowEventType::parse(&self.event_type).ok_or(StoreError::InvalidColumn {
                column: "event_type",
                value: self.event_type.clone(),
            })?;
        Ok(FlowEventRecord {
            id: self.event_id,
            run_id: RunId::from_string(self.run_id),
            seq: self.seq,
            event_type,
            data: serde_json::from_str(&self.data_json)?,
            created_at: self.created_at,
        })
    }
}

fn event_row(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        event_id: row.get(0)?,
        run_id: row.get(1)?,
        seq: row.get(2)?,
        event_type: row.get(3)?,
        data_json: row.get(4)?,
        created_at: row.get(5)?,
    })
}

struct RawArtifact {
    artifact_id: String,
    run_id: String,
    kind: String,
    path: String,
    metadata_json: String,
    created_at: String,
}

impl RawArtifact {
    fn into_record(self) -> Result<FlowArtifactRecord, StoreError> {
        Ok(FlowArtifactRecord {
            id: self.artifact_id,
            run_id: RunId::from_string(self.run_id),
            kind: self.kind,
            path: self.path,
            metadata: serde_json::from_str(&self.metadata_json)?,
            created_at: self.created_at,
        })
    }
}

fn artifact_row(row: &Row<'_>) -> rusqlite::Result<RawArtifact> {
    Ok(RawArtifact {
        artifact_id: row.get(0)?,
        run_id: row.get(1)?,
        kind: row.get(2)?,
        path: row.get(3)?,
        metadata_json: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn get_run_conn(conn: &Connection, run_id: &str) -> Result<Option<FlowRunRecord>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT run_id, flow_type, status, current_step, input_data_json, state_json,
                    metadata_json, error_message, created_at, started_at, finished_at,
                    stop_requested
             FROM flow_runs WHERE run_id = ?1",
            [run_id],
            run_row,
        )
        .optional()?;
    raw.map(RawRun::into_record).transpose()
}

fn require_run(conn: &Connection, run_id: &str) -> Result<FlowRunRecord, StoreError> {
    get_run_conn(conn, run_id)?.ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
}

#[cfg(test)]
#[path = "flows_tests.rs"]
mod tests;
