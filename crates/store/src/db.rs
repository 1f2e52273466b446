// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite connection setup: pragma ladder and schema migration.

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("flow run not found: {0}")]
    RunNotFound(String),
    #[error("flow run already exists: {0}")]
    RunExists(String),
    #[error("invalid column value for {column}: {value}")]
    InvalidColumn { column: &'static str, value: String },
}

const SCHEMA_VERSION: i64 = 1;

/// Open (creating if needed) a flows database with the standard
/// pragmas applied and the schema migrated.
///
/// `durable` selects `synchronous=FULL` over the default `NORMAL`.
pub fn open_flows_db(path: &Path, durable: bool) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    apply_pragmas(&conn, durable)?;
    migrate(&conn)?;
    Ok(conn)
}

/// In-memory database for tests.
pub fn open_in_memory() -> Result<Connection, StoreError> {
    let conn = Connection::open_in_memory()?;
    apply_pragmas(&conn, false)?;
    migrate(&conn)?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection, durable: bool) -> Result<(), StoreError> {
    // journal_mode returns a row; the rest are plain settings.
    let _mode: String =
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    let synchronous = if durable { "FULL" } else { "NORMAL" };
    conn.execute_batch(&format!(
        "PRAGMA synchronous={synchronous};\n\
         PRAGMA foreign_keys=ON;\n\
         PRAGMA busy_timeout=5000;\n\
         PRAGMA temp_store=MEMORY;"
    ))?;
    Ok(())
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }
    conn.execute_batch(
        "BEGIN;
         CREATE TABLE IF NOT EXISTS flow_runs (
             run_id          TEXT PRIMARY KEY,
             flow_type       TEXT NOT NULL,
             status          TEXT NOT NULL,
             current_step    TEXT NOT NULL,
             input_data_json TEXT NOT NULL DEFAULT '{}',
             state_json      TEXT NOT NULL DEFAULT '{}',
             metadata_json   TEXT NOT NULL DEFAULT '{}',
             error_message   TEXT,
             created_at      TEXT NOT NULL,
             started_at      TEXT,
             finished_at     TEXT,
             stop_requested  INTEGER NOT NULL DEFAULT 0
         );
         CREATE TABLE IF NOT EXISTS flow_events (
             event_id   TEXT PRIMARY KEY,
             run_id     TEXT NOT NULL REFERENCES flow_runs(run_id) ON DELETE CASCADE,
             seq        INTEGER NOT NULL,
             event_type TEXT NOT NULL,
             data_json  TEXT NOT NULL DEFAULT '{}',
             created_at TEXT NOT NULL,
             UNIQUE (run_id, seq)
         );
         CREATE TABLE IF NOT EXISTS flow_artifacts (
             artifact_id   TEXT PRIMARY KEY,
             run_id        TEXT NOT NULL REFERENCES flow_runs(run_id) ON DELETE CASCADE,
             kind          TEXT NOT NULL,
             path          TEXT NOT NULL,
             metadata_json TEXT NOT NULL DEFAULT '{}',
             created_at    TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_flow_events_run_seq
             ON flow_events(run_id, seq);
         CREATE INDEX IF NOT EXISTS idx_flow_runs_type_status
             ON flow_runs(flow_type, status);
         PRAGMA user_version = 1;
         COMMIT;",
    )?;
    Ok(())
}

#[cfg(test)]
#[path = "db_tests.rs"]
mod tests;
