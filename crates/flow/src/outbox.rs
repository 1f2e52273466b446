// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-run outbox: the current `DISPATCH.md`, its archived history,
//! and human replies.

use crate::error::FlowError;
use car_core::{atomic_write_json, now_iso_utc, paths, DispatchDoc};
use serde_json::json;
use std::path::{Path, PathBuf};

/// Resolved locations of one run's outbox tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxPaths {
    pub run_dir: PathBuf,
    pub dispatch_dir: PathBuf,
    pub dispatch_path: PathBuf,
    pub dispatch_history_dir: PathBuf,
    pub reply_history_dir: PathBuf,
}

pub fn resolve_outbox_paths(workspace_root: &Path, runs_dir: &Path, run_id: &str) -> OutboxPaths {
    let run_dir = paths::run_dir(workspace_root, runs_dir, run_id);
    OutboxPaths {
        dispatch_dir: paths::dispatch_dir(&run_dir),
        dispatch_path: paths::dispatch_path(&run_dir),
        dispatch_history_dir: paths::dispatch_history_dir(&run_dir),
        reply_history_dir: paths::reply_history_dir(&run_dir),
        run_dir,
    }
}

pub fn ensure_outbox_dirs(paths: &OutboxPaths) -> Result<(), FlowError> {
    std::fs::create_dir_all(&paths.dispatch_dir)?;
    std::fs::create_dir_all(&paths.dispatch_history_dir)?;
    std::fs::create_dir_all(&paths.reply_history_dir)?;
    Ok(())
}

/// Highest numeric sequence directory in a history dir, 0 when none.
pub fn latest_seq(history_dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(history_dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_string_lossy().trim().parse::<u64>().ok())
        .max()
        .unwrap_or(0)
}

/// Provenance recorded next to each archived dispatch.
#[derive(Debug, Clone, Default)]
pub struct ArchiveMeta {
    pub ticket_id: Option<String>,
    pub repo_id: String,
    pub run_id: String,
    pub origin: String,
}

#[derive(Debug, Clone)]
pub struct ArchivedDispatch {
    pub seq: u64,
    pub doc: DispatchDoc,
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Archive the current `DISPATCH.md` plus sibling attachments into
/// `dispatch_history/<seq>/`.
///
/// The destination directory must not exist; a second archive of the
/// same seq fails with `ArchiveConflict`, which is what makes dispatch
/// archival idempotent under races.
pub fn archive_dispatch(
    outbox: &OutboxPaths,
    next_seq: u64,
    meta: &ArchiveMeta,
) -> Result<ArchivedDispatch, FlowError> {
    let doc = DispatchDoc::load(&outbox.dispatch_path)?;
    let dest = outbox.dispatch_history_dir.join(paths::history_seq_name(next_seq));
    std::fs::create_dir_all(&outbox.dispatch_history_dir)?;
    std::fs::create_dir(&dest).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            FlowError::ArchiveConflict { seq: next_seq, dir: dest.clone() }
        } else {
            FlowError::Io(e)
        }
    })?;

    let mut files = Vec::new();
    for entry in std::fs::read_dir(&outbox.dispatch_dir)? {
        let entry = entry?;
        let source = entry.path();
        if !source.is_file() {
            continue;
        }
        let target = dest.join(entry.file_name());
        std::fs::rename(&source, &target)?;
        files.push(target);
    }
    files.sort();

    atomic_write_json(
        &dest.join("meta.json"),
        &json!({
            "seq": next_seq,
            "mode": doc.mode.as_str(),
            "title": doc.title,
            "ticket_id": meta.ticket_id,
            "repo_id": meta.repo_id,
            "run_id": meta.run_id,
            "origin": meta.origin,
            "archived_at": now_iso_utc(),
        }),
    )?;

    Ok(ArchivedDispatch { seq: next_seq, doc, dir: dest, files })
}

/// The newest reply not yet consumed, given the consumed watermark.
/// Returns `(seq, body)`.
pub fn read_unconsumed_reply(
    reply_history_dir: &Path,
    consumed_seq: u64,
) -> Result<Option<(u64, String)>, FlowError> {
    let latest = latest_seq(reply_history_dir);
    if latest <= consumed_seq {
        return Ok(None);
    }
    let path = reply_history_dir.join(paths::history_seq_name(latest)).join("USER_REPLY.md");
    let body = match std::fs::read_to_string(&path) {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Accept unpadded directory names written by hand.
            let alt = reply_history_dir.join(latest.to_string()).join("USER_REPLY.md");
            match std::fs::read_to_string(alt) {
                Ok(body) => body,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Some((latest, body)))
}

#[cfg(test)]
#[path = "outbox_tests.rs"]
mod tests;
