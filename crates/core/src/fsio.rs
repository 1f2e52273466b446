// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Atomic file writes and advisory file locks.
//!
//! Every writer of a shared file (lifecycle events, managed-process
//! registry, dismissal stores) goes through these helpers.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock busy: {0}")]
    LockBusy(PathBuf),
}

/// Write `bytes` to `path` atomically: write to a sibling `.tmp` file,
/// fsync, then rename over the target. Readers observe either the old
/// contents or the new contents, never a partial file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), FsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e.into())
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), FsError> {
    let mut body = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
    body.push(b'\n');
    atomic_write(path, &body)
}

/// Read and deserialize a JSON file. `Ok(None)` when the file is absent.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, FsError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value = serde_json::from_slice(&raw).map_err(std::io::Error::other)?;
    Ok(Some(value))
}

/// An exclusive OS advisory lock on a sidecar lock file.
///
/// The lock is released when the guard drops, on every exit path.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock, blocking until it is available.
    pub fn acquire(path: &Path) -> Result<Self, FsError> {
        let file = Self::open_lock_file(path)?;
        file.lock_exclusive()?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    /// Try to acquire the lock without blocking. Contention yields
    /// `FsError::LockBusy`.
    pub fn try_acquire(path: &Path) -> Result<Self, FsError> {
        let file = Self::open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path: path.to_path_buf() }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(FsError::LockBusy(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_lock_file(path: &Path) -> Result<File, FsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Never truncate: the file may be held by another process.
        Ok(OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
#[path = "fsio_tests.rs"]
mod tests;
