// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subprocess termination: SIGTERM, a grace period, then SIGKILL —
//! against the process group first so agent children don't orphan,
//! with a pid-only fallback.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::time::Duration;

/// Signal-0 probe. EPERM means the pid exists but belongs to someone
/// else, which still counts as running.
pub fn pid_is_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Signal-0 probe for a process group. Unlike pids, a group we cannot
/// signal is useless to us, so EPERM reports not-running.
pub fn pgid_is_running(pgid: i32) -> bool {
    if pgid <= 0 {
        return false;
    }
    killpg(Pid::from_raw(pgid), None).is_ok()
}

/// The process group of `pid`, when the OS will tell us.
pub fn pgid_of(pid: i32) -> Option<i32> {
    nix::unistd::getpgid(Some(Pid::from_raw(pid))).ok().map(Pid::as_raw)
}

fn send_pid_signal(pid: i32, signal: Signal) -> bool {
    match kill(Pid::from_raw(pid), Some(signal)) {
        Ok(()) => true,
        // Already gone counts as delivered.
        Err(Errno::ESRCH) => true,
        Err(Errno::EPERM) => {
            tracing::warn!(pid, signal = %signal, "signal permission denied");
            false
        }
        Err(errno) => {
            tracing::debug!(pid, signal = %signal, %errno, "signal error");
            true
        }
    }
}

fn send_pgid_signal(pgid: i32, signal: Signal) -> bool {
    match killpg(Pid::from_raw(pgid), Some(signal)) {
        Ok(()) => true,
        Err(Errno::ESRCH) => true,
        Err(Errno::EPERM) => {
            tracing::warn!(pgid, signal = %signal, "group signal permission denied");
            false
        }
        Err(errno) => {
            tracing::debug!(pgid, signal = %signal, %errno, "group signal error");
            true
        }
    }
}

/// Terminate a single pid via SIGTERM then SIGKILL.
///
/// Blocking (sleeps through the grace window); call from a blocking
/// task in async contexts.
pub fn terminate_pid(pid: i32, grace: Duration, kill_wait: Duration) -> bool {
    if pid <= 0 {
        return false;
    }
    if !send_pid_signal(pid, Signal::SIGTERM) {
        return false;
    }
    if !grace.is_zero() {
        std::thread::sleep(grace);
    }
    if !send_pid_signal(pid, Signal::SIGKILL) {
        return false;
    }
    if !kill_wait.is_zero() {
        std::thread::sleep(kill_wait);
    }
    true
}

/// Terminate a process group via SIGTERM then SIGKILL.
pub fn terminate_group(pgid: i32, grace: Duration, kill_wait: Duration) -> bool {
    if pgid <= 0 {
        return false;
    }
    if !send_pgid_signal(pgid, Signal::SIGTERM) {
        return false;
    }
    if !grace.is_zero() {
        std::thread::sleep(grace);
    }
    if !send_pgid_signal(pgid, Signal::SIGKILL) {
        return false;
    }
    if !kill_wait.is_zero() {
        std::thread::sleep(kill_wait);
    }
    true
}

/// Terminate both targets of a registry record. The group goes first;
/// a target is terminated when at least one path succeeds.
pub fn terminate_record(
    pid: Option<i32>,
    pgid: Option<i32>,
    grace: Duration,
    kill_wait: Duration,
) -> bool {
    let mut had_target = false;
    let mut group_ok = false;
    let mut pid_ok = false;
    if let Some(pgid) = pgid {
        had_target = true;
        group_ok = terminate_group(pgid, grace, kill_wait);
    }
    if let Some(pid) = pid {
        had_target = true;
        pid_ok = terminate_pid(pid, grace, kill_wait);
    }
    if !had_target {
        tracing::warn!("terminate_record called with no target");
        return false;
    }
    let ok = group_ok || pid_ok;
    if !ok {
        tracing::warn!(?pid, ?pgid, "terminate_record failed on both paths");
    }
    ok
}

#[cfg(test)]
#[path = "terminate_tests.rs"]
mod tests;
