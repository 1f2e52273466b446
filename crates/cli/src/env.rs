// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the CLI.

/// `CODEX_AUTORUNNER_SKIP_UPDATE_CHECKS=1` skips self-update integrity
/// checks (the updater itself lives outside the hub core).
pub fn skip_update_checks() -> bool {
    std::env::var("CODEX_AUTORUNNER_SKIP_UPDATE_CHECKS")
        .map(|v| v == "1")
        .unwrap_or(false)
}
