// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ISO-8601 UTC timestamp helpers

use chrono::{DateTime, SecondsFormat, Utc};

/// Current time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn now_iso_utc() -> String {
    format_iso_utc(Utc::now())
}

/// Format a time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn format_iso_utc(when: DateTime<Utc>) -> String {
    when.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Current time with microsecond precision, for orderings finer than
/// one second (event rows).
pub fn now_iso_utc_micros() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC3339/ISO-8601 timestamp into UTC. Returns `None` on
/// malformed input rather than failing the caller.
pub fn parse_iso_utc(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim()).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
#[path = "time_fmt_tests.rs"]
mod tests;
