// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ticket documents: ordered markdown files with YAML frontmatter.
//!
//! Filenames follow `TICKET-<index>[suffix].md`; the index orders the
//! queue. Frontmatter carries the orchestration keys (`agent`, `done`,
//! `title`, `goal`, `requires`); unknown keys are preserved in `extra`.

use crate::frontmatter;
use serde_yaml::{Mapping, Value as Yaml};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("io error reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("ticket filename does not match TICKET-<index>[suffix].md: {0}")]
    InvalidFilename(PathBuf),
    #[error("ticket has no frontmatter block: {0}")]
    MissingFrontmatter(PathBuf),
    #[error("invalid frontmatter yaml in {path}: {source}")]
    Yaml { path: PathBuf, source: serde_yaml::Error },
    #[error("ticket frontmatter field {field} is invalid in {path}")]
    InvalidField { path: PathBuf, field: &'static str },
    #[error("duplicate ticket index {index}: {a} and {b}")]
    DuplicateIndex { index: u32, a: PathBuf, b: PathBuf },
}

/// Parse a ticket index out of a filename. `None` when the name does
/// not match the canonical `TICKET-<index>[suffix].md` pattern.
pub fn parse_ticket_index(file_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix("TICKET-")?;
    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let (digits, suffix) = rest.split_at(digits_end);
    if !suffix.ends_with(".md") {
        return None;
    }
    digits.parse().ok()
}

/// Parsed, validated ticket frontmatter.
///
/// Only a minimal set of keys drives orchestration; everything else is
/// preserved in `extra` for forward compatibility.
#[derive(Debug, Clone, PartialEq)]
pub struct TicketFrontmatter {
    pub agent: String,
    pub done: bool,
    pub title: Option<String>,
    pub goal: Option<String>,
    pub requires: Vec<String>,
    pub extra: Mapping,
}

/// One ticket on disk.
#[derive(Debug, Clone)]
pub struct TicketDoc {
    pub path: PathBuf,
    pub index: u32,
    pub frontmatter: TicketFrontmatter,
    pub body: String,
    raw: frontmatter::SplitDoc,
}

impl TicketDoc {
    /// Parse a ticket from raw file contents.
    pub fn parse(path: &Path, raw: &str) -> Result<Self, TicketError> {
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let index = file_name
            .as_deref()
            .and_then(parse_ticket_index)
            .ok_or_else(|| TicketError::InvalidFilename(path.to_path_buf()))?;

        let split = frontmatter::split(raw)
            .ok_or_else(|| TicketError::MissingFrontmatter(path.to_path_buf()))?;
        let mapping: Mapping = serde_yaml::from_str(&split.frontmatter)
            .map_err(|source| TicketError::Yaml { path: path.to_path_buf(), source })?;
        let frontmatter = parse_frontmatter(path, mapping)?;

        Ok(Self {
            path: path.to_path_buf(),
            index,
            body: split.body.clone(),
            frontmatter,
            raw: split,
        })
    }

    /// Read and parse a ticket file.
    pub fn load(path: &Path) -> Result<Self, TicketError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| TicketError::Io { path: path.to_path_buf(), source })?;
        Self::parse(path, &raw)
    }

    /// Render the ticket back to its on-disk form.
    ///
    /// The original frontmatter text is kept verbatim, so an unmodified
    /// parse-render cycle is byte-identical.
    pub fn render(&self) -> String {
        frontmatter::render(&self.raw)
    }

    pub fn file_name(&self) -> String {
        self.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    }
}

fn parse_frontmatter(path: &Path, mut mapping: Mapping) -> Result<TicketFrontmatter, TicketError> {
    let agent = match mapping.remove("agent") {
        Some(Yaml::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => return Err(TicketError::InvalidField { path: path.to_path_buf(), field: "agent" }),
    };
    let done = match mapping.remove("done") {
        Some(Yaml::Bool(b)) => b,
        None => false,
        Some(_) => {
            return Err(TicketError::InvalidField { path: path.to_path_buf(), field: "done" })
        }
    };
    let title = take_optional_string(&mut mapping, "title");
    let goal = take_optional_string(&mut mapping, "goal");
    let requires = match mapping.remove("requires") {
        None | Some(Yaml::Null) => Vec::new(),
        Some(Yaml::Sequence(items)) => normalize_requires(items),
        Some(_) => {
            return Err(TicketError::InvalidField { path: path.to_path_buf(), field: "requires" })
        }
    };
    Ok(TicketFrontmatter { agent, done, title, goal, requires, extra: mapping })
}

fn take_optional_string(mapping: &mut Mapping, key: &str) -> Option<String> {
    match mapping.remove(key) {
        Some(Yaml::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Some(other) => {
            // Preserve non-string oddities instead of dropping them.
            mapping.insert(Yaml::String(key.to_string()), other);
            None
        }
        None => None,
    }
}

/// Trim, drop empties, and dedupe while preserving order.
fn normalize_requires(items: Vec<Yaml>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let Yaml::String(s) = item else { continue };
        let cleaned = s.trim();
        if cleaned.is_empty() || !seen.insert(cleaned.to_string()) {
            continue;
        }
        out.push(cleaned.to_string());
    }
    out
}

/// Sorted ticket paths in a directory. A missing directory is empty.
pub fn list_ticket_paths(dir: &Path) -> Result<Vec<PathBuf>, TicketError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(TicketError::Io { path: dir.to_path_buf(), source }),
    };
    let mut indexed: Vec<(u32, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| TicketError::Io { path: dir.to_path_buf(), source })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(index) = parse_ticket_index(&name) {
            indexed.push((index, entry.path()));
        }
    }
    indexed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    for pair in indexed.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(TicketError::DuplicateIndex {
                index: pair[0].0,
                a: pair[0].1.clone(),
                b: pair[1].1.clone(),
            });
        }
    }
    Ok(indexed.into_iter().map(|(_, path)| path).collect())
}

/// Load every ticket in a directory, ordered by index.
pub fn list_ticket_docs(dir: &Path) -> Result<Vec<TicketDoc>, TicketError> {
    list_ticket_paths(dir)?.iter().map(|path| TicketDoc::load(path)).collect()
}

#[cfg(test)]
#[path = "ticket_tests.rs"]
mod tests;
