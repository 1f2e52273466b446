// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dispatch documents: agent → human messages archived per turn.

use crate::frontmatter;
use serde_yaml::{Mapping, Value as Yaml};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("io error reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("dispatch has no frontmatter block")]
    MissingFrontmatter,
    #[error("invalid dispatch frontmatter yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid dispatch mode: {0:?}")]
    InvalidMode(Option<String>),
}

/// Semantics of a dispatch: `pause` forces the flow into `paused`,
/// `notify` and `turn_summary` do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Pause,
    Notify,
    TurnSummary,
}

impl DispatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Notify => "notify",
            Self::TurnSummary => "turn_summary",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pause" => Some(Self::Pause),
            "notify" => Some(Self::Notify),
            "turn_summary" => Some(Self::TurnSummary),
            _ => None,
        }
    }
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `DISPATCH.md`.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchDoc {
    pub mode: DispatchMode,
    pub title: Option<String>,
    pub extra: Mapping,
    pub body: String,
}

impl DispatchDoc {
    pub fn new(mode: DispatchMode, title: Option<String>, body: impl Into<String>) -> Self {
        Self { mode, title, extra: Mapping::new(), body: body.into() }
    }

    /// Parse a dispatch from raw file contents.
    pub fn parse(raw: &str) -> Result<Self, DispatchError> {
        let split = frontmatter::split(raw).ok_or(DispatchError::MissingFrontmatter)?;
        let mut mapping: Mapping = serde_yaml::from_str(&split.frontmatter)?;
        let mode_raw = match mapping.remove("mode") {
            Some(Yaml::String(s)) => Some(s),
            _ => None,
        };
        let mode = mode_raw
            .as_deref()
            .map(str::trim)
            .and_then(DispatchMode::parse)
            .ok_or(DispatchError::InvalidMode(mode_raw))?;
        let title = match mapping.remove("title") {
            Some(Yaml::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        };
        Ok(Self { mode, title, extra: mapping, body: split.body })
    }

    pub fn load(path: &std::path::Path) -> Result<Self, DispatchError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| DispatchError::Io { path: path.to_path_buf(), source })?;
        Self::parse(&raw)
    }

    /// Render the dispatch to its on-disk form.
    pub fn render(&self) -> Result<String, DispatchError> {
        let mut mapping = Mapping::new();
        mapping.insert(
            Yaml::String("mode".to_string()),
            Yaml::String(self.mode.as_str().to_string()),
        );
        if let Some(title) = &self.title {
            mapping.insert(Yaml::String("title".to_string()), Yaml::String(title.clone()));
        }
        for (key, value) in &self.extra {
            mapping.insert(key.clone(), value.clone());
        }
        let yaml = serde_yaml::to_string(&mapping)?;
        Ok(format!("---\n{yaml}---\n{}", self.body))
    }

    /// A short preview of title-or-body used in pause reasons.
    pub fn preview(&self, limit: usize) -> String {
        let source = self
            .title
            .clone()
            .unwrap_or_else(|| self.body.split_whitespace().collect::<Vec<_>>().join(" "));
        let mut preview: String = source.chars().take(limit).collect();
        if source.chars().count() > limit {
            preview.push_str("...");
        }
        preview
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
