// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! YAML frontmatter splitting shared by ticket and dispatch documents.

/// A markdown document split into its frontmatter text and body.
///
/// The raw segments are kept verbatim so an unmodified document
/// renders back byte-identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SplitDoc {
    /// Text between the `---` delimiters, including its trailing newline.
    pub frontmatter: String,
    /// Everything after the closing delimiter line.
    pub body: String,
}

/// Split `raw` into frontmatter and body.
///
/// The document must start with a `---` line and contain a closing
/// `---` line. Returns `None` when no frontmatter block is present.
pub(crate) fn split(raw: &str) -> Option<SplitDoc> {
    let rest = raw.strip_prefix("---\n").or_else(|| raw.strip_prefix("---\r\n"))?;
    let mut offset = 0usize;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == "---" {
            let frontmatter = rest[..offset].to_string();
            let body = rest[offset + line.len()..].to_string();
            return Some(SplitDoc { frontmatter, body });
        }
        offset += line.len();
    }
    None
}

/// Reassemble a document from its verbatim segments.
pub(crate) fn render(doc: &SplitDoc) -> String {
    format!("---\n{}---\n{}", doc.frontmatter, doc.body)
}

#[cfg(test)]
#[path = "frontmatter_tests.rs"]
mod tests;
