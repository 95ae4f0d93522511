//! Front matter codec for work package records
//!
//! A record is a YAML header between two `---` lines followed by free-form
//! content:
//!
//! ```text
//! ---
//! work_package_id: WP01
//! title: Setup
//! lane: planned
//! dependencies: []
//! history: []
//! ---
//! # Free-form body
//! ```

use std::path::Path;

use super::types::WorkPackage;
use crate::error::{CoordError, CoordResult};

const DELIMITER: &str = "---";

/// Split raw record text into (yaml header, body).
///
/// Returns `None` if the text does not start with a delimiter line or the
/// header is never closed.
pub fn split_front_matter(text: &str) -> Option<(&str, &str)> {
    let rest = text
        .strip_prefix("---\r\n")
        .or_else(|| text.strip_prefix("---\n"))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == DELIMITER {
            let header = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((header, body));
        }
        offset += line.len();
    }
    None
}

/// Join a yaml header and body back into record text
pub fn join_front_matter(header: &str, body: &str) -> String {
    let mut out = String::with_capacity(header.len() + body.len() + 8);
    out.push_str("---\n");
    out.push_str(header);
    if !header.is_empty() && !header.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("---\n");
    out.push_str(body);
    out
}

/// A parsed work package file
#[derive(Debug, Clone, PartialEq)]
pub struct WorkPackageRecord {
    pub meta: WorkPackage,
    pub body: String,
}

impl WorkPackageRecord {
    pub fn new(meta: WorkPackage, body: impl Into<String>) -> Self {
        Self {
            meta,
            body: body.into(),
        }
    }

    /// Parse record text; `origin` only labels errors
    pub fn parse(text: &str, origin: &Path) -> CoordResult<Self> {
        let (header, body) = split_front_matter(text).ok_or_else(|| {
            CoordError::invalid_record(origin, "missing or unterminated front matter")
        })?;
        let meta: WorkPackage = serde_yaml::from_str(header)
            .map_err(|e| CoordError::invalid_record(origin, e.to_string()))?;
        if meta.id.trim().is_empty() {
            return Err(CoordError::invalid_record(origin, "empty work_package_id"));
        }
        Ok(Self {
            meta,
            body: body.to_string(),
        })
    }

    /// Render back to record text
    pub fn render(&self) -> CoordResult<String> {
        let header = serde_yaml::to_string(&self.meta)?;
        Ok(join_front_matter(&header, &self.body))
    }
}
