//! 0.4.0: canonical lane names
//!
//! Older records spell lanes `in_progress`, `review` or `for-review`.
//! Rewrites them, in the header and in every history entry, to the names
//! the lane machine uses. Files are handled one at a time; a file that is
//! already canonical is never rewritten.

use serde_yaml::{Mapping, Value};
use tracing::debug;

use super::{
    feature_dirs, markdown_files, read_front_matter, render_front_matter, tasks_dir, Migration,
    MigrationVersion,
};
use crate::config::CoordConfig;
use crate::error::CoordResult;
use crate::work_package::{write_atomic, Lane};

pub struct CanonicalLaneNames;

/// Canonical spelling if `value` is a known lane written differently
fn replacement(value: &Value) -> Option<&'static str> {
    let raw = value.as_str()?;
    let canonical = Lane::canonical_name(raw)?;
    (raw != canonical).then_some(canonical)
}

/// Rewrite legacy lane names in place; true if anything changed
fn canonicalize(header: &mut Mapping) -> bool {
    let mut changed = false;
    if let Some(lane) = header.get_mut("lane") {
        if let Some(canonical) = replacement(lane) {
            *lane = Value::from(canonical);
            changed = true;
        }
    }
    if let Some(Value::Sequence(history)) = header.get_mut("history") {
        for entry in history.iter_mut() {
            if let Some(lane) = entry.get_mut("lane") {
                if let Some(canonical) = replacement(lane) {
                    *lane = Value::from(canonical);
                    changed = true;
                }
            }
        }
    }
    changed
}

impl Migration for CanonicalLaneNames {
    fn version(&self) -> MigrationVersion {
        MigrationVersion::new(0, 4, 0)
    }

    fn name(&self) -> &'static str {
        "canonical_lane_names"
    }

    fn description(&self) -> &'static str {
        "Rewrite legacy lane names (in_progress, review, for-review) to canonical ones"
    }

    fn detect(&self, config: &CoordConfig) -> CoordResult<bool> {
        for feature in feature_dirs(&config.specs_dir)? {
            for file in markdown_files(&tasks_dir(&feature))? {
                let (mut header, _) = read_front_matter(&file)?;
                if canonicalize(&mut header) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn apply(&self, config: &CoordConfig) -> CoordResult<usize> {
        let mut changed = 0;
        for feature in feature_dirs(&config.specs_dir)? {
            for file in markdown_files(&tasks_dir(&feature))? {
                let (mut header, body) = read_front_matter(&file)?;
                if !canonicalize(&mut header) {
                    continue;
                }
                write_atomic(&file, &render_front_matter(&header, &body)?)?;
                debug!(file = %file.display(), "canonicalized lane names");
                changed += 1;
            }
        }
        Ok(changed)
    }
}
