//! 0.2.0: lane subdirectories -> flat task files
//!
//! Old layout kept the lane in the path (`tasks/doing/WP03.md`). The lane
//! now lives in front matter and every record sits directly under `tasks/`.

use serde_yaml::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{
    feature_dirs, markdown_files, read_front_matter, render_front_matter, tasks_dir, Migration,
    MigrationVersion,
};
use crate::config::CoordConfig;
use crate::error::{CoordError, CoordResult};
use crate::work_package::{write_atomic, Lane};

pub struct FlattenLaneDirectories;

/// Legacy lane directories of one feature with the lane they stand for
fn lane_dirs(feature_dir: &Path) -> CoordResult<Vec<(PathBuf, Lane)>> {
    let tasks = tasks_dir(feature_dir);
    if !tasks.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(&tasks)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Ok(lane) = name.parse::<Lane>() {
            dirs.push((entry.path(), lane));
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Rewrite one legacy file into the flat layout, then drop the original
fn flatten_file(source: &Path, lane: Lane, dest_dir: &Path) -> CoordResult<bool> {
    let Some(file_name) = source.file_name() else {
        return Ok(false);
    };
    let dest = dest_dir.join(file_name);
    let wp_id = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (mut header, body) = read_front_matter(source)?;
    if !header.contains_key("work_package_id") {
        header.insert(Value::from("work_package_id"), Value::from(wp_id));
    }
    header.insert(Value::from("lane"), Value::from(lane.as_str()));
    let rendered = render_front_matter(&header, &body)?;

    if dest.exists() {
        let existing = std::fs::read_to_string(&dest)?;
        if existing != rendered {
            return Err(CoordError::invalid_record(
                &dest,
                format!(
                    "both {} and the flat record exist with different content",
                    source.display()
                ),
            ));
        }
    } else {
        write_atomic(&dest, &rendered)?;
    }
    std::fs::remove_file(source)?;
    debug!(from = %source.display(), to = %dest.display(), "flattened task file");
    Ok(true)
}

impl Migration for FlattenLaneDirectories {
    fn version(&self) -> MigrationVersion {
        MigrationVersion::new(0, 2, 0)
    }

    fn name(&self) -> &'static str {
        "flatten_lane_directories"
    }

    fn description(&self) -> &'static str {
        "Move tasks/<lane>/<WP>.md to tasks/<WP>.md with the lane in front matter"
    }

    fn detect(&self, config: &CoordConfig) -> CoordResult<bool> {
        for feature in feature_dirs(&config.specs_dir)? {
            for (dir, _) in lane_dirs(&feature)? {
                if !markdown_files(&dir)?.is_empty() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn apply(&self, config: &CoordConfig) -> CoordResult<usize> {
        let mut changed = 0;
        for feature in feature_dirs(&config.specs_dir)? {
            let dest_dir = tasks_dir(&feature);
            for (dir, lane) in lane_dirs(&feature)? {
                for file in markdown_files(&dir)? {
                    if flatten_file(&file, lane, &dest_dir)? {
                        changed += 1;
                    }
                }
                // Only succeeds once the directory is empty
                let _ = std::fs::remove_dir(&dir);
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_package::WorkPackageRecord;
    use tempfile::tempdir;

    fn config_in(dir: &Path) -> CoordConfig {
        let mut config = CoordConfig::for_repo(dir);
        config.resolve_paths();
        config
    }

    #[test]
    fn test_flatten_sets_lane_and_keeps_body() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let legacy = config.specs_dir.join("f/tasks/in_progress");
        std::fs::create_dir_all(&legacy).unwrap();
        std::fs::write(
            legacy.join("WP02.md"),
            "---\nwork_package_id: WP02\ntitle: API\nreviewer: carol\n---\n# API\n",
        )
        .unwrap();
        std::fs::create_dir_all(config.specs_dir.join("f/tasks/planned")).unwrap();
        std::fs::write(config.specs_dir.join("f/tasks/planned/WP03.md"), "# bare\n").unwrap();

        let migration = FlattenLaneDirectories;
        assert!(migration.detect(&config).unwrap());
        assert_eq!(migration.apply(&config).unwrap(), 2);
        assert!(!migration.detect(&config).unwrap());
        assert!(!legacy.exists());

        let flat = config.specs_dir.join("f/tasks/WP02.md");
        let text = std::fs::read_to_string(&flat).unwrap();
        let record = WorkPackageRecord::parse(&text, &flat).unwrap();
        assert_eq!(record.meta.lane, Lane::Doing);
        assert_eq!(record.meta.extra["reviewer"], "carol");
        assert_eq!(record.body, "# API\n");

        let bare = config.specs_dir.join("f/tasks/WP03.md");
        let text = std::fs::read_to_string(&bare).unwrap();
        let record = WorkPackageRecord::parse(&text, &bare).unwrap();
        assert_eq!(record.meta.id, "WP03");
    }

    #[test]
    fn test_resumes_after_copy_without_delete() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let legacy = config.specs_dir.join("f/tasks/done");
        std::fs::create_dir_all(&legacy).unwrap();
        let source = legacy.join("WP01.md");
        std::fs::write(&source, "---\nwork_package_id: WP01\n---\n").unwrap();

        // Interrupted run: flat copy written, source still there
        let (mut header, body) = read_front_matter(&source).unwrap();
        header.insert(Value::from("lane"), Value::from("done"));
        std::fs::write(
            config.specs_dir.join("f/tasks/WP01.md"),
            render_front_matter(&header, &body).unwrap(),
        )
        .unwrap();

        let migration = FlattenLaneDirectories;
        assert!(migration.detect(&config).unwrap());
        migration.apply(&config).unwrap();
        assert!(!migration.detect(&config).unwrap());
        assert!(!source.exists());
    }

    #[test]
    fn test_conflicting_copies_fail() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let legacy = config.specs_dir.join("f/tasks/done");
        std::fs::create_dir_all(&legacy).unwrap();
        std::fs::write(legacy.join("WP01.md"), "---\nwork_package_id: WP01\n---\nold\n").unwrap();
        std::fs::write(config.specs_dir.join("f/tasks/WP01.md"), "---\nwork_package_id: WP01\n---\nnew\n").unwrap();

        let err = FlattenLaneDirectories.apply(&config).unwrap_err();
        assert!(matches!(err, CoordError::InvalidRecord { .. }));
    }
}
