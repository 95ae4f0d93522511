//! 0.3.0: per-feature manifest
//!
//! Graph construction reads the work package ids from `manifest.json`.
//! Features planned before the manifest existed get one listing every
//! task file, sorted.

use std::path::Path;
use tracing::debug;

use super::{feature_dirs, markdown_files, tasks_dir, Migration, MigrationVersion};
use crate::config::CoordConfig;
use crate::error::CoordResult;
use crate::work_package::{write_atomic, FeatureManifest, MANIFEST_FILE};

pub struct FeatureManifestMigration;

/// Work package ids of a feature without a manifest; `None` if it needs none
fn missing_manifest(feature_dir: &Path) -> CoordResult<Option<Vec<String>>> {
    if feature_dir.join(MANIFEST_FILE).exists() {
        return Ok(None);
    }
    let mut ids: Vec<String> = markdown_files(&tasks_dir(feature_dir))?
        .iter()
        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    if ids.is_empty() {
        return Ok(None);
    }
    ids.sort();
    Ok(Some(ids))
}

impl Migration for FeatureManifestMigration {
    fn version(&self) -> MigrationVersion {
        MigrationVersion::new(0, 3, 0)
    }

    fn name(&self) -> &'static str {
        "feature_manifest"
    }

    fn description(&self) -> &'static str {
        "Create manifest.json for features that have task files but no manifest"
    }

    fn detect(&self, config: &CoordConfig) -> CoordResult<bool> {
        for feature in feature_dirs(&config.specs_dir)? {
            if missing_manifest(&feature)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn apply(&self, config: &CoordConfig) -> CoordResult<usize> {
        let mut changed = 0;
        for feature in feature_dirs(&config.specs_dir)? {
            let Some(ids) = missing_manifest(&feature)? else {
                continue;
            };
            let slug = feature
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let manifest = FeatureManifest::new(slug, ids);
            let content = serde_json::to_string_pretty(&manifest)?;
            write_atomic(&feature.join(MANIFEST_FILE), &(content + "\n"))?;
            debug!(feature = %manifest.feature, count = manifest.work_packages.len(), "wrote manifest");
            changed += 1;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_package::FeatureStore;
    use tempfile::tempdir;

    #[test]
    fn test_creates_sorted_manifest_once() {
        let dir = tempdir().unwrap();
        let mut config = CoordConfig::for_repo(dir.path());
        config.resolve_paths();

        let tasks = config.specs_dir.join("002-billing/tasks");
        std::fs::create_dir_all(&tasks).unwrap();
        for id in ["WP03", "WP01", "WP02"] {
            std::fs::write(tasks.join(format!("{id}.md")), "---\n---\n").unwrap();
        }
        // Feature that already has one is left alone
        let store = FeatureStore::from_config(&config);
        store
            .save_manifest(&FeatureManifest::new("001-auth", vec!["WP09".into()]))
            .unwrap();

        let migration = FeatureManifestMigration;
        assert!(migration.detect(&config).unwrap());
        assert_eq!(migration.apply(&config).unwrap(), 1);
        assert!(!migration.detect(&config).unwrap());

        let manifest = store.load_manifest("002-billing").unwrap();
        assert_eq!(manifest.work_packages, vec!["WP01", "WP02", "WP03"]);
        assert_eq!(store.load_manifest("001-auth").unwrap().work_packages, vec!["WP09"]);
    }
}
