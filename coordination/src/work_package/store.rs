//! Feature store: manifests and work package records on disk
//!
//! Reads always go to the authoritative checkout. Worktrees never carry
//! their own copy of the specs directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::record::WorkPackageRecord;
use super::types::WorkPackage;
use crate::config::CoordConfig;
use crate::error::{CoordError, CoordResult};

/// File name of the per-feature manifest
pub const MANIFEST_FILE: &str = "manifest.json";

/// Directory holding the per-package records of a feature
pub const TASKS_DIR: &str = "tasks";

/// Per-feature manifest listing its work packages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureManifest {
    pub feature: String,

    /// Integration branch for this feature, overrides the project default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_branch: Option<String>,

    pub work_packages: Vec<String>,
}

impl FeatureManifest {
    pub fn new(feature: impl Into<String>, work_packages: Vec<String>) -> Self {
        Self {
            feature: feature.into(),
            target_branch: None,
            work_packages,
        }
    }
}

/// A feature with all its records loaded
#[derive(Debug, Clone)]
pub struct Feature {
    pub manifest: FeatureManifest,
    pub records: Vec<WorkPackageRecord>,
}

impl Feature {
    pub fn slug(&self) -> &str {
        &self.manifest.feature
    }

    /// Metadata of every work package, manifest order
    pub fn work_packages(&self) -> Vec<WorkPackage> {
        self.records.iter().map(|r| r.meta.clone()).collect()
    }

    pub fn find(&self, wp_id: &str) -> Option<&WorkPackage> {
        self.records
            .iter()
            .map(|r| &r.meta)
            .find(|wp| wp.id == wp_id)
    }
}

/// Write `content` to `path` via a temp file and rename
pub fn write_atomic(path: &Path, content: &str) -> CoordResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Filesystem view of the specs directory
#[derive(Debug, Clone)]
pub struct FeatureStore {
    specs_dir: PathBuf,
    specs_rel: PathBuf,
}

impl FeatureStore {
    pub fn new(specs_dir: impl Into<PathBuf>, specs_rel: impl Into<PathBuf>) -> Self {
        Self {
            specs_dir: specs_dir.into(),
            specs_rel: specs_rel.into(),
        }
    }

    pub fn from_config(config: &CoordConfig) -> Self {
        Self::new(&config.specs_dir, config.specs_rel())
    }

    pub fn specs_dir(&self) -> &Path {
        &self.specs_dir
    }

    pub fn feature_dir(&self, feature: &str) -> PathBuf {
        self.specs_dir.join(feature)
    }

    pub fn manifest_path(&self, feature: &str) -> PathBuf {
        self.feature_dir(feature).join(MANIFEST_FILE)
    }

    pub fn record_path(&self, feature: &str, wp_id: &str) -> PathBuf {
        self.feature_dir(feature)
            .join(TASKS_DIR)
            .join(format!("{wp_id}.md"))
    }

    /// Record path relative to the repository root, '/'-separated for git
    pub fn record_git_path(&self, feature: &str, wp_id: &str) -> String {
        let mut parts: Vec<String> = self
            .specs_rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        parts.push(feature.to_string());
        parts.push(TASKS_DIR.to_string());
        parts.push(format!("{wp_id}.md"));
        parts.join("/")
    }

    /// Feature slugs that carry a manifest, sorted
    pub fn list_features(&self) -> CoordResult<Vec<String>> {
        if !self.specs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut features = Vec::new();
        for entry in std::fs::read_dir(&self.specs_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() && entry.path().join(MANIFEST_FILE).exists() {
                features.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        features.sort();
        Ok(features)
    }

    pub fn load_manifest(&self, feature: &str) -> CoordResult<FeatureManifest> {
        let path = self.manifest_path(feature);
        if !path.exists() {
            return Err(CoordError::FeatureNotFound {
                feature: feature.to_string(),
            });
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| CoordError::invalid_record(&path, e.to_string()))
    }

    pub fn save_manifest(&self, manifest: &FeatureManifest) -> CoordResult<()> {
        let content = serde_json::to_string_pretty(manifest)?;
        write_atomic(&self.manifest_path(&manifest.feature), &(content + "\n"))
    }

    /// Load one record; the id inside must match the file name
    pub fn load_record(&self, feature: &str, wp_id: &str) -> CoordResult<WorkPackageRecord> {
        let path = self.record_path(feature, wp_id);
        if !path.exists() {
            return Err(CoordError::wp_not_found(feature, wp_id));
        }
        let content = std::fs::read_to_string(&path)?;
        let record = WorkPackageRecord::parse(&content, &path)?;
        if record.meta.id != wp_id {
            return Err(CoordError::invalid_record(
                &path,
                format!(
                    "work_package_id '{}' does not match file name '{wp_id}'",
                    record.meta.id
                ),
            ));
        }
        Ok(record)
    }

    pub fn save_record(&self, feature: &str, record: &WorkPackageRecord) -> CoordResult<()> {
        let path = self.record_path(feature, &record.meta.id);
        write_atomic(&path, &record.render()?)
    }

    /// Manifest plus every record it lists
    pub fn load_feature(&self, feature: &str) -> CoordResult<Feature> {
        let manifest = self.load_manifest(feature)?;
        let mut records = Vec::with_capacity(manifest.work_packages.len());
        for wp_id in &manifest.work_packages {
            let path = self.record_path(feature, wp_id);
            if !path.exists() {
                return Err(CoordError::invalid_record(
                    self.manifest_path(feature),
                    format!("lists {wp_id} but {} does not exist", path.display()),
                ));
            }
            records.push(self.load_record(feature, wp_id)?);
        }
        Ok(Feature { manifest, records })
    }
}
