//! Migration runner: ordered, forward-only, idempotent.
//!
//! Each migration detects whether storage still needs it and applies
//! itself file by file, so a run that died halfway is finished by the
//! next one. Completed versions are appended to the ledger at
//! `<state_dir>/migrations.json`.

mod v0_2_0_flatten_lane_directories;
mod v0_3_0_feature_manifest;
mod v0_4_0_canonical_lane_names;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::CoordConfig;
use crate::error::{CoordError, CoordResult};
use crate::work_package::{join_front_matter, split_front_matter, write_atomic, TASKS_DIR};
use crate::workspace::WorkspaceManager;

pub use v0_2_0_flatten_lane_directories::FlattenLaneDirectories;
pub use v0_3_0_feature_manifest::FeatureManifestMigration;
pub use v0_4_0_canonical_lane_names::CanonicalLaneNames;

/// `major.minor.patch`, ordered numerically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl MigrationVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl std::fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for MigrationVersion {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().trim_start_matches('v');
        let parts: Vec<&str> = raw.split('.').collect();
        let [major, minor, patch] = parts.as_slice() else {
            return Err(CoordError::validation(format!(
                "invalid migration version '{s}' (expected major.minor.patch)"
            )));
        };
        let num = |p: &str| {
            p.parse::<u32>().map_err(|_| {
                CoordError::validation(format!("invalid migration version '{s}'"))
            })
        };
        Ok(Self::new(num(*major)?, num(*minor)?, num(*patch)?))
    }
}

impl TryFrom<String> for MigrationVersion {
    type Error = CoordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MigrationVersion> for String {
    fn from(version: MigrationVersion) -> Self {
        version.to_string()
    }
}

/// One versioned transformation of the persisted layout.
///
/// `apply` must tolerate any partial prior application: check each file
/// before touching it.
pub trait Migration: Send + Sync {
    fn version(&self) -> MigrationVersion;

    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Whether storage still needs this migration
    fn detect(&self, config: &CoordConfig) -> CoordResult<bool>;

    /// Apply it; returns the number of files changed
    fn apply(&self, config: &CoordConfig) -> CoordResult<usize>;
}

/// Migrations in strictly increasing version order
#[derive(Default)]
pub struct MigrationRegistry {
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every migration shipped with this version
    pub fn builtin() -> CoordResult<Self> {
        let mut registry = Self::new();
        registry.register(Box::new(FlattenLaneDirectories))?;
        registry.register(Box::new(FeatureManifestMigration))?;
        registry.register(Box::new(CanonicalLaneNames))?;
        Ok(registry)
    }

    pub fn register(&mut self, migration: Box<dyn Migration>) -> CoordResult<()> {
        if let Some(last) = self.migrations.last() {
            if migration.version() <= last.version() {
                return Err(CoordError::validation(format!(
                    "migration {} ({}) registered after {} ({}); versions must increase",
                    migration.version(),
                    migration.name(),
                    last.version(),
                    last.name()
                )));
            }
        }
        self.migrations.push(migration);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Migration> {
        self.migrations.iter().map(|m| m.as_ref())
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

/// Identity of a migration in reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSummary {
    pub version_id: MigrationVersion,
    pub name: String,
    pub description: String,
}

impl MigrationSummary {
    fn of(migration: &dyn Migration) -> Self {
        Self {
            version_id: migration.version(),
            name: migration.name().to_string(),
            description: migration.description().to_string(),
        }
    }
}

/// A migration that ran (or would run, on a dry run)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    #[serde(flatten)]
    pub migration: MigrationSummary,
    pub files_changed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub applied: Vec<AppliedMigration>,
    pub skipped: Vec<MigrationSummary>,
    pub dry_run: bool,
    /// Commit holding the migrated layout, when one was made
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

/// Ledger entry, written only after a successful apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub version_id: MigrationVersion,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// Runs a registry against one project
pub struct MigrationEngine {
    config: CoordConfig,
    registry: MigrationRegistry,
}

impl MigrationEngine {
    pub fn new(config: CoordConfig, registry: MigrationRegistry) -> Self {
        Self { config, registry }
    }

    /// Engine over the built-in migrations
    pub fn with_builtin(config: CoordConfig) -> CoordResult<Self> {
        Ok(Self::new(config, MigrationRegistry::builtin()?))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.config.ledger_path()
    }

    pub fn ledger(&self) -> CoordResult<Vec<LedgerEntry>> {
        let path = self.ledger_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| CoordError::invalid_record(&path, e.to_string()))
    }

    fn record(&self, migration: &dyn Migration) -> CoordResult<()> {
        let mut ledger = self.ledger()?;
        ledger.retain(|e| e.version_id != migration.version());
        ledger.push(LedgerEntry {
            version_id: migration.version(),
            name: migration.name().to_string(),
            applied_at: Utc::now(),
        });
        ledger.sort_by_key(|e| e.version_id);
        let content = serde_json::to_string_pretty(&ledger)?;
        write_atomic(&self.ledger_path(), &(content + "\n"))
    }

    /// Migrations whose `detect` still reports work, in version order
    pub fn list_pending(&self) -> CoordResult<Vec<MigrationSummary>> {
        let mut pending = Vec::new();
        for migration in self.registry.iter() {
            if migration.detect(&self.config)? {
                pending.push(MigrationSummary::of(migration));
            }
        }
        Ok(pending)
    }

    /// Apply every pending migration in order.
    ///
    /// After each apply the migration must no longer detect; anything else
    /// is a `MigrationNotIdempotent` failure.
    pub fn apply_all(&self, dry_run: bool) -> CoordResult<MigrationReport> {
        let mut report = MigrationReport {
            dry_run,
            ..Default::default()
        };

        for migration in self.registry.iter() {
            let version = migration.version();
            if !migration.detect(&self.config)? {
                debug!(version = %version, name = migration.name(), "migration not needed");
                report.skipped.push(MigrationSummary::of(migration));
                continue;
            }

            if dry_run {
                info!(version = %version, name = migration.name(), "would apply migration");
                report.applied.push(AppliedMigration {
                    migration: MigrationSummary::of(migration),
                    files_changed: 0,
                });
                continue;
            }

            info!(version = %version, name = migration.name(), "applying migration");
            let files_changed = migration
                .apply(&self.config)
                .map_err(|e| CoordError::migration(version, e.to_string()))?;

            if migration.detect(&self.config)? {
                return Err(CoordError::MigrationNotIdempotent {
                    version: version.to_string(),
                });
            }
            self.record(migration)?;
            info!(version = %version, name = migration.name(), files_changed, "applied migration");
            report.applied.push(AppliedMigration {
                migration: MigrationSummary::of(migration),
                files_changed,
            });
        }

        Ok(report)
    }

    /// Migrate the primary checkout and commit the result on its branch.
    ///
    /// Records are read from branch tips, so an uncommitted layout change
    /// would be invisible to everything else. Refuses to start when the
    /// specs directory or the ledger has uncommitted changes of its own.
    pub async fn upgrade(
        &self,
        manager: &WorkspaceManager,
        dry_run: bool,
    ) -> CoordResult<MigrationReport> {
        let git = manager.git();
        let specs = self.config.specs_dir.to_string_lossy().into_owned();
        let ledger = self.ledger_path().to_string_lossy().into_owned();
        let paths = ["--", specs.as_str(), ledger.as_str()];

        if !dry_run {
            let mut args = vec!["status", "--porcelain"];
            args.extend(paths);
            if !git.run(&args).await?.is_empty() {
                return Err(CoordError::UncommittedChanges {
                    path: self.config.specs_dir.clone(),
                });
            }
        }

        let mut report = self.apply_all(dry_run)?;
        let Some(last) = report.applied.last().map(|a| a.migration.version_id) else {
            return Ok(report);
        };
        if dry_run {
            return Ok(report);
        }

        let registry = manager.registry();
        let _guard = registry.lock()?.write(registry.lock_timeout()).await?;

        let mut add = vec!["add", "-A"];
        add.extend(paths);
        git.run(&add).await?;

        let mut diff = vec!["diff", "--cached", "--quiet"];
        diff.extend(paths);
        let (unchanged, _, _) = git.run_status(&diff).await?;
        if unchanged {
            return Ok(report);
        }

        let message = format!(
            "{} upgrade project layout to {last}",
            self.config.commit_prefix
        );
        let mut commit = vec!["commit", "-q", "-m", message.as_str()];
        commit.extend(paths);
        git.run(&commit).await?;
        let head = git.rev_parse("HEAD").await?;
        info!(version = %last, commit = %head, "committed migrated layout");
        report.commit = Some(head);
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Layout helpers shared by the built-in migrations
// ---------------------------------------------------------------------------

/// Subdirectories of `specs_dir`, sorted
fn feature_dirs(specs_dir: &Path) -> CoordResult<Vec<PathBuf>> {
    if !specs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(specs_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// `*.md` files directly inside `dir`, sorted
fn markdown_files(dir: &Path) -> CoordResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && path.extension().is_some_and(|e| e == "md") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn tasks_dir(feature_dir: &Path) -> PathBuf {
    feature_dir.join(TASKS_DIR)
}

/// Front matter as a raw YAML mapping plus body.
///
/// Text without front matter yields an empty mapping and the whole text
/// as body.
fn read_front_matter(path: &Path) -> CoordResult<(serde_yaml::Mapping, String)> {
    let text = std::fs::read_to_string(path)?;
    let Some((header, body)) = split_front_matter(&text) else {
        return Ok((serde_yaml::Mapping::new(), text));
    };
    let value: serde_yaml::Value = if header.trim().is_empty() {
        serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
    } else {
        serde_yaml::from_str(header).map_err(|e| CoordError::invalid_record(path, e.to_string()))?
    };
    match value {
        serde_yaml::Value::Mapping(map) => Ok((map, body.to_string())),
        _ => Err(CoordError::invalid_record(
            path,
            "front matter is not a mapping",
        )),
    }
}

fn render_front_matter(map: &serde_yaml::Mapping, body: &str) -> CoordResult<String> {
    let header = serde_yaml::to_string(map)?;
    Ok(join_front_matter(&header, body))
}
