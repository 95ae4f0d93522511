//! Project configuration
//!
//! Defaults, then `<state_dir>/config.toml`, then `WPFLOW_*` environment
//! variables. The command layer applies its own flags last.

use crate::error::CoordResult;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Name of the optional project config file inside `state_dir`
pub const CONFIG_FILE: &str = "config.toml";

/// Runtime configuration shared by every component
#[derive(Debug, Clone, PartialEq)]
pub struct CoordConfig {
    /// Primary checkout of the repository
    pub repo_root: PathBuf,

    /// Directory holding feature directories (manifests and task records)
    pub specs_dir: PathBuf,

    /// Parent directory for per-work-package worktrees
    pub worktrees_dir: PathBuf,

    /// Versioned project state (config, migration ledger)
    pub state_dir: PathBuf,

    /// Integration branch; `None` means the branch checked out in `repo_root`
    pub target_branch: Option<String>,

    /// Upper bound for any single git invocation
    pub git_timeout_secs: u64,

    /// Retry attempts for transient git failures
    pub max_retries: u32,

    /// Prefix for commits created by the synchronizer
    pub commit_prefix: String,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            repo_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            specs_dir: PathBuf::from("specs"),
            worktrees_dir: PathBuf::from(".worktrees"),
            state_dir: PathBuf::from(".wpflow"),
            target_branch: None,
            git_timeout_secs: 120,
            max_retries: 3,
            commit_prefix: "[wpflow]".to_string(),
        }
    }
}

/// On-disk form of `config.toml`; every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    specs_dir: Option<PathBuf>,
    worktrees_dir: Option<PathBuf>,
    target_branch: Option<String>,
    git_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    commit_prefix: Option<String>,
}

impl CoordConfig {
    /// Config rooted at `repo_root` with defaults for everything else
    pub fn for_repo(repo_root: impl AsRef<Path>) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Full load: defaults, project file, environment, then path resolution
    pub fn load(repo_root: Option<PathBuf>) -> CoordResult<Self> {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("WPFLOW_REPO_ROOT") {
            config.repo_root = PathBuf::from(dir);
        }
        if let Some(root) = repo_root {
            config.repo_root = root;
        }
        if let Ok(dir) = std::env::var("WPFLOW_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }

        let file = config.repo_root.join(&config.state_dir).join(CONFIG_FILE);
        if file.exists() {
            config.apply_file(&file)?;
        }
        config.apply_env();
        config.resolve_paths();
        Ok(config)
    }

    /// Merge values from a `config.toml`
    pub fn apply_file(&mut self, path: &Path) -> CoordResult<()> {
        let content = std::fs::read_to_string(path)?;
        let file: FileConfig = toml::from_str(&content)?;

        if let Some(dir) = file.specs_dir {
            self.specs_dir = dir;
        }
        if let Some(dir) = file.worktrees_dir {
            self.worktrees_dir = dir;
        }
        if file.target_branch.is_some() {
            self.target_branch = file.target_branch;
        }
        if let Some(secs) = file.git_timeout_secs {
            self.git_timeout_secs = secs;
        }
        if let Some(n) = file.max_retries {
            self.max_retries = n;
        }
        if let Some(prefix) = file.commit_prefix {
            self.commit_prefix = prefix;
        }
        tracing::debug!(path = %path.display(), "loaded project config");
        Ok(())
    }

    /// Apply `WPFLOW_*` environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("WPFLOW_SPECS_DIR") {
            self.specs_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("WPFLOW_WORKTREES_DIR") {
            self.worktrees_dir = PathBuf::from(dir);
        }
        if let Ok(branch) = std::env::var("WPFLOW_TARGET_BRANCH") {
            if !branch.is_empty() {
                self.target_branch = Some(branch);
            }
        }
        if let Ok(secs) = std::env::var("WPFLOW_GIT_TIMEOUT_SECS") {
            if let Ok(n) = secs.parse() {
                self.git_timeout_secs = n;
            }
        }
        if let Ok(max) = std::env::var("WPFLOW_MAX_RETRIES") {
            if let Ok(n) = max.parse() {
                self.max_retries = n;
            }
        }
        if let Ok(prefix) = std::env::var("WPFLOW_COMMIT_PREFIX") {
            self.commit_prefix = prefix;
        }
    }

    /// Resolve paths relative to the repository root
    pub fn resolve_paths(&mut self) {
        if self.specs_dir.is_relative() {
            self.specs_dir = self.repo_root.join(&self.specs_dir);
        }
        if self.worktrees_dir.is_relative() {
            self.worktrees_dir = self.repo_root.join(&self.worktrees_dir);
        }
        if self.state_dir.is_relative() {
            self.state_dir = self.repo_root.join(&self.state_dir);
        }
    }

    /// `specs_dir` relative to `repo_root`, as git sees it
    pub fn specs_rel(&self) -> PathBuf {
        self.specs_dir
            .strip_prefix(&self.repo_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| self.specs_dir.clone())
    }

    /// Path of the migration ledger
    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("migrations.json")
    }
}
