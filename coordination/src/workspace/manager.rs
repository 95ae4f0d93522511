//! Workspace lifecycle manager
//!
//! `create` picks a base from the dependency graph, adds a sparse worktree
//! on a fresh branch and registers it. Any failure after the registry
//! entry was claimed rolls everything back, so a workspace is either
//! `active` or absent.

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::registry::{Workspace, WorkspaceRegistry, WorkspaceState};
use super::{validate_name, workspace_id, SHARED_STATE_DIR};
use crate::config::CoordConfig;
use crate::error::{CoordError, CoordResult};
use crate::git::GitManager;
use crate::graph::DependencyGraph;
use crate::work_package::{Feature, FeatureManifest, FeatureStore};

/// Where a new workspace branches from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaseChoice {
    /// Branch the workspace starts from
    pub base_ref: String,
    /// Work package whose work the base carries, `None` for the target branch
    pub base_wp: Option<String>,
}

/// Flags for [`WorkspaceManager::remove`]
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    pub keep_branch: bool,
    pub keep_storage: bool,
    /// Discard uncommitted changes and unmerged commits
    pub force: bool,
}

/// Registry entry joined with what is actually on disk
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceStatus {
    pub workspace_id: String,
    pub feature: String,
    pub bound_wp_id: String,
    pub state: WorkspaceState,
    pub path: PathBuf,
    pub base_ref: String,
    pub branch_ref: String,
    pub branch_exists: bool,
    pub storage_present: bool,
    pub owner_process: Option<String>,
    /// `None` when liveness cannot be determined
    pub owner_alive: Option<bool>,
}

/// Creates, removes and reports workspaces of one repository
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    config: CoordConfig,
    git: GitManager,
    store: FeatureStore,
    registry: WorkspaceRegistry,
    common_dir: PathBuf,
}

impl WorkspaceManager {
    /// Open the repository at `config.repo_root`
    pub async fn open(config: CoordConfig) -> CoordResult<Self> {
        let git = GitManager::from_config(&config);
        git.ensure_repository().await?;
        let common_dir = git.common_dir().await?;
        let registry = WorkspaceRegistry::new(
            common_dir.join(SHARED_STATE_DIR),
            Duration::from_secs(config.git_timeout_secs),
        );
        let store = FeatureStore::from_config(&config);

        let manager = Self {
            config,
            git,
            store,
            registry,
            common_dir,
        };
        manager.exclude_worktrees_dir()?;
        Ok(manager)
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    pub fn git(&self) -> &GitManager {
        &self.git
    }

    pub fn store(&self) -> &FeatureStore {
        &self.store
    }

    pub fn registry(&self) -> &WorkspaceRegistry {
        &self.registry
    }

    pub fn common_dir(&self) -> &Path {
        &self.common_dir
    }

    /// `<git-common-dir>/wpflow`
    pub fn shared_state_dir(&self) -> PathBuf {
        self.common_dir.join(SHARED_STATE_DIR)
    }

    pub fn workspace_path(&self, feature: &str, wp_id: &str) -> PathBuf {
        self.config.worktrees_dir.join(workspace_id(feature, wp_id))
    }

    /// Keep the worktrees directory out of `git status` in the primary checkout
    fn exclude_worktrees_dir(&self) -> CoordResult<()> {
        let Ok(rel) = self.config.worktrees_dir.strip_prefix(&self.config.repo_root) else {
            return Ok(());
        };
        if rel.as_os_str().is_empty() {
            return Ok(());
        }
        let pattern = format!("/{}/", rel.to_string_lossy().replace('\\', "/"));
        let exclude = self.common_dir.join("info").join("exclude");
        let mut content = std::fs::read_to_string(&exclude).unwrap_or_default();
        if content.lines().any(|line| line.trim() == pattern) {
            return Ok(());
        }
        if let Some(parent) = exclude.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&pattern);
        content.push('\n');
        std::fs::write(&exclude, content)?;
        debug!(pattern = %pattern, "added worktrees dir to info/exclude");
        Ok(())
    }

    /// Integration branch of a feature.
    ///
    /// Manifest setting, then project config, then whatever the primary
    /// checkout has checked out.
    pub async fn target_branch(&self, manifest: &FeatureManifest) -> CoordResult<String> {
        if let Some(branch) = manifest
            .target_branch
            .as_ref()
            .or(self.config.target_branch.as_ref())
        {
            return Ok(branch.clone());
        }
        let branch = self.git.current_branch().await?;
        if branch == "HEAD" {
            return Err(CoordError::usage(
                "primary checkout has a detached HEAD; set target_branch in the manifest or config",
            ));
        }
        Ok(branch)
    }

    /// Load a feature and validate its dependency graph
    pub fn load_feature(&self, feature: &str) -> CoordResult<(Feature, DependencyGraph)> {
        validate_name("feature", feature)?;
        let feature = self.store.load_feature(feature)?;
        let graph = DependencyGraph::build(&feature.work_packages())?;
        Ok((feature, graph))
    }

    /// Pick the base for `wp_id`.
    ///
    /// An explicit base wins. Otherwise no dependencies means the target
    /// branch, one dependency means that dependency's branch, and more
    /// than one is refused.
    pub async fn resolve_base(
        &self,
        feature: &Feature,
        graph: &DependencyGraph,
        wp_id: &str,
        explicit: Option<&str>,
    ) -> CoordResult<BaseChoice> {
        let deps = graph
            .direct_dependencies(wp_id)
            .ok_or_else(|| CoordError::wp_not_found(feature.slug(), wp_id))?;

        let base_wp = match explicit {
            Some(base) => {
                if base == wp_id {
                    return Err(CoordError::usage(format!("{wp_id} cannot be its own base")));
                }
                if !graph.contains(base) {
                    return Err(CoordError::wp_not_found(feature.slug(), base));
                }
                if !deps.iter().any(|d| d == base) {
                    warn!(wp_id, base, "explicit base is not a direct dependency");
                }
                Some(base.to_string())
            }
            None => match deps.as_slice() {
                [] => None,
                [only] => Some(only.clone()),
                _ => {
                    return Err(CoordError::AmbiguousBase {
                        wp_id: wp_id.to_string(),
                        candidates: deps,
                    })
                }
            },
        };

        let Some(base_wp) = base_wp else {
            let target = self.target_branch(&feature.manifest).await?;
            if self.git.resolve(&target).await?.is_none() {
                return Err(CoordError::BaseNotReady {
                    wp_id: wp_id.to_string(),
                    base: target,
                    state: "missing".to_string(),
                });
            }
            return Ok(BaseChoice {
                base_ref: target,
                base_wp: None,
            });
        };

        let base_id = workspace_id(feature.slug(), &base_wp);
        let entry = self.registry.get(&base_id)?;
        let state = entry.as_ref().map(|w| w.state).unwrap_or_default();

        if state.is_materialized() && self.git.branch_exists(&base_id).await? {
            return Ok(BaseChoice {
                base_ref: base_id,
                base_wp: Some(base_wp),
            });
        }

        // Already folded into the target and cleaned up
        if entry.as_ref().is_some_and(|w| w.merged_at.is_some()) {
            let target = self.target_branch(&feature.manifest).await?;
            debug!(wp_id, base = %base_wp, "base already merged, using target branch");
            return Ok(BaseChoice {
                base_ref: target,
                base_wp: Some(base_wp),
            });
        }

        Err(CoordError::BaseNotReady {
            wp_id: wp_id.to_string(),
            base: base_id,
            state: state.to_string(),
        })
    }

    /// Materialize a workspace for `wp_id` of `feature`
    pub async fn create(
        &self,
        feature: &str,
        wp_id: &str,
        base: Option<&str>,
    ) -> CoordResult<Workspace> {
        validate_name("work package", wp_id)?;
        let (feature_data, graph) = self.load_feature(feature)?;
        if !graph.contains(wp_id) {
            return Err(CoordError::wp_not_found(feature, wp_id));
        }

        let id = workspace_id(feature, wp_id);
        let path = self.workspace_path(feature, wp_id);

        if let Some(existing) = self.registry.get(&id)? {
            if existing.state.is_live() {
                return Err(CoordError::WorkspaceExists {
                    workspace_id: id,
                    path: existing.path,
                });
            }
        }
        if path.exists() {
            return Err(CoordError::WorkspaceExists {
                workspace_id: id,
                path,
            });
        }

        let choice = self
            .resolve_base(&feature_data, &graph, wp_id, base)
            .await?;
        let mut base_commit = self.git.rev_parse(&choice.base_ref).await?;
        let reuse_branch = self.git.branch_exists(&id).await?;
        if reuse_branch {
            // The kept branch forked earlier; record where, not today's base tip
            if let Some(fork) = self.git.merge_base(&id, &base_commit).await? {
                base_commit = fork;
            }
        }

        let now = Utc::now();
        let workspace = Workspace {
            workspace_id: id.clone(),
            feature: feature.to_string(),
            bound_wp_id: wp_id.to_string(),
            base_ref: choice.base_ref.clone(),
            base_commit,
            branch_ref: id.clone(),
            path,
            state: WorkspaceState::Created,
            owner_process: None,
            created_at: now,
            updated_at: now,
            merged_at: None,
        };

        // Claim the id; of two concurrent creates only one gets past here
        let claim = workspace.clone();
        self.registry
            .update(move |map| {
                if let Some(other) = map.get(&claim.workspace_id) {
                    if other.state.is_live() {
                        return Err(CoordError::WorkspaceExists {
                            workspace_id: claim.workspace_id.clone(),
                            path: other.path.clone(),
                        });
                    }
                }
                map.insert(claim.workspace_id.clone(), claim);
                Ok(())
            })
            .await?;

        info!(
            workspace_id = %id,
            base = %choice.base_ref,
            reuse_branch,
            "creating workspace"
        );

        if let Err(e) = self.materialize(&workspace, reuse_branch).await {
            warn!(workspace_id = %id, error = %e, "workspace creation failed, rolling back");
            self.rollback(&workspace, !reuse_branch).await;
            return Err(e);
        }

        let workspace = self
            .registry
            .set_state(&id, WorkspaceState::Active)
            .await?;
        info!(workspace_id = %id, path = %workspace.path.display(), "workspace active");
        Ok(workspace)
    }

    /// Add the worktree and check it out without the specs directory
    async fn materialize(&self, workspace: &Workspace, reuse_branch: bool) -> CoordResult<()> {
        if let Some(parent) = workspace.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path = workspace.path.to_string_lossy().into_owned();

        if reuse_branch {
            self.git
                .run(&["worktree", "add", "--no-checkout", &path, &workspace.branch_ref])
                .await?;
        } else {
            self.git
                .run(&[
                    "worktree",
                    "add",
                    "--no-checkout",
                    "-b",
                    &workspace.branch_ref,
                    &path,
                    &workspace.base_commit,
                ])
                .await?;
        }

        let worktree = self.git.at(&workspace.path);
        let mut patterns = vec!["/*".to_string()];
        let specs_rel = self.config.specs_rel();
        if specs_rel.is_relative() {
            patterns.push(format!(
                "!/{}/",
                specs_rel.to_string_lossy().replace('\\', "/")
            ));
        }
        let mut args = vec!["sparse-checkout", "set", "--no-cone"];
        args.extend(patterns.iter().map(String::as_str));
        worktree.run(&args).await?;
        worktree.run(&["read-tree", "-mu", "HEAD"]).await?;
        Ok(())
    }

    /// Best-effort undo of a partial create; the workspace ends up absent
    async fn rollback(&self, workspace: &Workspace, delete_branch: bool) {
        let path = workspace.path.to_string_lossy().into_owned();
        if workspace.path.exists() {
            if let Err(e) = self
                .git
                .run(&["worktree", "remove", "--force", &path])
                .await
            {
                warn!("git worktree remove warning: {e}");
                if let Err(e) = std::fs::remove_dir_all(&workspace.path) {
                    warn!(path = %path, "failed to remove workspace directory: {e}");
                }
            }
        }
        if let Err(e) = self.git.run(&["worktree", "prune"]).await {
            warn!("git worktree prune warning: {e}");
        }
        if delete_branch {
            if let Err(e) = self.git.delete_branch(&workspace.branch_ref, true).await {
                debug!(branch = %workspace.branch_ref, "branch cleanup skipped: {e}");
            }
        }
        if let Err(e) = self.registry.forget(&workspace.workspace_id).await {
            warn!(workspace_id = %workspace.workspace_id, "failed to drop registry entry: {e}");
        }
    }

    /// Tear down a workspace; prunes its branch unless `keep_branch`
    pub async fn remove(
        &self,
        workspace_id: &str,
        options: RemoveOptions,
    ) -> CoordResult<Workspace> {
        if options.keep_storage && !options.keep_branch {
            return Err(CoordError::usage(
                "keeping storage requires keeping the branch: a checked-out branch cannot be deleted",
            ));
        }
        let workspace =
            self.registry
                .get(workspace_id)?
                .ok_or_else(|| CoordError::WorkspaceNotFound {
                    workspace_id: workspace_id.to_string(),
                })?;
        let path = workspace.path.to_string_lossy().into_owned();
        let branch_exists = self.git.branch_exists(&workspace.branch_ref).await?;
        let storage_present = workspace.path.exists();

        if !options.keep_storage && storage_present && !options.force {
            if self
                .git
                .at(&workspace.path)
                .has_uncommitted_changes()
                .await?
            {
                return Err(CoordError::UncommittedChanges {
                    path: workspace.path.clone(),
                });
            }
        }

        if !options.keep_branch && branch_exists && !options.force && workspace.merged_at.is_none()
        {
            let tip = self.git.rev_parse(&workspace.branch_ref).await?;
            if tip != workspace.base_commit {
                return Err(CoordError::usage(format!(
                    "branch {} has commits that were never merged; keep the branch or force removal",
                    workspace.branch_ref
                )));
            }
        }

        if !options.keep_storage && storage_present {
            let mut args = vec!["worktree", "remove"];
            if options.force {
                args.push("--force");
            }
            args.push(&path);
            self.git.run_with_retry(&args).await?;
        }
        if let Err(e) = self.git.run(&["worktree", "prune"]).await {
            warn!("git worktree prune warning: {e}");
        }

        if !options.keep_branch && branch_exists {
            self.git.delete_branch(&workspace.branch_ref, true).await?;
        }

        let removed = self
            .registry
            .update(|map| {
                let entry =
                    map.get_mut(workspace_id)
                        .ok_or_else(|| CoordError::WorkspaceNotFound {
                            workspace_id: workspace_id.to_string(),
                        })?;
                entry.set_state(WorkspaceState::Removed);
                entry.owner_process = None;
                Ok(entry.clone())
            })
            .await?;

        info!(
            workspace_id,
            keep_branch = options.keep_branch,
            keep_storage = options.keep_storage,
            "workspace removed"
        );
        Ok(removed)
    }

    /// Record that a workspace's branch was folded into its target
    pub async fn mark_merged(&self, workspace_id: &str) -> CoordResult<Option<Workspace>> {
        if self.registry.get(workspace_id)?.is_none() {
            return Ok(None);
        }
        let workspace = self
            .registry
            .set_state(workspace_id, WorkspaceState::Merged)
            .await?;
        debug!(workspace_id, "workspace marked merged");
        Ok(Some(workspace))
    }

    pub async fn status(&self, workspace_id: &str) -> CoordResult<WorkspaceStatus> {
        let workspace =
            self.registry
                .get(workspace_id)?
                .ok_or_else(|| CoordError::WorkspaceNotFound {
                    workspace_id: workspace_id.to_string(),
                })?;
        let storage_present = workspace.path.join(".git").exists();
        self.describe(workspace, storage_present).await
    }

    /// Every registered workspace, checked against `git worktree list`
    pub async fn list(&self) -> CoordResult<Vec<WorkspaceStatus>> {
        let worktrees = self.git.list_worktrees().await?;
        let mut statuses = Vec::new();
        for workspace in self.registry.load()? {
            let storage_present = workspace.path.exists()
                && worktrees
                    .iter()
                    .any(|w| same_path(&w.path, &workspace.path));
            statuses.push(self.describe(workspace, storage_present).await?);
        }
        Ok(statuses)
    }

    async fn describe(
        &self,
        workspace: Workspace,
        storage_present: bool,
    ) -> CoordResult<WorkspaceStatus> {
        let branch_exists = self.git.branch_exists(&workspace.branch_ref).await?;
        let owner_alive = workspace.owner_process.as_deref().and_then(process_alive);
        Ok(WorkspaceStatus {
            workspace_id: workspace.workspace_id,
            feature: workspace.feature,
            bound_wp_id: workspace.bound_wp_id,
            state: workspace.state,
            path: workspace.path,
            base_ref: workspace.base_ref,
            branch_ref: workspace.branch_ref,
            branch_exists,
            storage_present,
            owner_process: workspace.owner_process,
            owner_alive,
        })
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Liveness of a numeric pid handle; unknown for anything else
fn process_alive(handle: &str) -> Option<bool> {
    let pid: u32 = handle.trim().parse().ok()?;
    if cfg!(target_os = "linux") {
        Some(Path::new("/proc").join(pid.to_string()).exists())
    } else {
        None
    }
}
