//! Merge execution
//!
//! Effective branches are merged one after another in a detached
//! integration worktree. The target ref only moves once every step has
//! succeeded. A conflict aborts the step, records where the sequence
//! stopped and leaves the integration worktree in place for a manual
//! resolution; the next run picks up from there. Commits that reach the
//! target in between are merged into the integration head first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::plan::{build_plan, MergePlan, PlannedStep, StepAction, StepOptions};
use crate::error::{CoordError, CoordResult};
use crate::git::GitManager;
use crate::work_package::write_atomic;
use crate::workspace::{workspace_id, RemoveOptions, WorkspaceManager};

const MERGE_STATE_DIR: &str = "merge-state";
const INTEGRATION_DIR: &str = "integration";

/// Caller options for a merge run
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub dry_run: bool,
    pub push: bool,
    pub keep_branches: bool,
    pub keep_workspaces: bool,
    pub remote: String,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            push: false,
            keep_branches: false,
            keep_workspaces: false,
            remote: "origin".to_string(),
        }
    }
}

impl MergeOptions {
    fn step_options(&self) -> StepOptions {
        StepOptions {
            push: self.push,
            keep_branches: self.keep_branches,
            keep_workspaces: self.keep_workspaces,
        }
    }
}

/// The pair of refs that failed to merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPair {
    pub left: String,
    pub right: String,
}

/// Progress of an interrupted merge, persisted between runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeState {
    pub feature: String,
    pub target: String,
    /// Target commit when the sequence started
    pub target_start: String,
    pub integration_path: PathBuf,
    pub integration_head: String,
    pub completed: Vec<String>,
    pub remaining: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictPair>,
    pub plan: MergePlan,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    DryRun,
    AlreadyIntegrated,
    Merged,
}

/// What a merge run did
#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub status: MergeStatus,
    pub resumed: bool,
    #[serde(flatten)]
    pub plan: MergePlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_commit: Option<String>,
    pub executed_steps: Vec<PlannedStep>,
}

/// Folds a feature's work package branches into its target branch
pub struct MergeOrchestrator<'a> {
    manager: &'a WorkspaceManager,
}

impl<'a> MergeOrchestrator<'a> {
    pub fn new(manager: &'a WorkspaceManager) -> Self {
        Self { manager }
    }

    fn git(&self) -> &GitManager {
        self.manager.git()
    }

    pub fn state_path(&self, feature: &str) -> PathBuf {
        self.manager
            .shared_state_dir()
            .join(MERGE_STATE_DIR)
            .join(format!("{feature}.json"))
    }

    pub fn integration_path(&self, feature: &str) -> PathBuf {
        self.manager
            .shared_state_dir()
            .join(INTEGRATION_DIR)
            .join(feature)
    }

    pub fn load_state(&self, feature: &str) -> CoordResult<Option<MergeState>> {
        let path = self.state_path(feature);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let state = serde_json::from_str(&content)
            .map_err(|e| CoordError::invalid_record(&path, e.to_string()))?;
        Ok(Some(state))
    }

    fn save_state(&self, state: &MergeState) -> CoordResult<()> {
        let content = serde_json::to_string_pretty(state)?;
        write_atomic(&self.state_path(&state.feature), &(content + "\n"))
    }

    /// Compute the plan without touching anything
    pub async fn plan(&self, feature: &str, options: &MergeOptions) -> CoordResult<MergePlan> {
        let (feature_data, graph) = self.manager.load_feature(feature)?;
        let target = self.manager.target_branch(&feature_data.manifest).await?;

        // Sorted by work package id; same order as the branch names
        let ids: Vec<String> = graph.ids().map(str::to_string).collect();
        let branches: Vec<String> = ids.iter().map(|id| workspace_id(feature, id)).collect();

        let mut live = Vec::new();
        for branch in &branches {
            if let Some(ws) = self.manager.registry().get(branch)? {
                if ws.state.is_live() && ws.path.exists() {
                    live.push(branch.clone());
                }
            }
        }

        build_plan(
            self.git(),
            feature,
            &target,
            &branches,
            &live,
            options.step_options(),
        )
        .await
    }

    /// Plan and, unless `dry_run`, execute the merge of `feature`
    pub async fn merge(&self, feature: &str, options: &MergeOptions) -> CoordResult<MergeReport> {
        if !options.dry_run {
            if let Some(mut state) = self.load_state(feature)? {
                let current = self.git().rev_parse(&state.target).await?;
                if current != state.target_start {
                    self.catch_up(&mut state, &current).await?;
                }
                info!(feature, remaining = ?state.remaining, "resuming interrupted merge");
                return self.run(state, options, true).await;
            }
        }

        let plan = self.plan(feature, options).await?;
        info!(
            feature,
            target = %plan.target,
            effective = ?plan.effective_wp_branches,
            skipped_in_target = plan.skipped_already_in_target.len(),
            skipped_ancestor = plan.skipped_ancestor_of.len(),
            "merge plan computed"
        );

        if options.dry_run {
            return Ok(MergeReport {
                status: MergeStatus::DryRun,
                resumed: false,
                plan,
                merged_commit: None,
                executed_steps: Vec::new(),
            });
        }
        if plan.is_integrated() {
            info!(feature, target = %plan.target, "already integrated");
            return Ok(MergeReport {
                status: MergeStatus::AlreadyIntegrated,
                resumed: false,
                plan,
                merged_commit: None,
                executed_steps: Vec::new(),
            });
        }

        let integration_path = self.integration_path(feature);
        self.prepare_integration(&integration_path, &plan.target_commit)
            .await?;

        let state = MergeState {
            feature: feature.to_string(),
            target: plan.target.clone(),
            target_start: plan.target_commit.clone(),
            integration_path,
            integration_head: plan.target_commit.clone(),
            completed: Vec::new(),
            remaining: plan.effective_wp_branches.clone(),
            conflict: None,
            plan,
            updated_at: Utc::now(),
        };
        self.run(state, options, false).await
    }

    /// Fresh detached worktree at `commit`
    async fn prepare_integration(&self, path: &Path, commit: &str) -> CoordResult<()> {
        let path_str = path.to_string_lossy().into_owned();
        if path.exists() {
            debug!(path = %path_str, "removing stale integration worktree");
            if let Err(e) = self
                .git()
                .run(&["worktree", "remove", "--force", &path_str])
                .await
            {
                warn!("git worktree remove warning: {e}");
                std::fs::remove_dir_all(path)?;
            }
        }
        self.git().run(&["worktree", "prune"]).await?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.git()
            .run(&["worktree", "add", "--detach", &path_str, commit])
            .await?;
        Ok(())
    }

    async fn run(
        &self,
        mut state: MergeState,
        options: &MergeOptions,
        resumed: bool,
    ) -> CoordResult<MergeReport> {
        self.ensure_integration(&state).await?;
        let integration = self.git().at(&state.integration_path);
        let mut executed = Vec::new();

        while let Some(branch) = state.remaining.first().cloned() {
            let head = integration.rev_parse("HEAD").await?;
            if integration.is_ancestor(&branch, &head).await? {
                debug!(branch = %branch, "already contained in integration head");
                state.remaining.remove(0);
                state.completed.push(branch.clone());
                state.integration_head = head;
                executed.push(PlannedStep::new(StepAction::Merge, branch));
                continue;
            }

            let message = format!(
                "{} merge {} into {}",
                self.manager.config().commit_prefix,
                branch,
                state.target
            );
            let (ok, stdout, stderr) = integration
                .run_status(&["merge", "--no-edit", "-m", &message, &branch])
                .await?;

            if !ok {
                let left = state
                    .completed
                    .last()
                    .cloned()
                    .unwrap_or_else(|| state.target.clone());
                let conflicted =
                    stdout.contains("CONFLICT") || stderr.contains("CONFLICT");
                // Anything else may be a merge the user still has in progress
                if conflicted {
                    if let Err(e) = integration.run(&["merge", "--abort"]).await {
                        debug!("merge --abort: {e}");
                    }
                }
                state.integration_head = integration.rev_parse("HEAD").await?;
                state.updated_at = Utc::now();

                if conflicted {
                    state.conflict = Some(ConflictPair {
                        left: left.clone(),
                        right: branch.clone(),
                    });
                    self.save_state(&state)?;
                    warn!(
                        feature = %state.feature,
                        left = %left,
                        right = %branch,
                        "merge conflict, sequence halted"
                    );
                    return Err(CoordError::MergeConflict {
                        left,
                        right: branch,
                        integration_path: state.integration_path.clone(),
                    });
                }
                self.save_state(&state)?;
                return Err(CoordError::git(
                    format!("merge {branch}"),
                    if stderr.is_empty() { stdout } else { stderr },
                ));
            }

            state.integration_head = integration.rev_parse("HEAD").await?;
            state.remaining.remove(0);
            state.completed.push(branch.clone());
            state.conflict = None;
            info!(branch = %branch, head = %state.integration_head, "merge step done");
            executed.push(PlannedStep::new(StepAction::Merge, branch));
        }

        let merged_commit = integration.rev_parse("HEAD").await?;
        self.advance_target(&state, &merged_commit).await?;

        for branch in state.plan.all_wp_branches.clone() {
            if let Err(e) = self.manager.mark_merged(&branch).await {
                warn!(workspace_id = %branch, "failed to mark workspace merged: {e}");
            }
        }

        // Target already holds the result; cleanup problems only warn
        for step in state.plan.planned_steps.clone() {
            match step.action {
                StepAction::Merge => {}
                StepAction::RemoveWorkspace => {
                    let remove = RemoveOptions {
                        keep_branch: true,
                        keep_storage: false,
                        force: false,
                    };
                    match self.manager.remove(&step.git_ref, remove).await {
                        Ok(_) => executed.push(step),
                        Err(e) => warn!(workspace_id = %step.git_ref, "workspace cleanup failed: {e}"),
                    }
                }
                StepAction::DeleteBranch => {
                    match self.git().delete_branch(&step.git_ref, true).await {
                        Ok(()) => executed.push(step),
                        Err(e) => warn!(branch = %step.git_ref, "branch cleanup failed: {e}"),
                    }
                }
                StepAction::Push => {}
            }
        }

        self.discard(&state).await;

        if options.push {
            self.git()
                .run_with_retry(&["push", &options.remote, &state.target])
                .await?;
            info!(remote = %options.remote, target = %state.target, "pushed target");
            executed.push(PlannedStep::new(StepAction::Push, state.target.clone()));
        }

        info!(
            feature = %state.feature,
            target = %state.target,
            commit = %merged_commit,
            "merge complete"
        );
        Ok(MergeReport {
            status: MergeStatus::Merged,
            resumed,
            plan: state.plan,
            merged_commit: Some(merged_commit),
            executed_steps: executed,
        })
    }

    /// Recreate the integration worktree at the last recorded head if it is gone
    async fn ensure_integration(&self, state: &MergeState) -> CoordResult<()> {
        if !state.integration_path.exists() {
            self.prepare_integration(&state.integration_path, &state.integration_head)
                .await?;
        }
        Ok(())
    }

    /// Fold commits that landed on the target since the sequence started
    /// into the integration head, keeping every step done so far.
    async fn catch_up(&self, state: &mut MergeState, current: &str) -> CoordResult<()> {
        warn!(
            feature = %state.feature,
            target = %state.target,
            from = %state.target_start,
            to = current,
            "target moved since the interrupted merge, merging it into the integration head"
        );
        self.ensure_integration(state).await?;
        let integration = self.git().at(&state.integration_path);

        let message = format!(
            "{} merge {} into integration of {}",
            self.manager.config().commit_prefix,
            state.target,
            state.feature
        );
        let (ok, stdout, stderr) = integration
            .run_status(&["merge", "--no-edit", "-m", &message, current])
            .await?;

        if !ok {
            if !(stdout.contains("CONFLICT") || stderr.contains("CONFLICT")) {
                return Err(CoordError::git(
                    format!("merge {} into integration", state.target),
                    if stderr.is_empty() { stdout } else { stderr },
                ));
            }
            if let Err(e) = integration.run(&["merge", "--abort"]).await {
                debug!("merge --abort: {e}");
            }
            let right = state
                .completed
                .last()
                .or_else(|| state.remaining.first())
                .cloned()
                .unwrap_or_else(|| state.feature.clone());
            state.conflict = Some(ConflictPair {
                left: state.target.clone(),
                right: right.clone(),
            });
            state.updated_at = Utc::now();
            self.save_state(state)?;
            warn!(
                feature = %state.feature,
                target = %state.target,
                "new target commits conflict with the integration head"
            );
            return Err(CoordError::MergeConflict {
                left: state.target.clone(),
                right,
                integration_path: state.integration_path.clone(),
            });
        }

        state.integration_head = integration.rev_parse("HEAD").await?;
        state.target_start = current.to_string();
        state.plan.target_commit = current.to_string();
        state.conflict = None;
        state.updated_at = Utc::now();
        self.save_state(state)?;
        info!(
            feature = %state.feature,
            head = %state.integration_head,
            "integration head caught up with target"
        );
        Ok(())
    }

    /// Move the target ref to `commit`, only if it has not moved meanwhile
    async fn advance_target(&self, state: &MergeState, commit: &str) -> CoordResult<()> {
        let current = self.git().rev_parse(&state.target).await?;
        if current != state.target_start {
            return Err(CoordError::git(
                format!("update {}", state.target),
                format!(
                    "target moved from {} to {current} during the merge; re-run to merge again",
                    state.target_start
                ),
            ));
        }

        match self.git().worktree_for_branch(&state.target).await? {
            Some(checkout) => {
                self.git()
                    .at(&checkout)
                    .run(&["merge", "--ff-only", commit])
                    .await?;
            }
            None => {
                let refname = format!("refs/heads/{}", state.target);
                let message = format!("{} merge {}", self.manager.config().commit_prefix, state.feature);
                if !self
                    .git()
                    .update_ref(&refname, commit, &state.target_start, &message)
                    .await?
                {
                    return Err(CoordError::git(
                        format!("update-ref {refname}"),
                        "target moved during the merge; re-run to merge again",
                    ));
                }
            }
        }
        debug!(target = %state.target, commit, "target advanced");
        Ok(())
    }

    /// Drop the integration worktree and the state file
    async fn discard(&self, state: &MergeState) {
        let path = state.integration_path.to_string_lossy().into_owned();
        if state.integration_path.exists() {
            if let Err(e) = self
                .git()
                .run(&["worktree", "remove", "--force", &path])
                .await
            {
                warn!("git worktree remove warning: {e}");
            }
        }
        if let Err(e) = self.git().run(&["worktree", "prune"]).await {
            warn!("git worktree prune warning: {e}");
        }
        let state_path = self.state_path(&state.feature);
        if state_path.exists() {
            if let Err(e) = std::fs::remove_file(&state_path) {
                warn!(path = %state_path.display(), "failed to remove merge state: {e}");
            }
        }
    }
}
