//! State synchronizer
//!
//! Work package metadata lives on the authoritative branch (the feature's
//! target). Workspaces never check it out, so every change goes through
//! here: read the record at the branch tip, apply the change, write a
//! commit on top of that tip with plumbing commands, then compare-and-swap
//! the branch ref. Lane change and history entry land in the same commit.
//!
//! A rejected swap means someone else committed first. The change is
//! re-read and re-applied once; a second rejection is reported as
//! contention instead of overwriting.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{CoordError, CoordResult};
use crate::git::GitManager;
use crate::graph::DependencyGraph;
use crate::work_package::{
    write_atomic, HistoryEntry, Lane, Transition, WorkPackage, WorkPackageRecord,
};
use crate::workspace::{validate_name, workspace_id, WorkspaceManager};

/// Attempts per change: the first try plus one retry
const MAX_ATTEMPTS: u32 = 2;

/// Result of one committed metadata change
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub feature: String,
    pub work_package: WorkPackage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition: Option<Transition>,
    pub branch: String,
    pub commit: String,
    pub attempts: u32,
    /// Dependents not yet done, filled when a package is closed
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub open_dependents: Vec<String>,
}

#[derive(Debug, Clone)]
enum Change {
    Lane {
        target: Lane,
        actor: String,
        note: String,
    },
    Note {
        actor: String,
        note: String,
    },
}

impl Change {
    fn apply(&self, wp: &mut WorkPackage, owner: &str) -> CoordResult<Option<Transition>> {
        match self {
            Self::Lane {
                target,
                actor,
                note,
            } => {
                let transition = wp.apply_lane(*target, actor, note)?;
                wp.owner_process = (*target == Lane::Doing).then(|| owner.to_string());
                Ok(Some(transition))
            }
            Self::Note { actor, note } => {
                wp.history.push(HistoryEntry::now(wp.lane, actor, note));
                Ok(None)
            }
        }
    }

    fn summary(&self, wp_id: &str) -> String {
        match self {
            Self::Lane { target, actor, .. } => format!("{wp_id} -> {target} ({actor})"),
            Self::Note { actor, .. } => format!("{wp_id} note ({actor})"),
        }
    }
}

enum Attempt {
    Committed {
        commit: String,
        record: WorkPackageRecord,
        transition: Option<Transition>,
    },
    /// The branch no longer points at the expected tip
    Rejected,
}

/// Private index file for building one commit, removed on drop
struct TempIndex(PathBuf);

impl Drop for TempIndex {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
        let _ = std::fs::remove_file(self.0.with_extension("lock"));
    }
}

/// Serialized writer for work package metadata
#[derive(Debug, Clone)]
pub struct StateSynchronizer {
    manager: WorkspaceManager,
    owner: String,
}

impl StateSynchronizer {
    /// Owner handle defaults to the current process id
    pub fn new(manager: WorkspaceManager) -> Self {
        Self {
            manager,
            owner: std::process::id().to_string(),
        }
    }

    /// Handle recorded as `owner_process` when a package enters `doing`
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    fn git(&self) -> &GitManager {
        self.manager.git()
    }

    /// Branch holding the authoritative records of `feature`
    pub async fn authoritative_branch(&self, feature: &str) -> CoordResult<String> {
        validate_name("feature", feature)?;
        let manifest = self.manager.store().load_manifest(feature)?;
        self.manager.target_branch(&manifest).await
    }

    async fn tip(&self, branch: &str) -> CoordResult<String> {
        self.git().rev_parse(&format!("refs/heads/{branch}")).await
    }

    async fn read_at(&self, tip: &str, feature: &str, wp_id: &str) -> CoordResult<WorkPackageRecord> {
        let path = self.manager.store().record_git_path(feature, wp_id);
        let text = self
            .git()
            .show_file(tip, &path)
            .await?
            .ok_or_else(|| CoordError::wp_not_found(feature, wp_id))?;
        let record = WorkPackageRecord::parse(&text, Path::new(&path))?;
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

    /// Current metadata of one work package
    pub async fn read(&self, feature: &str, wp_id: &str) -> CoordResult<WorkPackage> {
        let branch = self.authoritative_branch(feature).await?;
        let tip = self.tip(&branch).await?;
        Ok(self.read_at(&tip, feature, wp_id).await?.meta)
    }

    /// Metadata of every work package of `feature`, manifest order
    pub async fn list(&self, feature: &str) -> CoordResult<Vec<WorkPackage>> {
        let branch = self.authoritative_branch(feature).await?;
        let tip = self.tip(&branch).await?;
        let manifest = self.manager.store().load_manifest(feature)?;
        let mut packages = Vec::with_capacity(manifest.work_packages.len());
        for wp_id in &manifest.work_packages {
            packages.push(self.read_at(&tip, feature, wp_id).await?.meta);
        }
        Ok(packages)
    }

    /// Move a work package to `lane`, appending a history entry
    pub async fn update_lane(
        &self,
        feature: &str,
        wp_id: &str,
        lane: Lane,
        actor: &str,
        note: &str,
    ) -> CoordResult<SyncOutcome> {
        let change = Change::Lane {
            target: lane,
            actor: actor.to_string(),
            note: note.to_string(),
        };
        let mut outcome = self.commit_change(feature, wp_id, change).await?;

        let ws_id = workspace_id(feature, wp_id);
        if let Err(e) = self
            .manager
            .registry()
            .set_owner(&ws_id, outcome.work_package.owner_process.clone())
            .await
        {
            warn!(workspace_id = %ws_id, "failed to record owner process: {e}");
        }

        if lane == Lane::Done {
            let packages = self.list(feature).await?;
            let graph = DependencyGraph::build(&packages)?;
            let open: Vec<String> = graph
                .transitive_dependents(wp_id)
                .into_iter()
                .filter(|id| {
                    packages
                        .iter()
                        .any(|wp| &wp.id == id && wp.lane != Lane::Done)
                })
                .collect();
            if !open.is_empty() {
                warn!(wp_id, dependents = ?open, "closed work package still has open dependents");
            }
            outcome.open_dependents = open;
        }

        info!(
            feature,
            wp_id,
            lane = %lane,
            actor,
            commit = %outcome.commit,
            "lane changed"
        );
        Ok(outcome)
    }

    /// Append a history entry without changing the lane
    pub async fn append_note(
        &self,
        feature: &str,
        wp_id: &str,
        actor: &str,
        note: &str,
    ) -> CoordResult<SyncOutcome> {
        if note.trim().is_empty() {
            return Err(CoordError::usage("note must not be empty"));
        }
        let change = Change::Note {
            actor: actor.to_string(),
            note: note.to_string(),
        };
        let outcome = self.commit_change(feature, wp_id, change).await?;
        info!(feature, wp_id, actor, commit = %outcome.commit, "note appended");
        Ok(outcome)
    }

    async fn commit_change(
        &self,
        feature: &str,
        wp_id: &str,
        change: Change,
    ) -> CoordResult<SyncOutcome> {
        validate_name("work package", wp_id)?;
        let branch = self.authoritative_branch(feature).await?;

        for attempt in 1..=MAX_ATTEMPTS {
            let tip = self.tip(&branch).await?;
            match self
                .try_commit(&branch, &tip, feature, wp_id, &change)
                .await?
            {
                Attempt::Committed {
                    commit,
                    record,
                    transition,
                } => {
                    if let Err(e) = self.refresh_checkout(&branch, &tip, feature, wp_id).await {
                        warn!(branch = %branch, wp_id, "failed to refresh checked-out record: {e}");
                    }
                    return Ok(SyncOutcome {
                        feature: feature.to_string(),
                        work_package: record.meta,
                        transition,
                        branch,
                        commit,
                        attempts: attempt,
                        open_dependents: Vec::new(),
                    });
                }
                Attempt::Rejected => {
                    debug!(wp_id, attempt, branch = %branch, "authoritative branch moved, re-reading");
                }
            }
        }

        warn!(wp_id, branch = %branch, "giving up after concurrent updates");
        Err(CoordError::Contention {
            wp_id: wp_id.to_string(),
            attempts: MAX_ATTEMPTS,
        })
    }

    /// One read-modify-commit against `expected_tip`.
    ///
    /// Validation errors surface before anything is written.
    async fn try_commit(
        &self,
        branch: &str,
        expected_tip: &str,
        feature: &str,
        wp_id: &str,
        change: &Change,
    ) -> CoordResult<Attempt> {
        let mut record = self.read_at(expected_tip, feature, wp_id).await?;
        let transition = change.apply(&mut record.meta, &self.owner)?;
        let rendered = record.render()?;
        let path = self.manager.store().record_git_path(feature, wp_id);

        let blob = self
            .git()
            .run_with_stdin(&["hash-object", "-w", "--stdin"], rendered.as_bytes())
            .await?;

        let tmp_dir = self.manager.shared_state_dir();
        std::fs::create_dir_all(&tmp_dir)?;
        let index = TempIndex(tmp_dir.join(format!("tmp-index-{}", uuid::Uuid::new_v4())));
        let index_path = index.0.to_string_lossy().into_owned();
        let env = [("GIT_INDEX_FILE", index_path.as_str())];

        self.git().run_env(&["read-tree", expected_tip], &env).await?;
        self.git()
            .run_env(
                &[
                    "update-index",
                    "--add",
                    "--cacheinfo",
                    &format!("100644,{blob},{path}"),
                ],
                &env,
            )
            .await?;
        let tree = self.git().run_env(&["write-tree"], &env).await?;
        drop(index);

        let message = format!(
            "{} {feature} {}",
            self.manager.config().commit_prefix,
            change.summary(wp_id)
        );
        let commit = self
            .git()
            .run(&["commit-tree", &tree, "-p", expected_tip, "-m", &message])
            .await?;

        let refname = format!("refs/heads/{branch}");
        if self
            .git()
            .update_ref(&refname, &commit, expected_tip, &message)
            .await?
        {
            Ok(Attempt::Committed {
                commit,
                record,
                transition,
            })
        } else {
            Ok(Attempt::Rejected)
        }
    }

    /// Bring the checked-out copy of a record in line with the branch tip.
    ///
    /// Runs under the shared lock and always copies the latest tip, so
    /// concurrent refreshes converge on the newest content. A copy that
    /// matches neither `previous_tip` nor the tip holds local edits and is
    /// left alone.
    async fn refresh_checkout(
        &self,
        branch: &str,
        previous_tip: &str,
        feature: &str,
        wp_id: &str,
    ) -> CoordResult<()> {
        let Some(checkout) = self.git().worktree_for_branch(branch).await? else {
            return Ok(());
        };
        let path = self.manager.store().record_git_path(feature, wp_id);
        let file = checkout.join(&path);

        let registry = self.manager.registry();
        let _guard = registry.lock()?.write(registry.lock_timeout()).await?;

        let tip = self.tip(branch).await?;
        let Some(content) = self.git().show_file(&tip, &path).await? else {
            return Ok(());
        };
        let on_disk = match std::fs::read_to_string(&file) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if on_disk.as_deref() != Some(content.as_str()) {
            let before = self.git().show_file(previous_tip, &path).await?;
            if on_disk != before {
                warn!(
                    path = %file.display(),
                    "checked-out record has local edits, leaving it as is"
                );
                return Ok(());
            }
        }

        let blob = self.git().run(&["rev-parse", &format!("{tip}:{path}")]).await?;
        write_atomic(&file, &content)?;
        self.git()
            .at(&checkout)
            .run(&["update-index", "--cacheinfo", &format!("100644,{blob},{path}")])
            .await?;
        debug!(checkout = %checkout.display(), path = %path, "refreshed checked-out record");
        Ok(())
    }
}
