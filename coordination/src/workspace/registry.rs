//! Workspace registry
//!
//! JSON file in the shared git directory, so every linked worktree sees
//! the same entries. Mutations happen under [`FileLock`] and are written
//! atomically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::lock::FileLock;
use crate::error::{CoordError, CoordResult};
use crate::work_package::write_atomic;

pub const REGISTRY_FILE: &str = "workspaces.json";
pub const LOCK_FILE: &str = "workspaces.lock";

/// Lifecycle state of a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    #[default]
    Absent,
    Created,
    Active,
    Merged,
    Removed,
}

impl WorkspaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Created => "created",
            Self::Active => "active",
            Self::Merged => "merged",
            Self::Removed => "removed",
        }
    }

    /// Storage is (or should be) present on disk
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Created | Self::Active | Self::Merged)
    }

    /// A branch in this state may serve as base for another workspace
    pub fn is_materialized(&self) -> bool {
        matches!(self, Self::Active | Self::Merged)
    }
}

impl std::fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One workspace bound to one work package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub workspace_id: String,
    pub feature: String,
    pub bound_wp_id: String,

    /// Ref the branch was created from (branch name)
    pub base_ref: String,

    /// Commit `base_ref` pointed at when the workspace was created
    pub base_commit: String,

    pub branch_ref: String,
    pub path: PathBuf,
    pub state: WorkspaceState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_process: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set once the branch was folded into its target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
}

impl Workspace {
    /// Move to `state`, stamping `updated_at`
    pub fn set_state(&mut self, state: WorkspaceState) {
        self.state = state;
        self.updated_at = Utc::now();
        if state == WorkspaceState::Merged && self.merged_at.is_none() {
            self.merged_at = Some(self.updated_at);
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    workspaces: BTreeMap<String, Workspace>,
}

/// Handle on `<git-common-dir>/wpflow/workspaces.json`
#[derive(Debug, Clone)]
pub struct WorkspaceRegistry {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl WorkspaceRegistry {
    pub fn new(dir: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(REGISTRY_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Open the shared lock file
    pub fn lock(&self) -> CoordResult<FileLock> {
        FileLock::open(self.lock_path())
    }

    fn read_file(&self) -> CoordResult<RegistryFile> {
        let path = self.path();
        if !path.exists() {
            return Ok(RegistryFile::default());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| CoordError::invalid_record(&path, e.to_string()))
    }

    /// Every entry, sorted by workspace id. Lock-free: writes are atomic.
    pub fn load(&self) -> CoordResult<Vec<Workspace>> {
        Ok(self.read_file()?.workspaces.into_values().collect())
    }

    pub fn get(&self, workspace_id: &str) -> CoordResult<Option<Workspace>> {
        Ok(self.read_file()?.workspaces.remove(workspace_id))
    }

    /// Run `f` over the entry map under the lock and persist the result
    pub async fn update<F, R>(&self, f: F) -> CoordResult<R>
    where
        F: FnOnce(&mut BTreeMap<String, Workspace>) -> CoordResult<R>,
    {
        let _guard = self.lock()?.write(self.lock_timeout).await?;

        let mut file = self.read_file()?;
        let result = f(&mut file.workspaces)?;
        let content = serde_json::to_string_pretty(&file)?;
        write_atomic(&self.path(), &(content + "\n"))?;
        Ok(result)
    }

    /// Insert or replace one entry
    pub async fn put(&self, workspace: Workspace) -> CoordResult<()> {
        self.update(move |map| {
            map.insert(workspace.workspace_id.clone(), workspace);
            Ok(())
        })
        .await
    }

    /// Drop an entry entirely (the workspace is `absent` again)
    pub async fn forget(&self, workspace_id: &str) -> CoordResult<Option<Workspace>> {
        self.update(|map| Ok(map.remove(workspace_id))).await
    }

    /// Change the state of an existing entry
    pub async fn set_state(
        &self,
        workspace_id: &str,
        state: WorkspaceState,
    ) -> CoordResult<Workspace> {
        self.update(|map| {
            let entry = map
                .get_mut(workspace_id)
                .ok_or_else(|| CoordError::WorkspaceNotFound {
                    workspace_id: workspace_id.to_string(),
                })?;
            entry.set_state(state);
            Ok(entry.clone())
        })
        .await
    }

    /// Record or clear the owning process of an entry, if it exists
    pub async fn set_owner(
        &self,
        workspace_id: &str,
        owner: Option<String>,
    ) -> CoordResult<Option<Workspace>> {
        self.update(|map| {
            Ok(map.get_mut(workspace_id).map(|entry| {
                entry.owner_process = owner;
                entry.updated_at = Utc::now();
                entry.clone()
            }))
        })
        .await
    }
}
