//! Workspace lifecycle
//!
//! One git worktree per work package, on its own branch, with the specs
//! directory left out of the checkout. The registry of workspaces lives
//! in the shared git directory so every checkout agrees on it.

pub mod lock;
pub mod manager;
pub mod registry;

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{CoordError, CoordResult};

pub use lock::{FileLock, LockGuard};
pub use manager::{BaseChoice, RemoveOptions, WorkspaceManager, WorkspaceStatus};
pub use registry::{Workspace, WorkspaceRegistry, WorkspaceState};

/// Directory under the git common dir holding shared, unversioned state
pub const SHARED_STATE_DIR: &str = "wpflow";

static NAME_COMPONENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("NAME_COMPONENT_RE regex should compile")
});

/// Reject feature slugs and ids that would not make a valid branch name
pub fn validate_name(kind: &str, value: &str) -> CoordResult<()> {
    if NAME_COMPONENT_RE.is_match(value) && !value.contains("..") && !value.ends_with(".lock") {
        Ok(())
    } else {
        Err(CoordError::usage(format!(
            "invalid {kind} '{value}': use letters, digits, '.', '_' or '-'"
        )))
    }
}

/// Workspace id and branch name for a work package: `<feature>-<wp>`
pub fn workspace_id(feature: &str, wp_id: &str) -> String {
    format!("{feature}-{wp_id}")
}
