//! Work Package Coordination Library
//!
//! This library provides:
//! - Dependency graph over a feature's work packages
//! - One git worktree per work package, based on its dependency
//! - Multi-branch merge of a feature into its target branch
//! - Serialized lane changes on the authoritative branch
//! - Forward-only migrations of the on-disk project layout
//!
//! # Layout
//!
//! ```text
//! <repo>/specs/<feature>/manifest.json         work package ids, target branch
//! <repo>/specs/<feature>/tasks/<WP>.md         YAML front matter + body
//! <repo>/.wpflow/config.toml                   project settings
//! <repo>/.wpflow/migrations.json               applied migrations
//! <repo>/.worktrees/<feature>-<WP>/            workspaces
//! <git-common-dir>/wpflow/workspaces.json      workspace registry
//! <git-common-dir>/wpflow/merge-state/         interrupted merges
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use wpflow_coordination::{CoordConfig, StateSynchronizer, WorkspaceManager, Lane};
//!
//! # async fn demo() -> wpflow_coordination::CoordResult<()> {
//! let config = CoordConfig::load(None)?;
//! let manager = WorkspaceManager::open(config).await?;
//! let workspace = manager.create("001-auth", "WP02", None).await?;
//!
//! let sync = StateSynchronizer::new(manager);
//! sync.update_lane("001-auth", "WP02", Lane::Doing, "alice", "started")
//!     .await?;
//! # let _ = workspace;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod git;
pub mod graph;
pub mod merge;
pub mod migration;
pub mod sync;
pub mod work_package;
pub mod workspace;

pub use config::CoordConfig;
pub use error::{CoordError, CoordResult, ErrorCategory, StructuredError};
pub use git::{GitManager, WorktreeInfo};
pub use graph::DependencyGraph;

// Re-export work package types
pub use work_package::{
    Feature, FeatureManifest, FeatureStore, HistoryEntry, Lane, Transition, WorkPackage,
    WorkPackageRecord,
};

// Re-export workspace types
pub use workspace::{
    workspace_id, BaseChoice, RemoveOptions, Workspace, WorkspaceManager, WorkspaceRegistry,
    WorkspaceState, WorkspaceStatus,
};

// Re-export merge types
pub use merge::{
    ConflictPair, MergeOptions, MergeOrchestrator, MergePlan, MergeReport, MergeState,
    MergeStatus, PlannedStep, StepAction,
};

pub use sync::{StateSynchronizer, SyncOutcome};

// Re-export migration types
pub use migration::{
    Migration, MigrationEngine, MigrationRegistry, MigrationReport, MigrationSummary,
    MigrationVersion,
};
