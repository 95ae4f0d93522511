//! Command-line arguments

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use wpflow_coordination::Lane;

/// Parallel work-package workspaces on top of git worktrees
#[derive(Parser, Debug)]
#[command(name = "wpflow", author, version, about, long_about = None)]
pub struct Cli {
    /// Repository to operate on (defaults to the one containing the current directory)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    /// Emit machine-readable JSON on stdout
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Integration branch for features whose manifest names none
    #[arg(long, global = true)]
    pub target_branch: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the workspace for a work package
    Implement {
        /// Work package id, e.g. WP02
        wp_id: String,

        #[arg(long)]
        feature: String,

        /// Branch from this work package instead of the inferred base
        #[arg(long)]
        base: Option<String>,
    },

    /// Merge a feature's work package branches into its target branch
    Merge(MergeArgs),

    /// Move a work package to another lane
    Move {
        wp_id: String,

        /// planned, doing, for_review or done
        lane: Lane,

        #[arg(long)]
        feature: String,

        #[command(flatten)]
        actor: ActorArgs,

        #[arg(long, default_value = "")]
        note: String,
    },

    /// Append a history note without changing the lane
    Note {
        wp_id: String,

        note: String,

        #[arg(long)]
        feature: String,

        #[command(flatten)]
        actor: ActorArgs,
    },

    /// Show one work package as recorded on the authoritative branch
    Show {
        wp_id: String,

        #[arg(long)]
        feature: String,
    },

    /// List the work packages of a feature with their lanes
    Tasks {
        #[arg(long)]
        feature: String,
    },

    /// Dependency graph queries
    Graph {
        #[arg(long)]
        feature: String,
    },

    /// Workspace inspection and teardown
    #[command(subcommand)]
    Workspace(WorkspaceCommand),

    /// Bring the on-disk project layout up to date
    Upgrade {
        /// Report pending migrations without applying them
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    #[arg(long)]
    pub feature: String,

    /// Compute and print the plan only
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Push the target branch after a successful merge
    #[arg(long, default_value_t = false)]
    pub push: bool,

    #[arg(long, default_value = "origin")]
    pub remote: String,

    #[arg(long, default_value_t = false)]
    pub keep_branches: bool,

    #[arg(long, default_value_t = false)]
    pub keep_workspaces: bool,
}

#[derive(Args, Debug)]
pub struct ActorArgs {
    /// Who made the change (defaults to $USER)
    #[arg(long)]
    pub actor: Option<String>,
}

impl ActorArgs {
    pub fn resolve(&self) -> String {
        self.actor
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| "wpflow".to_string())
    }
}

#[derive(Subcommand, Debug)]
pub enum WorkspaceCommand {
    /// Every registered workspace
    List,

    /// One workspace, by id (<feature>-<WP>)
    Status { workspace_id: String },

    /// Remove a workspace
    Remove {
        workspace_id: String,

        #[arg(long, default_value_t = false)]
        keep_branch: bool,

        /// Leave the worktree on disk (requires --keep-branch)
        #[arg(long, default_value_t = false)]
        keep_storage: bool,

        /// Discard uncommitted changes and unmerged commits
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}
