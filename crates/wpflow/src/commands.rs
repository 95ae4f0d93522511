//! Command dispatch: argument structs in, library calls, human or JSON out

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use wpflow_coordination::{
    CoordConfig, DependencyGraph, GitManager, MergeOptions, MergeOrchestrator, MergeReport,
    MergeStatus, MigrationEngine, RemoveOptions, StateSynchronizer, SyncOutcome, WorkPackage,
    WorkspaceManager, WorkspaceStatus,
};

use crate::cli::{Cli, Command, MergeArgs, WorkspaceCommand};

/// Timeout for locating the repository, before any config is read
const DISCOVERY_TIMEOUT_SECS: u64 = 30;

pub async fn run(cli: &Cli) -> Result<()> {
    let config = load_config(cli).await?;
    let manager = WorkspaceManager::open(config).await?;
    dispatch(cli, &cli.command, manager).await
}

async fn dispatch(cli: &Cli, command: &Command, manager: WorkspaceManager) -> Result<()> {
    match command {
        Command::Implement {
            wp_id,
            feature,
            base,
        } => {
            let workspace = manager.create(feature, wp_id, base.as_deref()).await?;
            if cli.json {
                return print_json(&workspace);
            }
            println!(
                "Workspace {} ready at {}",
                workspace.workspace_id,
                workspace.path.display()
            );
            println!("  branch: {}", workspace.branch_ref);
            println!("  base:   {} ({})", workspace.base_ref, short(&workspace.base_commit));
            Ok(())
        }

        Command::Merge(args) => merge(cli, &manager, args).await,

        Command::Move {
            wp_id,
            lane,
            feature,
            actor,
            note,
        } => {
            let sync = StateSynchronizer::new(manager);
            let outcome = sync
                .update_lane(feature, wp_id, *lane, &actor.resolve(), note)
                .await?;
            print_outcome(cli, &outcome)
        }

        Command::Note {
            wp_id,
            note,
            feature,
            actor,
        } => {
            let sync = StateSynchronizer::new(manager);
            let outcome = sync
                .append_note(feature, wp_id, &actor.resolve(), note)
                .await?;
            print_outcome(cli, &outcome)
        }

        Command::Show { wp_id, feature } => {
            let wp = StateSynchronizer::new(manager).read(feature, wp_id).await?;
            if cli.json {
                return print_json(&wp);
            }
            print_work_package(&wp);
            for entry in &wp.history {
                println!(
                    "  {} {:<10} {:<12} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M"),
                    entry.lane,
                    entry.actor,
                    entry.note
                );
            }
            Ok(())
        }

        Command::Tasks { feature } => {
            let packages = StateSynchronizer::new(manager).list(feature).await?;
            if cli.json {
                return print_json(&packages);
            }
            for wp in &packages {
                print_work_package(wp);
            }
            Ok(())
        }

        Command::Graph { feature } => {
            let packages = StateSynchronizer::new(manager).list(feature).await?;
            let graph = DependencyGraph::build(&packages)?;
            print_graph(cli, &graph, &packages)
        }

        Command::Workspace(command) => workspace(cli, &manager, command).await,

        Command::Upgrade { dry_run } => upgrade(cli, &manager, *dry_run).await,
    }
}

async fn upgrade(cli: &Cli, manager: &WorkspaceManager, dry_run: bool) -> Result<()> {
    let engine = MigrationEngine::with_builtin(manager.config().clone())?;
    let report = engine.upgrade(manager, dry_run).await?;
    if cli.json {
        return print_json(&report);
    }
    if report.applied.is_empty() {
        println!("Project layout is up to date.");
    }
    for applied in &report.applied {
        let verb = if report.dry_run { "would apply" } else { "applied" };
        println!(
            "{verb} {} {} ({} files)",
            applied.migration.version_id, applied.migration.name, applied.files_changed
        );
    }
    if let Some(commit) = &report.commit {
        println!("committed {}", short(commit));
    }
    Ok(())
}

async fn merge(cli: &Cli, manager: &WorkspaceManager, args: &MergeArgs) -> Result<()> {
    let options = MergeOptions {
        dry_run: args.dry_run,
        push: args.push,
        keep_branches: args.keep_branches,
        keep_workspaces: args.keep_workspaces,
        remote: args.remote.clone(),
    };
    let report = MergeOrchestrator::new(manager)
        .merge(&args.feature, &options)
        .await?;
    if cli.json {
        return print_json(&report);
    }
    print_merge_report(&report);
    Ok(())
}

async fn workspace(cli: &Cli, manager: &WorkspaceManager, command: &WorkspaceCommand) -> Result<()> {
    match command {
        WorkspaceCommand::List => {
            let statuses = manager.list().await?;
            if cli.json {
                return print_json(&statuses);
            }
            if statuses.is_empty() {
                println!("No workspaces.");
            }
            for status in &statuses {
                print_status(status);
            }
            Ok(())
        }
        WorkspaceCommand::Status { workspace_id } => {
            let status = manager.status(workspace_id).await?;
            if cli.json {
                return print_json(&status);
            }
            print_status(&status);
            Ok(())
        }
        WorkspaceCommand::Remove {
            workspace_id,
            keep_branch,
            keep_storage,
            force,
        } => {
            let options = RemoveOptions {
                keep_branch: *keep_branch,
                keep_storage: *keep_storage,
                force: *force,
            };
            let removed = manager.remove(workspace_id, options).await?;
            if cli.json {
                return print_json(&removed);
            }
            println!("Removed workspace {}", removed.workspace_id);
            Ok(())
        }
    }
}

/// Find the primary checkout from wherever we were started, then load config
async fn load_config(cli: &Cli) -> Result<CoordConfig> {
    let start = match &cli.repo {
        Some(path) => path.clone(),
        None => std::env::current_dir().context("cannot read current directory")?,
    };
    let git = GitManager::new(&start, DISCOVERY_TIMEOUT_SECS);
    git.ensure_repository().await?;
    let root: PathBuf = git.primary_root().await?;

    let mut config = CoordConfig::load(Some(root))?;
    if let Some(branch) = &cli.target_branch {
        config.target_branch = Some(branch.clone());
    }
    tracing::debug!(
        repo = %config.repo_root.display(),
        specs = %config.specs_dir.display(),
        "configuration loaded"
    );
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn short(commit: &str) -> &str {
    commit.get(..8).unwrap_or(commit)
}

fn print_outcome(cli: &Cli, outcome: &SyncOutcome) -> Result<()> {
    if cli.json {
        return print_json(outcome);
    }
    let wp = &outcome.work_package;
    match outcome.transition {
        Some(transition) => println!("{} -> {} ({transition})", wp.id, wp.lane),
        None => println!("{}: note added", wp.id),
    }
    println!("  committed {} on {}", short(&outcome.commit), outcome.branch);
    if !outcome.open_dependents.is_empty() {
        println!(
            "  still open downstream: {}",
            outcome.open_dependents.join(", ")
        );
    }
    Ok(())
}

fn print_work_package(wp: &WorkPackage) {
    let deps: Vec<&str> = wp.dependencies.iter().map(String::as_str).collect();
    println!(
        "{:<8} {:<10} {}{}",
        wp.id,
        wp.lane,
        wp.title,
        if deps.is_empty() {
            String::new()
        } else {
            format!("  [after {}]", deps.join(", "))
        }
    );
}

fn print_graph(cli: &Cli, graph: &DependencyGraph, packages: &[WorkPackage]) -> Result<()> {
    let order = graph.topological_order();
    let levels = graph.depth_levels();
    let ready = graph.ready(packages);
    if cli.json {
        return print_json(&json!({
            "order": order,
            "levels": levels,
            "ready": ready,
        }));
    }
    println!("Order: {}", order.join(" -> "));
    for (depth, ids) in levels.iter().enumerate() {
        println!("  wave {depth}: {}", ids.join(", "));
    }
    if ready.is_empty() {
        println!("Ready: none");
    } else {
        println!("Ready: {}", ready.join(", "));
    }
    Ok(())
}

fn print_status(status: &WorkspaceStatus) {
    let mut flags = Vec::new();
    if !status.branch_exists {
        flags.push("no branch".to_string());
    }
    if !status.storage_present {
        flags.push("no worktree".to_string());
    }
    if let Some(owner) = &status.owner_process {
        let liveness = match status.owner_alive {
            Some(true) => "alive",
            Some(false) => "gone",
            None => "unknown",
        };
        flags.push(format!("owner {owner} ({liveness})"));
    }
    println!(
        "{:<28} {:<8} {}{}",
        status.workspace_id,
        status.state,
        status.path.display(),
        if flags.is_empty() {
            String::new()
        } else {
            format!("  [{}]", flags.join(", "))
        }
    );
}

fn print_merge_report(report: &MergeReport) {
    let plan = &report.plan;
    match report.status {
        MergeStatus::DryRun => println!("Merge plan for {} into {}:", plan.feature, plan.target),
        MergeStatus::AlreadyIntegrated => {
            println!("{} is already integrated into {}.", plan.feature, plan.target);
            return;
        }
        MergeStatus::Merged => println!(
            "Merged {} into {} at {}{}",
            plan.feature,
            plan.target,
            report.merged_commit.as_deref().map(short).unwrap_or("?"),
            if report.resumed { " (resumed)" } else { "" }
        ),
    }
    for branch in &plan.skipped_already_in_target {
        println!("  skip {branch}: already in {}", plan.target);
    }
    for (branch, container) in &plan.skipped_ancestor_of {
        println!("  skip {branch}: contained in {container}");
    }
    for branch in &plan.missing_wp_branches {
        println!("  skip {branch}: no such branch");
    }
    let steps = if report.status == MergeStatus::DryRun {
        &plan.planned_steps
    } else {
        &report.executed_steps
    };
    for step in steps {
        println!("  {} {}", step.action, step.git_ref);
    }
}
