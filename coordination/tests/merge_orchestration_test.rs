//! Merge orchestration end to end
//!
//! - Skip analysis for branches already in the target or subsumed
//! - Sequential execution and cleanup
//! - Conflict halts the sequence, a re-run resumes it
//! - A resolution survives commits that land on the target meanwhile
//! - Dry runs are deterministic and side-effect free

mod common;

use common::{commit_file, git, git_ok, TestRepo, FEATURE};
use wpflow_coordination::{
    CoordError, Lane, MergeOptions, MergeOrchestrator, MergeStatus, PlannedStep,
    StateSynchronizer, StepAction, WorkspaceState,
};

fn merge_step(branch: &str) -> PlannedStep {
    PlannedStep::new(StepAction::Merge, branch)
}

fn dry_run() -> MergeOptions {
    MergeOptions {
        dry_run: true,
        ..Default::default()
    }
}

/// WP01 on main, WP02 and WP03 both on top of WP01
fn diamond_branches(repo: &TestRepo) {
    repo.plan_diamond();
    repo.branch_with_commit("001-auth-WP01", "main", "a.txt", "a\n");
    repo.branch_with_commit("001-auth-WP02", "001-auth-WP01", "b.txt", "b\n");
    repo.branch_with_commit("001-auth-WP03", "001-auth-WP01", "c.txt", "c\n");
}

#[tokio::test]
async fn test_already_integrated_runs_nothing() {
    let repo = TestRepo::new();
    diamond_branches(&repo);
    git(repo.root(), &["merge", "-q", "--no-ff", "--no-edit", "001-auth-WP02"]);
    git(repo.root(), &["merge", "-q", "--no-ff", "--no-edit", "001-auth-WP03"]);
    let main_before = repo.rev("main");

    let manager = repo.manager().await;
    let report = MergeOrchestrator::new(&manager)
        .merge(FEATURE, &MergeOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, MergeStatus::AlreadyIntegrated);
    assert!(report.plan.effective_wp_branches.is_empty());
    assert_eq!(
        report.plan.skipped_already_in_target,
        vec!["001-auth-WP01", "001-auth-WP02", "001-auth-WP03"]
    );
    assert_eq!(report.plan.missing_wp_branches, vec!["001-auth-WP04"]);
    assert!(report.plan.planned_steps.is_empty());
    assert!(report.executed_steps.is_empty());

    assert_eq!(repo.rev("main"), main_before);
    assert!(repo.branch_exists("001-auth-WP02"));
    assert!(repo.branch_exists("001-auth-WP03"));
}

#[tokio::test]
async fn test_two_unmerged_dependencies_plan() {
    let repo = TestRepo::new();
    diamond_branches(&repo);
    let manager = repo.manager().await;

    let report = MergeOrchestrator::new(&manager)
        .merge(FEATURE, &dry_run())
        .await
        .unwrap();
    let plan = &report.plan;

    assert_eq!(report.status, MergeStatus::DryRun);
    assert_eq!(
        plan.all_wp_branches,
        vec!["001-auth-WP01", "001-auth-WP02", "001-auth-WP03"]
    );
    assert_eq!(plan.effective_wp_branches, vec!["001-auth-WP02", "001-auth-WP03"]);
    // First effective branch (sorted) that contains it
    assert_eq!(
        plan.skipped_ancestor_of.get("001-auth-WP01").map(String::as_str),
        Some("001-auth-WP02")
    );
    assert!(plan.skipped_already_in_target.is_empty());

    let merges: Vec<&PlannedStep> = plan.steps(StepAction::Merge).collect();
    assert_eq!(
        merges,
        vec![&merge_step("001-auth-WP02"), &merge_step("001-auth-WP03")]
    );
    assert_eq!(plan.planned_steps[0], merge_step("001-auth-WP02"));
    assert_eq!(plan.planned_steps[1], merge_step("001-auth-WP03"));
    assert_eq!(plan.steps(StepAction::DeleteBranch).count(), 3);
    assert_eq!(plan.steps(StepAction::RemoveWorkspace).count(), 0);
}

#[tokio::test]
async fn test_dry_run_is_deterministic_and_inert() {
    let repo = TestRepo::new();
    diamond_branches(&repo);
    let main_before = repo.rev("main");
    let manager = repo.manager().await;
    let orchestrator = MergeOrchestrator::new(&manager);

    let options = MergeOptions {
        dry_run: true,
        push: true,
        ..Default::default()
    };
    let first = serde_json::to_value(orchestrator.merge(FEATURE, &options).await.unwrap()).unwrap();
    let second = serde_json::to_value(orchestrator.merge(FEATURE, &options).await.unwrap()).unwrap();
    assert_eq!(first, second);

    for key in [
        "all_wp_branches",
        "effective_wp_branches",
        "skipped_already_in_target",
        "skipped_ancestor_of",
        "planned_steps",
    ] {
        assert!(first.get(key).is_some(), "missing {key}");
    }
    assert_eq!(
        first["planned_steps"][0],
        serde_json::json!({"action": "merge", "ref": "001-auth-WP02"})
    );
    let steps = first["planned_steps"].as_array().unwrap();
    assert_eq!(
        steps.last().unwrap(),
        &serde_json::json!({"action": "push", "ref": "main"})
    );

    assert_eq!(repo.rev("main"), main_before);
    assert!(repo.branch_exists("001-auth-WP01"));
    assert!(orchestrator.load_state(FEATURE).unwrap().is_none());
    assert!(!orchestrator.integration_path(FEATURE).exists());
}

#[tokio::test]
async fn test_merge_executes_in_order_and_cleans_up() {
    let repo = TestRepo::new();
    diamond_branches(&repo);
    let manager = repo.manager().await;
    let orchestrator = MergeOrchestrator::new(&manager);

    let report = orchestrator
        .merge(FEATURE, &MergeOptions::default())
        .await
        .unwrap();
    assert_eq!(report.status, MergeStatus::Merged);
    assert!(!report.resumed);

    let merged = report.merged_commit.clone().unwrap();
    assert_eq!(repo.rev("main"), merged);
    for file in ["a.txt", "b.txt", "c.txt"] {
        assert!(repo.root().join(file).exists(), "{file} missing from main");
    }
    assert_eq!(git(repo.root(), &["status", "--porcelain"]), "");

    for branch in ["001-auth-WP01", "001-auth-WP02", "001-auth-WP03"] {
        assert!(!repo.branch_exists(branch), "{branch} should be deleted");
    }
    assert_eq!(
        report
            .executed_steps
            .iter()
            .filter(|s| s.action == StepAction::Merge)
            .count(),
        2
    );
    assert!(orchestrator.load_state(FEATURE).unwrap().is_none());
    assert!(!orchestrator.integration_path(FEATURE).exists());
}

#[tokio::test]
async fn test_merge_removes_workspaces_and_frees_dependents() {
    let repo = TestRepo::new();
    repo.plan_diamond();
    let manager = repo.manager().await;

    manager.create(FEATURE, "WP01", None).await.unwrap();
    commit_file(&repo.workspace_dir("001-auth-WP01"), "a.txt", "a\n", "WP01");
    manager.create(FEATURE, "WP02", None).await.unwrap();
    commit_file(&repo.workspace_dir("001-auth-WP02"), "b.txt", "b\n", "WP02");

    let orchestrator = MergeOrchestrator::new(&manager);
    let kept = orchestrator
        .merge(
            FEATURE,
            &MergeOptions {
                dry_run: true,
                keep_workspaces: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    // A kept workspace keeps its branch checked out
    assert_eq!(kept.plan.planned_steps, vec![merge_step("001-auth-WP02")]);

    let report = orchestrator
        .merge(FEATURE, &MergeOptions::default())
        .await
        .unwrap();
    assert_eq!(report.status, MergeStatus::Merged);
    assert_eq!(
        report.plan.planned_steps,
        vec![
            merge_step("001-auth-WP02"),
            PlannedStep::new(StepAction::RemoveWorkspace, "001-auth-WP01"),
            PlannedStep::new(StepAction::DeleteBranch, "001-auth-WP01"),
            PlannedStep::new(StepAction::RemoveWorkspace, "001-auth-WP02"),
            PlannedStep::new(StepAction::DeleteBranch, "001-auth-WP02"),
        ]
    );

    for id in ["001-auth-WP01", "001-auth-WP02"] {
        assert!(!repo.workspace_dir(id).exists());
        assert!(!repo.branch_exists(id));
        let entry = manager.registry().get(id).unwrap().unwrap();
        assert_eq!(entry.state, WorkspaceState::Removed);
        assert!(entry.merged_at.is_some());
    }

    // WP03's base was merged and cleaned up: it starts from the target
    let ws = manager.create(FEATURE, "WP03", None).await.unwrap();
    assert_eq!(ws.base_ref, "main");
    assert!(repo.workspace_dir("001-auth-WP03").join("a.txt").exists());
}

#[tokio::test]
async fn test_conflict_halts_then_resumes() {
    let repo = TestRepo::new();
    repo.plan_feature(FEATURE, &[("WP01", &[]), ("WP02", &[])]);
    commit_file(repo.root(), "shared.txt", "base\n", "shared file");
    repo.branch_with_commit("001-auth-WP01", "main", "shared.txt", "from WP01\n");
    repo.branch_with_commit("001-auth-WP02", "main", "shared.txt", "from WP02\n");
    let main_before = repo.rev("main");

    let manager = repo.manager().await;
    let orchestrator = MergeOrchestrator::new(&manager);

    let err = orchestrator
        .merge(FEATURE, &MergeOptions::default())
        .await
        .unwrap_err();
    let integration = match &err {
        CoordError::MergeConflict {
            left,
            right,
            integration_path,
        } => {
            assert_eq!(left, "001-auth-WP01");
            assert_eq!(right, "001-auth-WP02");
            integration_path.clone()
        }
        other => panic!("unexpected error: {other:?}"),
    };
    assert_eq!(err.exit_code(), 3);

    // Target untouched, progress recorded
    assert_eq!(repo.rev("main"), main_before);
    let state = orchestrator.load_state(FEATURE).unwrap().unwrap();
    assert_eq!(state.completed, vec!["001-auth-WP01"]);
    assert_eq!(state.remaining, vec!["001-auth-WP02"]);
    assert_eq!(state.target_start, main_before);
    assert!(state.conflict.is_some());

    // Resolve by hand in the integration worktree
    assert!(!git_ok(&integration, &["merge", "--no-edit", "001-auth-WP02"]));
    std::fs::write(integration.join("shared.txt"), "resolved\n").unwrap();
    git(&integration, &["add", "shared.txt"]);
    git(&integration, &["commit", "-q", "--no-edit"]);

    let report = orchestrator
        .merge(FEATURE, &MergeOptions::default())
        .await
        .unwrap();
    assert_eq!(report.status, MergeStatus::Merged);
    assert!(report.resumed);
    assert_eq!(
        std::fs::read_to_string(repo.root().join("shared.txt")).unwrap(),
        "resolved\n"
    );
    assert!(orchestrator.load_state(FEATURE).unwrap().is_none());
    assert!(!integration.exists());
}

#[tokio::test]
async fn test_resume_survives_lane_commits_on_target() {
    let repo = TestRepo::new();
    repo.plan_feature(FEATURE, &[("WP01", &[]), ("WP02", &[])]);
    commit_file(repo.root(), "shared.txt", "base\n", "shared file");
    repo.branch_with_commit("001-auth-WP01", "main", "shared.txt", "from WP01\n");
    repo.branch_with_commit("001-auth-WP02", "main", "shared.txt", "from WP02\n");
    let main_before = repo.rev("main");

    let manager = repo.manager().await;
    let orchestrator = MergeOrchestrator::new(&manager);
    let err = orchestrator
        .merge(FEATURE, &MergeOptions::default())
        .await
        .unwrap_err();
    let integration = match &err {
        CoordError::MergeConflict {
            integration_path, ..
        } => integration_path.clone(),
        other => panic!("unexpected error: {other:?}"),
    };

    assert!(!git_ok(&integration, &["merge", "--no-edit", "001-auth-WP02"]));
    std::fs::write(integration.join("shared.txt"), "resolved\n").unwrap();
    git(&integration, &["add", "shared.txt"]);
    git(&integration, &["commit", "-q", "--no-edit"]);
    let resolution = git(&integration, &["rev-parse", "HEAD"]);

    // Someone moves a lane before the re-run
    let sync = StateSynchronizer::new(repo.manager().await);
    sync.update_lane(FEATURE, "WP01", Lane::Doing, "alice", "")
        .await
        .unwrap();
    let moved = repo.rev("main");
    assert_ne!(moved, main_before);

    let report = orchestrator
        .merge(FEATURE, &MergeOptions::default())
        .await
        .unwrap();
    assert_eq!(report.status, MergeStatus::Merged);
    assert!(report.resumed);

    let merged = report.merged_commit.unwrap();
    assert_eq!(repo.rev("main"), merged);
    assert!(git_ok(
        repo.root(),
        &["merge-base", "--is-ancestor", &resolution, &merged]
    ));
    assert!(git_ok(
        repo.root(),
        &["merge-base", "--is-ancestor", &moved, &merged]
    ));
    assert_eq!(
        std::fs::read_to_string(repo.root().join("shared.txt")).unwrap(),
        "resolved\n"
    );
    assert_eq!(sync.read(FEATURE, "WP01").await.unwrap().lane, Lane::Doing);
    assert!(orchestrator.load_state(FEATURE).unwrap().is_none());
}
