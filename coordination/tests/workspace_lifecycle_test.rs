//! Workspace lifecycle against a real repository
//!
//! - Base selection from the dependency graph
//! - Sparse checkout without the specs directory
//! - Rollback of a failed create, also after the worktree was added
//! - Recreation on a kept branch records where it forked
//! - Removal guards

mod common;

use common::{commit_file, git, TestRepo, FEATURE};
use wpflow_coordination::{CoordError, RemoveOptions, WorkspaceState};

#[tokio::test]
async fn test_root_package_branches_from_target_without_specs() {
    let repo = TestRepo::new();
    repo.plan_diamond();
    let manager = repo.manager().await;

    let ws = manager.create(FEATURE, "WP01", None).await.unwrap();
    assert_eq!(ws.workspace_id, "001-auth-WP01");
    assert_eq!(ws.branch_ref, "001-auth-WP01");
    assert_eq!(ws.base_ref, "main");
    assert_eq!(ws.base_commit, repo.rev("main"));
    assert_eq!(ws.state, WorkspaceState::Active);

    let path = repo.workspace_dir("001-auth-WP01");
    assert_eq!(ws.path, path);
    assert!(path.join("README.md").exists());
    assert!(!path.join("specs").exists(), "specs must not be materialized");
    assert_eq!(git(&path, &["status", "--porcelain"]), "");
    assert_eq!(git(&path, &["rev-parse", "--abbrev-ref", "HEAD"]), "001-auth-WP01");

    // Primary checkout does not see the worktrees directory
    assert_eq!(git(repo.root(), &["status", "--porcelain"]), "");
}

#[tokio::test]
async fn test_dependent_branches_from_dependency_tip() {
    let repo = TestRepo::new();
    repo.plan_diamond();
    let manager = repo.manager().await;

    manager.create(FEATURE, "WP01", None).await.unwrap();
    let wp01_dir = repo.workspace_dir("001-auth-WP01");
    let tip = commit_file(&wp01_dir, "src/auth.rs", "pub fn login() {}\n", "WP01: login");

    let ws = manager.create(FEATURE, "WP02", None).await.unwrap();
    assert_eq!(ws.base_ref, "001-auth-WP01");
    assert_eq!(ws.base_commit, tip);
    assert_ne!(ws.base_commit, repo.rev("main"));
    assert!(repo.workspace_dir("001-auth-WP02").join("src/auth.rs").exists());
}

#[tokio::test]
async fn test_base_not_ready_when_dependency_has_no_workspace() {
    let repo = TestRepo::new();
    repo.plan_diamond();
    let manager = repo.manager().await;

    let err = manager.create(FEATURE, "WP02", None).await.unwrap_err();
    assert!(
        matches!(err, CoordError::BaseNotReady { ref base, .. } if base == "001-auth-WP01"),
        "unexpected error: {err:?}"
    );
    assert_eq!(err.exit_code(), 4);
    assert!(manager.registry().get("001-auth-WP02").unwrap().is_none());
    assert!(!repo.branch_exists("001-auth-WP02"));
}

#[tokio::test]
async fn test_multiple_dependencies_need_explicit_base() {
    let repo = TestRepo::new();
    repo.plan_diamond();
    let manager = repo.manager().await;
    manager.create(FEATURE, "WP01", None).await.unwrap();
    manager.create(FEATURE, "WP02", None).await.unwrap();
    manager.create(FEATURE, "WP03", None).await.unwrap();

    let err = manager.create(FEATURE, "WP04", None).await.unwrap_err();
    match &err {
        CoordError::AmbiguousBase { wp_id, candidates } => {
            assert_eq!(wp_id, "WP04");
            assert_eq!(candidates, &vec!["WP02".to_string(), "WP03".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.exit_code(), 4);
    assert!(err.recovery_suggestion().contains("--base"));

    let ws = manager.create(FEATURE, "WP04", Some("WP03")).await.unwrap();
    assert_eq!(ws.base_ref, "001-auth-WP03");
}

#[tokio::test]
async fn test_create_twice_and_unknown_package() {
    let repo = TestRepo::new();
    repo.plan_diamond();
    let manager = repo.manager().await;
    manager.create(FEATURE, "WP01", None).await.unwrap();

    let err = manager.create(FEATURE, "WP01", None).await.unwrap_err();
    assert!(matches!(err, CoordError::WorkspaceExists { .. }));

    let err = manager.create(FEATURE, "WP99", None).await.unwrap_err();
    assert!(matches!(err, CoordError::WorkPackageNotFound { .. }));

    let err = manager.create(FEATURE, "../WP01", None).await.unwrap_err();
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn test_failed_create_rolls_back() {
    let repo = TestRepo::new();
    repo.plan_diamond();

    // Branch already checked out elsewhere: `worktree add` has to fail
    let elsewhere = tempfile::tempdir().unwrap();
    let other = elsewhere.path().join("other");
    git(
        repo.root(),
        &[
            "worktree",
            "add",
            "-q",
            "-b",
            "001-auth-WP01",
            &other.to_string_lossy(),
            "main",
        ],
    );

    let manager = repo.manager().await;
    let err = manager.create(FEATURE, "WP01", None).await.unwrap_err();
    assert!(matches!(err, CoordError::Git { .. }), "unexpected error: {err:?}");
    assert_eq!(err.exit_code(), 3);

    assert!(manager.registry().get("001-auth-WP01").unwrap().is_none());
    assert!(!repo.workspace_dir("001-auth-WP01").exists());
    // Not ours to delete
    assert!(repo.branch_exists("001-auth-WP01"));
}

#[tokio::test]
async fn test_checkout_failure_after_worktree_add_rolls_back() {
    let repo = TestRepo::new();
    commit_file(
        repo.root(),
        ".gitattributes",
        "/guarded.txt filter=broken\n",
        "attributes",
    );
    commit_file(repo.root(), "guarded.txt", "secret\n", "guarded file");
    // Every later checkout of guarded.txt fails; the worktree add itself does not
    git(repo.root(), &["config", "filter.broken.clean", "cat"]);
    git(repo.root(), &["config", "filter.broken.smudge", "false"]);
    git(repo.root(), &["config", "filter.broken.required", "true"]);
    repo.plan_diamond();

    let manager = repo.manager().await;
    let err = manager.create(FEATURE, "WP01", None).await.unwrap_err();
    assert!(matches!(err, CoordError::Git { .. }), "unexpected error: {err:?}");
    assert_eq!(err.exit_code(), 3);

    assert!(!repo.workspace_dir("001-auth-WP01").exists());
    assert!(!repo.branch_exists("001-auth-WP01"));
    assert!(manager.registry().get("001-auth-WP01").unwrap().is_none());
    let worktrees = git(repo.root(), &["worktree", "list", "--porcelain"]);
    assert_eq!(
        worktrees.lines().filter(|l| l.starts_with("worktree ")).count(),
        1,
        "{worktrees}"
    );
}

#[tokio::test]
async fn test_remove_guards_and_cleanup() {
    let repo = TestRepo::new();
    repo.plan_diamond();
    let manager = repo.manager().await;
    manager.create(FEATURE, "WP01", None).await.unwrap();
    let path = repo.workspace_dir("001-auth-WP01");

    let err = manager
        .remove(
            "001-auth-WP01",
            RemoveOptions {
                keep_storage: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 1);

    std::fs::write(path.join("README.md"), "edited\n").unwrap();
    let err = manager
        .remove("001-auth-WP01", RemoveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::UncommittedChanges { .. }));
    assert!(path.exists());

    // Committed but never merged work needs force or keep_branch
    git(&path, &["commit", "-q", "-am", "edit readme"]);
    let err = manager
        .remove("001-auth-WP01", RemoveOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 1);

    let removed = manager
        .remove(
            "001-auth-WP01",
            RemoveOptions {
                keep_branch: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(removed.state, WorkspaceState::Removed);
    assert!(!path.exists());
    assert!(repo.branch_exists("001-auth-WP01"));

    let status = manager.status("001-auth-WP01").await.unwrap();
    assert!(status.branch_exists);
    assert!(!status.storage_present);
}

#[tokio::test]
async fn test_removed_workspace_can_be_recreated_on_its_branch() {
    let repo = TestRepo::new();
    repo.plan_diamond();
    let manager = repo.manager().await;
    manager.create(FEATURE, "WP01", None).await.unwrap();
    let path = repo.workspace_dir("001-auth-WP01");
    let tip = commit_file(&path, "a.txt", "a\n", "WP01: a");

    manager
        .remove(
            "001-auth-WP01",
            RemoveOptions {
                keep_branch: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let ws = manager.create(FEATURE, "WP01", None).await.unwrap();
    assert_eq!(ws.state, WorkspaceState::Active);
    assert_eq!(git(&path, &["rev-parse", "HEAD"]), tip);
    assert!(path.join("a.txt").exists());
}

#[tokio::test]
async fn test_recreated_workspace_keeps_fork_point_as_base() {
    let repo = TestRepo::new();
    repo.plan_diamond();
    let fork = repo.rev("main");
    let manager = repo.manager().await;
    let ws = manager.create(FEATURE, "WP01", None).await.unwrap();
    assert_eq!(ws.base_commit, fork);

    let keep = RemoveOptions {
        keep_branch: true,
        ..Default::default()
    };
    manager.remove("001-auth-WP01", keep).await.unwrap();
    commit_file(repo.root(), "other.txt", "other\n", "unrelated work on main");
    assert_ne!(repo.rev("main"), fork);

    let ws = manager.create(FEATURE, "WP01", None).await.unwrap();
    assert_eq!(ws.base_commit, fork);

    // Nothing was committed on the branch, so nothing is lost by deleting it
    let removed = manager
        .remove("001-auth-WP01", RemoveOptions::default())
        .await
        .unwrap();
    assert_eq!(removed.state, WorkspaceState::Removed);
    assert!(!repo.branch_exists("001-auth-WP01"));

    // With commits of its own the branch is still guarded
    let ws = manager.create(FEATURE, "WP01", None).await.unwrap();
    assert_eq!(ws.base_commit, repo.rev("main"));
    commit_file(&ws.path, "a.txt", "a\n", "WP01: a");
    manager
        .remove(
            "001-auth-WP01",
            RemoveOptions {
                keep_branch: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let ws = manager.create(FEATURE, "WP01", None).await.unwrap();
    assert_eq!(ws.base_commit, repo.rev("main"));
    let err = manager
        .remove("001-auth-WP01", RemoveOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn test_list_reports_vanished_storage() {
    let repo = TestRepo::new();
    repo.plan_diamond();
    let manager = repo.manager().await;
    manager.create(FEATURE, "WP01", None).await.unwrap();
    manager.create(FEATURE, "WP02", None).await.unwrap();

    std::fs::remove_dir_all(repo.workspace_dir("001-auth-WP02")).unwrap();

    let statuses = manager.list().await.unwrap();
    assert_eq!(statuses.len(), 2);
    let wp01 = statuses
        .iter()
        .find(|s| s.workspace_id == "001-auth-WP01")
        .unwrap();
    let wp02 = statuses
        .iter()
        .find(|s| s.workspace_id == "001-auth-WP02")
        .unwrap();
    assert!(wp01.storage_present);
    assert!(!wp02.storage_present);
    assert!(wp02.branch_exists);
}
