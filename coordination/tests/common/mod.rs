//! Shared setup for integration tests: real git repositories in tempdirs

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use wpflow_coordination::{
    CoordConfig, FeatureManifest, FeatureStore, WorkPackage, WorkPackageRecord, WorkspaceManager,
};

pub const FEATURE: &str = "001-auth";

/// Run git in `dir`, panicking with stderr on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git spawn failed");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Run git in `dir` and only report whether it succeeded
pub fn git_ok(dir: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git spawn failed")
        .status
        .success()
}

/// Write, stage and commit one file; returns the new commit
pub fn commit_file(dir: &Path, name: &str, content: &str, message: &str) -> String {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    git(dir, &["add", name]);
    git(dir, &["commit", "-q", "-m", message]);
    git(dir, &["rev-parse", "HEAD"])
}

/// Repository on `main` with one commit
pub struct TestRepo {
    pub dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = dir.path();
        git(root, &["init", "-q"]);
        git(root, &["checkout", "-q", "-b", "main"]);
        git(root, &["config", "user.email", "test@test.com"]);
        git(root, &["config", "user.name", "Test User"]);
        std::fs::write(root.join("README.md"), "# Test Project\n").unwrap();
        git(root, &["add", "."]);
        git(root, &["commit", "-q", "-m", "Initial commit"]);
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> CoordConfig {
        let mut config = CoordConfig::for_repo(self.root());
        config.resolve_paths();
        config
    }

    pub async fn manager(&self) -> WorkspaceManager {
        WorkspaceManager::open(self.config())
            .await
            .expect("open repository")
    }

    pub fn store(&self) -> FeatureStore {
        FeatureStore::from_config(&self.config())
    }

    /// Plan `feature` with `(id, deps)` pairs and commit it on `main`
    pub fn plan_feature(&self, feature: &str, packages: &[(&str, &[&str])]) {
        let store = self.store();
        let ids = packages.iter().map(|(id, _)| id.to_string()).collect();
        store
            .save_manifest(&FeatureManifest::new(feature, ids))
            .unwrap();
        for (id, deps) in packages {
            let wp = WorkPackage::new(*id, format!("Work package {id}"))
                .with_dependencies(deps.iter().copied());
            store
                .save_record(feature, &WorkPackageRecord::new(wp, format!("# {id}\n")))
                .unwrap();
        }
        git(self.root(), &["add", "specs"]);
        git(self.root(), &["commit", "-q", "-m", &format!("plan {feature}")]);
    }

    /// The four-package diamond: WP01 <- WP02, WP03 <- WP04
    pub fn plan_diamond(&self) {
        self.plan_feature(
            FEATURE,
            &[
                ("WP01", &[]),
                ("WP02", &["WP01"]),
                ("WP03", &["WP01"]),
                ("WP04", &["WP02", "WP03"]),
            ],
        );
    }

    /// Branch `name` from `start` with one commit, without touching `main`'s checkout
    pub fn branch_with_commit(&self, name: &str, start: &str, file: &str, content: &str) -> String {
        git(self.root(), &["checkout", "-q", "-b", name, start]);
        let commit = commit_file(self.root(), file, content, &format!("work on {name}"));
        git(self.root(), &["checkout", "-q", "main"]);
        commit
    }

    pub fn rev(&self, rev: &str) -> String {
        git(self.root(), &["rev-parse", rev])
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        git_ok(
            self.root(),
            &["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")],
        )
    }

    pub fn workspace_dir(&self, id: &str) -> PathBuf {
        self.root().join(".worktrees").join(id)
    }
}
