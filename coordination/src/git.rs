//! Git command runner
//!
//! Every invocation is bounded by a timeout and the child is killed when the
//! bound expires. Transient failures (lock files, busy repository) can be
//! retried with exponential backoff.

use crate::config::CoordConfig;
use crate::error::{CoordError, CoordResult};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Default number of retry attempts for transient failures
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay between retries in milliseconds
const RETRY_BASE_DELAY_MS: u64 = 100;

/// One entry of `git worktree list --porcelain`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Short branch name, `None` when detached
    pub branch: Option<String>,
}

/// Git runner bound to one working directory
#[derive(Debug, Clone)]
pub struct GitManager {
    working_dir: PathBuf,
    timeout: Duration,
    max_retries: u32,
}

impl GitManager {
    /// Create manager for working directory
    pub fn new(working_dir: impl AsRef<Path>, timeout_secs: u64) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            timeout: Duration::from_secs(timeout_secs),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Manager for the primary checkout described by `config`
    pub fn from_config(config: &CoordConfig) -> Self {
        Self::new(&config.repo_root, config.git_timeout_secs).with_retries(config.max_retries)
    }

    /// Create manager with custom retry settings
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Same settings, different working directory
    pub fn at(&self, dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: dir.as_ref().to_path_buf(),
            ..self.clone()
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.as_secs()
    }

    /// Spawn git and wait for it within the timeout.
    ///
    /// Does not inspect the exit status.
    async fn output(
        &self,
        args: &[&str],
        envs: &[(&str, &str)],
        stdin: Option<&[u8]>,
    ) -> CoordResult<Output> {
        debug!(cwd = %self.working_dir.display(), args = ?args, "git");

        let mut cmd = tokio::process::Command::new("git");
        cmd.args(args)
            .current_dir(&self.working_dir)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in envs {
            cmd.env(key, value);
        }

        let operation = args.first().copied().unwrap_or("git").to_string();
        let mut child = cmd
            .spawn()
            .map_err(|e| CoordError::git(operation.clone(), format!("failed to spawn: {e}")))?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input).await?;
                // Dropping closes the pipe so git sees EOF
                drop(pipe);
            }
        }

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(CoordError::git(operation, e.to_string())),
            Err(_) => Err(CoordError::Timeout {
                operation: format!("git {}", args.join(" ")),
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    fn check(args: &[&str], output: Output) -> CoordResult<String> {
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoordError::git(args.join(" "), stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run git command and return trimmed stdout
    pub async fn run(&self, args: &[&str]) -> CoordResult<String> {
        let output = self.output(args, &[], None).await?;
        Self::check(args, output)
    }

    /// Run git command with extra environment variables
    pub async fn run_env(&self, args: &[&str], envs: &[(&str, &str)]) -> CoordResult<String> {
        let output = self.output(args, envs, None).await?;
        Self::check(args, output)
    }

    /// Run git command feeding `input` on stdin
    pub async fn run_with_stdin(&self, args: &[&str], input: &[u8]) -> CoordResult<String> {
        let output = self.output(args, &[], Some(input)).await?;
        Self::check(args, output)
    }

    /// Run git command with automatic retry for transient failures
    ///
    /// Uses exponential backoff: 100ms, 200ms, 400ms, etc.
    pub async fn run_with_retry(&self, args: &[&str]) -> CoordResult<String> {
        let mut attempt = 0;
        loop {
            match self.run(args).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                    debug!(attempt, delay_ms = delay, error = %e, "retrying git command");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run git command, returning stdout and whether it exited 0.
    pub async fn run_status(&self, args: &[&str]) -> CoordResult<(bool, String, String)> {
        let output = self.output(args, &[], None).await?;
        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }

    /// Fail with `NotInRepository` unless the working dir is inside a repo
    pub async fn ensure_repository(&self) -> CoordResult<()> {
        if !self.working_dir.exists() {
            return Err(CoordError::NotInRepository {
                path: self.working_dir.clone(),
            });
        }
        let (ok, _, _) = self.run_status(&["rev-parse", "--git-dir"]).await?;
        if !ok {
            return Err(CoordError::NotInRepository {
                path: self.working_dir.clone(),
            });
        }
        Ok(())
    }

    /// Absolute path of the shared git directory (same for every worktree)
    pub async fn common_dir(&self) -> CoordResult<PathBuf> {
        let out = self
            .run(&["rev-parse", "--path-format=absolute", "--git-common-dir"])
            .await?;
        Ok(PathBuf::from(out))
    }

    /// Root of the primary checkout, reachable from any linked worktree
    pub async fn primary_root(&self) -> CoordResult<PathBuf> {
        let worktrees = self.list_worktrees().await?;
        worktrees
            .into_iter()
            .next()
            .map(|w| w.path)
            .ok_or_else(|| CoordError::NotInRepository {
                path: self.working_dir.clone(),
            })
    }

    /// Get current branch name
    pub async fn current_branch(&self) -> CoordResult<String> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    /// Full commit hash of `rev`
    pub async fn rev_parse(&self, rev: &str) -> CoordResult<String> {
        self.run(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")])
            .await
    }

    /// Commit hash of `rev`, or `None` if it does not resolve
    pub async fn resolve(&self, rev: &str) -> CoordResult<Option<String>> {
        let (ok, out, _) = self
            .run_status(&["rev-parse", "--verify", "--quiet", &format!("{rev}^{{commit}}")])
            .await?;
        Ok(if ok && !out.is_empty() { Some(out) } else { None })
    }

    /// Check whether a local branch exists
    pub async fn branch_exists(&self, branch: &str) -> CoordResult<bool> {
        let (ok, _, _) = self
            .run_status(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])
            .await?;
        Ok(ok)
    }

    /// Best common ancestor of `a` and `b`, `None` for unrelated histories
    pub async fn merge_base(&self, a: &str, b: &str) -> CoordResult<Option<String>> {
        let output = self.output(&["merge-base", a, b], &[], None).await?;
        match output.status.code() {
            Some(0) => Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            )),
            Some(1) => Ok(None),
            _ => Err(CoordError::git(
                format!("merge-base {a} {b}"),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
        }
    }

    /// True if `ancestor` is reachable from `descendant`
    pub async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> CoordResult<bool> {
        let output = self
            .output(
                &["merge-base", "--is-ancestor", ancestor, descendant],
                &[],
                None,
            )
            .await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(CoordError::git(
                format!("merge-base --is-ancestor {ancestor} {descendant}"),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
        }
    }

    /// Check if working directory has uncommitted changes
    pub async fn has_uncommitted_changes(&self) -> CoordResult<bool> {
        let status = self.run(&["status", "--porcelain"]).await?;
        Ok(!status.is_empty())
    }

    /// Contents of `path` at `rev`, `None` if the path does not exist there
    pub async fn show_file(&self, rev: &str, path: &str) -> CoordResult<Option<String>> {
        let output = self
            .output(&["show", &format!("{rev}:{path}")], &[], None)
            .await?;
        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
        } else {
            Ok(None)
        }
    }

    /// Delete a local branch
    pub async fn delete_branch(&self, branch: &str, force: bool) -> CoordResult<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run_with_retry(&["branch", flag, branch]).await?;
        Ok(())
    }

    /// Compare-and-swap `refname` from `old` to `new`.
    ///
    /// Returns `false` when the ref no longer points at `old`.
    pub async fn update_ref(
        &self,
        refname: &str,
        new: &str,
        old: &str,
        message: &str,
    ) -> CoordResult<bool> {
        let (ok, _, stderr) = self
            .run_status(&["update-ref", "-m", message, refname, new, old])
            .await?;
        if ok {
            return Ok(true);
        }
        let lower = stderr.to_lowercase();
        if lower.contains("cannot lock ref") || lower.contains("but expected") {
            debug!(refname, expected = old, "update-ref rejected");
            return Ok(false);
        }
        Err(CoordError::git(format!("update-ref {refname}"), stderr))
    }

    /// List worktrees (primary checkout first)
    pub async fn list_worktrees(&self) -> CoordResult<Vec<WorktreeInfo>> {
        let stdout = self.run(&["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_porcelain(&stdout))
    }

    /// Path of the worktree that has `branch` checked out, if any
    pub async fn worktree_for_branch(&self, branch: &str) -> CoordResult<Option<PathBuf>> {
        Ok(self
            .list_worktrees()
            .await?
            .into_iter()
            .find(|w| w.branch.as_deref() == Some(branch))
            .map(|w| w.path))
    }
}

/// Parse `git worktree list --porcelain` output
pub fn parse_worktree_porcelain(stdout: &str) -> Vec<WorktreeInfo> {
    let mut infos = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in stdout.lines() {
        if let Some(path_str) = line.strip_prefix("worktree ") {
            // Flush previous entry
            if let Some(info) = current.take() {
                infos.push(info);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path_str),
                head: None,
                branch: None,
            });
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            if let Some(info) = current.as_mut() {
                info.head = Some(head.to_string());
            }
        } else if let Some(branch_ref) = line.strip_prefix("branch refs/heads/") {
            if let Some(info) = current.as_mut() {
                info.branch = Some(branch_ref.to_string());
            }
        }
    }

    // Flush last entry
    if let Some(info) = current {
        infos.push(info);
    }

    infos
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_worktree_porcelain() {
        let out = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\n\
                   worktree /repo/.worktrees/f-WP01\nHEAD def\nbranch refs/heads/f-WP01\n\n\
                   worktree /tmp/integration\nHEAD 123\ndetached\n";
        let infos = parse_worktree_porcelain(out);
        assert_eq!(infos.len(), 3);
        assert_eq!(infos[0].branch.as_deref(), Some("main"));
        assert_eq!(infos[1].path, PathBuf::from("/repo/.worktrees/f-WP01"));
        assert_eq!(infos[2].branch, None);
        assert_eq!(infos[2].head.as_deref(), Some("123"));
    }

    #[tokio::test]
    async fn test_current_branch_and_ancestry() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let git_mgr = GitManager::new(dir.path(), 30);

        assert_eq!(git_mgr.current_branch().await.unwrap(), "main");
        let first = git_mgr.rev_parse("HEAD").await.unwrap();
        let second = commit_file(dir.path(), "a.txt", "a", "second");

        assert!(git_mgr.is_ancestor(&first, &second).await.unwrap());
        assert!(!git_mgr.is_ancestor(&second, &first).await.unwrap());
        assert!(git_mgr.resolve("no-such-branch").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_not_a_repository() {
        let dir = tempdir().unwrap();
        let git_mgr = GitManager::new(dir.path(), 30);
        let err = git_mgr.ensure_repository().await.unwrap_err();
        assert!(matches!(err, CoordError::NotInRepository { .. }));
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_update_ref_compare_and_swap() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let git_mgr = GitManager::new(dir.path(), 30);
        git(dir.path(), &["branch", "side"]);

        let base = git_mgr.rev_parse("side").await.unwrap();
        let next = commit_file(dir.path(), "b.txt", "b", "on main");

        // Stale expectation is rejected
        assert!(!git_mgr
            .update_ref("refs/heads/side", &next, &next, "test")
            .await
            .unwrap());
        // Correct expectation succeeds
        assert!(git_mgr
            .update_ref("refs/heads/side", &next, &base, "test")
            .await
            .unwrap());
        assert_eq!(git_mgr.rev_parse("side").await.unwrap(), next);
    }

    #[tokio::test]
    async fn test_show_file() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let git_mgr = GitManager::new(dir.path(), 30);
        assert_eq!(
            git_mgr.show_file("HEAD", "README.md").await.unwrap().as_deref(),
            Some("# Test\n")
        );
        assert!(git_mgr.show_file("HEAD", "missing.md").await.unwrap().is_none());
    }
}
