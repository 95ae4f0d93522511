//! Merge planning
//!
//! Which work package branches still need to go into the target, and in
//! what order. Classification is a pure function over an ancestry oracle
//! so it can be checked without a repository; [`build_plan`] feeds it
//! real commits.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::CoordResult;
use crate::git::GitManager;

/// A candidate branch and the commit it points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchTip {
    pub branch: String,
    pub commit: String,
}

/// What a real run would do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Merge,
    RemoveWorkspace,
    DeleteBranch,
    Push,
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Merge => "merge",
            Self::RemoveWorkspace => "remove_workspace",
            Self::DeleteBranch => "delete_branch",
            Self::Push => "push",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub action: StepAction,
    #[serde(rename = "ref")]
    pub git_ref: String,
}

impl PlannedStep {
    pub fn new(action: StepAction, git_ref: impl Into<String>) -> Self {
        Self {
            action,
            git_ref: git_ref.into(),
        }
    }
}

/// Result of the skip analysis
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub effective: Vec<String>,
    pub skipped_already_in_target: Vec<String>,
    pub skipped_ancestor_of: BTreeMap<String, String>,
}

/// Split candidates into effective and skipped branches.
///
/// `in_target(tip)` tells whether a tip is already reachable from the
/// target; `is_ancestor(a, b)` whether `a` is reachable from `b` (true
/// for equal commits). Among tips on the same commit the smallest branch
/// name stays effective. A subsumed branch maps to the first effective
/// branch, in sorted order, that contains it.
pub fn classify<T, A>(tips: &[BranchTip], in_target: T, is_ancestor: A) -> Classification
where
    T: Fn(&BranchTip) -> bool,
    A: Fn(&BranchTip, &BranchTip) -> bool,
{
    let mut sorted: Vec<&BranchTip> = tips.iter().collect();
    sorted.sort_by(|a, b| a.branch.cmp(&b.branch));
    sorted.dedup_by(|a, b| a.branch == b.branch);

    let mut result = Classification::default();
    let mut remaining = Vec::new();
    for tip in sorted {
        if in_target(tip) {
            result.skipped_already_in_target.push(tip.branch.clone());
        } else {
            remaining.push(tip);
        }
    }

    let subsumed = |a: &BranchTip| {
        remaining.iter().any(|b| {
            b.branch != a.branch
                && is_ancestor(a, *b)
                && (a.commit != b.commit || b.branch < a.branch)
        })
    };
    let effective: Vec<&BranchTip> = remaining
        .iter()
        .copied()
        .filter(|t| !subsumed(*t))
        .collect();

    for &tip in &remaining {
        if effective.iter().any(|e| e.branch == tip.branch) {
            continue;
        }
        if let Some(container) = effective.iter().find(|e| is_ancestor(tip, **e)) {
            result
                .skipped_ancestor_of
                .insert(tip.branch.clone(), container.branch.clone());
        }
    }
    result.effective = effective.into_iter().map(|t| t.branch.clone()).collect();
    result
}

/// Cleanup and push behaviour folded into `planned_steps`
#[derive(Debug, Clone, Copy, Default)]
pub struct StepOptions {
    pub push: bool,
    pub keep_branches: bool,
    pub keep_workspaces: bool,
}

/// Full merge plan, serialized as the `--json` result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePlan {
    pub feature: String,
    pub target: String,
    pub target_commit: String,
    pub all_wp_branches: Vec<String>,
    pub effective_wp_branches: Vec<String>,
    pub skipped_already_in_target: Vec<String>,
    pub skipped_ancestor_of: BTreeMap<String, String>,
    pub planned_steps: Vec<PlannedStep>,
    pub missing_wp_branches: Vec<String>,
}

impl MergePlan {
    /// Nothing left to merge
    pub fn is_integrated(&self) -> bool {
        self.effective_wp_branches.is_empty()
    }

    pub fn steps(&self, action: StepAction) -> impl Iterator<Item = &PlannedStep> {
        self.planned_steps.iter().filter(move |s| s.action == action)
    }
}

/// Steps a real run executes, in order.
///
/// `live_workspaces` are the branches that still have a checked-out
/// workspace. A branch whose workspace is kept cannot be deleted, so no
/// delete step is planned for it.
pub fn planned_steps(
    target: &str,
    classification: &Classification,
    all_branches: &[String],
    live_workspaces: &[String],
    options: StepOptions,
) -> Vec<PlannedStep> {
    if classification.effective.is_empty() {
        return Vec::new();
    }
    let mut steps: Vec<PlannedStep> = classification
        .effective
        .iter()
        .map(|b| PlannedStep::new(StepAction::Merge, b))
        .collect();

    for branch in all_branches {
        let live = live_workspaces.contains(branch);
        if live && !options.keep_workspaces {
            steps.push(PlannedStep::new(StepAction::RemoveWorkspace, branch));
        }
        if !options.keep_branches && (!live || !options.keep_workspaces) {
            steps.push(PlannedStep::new(StepAction::DeleteBranch, branch));
        }
    }
    if options.push {
        steps.push(PlannedStep::new(StepAction::Push, target));
    }
    steps
}

/// Compute the plan for `wp_branches` (sorted by work package id)
/// against `target` using git ancestry.
pub async fn build_plan(
    git: &GitManager,
    feature: &str,
    target: &str,
    wp_branches: &[String],
    live_workspaces: &[String],
    options: StepOptions,
) -> CoordResult<MergePlan> {
    let target_commit = git.rev_parse(target).await?;

    let mut tips = Vec::new();
    let mut missing = Vec::new();
    for branch in wp_branches {
        if git.branch_exists(branch).await? {
            let commit = git.rev_parse(branch).await?;
            tips.push(BranchTip {
                branch: branch.clone(),
                commit,
            });
        } else {
            missing.push(branch.clone());
        }
    }

    // Ask git once per distinct commit pair
    let mut in_target: HashMap<String, bool> = HashMap::new();
    for tip in &tips {
        if !in_target.contains_key(&tip.commit) {
            let contained = git.is_ancestor(&tip.commit, &target_commit).await?;
            in_target.insert(tip.commit.clone(), contained);
        }
    }
    let mut ancestry: HashMap<(String, String), bool> = HashMap::new();
    for a in &tips {
        for b in &tips {
            let key = (a.commit.clone(), b.commit.clone());
            if a.commit == b.commit || ancestry.contains_key(&key) {
                continue;
            }
            let value = git.is_ancestor(&a.commit, &b.commit).await?;
            ancestry.insert(key, value);
        }
    }

    let classification = classify(
        &tips,
        |t| in_target.get(&t.commit).copied().unwrap_or(false),
        |a, b| {
            a.commit == b.commit
                || ancestry
                    .get(&(a.commit.clone(), b.commit.clone()))
                    .copied()
                    .unwrap_or(false)
        },
    );

    let existing: Vec<String> = tips.iter().map(|t| t.branch.clone()).collect();
    let steps = planned_steps(target, &classification, &existing, live_workspaces, options);

    Ok(MergePlan {
        feature: feature.to_string(),
        target: target.to_string(),
        target_commit,
        all_wp_branches: existing,
        effective_wp_branches: classification.effective,
        skipped_already_in_target: classification.skipped_already_in_target,
        skipped_ancestor_of: classification.skipped_ancestor_of,
        planned_steps: steps,
        missing_wp_branches: missing,
    })
}
