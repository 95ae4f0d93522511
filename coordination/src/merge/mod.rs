//! Multi-branch merge orchestration
//!
//! - `plan`: skip analysis and the ordered step list (dry-run output)
//! - `executor`: sequential execution in an integration worktree,
//!   resumable after a conflict

pub mod executor;
pub mod plan;

pub use executor::{
    ConflictPair, MergeOptions, MergeOrchestrator, MergeReport, MergeState, MergeStatus,
};
pub use plan::{
    build_plan, classify, planned_steps, BranchTip, Classification, MergePlan, PlannedStep,
    StepAction, StepOptions,
};
