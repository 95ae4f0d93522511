//! Coordination error types
//!
//! One error enum for every component. Each variant belongs to exactly one
//! [`ErrorCategory`], which in turn fixes the process exit code seen by the
//! command layer. Errors carry the offending work package, ref or version so
//! the caller can act without re-deriving context.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for coordination operations
pub type CoordResult<T> = Result<T, CoordError>;

/// Error taxonomy shared with the command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Caller supplied invalid arguments
    Usage,
    /// Cycle, invalid reference, invalid lane transition, malformed record
    Validation,
    /// Base not ready, ambiguous base, missing workspace
    Precondition,
    /// Version-control failure, merge conflict, timeout
    Execution,
    /// Optimistic concurrency retry exhausted
    Contention,
    /// Internal invariant violated
    Internal,
}

impl ErrorCategory {
    /// Exit code for the command surface.
    ///
    /// 0 success, 1 usage, 2 validation, 3 execution, 4 precondition.
    /// Contention and internal failures surface as execution failures.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Usage => 1,
            Self::Validation => 2,
            Self::Execution | Self::Contention | Self::Internal => 3,
            Self::Precondition => 4,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Usage => "usage",
            Self::Validation => "validation",
            Self::Precondition => "precondition",
            Self::Execution => "execution",
            Self::Contention => "contention",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Structured Error Response
// ============================================================================

/// Machine-readable error body emitted by `--json` commands.
///
/// ```json
/// {
///   "code": "MERGE_CONFLICT",
///   "category": "execution",
///   "message": "Merge conflict between 001-auth-WP02 and 001-auth-WP03",
///   "recovery_action": "Resolve the conflict between 001-auth-WP02 and 001-auth-WP03 ...",
///   "context": { "left": "001-auth-WP02", "right": "001-auth-WP03" }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Machine-readable error code (e.g. "CYCLE_DETECTED")
    pub code: String,

    /// Taxonomy bucket
    pub category: ErrorCategory,

    /// Human-readable error message
    pub message: String,

    /// The single corrective action for the caller
    pub recovery_action: String,

    /// Offending ids and refs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Whether re-running the same operation may succeed unchanged
    #[serde(default)]
    pub retryable: bool,
}

impl StructuredError {
    pub fn new(
        code: impl Into<String>,
        category: ErrorCategory,
        message: impl Into<String>,
        recovery_action: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            category,
            message: message.into(),
            recovery_action: recovery_action.into(),
            context: HashMap::new(),
            retryable: false,
        }
    }

    /// Add context key-value pair
    pub fn with_context(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Mark as retryable
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for StructuredError {}

/// Errors that can occur during coordination operations
#[derive(Error, Debug)]
pub enum CoordError {
    // ------------------------------------------------------------------
    // Usage
    // ------------------------------------------------------------------
    /// Invalid arguments from the caller
    #[error("Usage error: {message}")]
    Usage { message: String },

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------
    /// Dependency cycle, `path` starts and ends with the same id
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// Dependency on an id that is not part of the feature
    #[error("Work package {wp_id} depends on unknown work package {missing}")]
    InvalidReference { wp_id: String, missing: String },

    /// Work package lists itself as a dependency
    #[error("Work package {wp_id} depends on itself")]
    SelfDependency { wp_id: String },

    /// Two work packages share an id
    #[error("Duplicate work package id: {wp_id}")]
    DuplicateId { wp_id: String },

    /// Lane change not allowed by the lane state machine
    #[error("Invalid lane transition for {wp_id}: {from} -> {to}")]
    InvalidTransition {
        wp_id: String,
        from: String,
        to: String,
    },

    /// Record or manifest could not be parsed
    #[error("Invalid record {path}: {message}")]
    InvalidRecord { path: PathBuf, message: String },

    /// Other invalid input
    #[error("Validation error: {message}")]
    Validation { message: String },

    // ------------------------------------------------------------------
    // Precondition
    // ------------------------------------------------------------------
    /// The base a workspace would branch from is not materialized yet
    #[error("Base {base} for {wp_id} is not ready (workspace state: {state})")]
    BaseNotReady {
        wp_id: String,
        base: String,
        state: String,
    },

    /// Several dependencies and no explicit base
    #[error(
        "Work package {wp_id} has multiple dependencies ({}); an explicit base is required",
        candidates.join(", ")
    )]
    AmbiguousBase {
        wp_id: String,
        candidates: Vec<String>,
    },

    /// Path is not inside a git repository
    #[error("Not inside a git repository: {path}")]
    NotInRepository { path: PathBuf },

    /// Uncommitted changes prevent operation
    #[error("Uncommitted changes in {path}")]
    UncommittedChanges { path: PathBuf },

    /// Workspace already materialized
    #[error("Workspace {workspace_id} already exists at {path}")]
    WorkspaceExists {
        workspace_id: String,
        path: PathBuf,
    },

    /// No registry entry for this workspace
    #[error("Workspace not found: {workspace_id}")]
    WorkspaceNotFound { workspace_id: String },

    /// Work package id not present in the feature
    #[error("Work package {wp_id} not found in feature {feature}")]
    WorkPackageNotFound { feature: String, wp_id: String },

    /// Feature directory or manifest missing
    #[error("Feature not found: {feature}")]
    FeatureNotFound { feature: String },

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------
    /// Git operation failed
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    /// Sequential merge stopped at a conflicting pair
    #[error("Merge conflict between {left} and {right}")]
    MergeConflict {
        left: String,
        right: String,
        integration_path: PathBuf,
    },

    /// External command exceeded its time bound
    #[error("Operation '{operation}' timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// A migration failed while applying
    #[error("Migration {version} failed: {message}")]
    Migration { version: String, message: String },

    // ------------------------------------------------------------------
    // Contention / internal
    // ------------------------------------------------------------------
    /// Authoritative ref kept moving under the update
    #[error("Contention updating {wp_id}: authoritative branch moved {attempts} times")]
    Contention { wp_id: String, attempts: u32 },

    /// A migration still detects as pending right after it was applied
    #[error("Migration {version} is not idempotent: still pending after apply")]
    MigrationNotIdempotent { version: String },

    // ------------------------------------------------------------------
    // Wrappers
    // ------------------------------------------------------------------
    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML front matter error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Project config error
    #[error("Config error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl CoordError {
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn invalid_record(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn wp_not_found(feature: impl Into<String>, wp_id: impl Into<String>) -> Self {
        Self::WorkPackageNotFound {
            feature: feature.into(),
            wp_id: wp_id.into(),
        }
    }

    pub fn migration(version: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::Migration {
            version: version.to_string(),
            message: message.into(),
        }
    }

    /// Taxonomy bucket for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Usage { .. } => ErrorCategory::Usage,
            Self::Cycle { .. }
            | Self::InvalidReference { .. }
            | Self::SelfDependency { .. }
            | Self::DuplicateId { .. }
            | Self::InvalidTransition { .. }
            | Self::InvalidRecord { .. }
            | Self::Validation { .. }
            | Self::Yaml(_)
            | Self::Toml(_) => ErrorCategory::Validation,
            Self::BaseNotReady { .. }
            | Self::AmbiguousBase { .. }
            | Self::NotInRepository { .. }
            | Self::UncommittedChanges { .. }
            | Self::WorkspaceExists { .. }
            | Self::WorkspaceNotFound { .. }
            | Self::WorkPackageNotFound { .. }
            | Self::FeatureNotFound { .. } => ErrorCategory::Precondition,
            Self::Git { .. }
            | Self::MergeConflict { .. }
            | Self::Timeout { .. }
            | Self::Migration { .. }
            | Self::Io(_)
            | Self::Json(_) => ErrorCategory::Execution,
            Self::Contention { .. } => ErrorCategory::Contention,
            Self::MigrationNotIdempotent { .. } => ErrorCategory::Internal,
        }
    }

    /// Exit code for the command surface
    pub fn exit_code(&self) -> i32 {
        self.category().exit_code()
    }

    /// Check if this error is retryable (transient failure)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Git { message, .. } => {
                let lower = message.to_lowercase();
                // Lock file conflicts
                lower.contains("lock") ||
                // Timeout or network issues
                lower.contains("timeout") ||
                lower.contains("connection") ||
                // Repository busy
                lower.contains("another git process")
            }
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            Self::Contention { .. } => true,
            _ => false,
        }
    }

    /// The single corrective action for this error
    pub fn recovery_suggestion(&self) -> String {
        match self {
            Self::Usage { .. } => "Check the command arguments with --help and try again.".into(),
            Self::Cycle { path } => format!(
                "Break the dependency cycle {} by removing one of its edges from the work package headers.",
                path.join(" -> ")
            ),
            Self::InvalidReference { wp_id, missing } => format!(
                "Add {missing} to the feature or remove it from the dependencies of {wp_id}."
            ),
            Self::SelfDependency { wp_id } => {
                format!("Remove {wp_id} from its own dependency list.")
            }
            Self::DuplicateId { wp_id } => {
                format!("Rename one of the work packages that share the id {wp_id}.")
            }
            Self::InvalidTransition { wp_id, from, to } => format!(
                "Move {wp_id} through the intermediate lanes: {from} cannot go directly to {to}."
            ),
            Self::InvalidRecord { path, .. } => format!(
                "Fix the front matter of {} (it must start and end with a '---' line).",
                path.display()
            ),
            Self::Validation { .. } => "Check the input values and try again.".into(),
            Self::BaseNotReady { base, .. } => {
                format!("Implement the missing dependency {base} first.")
            }
            Self::AmbiguousBase { candidates, .. } => format!(
                "Pick one base explicitly with --base (one of: {}); the rest are merged later.",
                candidates.join(", ")
            ),
            Self::NotInRepository { .. } => {
                "Run the command from inside the project repository.".into()
            }
            Self::UncommittedChanges { path } => format!(
                "Commit or stash the changes in {} first, or pass --force.",
                path.display()
            ),
            Self::WorkspaceExists { path, .. } => format!(
                "Continue working in {} or remove the workspace first.",
                path.display()
            ),
            Self::WorkspaceNotFound { workspace_id } => {
                format!("Create the workspace first: wpflow implement for {workspace_id}.")
            }
            Self::WorkPackageNotFound { feature, wp_id } => format!(
                "Add {wp_id} to the manifest of {feature} or check the id spelling."
            ),
            Self::FeatureNotFound { feature } => {
                format!("Create the feature directory and manifest for {feature} first.")
            }
            Self::Git { message, .. } => {
                let lower = message.to_lowercase();
                if lower.contains("lock") || lower.contains("another git process") {
                    "Git lock file conflict. Wait a moment and retry.".into()
                } else if lower.contains("not a git repository") {
                    "Run the command from inside the project repository.".into()
                } else {
                    "Check repository state with git status and re-run.".into()
                }
            }
            Self::MergeConflict {
                left,
                right,
                integration_path,
            } => format!(
                "Resolve the conflict between {left} and {right}: run `git merge {right}` in {}, \
                 fix and commit, then re-run the merge to resume.",
                integration_path.display()
            ),
            Self::Timeout { operation, .. } => format!(
                "Re-run once the repository is idle, or raise WPFLOW_GIT_TIMEOUT_SECS ({operation})."
            ),
            Self::Migration { version, .. } => format!(
                "Fix the reported problem and re-run the upgrade; {version} resumes where it stopped."
            ),
            Self::Contention { wp_id, .. } => {
                format!("Another actor is updating {wp_id}; retry the whole operation.")
            }
            Self::MigrationNotIdempotent { version } => format!(
                "Report this defect: migration {version} does not converge. Do not re-run the upgrade."
            ),
            Self::Io(_) => "Check disk space and file permissions.".into(),
            Self::Json(_) => "Validate the JSON syntax of the state files.".into(),
            Self::Yaml(_) => "Validate the YAML front matter syntax.".into(),
            Self::Toml(_) => "Validate the syntax of the project config.toml.".into(),
        }
    }

    /// Error message with recovery suggestion appended
    pub fn with_suggestion(&self) -> String {
        format!("{}\n\nRecovery: {}", self, self.recovery_suggestion())
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Usage { .. } => "USAGE_ERROR",
            Self::Cycle { .. } => "CYCLE_DETECTED",
            Self::InvalidReference { .. } => "INVALID_REFERENCE",
            Self::SelfDependency { .. } => "SELF_DEPENDENCY",
            Self::DuplicateId { .. } => "DUPLICATE_ID",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InvalidRecord { .. } => "INVALID_RECORD",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::BaseNotReady { .. } => "BASE_NOT_READY",
            Self::AmbiguousBase { .. } => "AMBIGUOUS_BASE",
            Self::NotInRepository { .. } => "NOT_IN_REPOSITORY",
            Self::UncommittedChanges { .. } => "UNCOMMITTED_CHANGES",
            Self::WorkspaceExists { .. } => "WORKSPACE_EXISTS",
            Self::WorkspaceNotFound { .. } => "WORKSPACE_NOT_FOUND",
            Self::WorkPackageNotFound { .. } => "WORK_PACKAGE_NOT_FOUND",
            Self::FeatureNotFound { .. } => "FEATURE_NOT_FOUND",
            Self::Git { .. } => "GIT_ERROR",
            Self::MergeConflict { .. } => "MERGE_CONFLICT",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Migration { .. } => "MIGRATION_FAILED",
            Self::Contention { .. } => "CONTENTION",
            Self::MigrationNotIdempotent { .. } => "MIGRATION_NOT_IDEMPOTENT",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Yaml(_) => "YAML_ERROR",
            Self::Toml(_) => "CONFIG_ERROR",
        }
    }

    /// Convert to structured error for `--json` output
    pub fn to_structured(&self) -> StructuredError {
        let mut structured = StructuredError::new(
            self.code(),
            self.category(),
            self.to_string(),
            self.recovery_suggestion(),
        );

        structured = match self {
            Self::Cycle { path } => structured.with_context("cycle", path.clone()),
            Self::InvalidReference { wp_id, missing } => structured
                .with_context("wp_id", wp_id.clone())
                .with_context("missing", missing.clone()),
            Self::InvalidTransition { wp_id, from, to } => structured
                .with_context("wp_id", wp_id.clone())
                .with_context("from", from.clone())
                .with_context("to", to.clone()),
            Self::BaseNotReady { wp_id, base, .. } => structured
                .with_context("wp_id", wp_id.clone())
                .with_context("base", base.clone()),
            Self::AmbiguousBase { wp_id, candidates } => structured
                .with_context("wp_id", wp_id.clone())
                .with_context("candidates", candidates.clone()),
            Self::MergeConflict { left, right, .. } => structured
                .with_context("left", left.clone())
                .with_context("right", right.clone()),
            Self::Contention { wp_id, attempts } => structured
                .with_context("wp_id", wp_id.clone())
                .with_context("attempts", *attempts),
            Self::MigrationNotIdempotent { version } | Self::Migration { version, .. } => {
                structured.with_context("version", version.clone())
            }
            _ => structured,
        };

        if self.is_retryable() {
            structured = structured.retryable();
        }

        structured
    }

    /// Convert to structured error JSON string
    pub fn to_structured_json(&self) -> String {
        serde_json::to_string_pretty(&self.to_structured())
            .unwrap_or_else(|_| format!(r#"{{"code":"SERIALIZATION_ERROR","message":"{}"}}"#, self))
    }
}
