//! Work package records
//!
//! - `types`: `WorkPackage`, `Lane` and the lane state machine
//! - `record`: YAML front matter codec for record files
//! - `store`: manifests and records under the specs directory

pub mod record;
pub mod store;
pub mod types;

pub use record::{join_front_matter, split_front_matter, WorkPackageRecord};
pub use store::{write_atomic, Feature, FeatureManifest, FeatureStore, MANIFEST_FILE, TASKS_DIR};
pub use types::{HistoryEntry, Lane, Transition, WorkPackage};
