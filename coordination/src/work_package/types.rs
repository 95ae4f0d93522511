//! Work package types and the lane state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use crate::error::CoordError;

/// Lifecycle lane of a work package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    #[default]
    Planned,
    #[serde(alias = "in_progress")]
    Doing,
    #[serde(alias = "review", alias = "for-review")]
    ForReview,
    Done,
}

/// Named edges of the lane state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// planned -> doing
    Start,
    /// doing -> for_review
    Submit,
    /// for_review -> done
    Approve,
    /// for_review -> planned
    Reject,
    /// doing -> planned, explicit hand-back
    Block,
}

impl Lane {
    pub const ALL: [Lane; 4] = [Lane::Planned, Lane::Doing, Lane::ForReview, Lane::Done];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Doing => "doing",
            Self::ForReview => "for_review",
            Self::Done => "done",
        }
    }

    /// The transition leading from `self` to `target`, if the machine allows it
    pub fn transition_to(self, target: Lane) -> Option<Transition> {
        match (self, target) {
            (Self::Planned, Self::Doing) => Some(Transition::Start),
            (Self::Doing, Self::ForReview) => Some(Transition::Submit),
            (Self::ForReview, Self::Done) => Some(Transition::Approve),
            (Self::ForReview, Self::Planned) => Some(Transition::Reject),
            (Self::Doing, Self::Planned) => Some(Transition::Block),
            _ => None,
        }
    }

    /// `done` has no outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Canonical name for a lane spelling, accepting legacy aliases
    pub fn canonical_name(raw: &str) -> Option<&'static str> {
        raw.parse::<Lane>().ok().map(|l| l.as_str())
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lane {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "planned" => Ok(Self::Planned),
            "doing" | "in_progress" => Ok(Self::Doing),
            "for_review" | "for-review" | "review" => Ok(Self::ForReview),
            "done" => Ok(Self::Done),
            other => Err(CoordError::usage(format!(
                "unknown lane '{other}' (expected planned, doing, for_review or done)"
            ))),
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Submit => "submit",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Block => "block",
        };
        f.write_str(name)
    }
}

/// One entry of the append-only lane history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub lane: Lane,
    pub actor: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
}

impl HistoryEntry {
    pub fn now(lane: Lane, actor: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            lane,
            actor: actor.into(),
            note: note.into(),
        }
    }
}

/// Structured metadata header of a work package record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkPackage {
    /// Stable short identifier, unique within a feature
    #[serde(rename = "work_package_id")]
    pub id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub lane: Lane,

    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub assignee: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent: String,

    /// Opaque handle of the process currently working the package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_process: Option<String>,

    #[serde(default)]
    pub history: Vec<HistoryEntry>,

    /// Keys this version does not know about, preserved on rewrite
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl WorkPackage {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            lane: Lane::Planned,
            dependencies: BTreeSet::new(),
            assignee: String::new(),
            agent: String::new(),
            owner_process: None,
            history: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Builder: add dependencies
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Builder: set lane
    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    /// Apply a validated lane change and append its history entry.
    ///
    /// Leaves `self` untouched when the transition is not allowed.
    pub fn apply_lane(
        &mut self,
        target: Lane,
        actor: &str,
        note: &str,
    ) -> Result<Transition, CoordError> {
        let transition =
            self.lane
                .transition_to(target)
                .ok_or_else(|| CoordError::InvalidTransition {
                    wp_id: self.id.clone(),
                    from: self.lane.to_string(),
                    to: target.to_string(),
                })?;
        self.lane = target;
        self.history.push(HistoryEntry::now(target, actor, note));
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use Lane::*;
        let allowed = [
            (Planned, Doing, Transition::Start),
            (Doing, ForReview, Transition::Submit),
            (ForReview, Done, Transition::Approve),
            (ForReview, Planned, Transition::Reject),
            (Doing, Planned, Transition::Block),
        ];
        for from in Lane::ALL {
            for to in Lane::ALL {
                let expected = allowed
                    .iter()
                    .find(|(f, t, _)| *f == from && *t == to)
                    .map(|(_, _, tr)| *tr);
                assert_eq!(from.transition_to(to), expected, "{from} -> {to}");
            }
        }
        assert!(Done.is_terminal());
    }

    #[test]
    fn test_lane_aliases() {
        assert_eq!("in_progress".parse::<Lane>().unwrap(), Lane::Doing);
        assert_eq!("for-review".parse::<Lane>().unwrap(), Lane::ForReview);
        assert_eq!(Lane::canonical_name("review"), Some("for_review"));
        assert!("shipping".parse::<Lane>().is_err());

        let lane: Lane = serde_yaml::from_str("in_progress").unwrap();
        assert_eq!(lane, Lane::Doing);
    }

    #[test]
    fn test_apply_lane_rejects_skip() {
        let mut wp = WorkPackage::new("WP01", "Setup");
        let err = wp.apply_lane(Lane::Done, "alice", "").unwrap_err();
        assert!(matches!(err, CoordError::InvalidTransition { .. }));
        assert_eq!(wp.lane, Lane::Planned);
        assert!(wp.history.is_empty());

        assert_eq!(
            wp.apply_lane(Lane::Doing, "alice", "starting").unwrap(),
            Transition::Start
        );
        assert_eq!(wp.lane, Lane::Doing);
        assert_eq!(wp.history.len(), 1);
        assert_eq!(wp.history[0].actor, "alice");
    }
}
