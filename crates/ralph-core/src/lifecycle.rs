//! Forward-only project lifecycle and derived milestone progress.
//!
//! The external tracker is the system of record for project state. This
//! module only knows the ordering rule: a project may move to a strictly
//! higher-ranked state, never sideways, backwards, or onto itself.

use crate::error::LifecycleError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// External project lifecycle, totally ordered by declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProjectState {
    Backlog,
    Planned,
    InProgress,
    InReview,
    Done,
}

impl ProjectState {
    pub const ALL: [ProjectState; 5] = [
        ProjectState::Backlog,
        ProjectState::Planned,
        ProjectState::InProgress,
        ProjectState::InReview,
        ProjectState::Done,
    ];

    pub fn rank(self) -> u8 {
        match self {
            ProjectState::Backlog => 0,
            ProjectState::Planned => 1,
            ProjectState::InProgress => 2,
            ProjectState::InReview => 3,
            ProjectState::Done => 4,
        }
    }

    /// Status name as shown in the tracker UI.
    pub fn display_name(self) -> &'static str {
        match self {
            ProjectState::Backlog => "Backlog",
            ProjectState::Planned => "Planned",
            ProjectState::InProgress => "In Progress",
            ProjectState::InReview => "In Review",
            ProjectState::Done => "Done",
        }
    }

    /// Inverse of [`display_name`](Self::display_name), case-insensitive.
    pub fn from_display_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.display_name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProjectState::Backlog => "Backlog",
            ProjectState::Planned => "Planned",
            ProjectState::InProgress => "InProgress",
            ProjectState::InReview => "InReview",
            ProjectState::Done => "Done",
        };
        f.write_str(s)
    }
}

impl FromStr for ProjectState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        match compact.as_str() {
            "backlog" => Ok(ProjectState::Backlog),
            "planned" => Ok(ProjectState::Planned),
            "inprogress" => Ok(ProjectState::InProgress),
            "inreview" => Ok(ProjectState::InReview),
            "done" => Ok(ProjectState::Done),
            _ => Err(format!("unknown project state: {s}")),
        }
    }
}

/// Validate a lifecycle move and return the new state.
///
/// Succeeds only when `rank(target) > rank(current)`.
pub fn transition(
    current: ProjectState,
    target: ProjectState,
) -> Result<ProjectState, LifecycleError> {
    if target.rank() > current.rank() {
        Ok(target)
    } else {
        Err(LifecycleError::InvalidTransition {
            from: current,
            to: target,
        })
    }
}

/// Issue state as reported by the tracker, reduced to what progress needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueState {
    Backlog,
    Todo,
    InProgress,
    InReview,
    Done,
    Canceled,
}

impl IssueState {
    /// Done and canceled issues both count toward milestone completion.
    pub fn is_closed(self) -> bool {
        matches!(self, IssueState::Done | IssueState::Canceled)
    }
}

/// Derived milestone completion. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MilestoneProgress {
    pub closed: usize,
    pub total: usize,
}

impl MilestoneProgress {
    pub fn from_states(states: &[IssueState]) -> Self {
        Self {
            closed: states.iter().filter(|s| s.is_closed()).count(),
            total: states.len(),
        }
    }

    /// Fraction in `[0.0, 1.0]`. A milestone with no issues reports `0.0`.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.closed as f64 / self.total as f64
        }
    }

    pub fn percent(&self) -> u8 {
        (self.ratio() * 100.0).round() as u8
    }
}
