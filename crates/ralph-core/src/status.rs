//! Durable per-project status: the unit the status store persists.

use crate::convergence::RequirementState;
use crate::gate::PipelineResult;
use crate::requirement::RequirementId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Milestone progress as recorded locally. Forward-only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MilestoneStatus::Pending => write!(f, "pending"),
            MilestoneStatus::InProgress => write!(f, "in_progress"),
            MilestoneStatus::Complete => write!(f, "complete"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneRecord {
    pub status: MilestoneStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_issue_ids: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl MilestoneRecord {
    /// Move forward to `status`. Returns false (and changes nothing) when
    /// `status` is not ahead of the current one.
    pub fn advance(&mut self, status: MilestoneStatus, now: DateTime<Utc>) -> bool {
        if status <= self.status {
            return false;
        }
        self.status = status;
        if status == MilestoneStatus::Complete {
            self.completed_at = Some(now);
        }
        true
    }
}

/// Final outcome of one requirement, checkpointed after each terminal move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequirementRecord {
    pub state: RequirementState,
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<PipelineResult>,
    pub updated_at: DateTime<Utc>,
}

/// Status for one (project, slug) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    pub project: String,
    pub slug: String,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_team_id: Option<String>,
    #[serde(default)]
    pub milestones: BTreeMap<String, MilestoneRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requirements: BTreeMap<RequirementId, RequirementRecord>,
}

impl ProjectStatus {
    pub fn new(
        project: impl Into<String>,
        slug: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            slug: slug.into(),
            branch: branch.into(),
            created_at: Utc::now(),
            external_project_id: None,
            external_team_id: None,
            milestones: BTreeMap::new(),
            requirements: BTreeMap::new(),
        }
    }

    /// Structural checks serde cannot express.
    pub fn validate(&self, expected_slug: &str) -> Result<(), String> {
        if self.slug.trim().is_empty() {
            return Err("slug is empty".into());
        }
        if self.slug != expected_slug {
            return Err(format!(
                "slug mismatch: file is for {expected_slug} but contains {}",
                self.slug
            ));
        }
        for (name, milestone) in &self.milestones {
            if milestone.completed_at.is_some() && milestone.status != MilestoneStatus::Complete {
                return Err(format!(
                    "milestone {name} has completedAt but status {}",
                    milestone.status
                ));
            }
        }
        Ok(())
    }

    pub fn requirement_state(&self, id: &RequirementId) -> Option<&RequirementState> {
        self.requirements.get(id).map(|r| &r.state)
    }

    pub fn record_requirement(&mut self, id: RequirementId, record: RequirementRecord) {
        self.requirements.insert(id, record);
    }

    /// Advance a milestone, creating it as pending first if it is new.
    pub fn advance_milestone(
        &mut self,
        name: &str,
        status: MilestoneStatus,
        now: DateTime<Utc>,
    ) -> bool {
        self.milestones
            .entry(name.to_string())
            .or_default()
            .advance(status, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::BlockReason;

    #[test]
    fn json_uses_camel_case_and_snake_case_statuses() {
        let mut status = ProjectStatus::new("demo", "v1", "ralph/v1");
        status.external_project_id = Some("proj_123".into());
        status.milestones.insert(
            "M1".into(),
            MilestoneRecord {
                status: MilestoneStatus::InProgress,
                external_issue_ids: Some(["ISS-1".to_string()].into()),
                completed_at: None,
            },
        );
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["externalProjectId"], "proj_123");
        assert!(json.get("createdAt").is_some());
        assert_eq!(json["milestones"]["M1"]["status"], "in_progress");
        assert_eq!(json["milestones"]["M1"]["externalIssueIds"][0], "ISS-1");
        assert!(json.get("requirements").is_none());
    }

    #[test]
    fn unknown_milestone_status_fails_to_parse() {
        let raw = r#"{
            "project": "demo", "slug": "v1", "branch": "main",
            "createdAt": "2026-01-01T00:00:00Z",
            "milestones": { "M1": { "status": "almost_done" } }
        }"#;
        assert!(serde_json::from_str::<ProjectStatus>(raw).is_err());
    }

    #[test]
    fn validate_rejects_slug_mismatch() {
        let status = ProjectStatus::new("demo", "v1", "main");
        assert!(status.validate("v1").is_ok());
        assert!(status.validate("v2").unwrap_err().contains("slug mismatch"));
    }

    #[test]
    fn validate_rejects_completed_at_on_open_milestone() {
        let mut status = ProjectStatus::new("demo", "v1", "main");
        status.milestones.insert(
            "M1".into(),
            MilestoneRecord {
                status: MilestoneStatus::Pending,
                external_issue_ids: None,
                completed_at: Some(Utc::now()),
            },
        );
        assert!(status.validate("v1").is_err());
    }

    #[test]
    fn milestones_only_move_forward() {
        let mut status = ProjectStatus::new("demo", "v1", "main");
        let now = Utc::now();
        assert!(status.advance_milestone("M1", MilestoneStatus::InProgress, now));
        assert!(!status.advance_milestone("M1", MilestoneStatus::InProgress, now));
        assert!(status.advance_milestone("M1", MilestoneStatus::Complete, now));
        assert!(!status.advance_milestone("M1", MilestoneStatus::Pending, now));
        let m1 = &status.milestones["M1"];
        assert_eq!(m1.status, MilestoneStatus::Complete);
        assert_eq!(m1.completed_at, Some(now));
    }

    #[test]
    fn requirement_records_roundtrip() {
        let mut status = ProjectStatus::new("demo", "v1", "main");
        status.record_requirement(
            RequirementId::new("REQ-2"),
            RequirementRecord {
                state: RequirementState::Blocked {
                    reason: BlockReason::Dependency {
                        requirement: RequirementId::new("REQ-1"),
                    },
                },
                iterations: 0,
                last_result: None,
                updated_at: Utc::now(),
            },
        );
        let json = serde_json::to_string(&status).unwrap();
        let back: ProjectStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
        assert_eq!(
            back.requirement_state(&RequirementId::new("REQ-2")).map(|s| s.label()),
            Some("BLOCKED")
        );
    }
}
