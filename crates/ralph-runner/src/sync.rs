//! Lifecycle synchronizer: forward-only project moves mirrored to the tracker.
//!
//! The tracker is authoritative. Every operation reads the current state
//! from it first, validates the move locally, and only then writes. Milestone
//! progress is recomputed from issue states on every call.

use crate::event_bus::EventBus;
use crate::tracker::Tracker;
use anyhow::Result;
use ralph_core::event::EventKind;
use ralph_core::lifecycle::{MilestoneProgress, ProjectState, transition};

/// Forward-only lifecycle writes against a [`Tracker`].
pub struct LifecycleSync<T: Tracker> {
    tracker: T,
    event_bus: Option<EventBus>,
}

impl<T: Tracker> LifecycleSync<T> {
    pub fn new(tracker: T) -> Self {
        Self {
            tracker,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    /// Move `project_id` to `target`. Fails with
    /// [`LifecycleError::InvalidTransition`](ralph_core::error::LifecycleError)
    /// (downcastable) unless `target` ranks strictly higher than the current state.
    pub async fn advance(&self, project_id: &str, target: ProjectState) -> Result<ProjectState> {
        let current = self.tracker.project_state(project_id).await?;
        let next = transition(current, target)?;
        self.tracker.set_project_state(project_id, next).await?;
        tracing::info!(
            project = project_id,
            from = %current,
            to = %next,
            "project lifecycle advanced"
        );
        if let Some(ref bus) = self.event_bus {
            bus.emit(EventKind::LifecycleAdvanced { from: current, to: next });
        }
        Ok(next)
    }

    /// Like [`advance`](Self::advance), but a project already at or past
    /// `target` is left alone. Returns the state the project ends in.
    pub async fn advance_at_least(
        &self,
        project_id: &str,
        target: ProjectState,
    ) -> Result<ProjectState> {
        let current = self.tracker.project_state(project_id).await?;
        if current >= target {
            tracing::debug!(
                project = project_id,
                current = %current,
                target = %target,
                "lifecycle already there"
            );
            return Ok(current);
        }
        self.advance(project_id, target).await
    }

    pub async fn milestone_progress(&self, issue_ids: &[String]) -> Result<MilestoneProgress> {
        let states = self.tracker.issue_states(issue_ids).await?;
        Ok(MilestoneProgress::from_states(&states))
    }
}
