//! Loop event types for real-time observability.
//!
//! Events are emitted by the convergence engine as requirements progress.
//! Consumers (the CLI renderer, the JSONL log) subscribe and render them.
//!
//! These are pure data types with no async runtime dependency. The
//! broadcast bus lives in `ralph-runner`.

use crate::gate::Verdict;
use crate::lifecycle::ProjectState;
use crate::requirement::RequirementId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A timestamped loop event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl PipelineEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// The specific kind of loop event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventKind {
    /// Requirement state changed (labels as in `RequirementState::label`).
    RequirementStateChange {
        requirement: RequirementId,
        from: String,
        to: String,
    },

    /// Agent dispatched for one iteration.
    AgentDispatched {
        requirement: RequirementId,
        iteration: u32,
        agent: String,
    },

    /// Agent returned control.
    AgentFinished {
        requirement: RequirementId,
        iteration: u32,
        success: bool,
        elapsed_secs: f64,
    },

    /// One gate finished inside a pipeline run.
    GateFinished {
        gate: String,
        passed: bool,
        errors: usize,
        duration_secs: f64,
    },

    /// A whole pipeline run finished.
    PipelineFinished {
        requirement: Option<RequirementId>,
        verdict: Verdict,
        error_count: usize,
    },

    /// Status file checkpointed after a terminal transition.
    CheckpointSaved {
        requirement: RequirementId,
        slug: String,
    },

    /// External project lifecycle advanced.
    LifecycleAdvanced { from: ProjectState, to: ProjectState },

    /// Engine-level log message (info, warn, error).
    EngineLog { level: LogLevel, message: String },
}

/// Severity level for engine log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ts = self.timestamp.format("%H:%M:%S%.3f");
        match &self.kind {
            EventKind::RequirementStateChange {
                requirement,
                from,
                to,
            } => write!(f, "[{ts}] {requirement}: {from} -> {to}"),

            EventKind::AgentDispatched {
                requirement,
                iteration,
                agent,
            } => write!(f, "[{ts}] {requirement}: dispatched {agent} (iteration {iteration})"),

            EventKind::AgentFinished {
                requirement,
                iteration,
                success,
                elapsed_secs,
            } => {
                let status = if *success { "OK" } else { "FAIL" };
                write!(
                    f,
                    "[{ts}] {requirement}: agent finished iteration {iteration} \
                     ({status}, {elapsed_secs:.1}s)"
                )
            }

            EventKind::GateFinished {
                gate,
                passed,
                errors,
                duration_secs,
            } => {
                let status = if *passed { "PASS" } else { "FAIL" };
                write!(f, "[{ts}] gate/{gate}: {status}")?;
                if *errors > 0 {
                    write!(f, " ({errors} errors)")?;
                }
                write!(f, " {duration_secs:.1}s")
            }

            EventKind::PipelineFinished {
                requirement,
                verdict,
                error_count,
            } => {
                let scope = requirement
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "verify".into());
                write!(f, "[{ts}] {scope}: {verdict} ({error_count} errors)")
            }

            EventKind::CheckpointSaved { requirement, slug } => {
                write!(f, "[{ts}] {requirement}: checkpoint saved to {slug}")
            }

            EventKind::LifecycleAdvanced { from, to } => {
                write!(f, "[{ts}] project: {from} -> {to}")
            }

            EventKind::EngineLog { level, message } => {
                let tag = match level {
                    LogLevel::Info => "INFO",
                    LogLevel::Warn => "WARN",
                    LogLevel::Error => "ERROR",
                };
                write!(f, "[{ts}] [{tag}] {message}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_display_state_change() {
        let event = PipelineEvent::new(EventKind::RequirementStateChange {
            requirement: RequirementId::new("REQ-1"),
            from: "VERIFYING".into(),
            to: "SUCCEEDED".into(),
        });
        let s = event.to_string();
        assert!(s.contains("REQ-1"));
        assert!(s.contains("VERIFYING -> SUCCEEDED"));
    }

    #[test]
    fn event_serialize_roundtrip() {
        let event = PipelineEvent::new(EventKind::AgentFinished {
            requirement: RequirementId::new("REQ-2"),
            iteration: 3,
            success: true,
            elapsed_secs: 42.5,
        });
        let json = serde_json::to_string(&event).unwrap();
        let parsed: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed.kind,
            EventKind::AgentFinished {
                success: true,
                iteration: 3,
                ..
            }
        ));
    }

    #[test]
    fn gate_finished_display() {
        let event = PipelineEvent::new(EventKind::GateFinished {
            gate: "types".into(),
            passed: false,
            errors: 2,
            duration_secs: 1.25,
        });
        assert!(event.to_string().contains("gate/types: FAIL (2 errors)"));
    }

    #[test]
    fn standalone_pipeline_display() {
        let event = PipelineEvent::new(EventKind::PipelineFinished {
            requirement: None,
            verdict: Verdict::Passed,
            error_count: 0,
        });
        assert!(event.to_string().contains("verify: PASSED"));
    }

    #[test]
    fn engine_log_display() {
        let event = PipelineEvent::new(EventKind::EngineLog {
            level: LogLevel::Warn,
            message: "tracker unavailable".into(),
        });
        assert!(event.to_string().contains("[WARN] tracker unavailable"));
    }
}
