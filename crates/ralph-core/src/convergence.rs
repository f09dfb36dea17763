//! Requirement state machine and convergence-aware retry prompts.
//!
//! Each requirement moves through
//!
//! ```text
//! PENDING -> RUNNING(k) -> VERIFYING(k) -> SUCCEEDED
//!                ^               |
//!                +---- k+1 ------+-> FAILED_EXHAUSTED   (k == max)
//! PENDING -> BLOCKED                                    (dependency did not succeed)
//! RUNNING/VERIFYING -> BLOCKED                          (interrupted)
//! ```
//!
//! On top of the plain iteration budget, failures are fingerprinted so that
//! when the agent keeps hitting the same diagnostics the retry prompt
//! escalates instead of repeating itself. The budget stays the only stop
//! condition.

use crate::gate::{GateError, PipelineResult};
use crate::requirement::RequirementId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Why a requirement never ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// A dependency ended in `FAILED_EXHAUSTED` or was itself blocked.
    Dependency { requirement: RequirementId },
    /// A stop signal arrived between iterations.
    Interrupted { iteration: u32 },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Dependency { requirement } => {
                write!(f, "dependency {requirement} did not succeed")
            }
            BlockReason::Interrupted { iteration } => {
                write!(f, "interrupted after iteration {iteration}")
            }
        }
    }
}

/// Per-requirement loop state.
///
/// Serialized with a `state` tag (`{"state":"RUNNING","iteration":2}`) so a
/// status file stays readable. Iterations count from 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequirementState {
    /// Not dispatched yet in this run.
    Pending,
    /// The agent is working on iteration `iteration`.
    Running { iteration: u32 },
    /// The gate pipeline is checking iteration `iteration`.
    Verifying { iteration: u32 },
    /// Every gate passed after `iterations` attempts.
    Succeeded { iterations: u32 },
    /// The iteration budget ran out with gates still failing.
    FailedExhausted { iterations: u32 },
    Blocked { reason: BlockReason },
}

impl RequirementState {
    /// Upper-case name without payload, e.g. `FAILED_EXHAUSTED`.
    pub fn label(&self) -> &'static str {
        match self {
            RequirementState::Pending => "PENDING",
            RequirementState::Running { .. } => "RUNNING",
            RequirementState::Verifying { .. } => "VERIFYING",
            RequirementState::Succeeded { .. } => "SUCCEEDED",
            RequirementState::FailedExhausted { .. } => "FAILED_EXHAUSTED",
            RequirementState::Blocked { .. } => "BLOCKED",
        }
    }

    /// Succeeded, failed or blocked. A terminal state is what gets
    /// checkpointed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequirementState::Succeeded { .. }
                | RequirementState::FailedExhausted { .. }
                | RequirementState::Blocked { .. }
        )
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, RequirementState::Succeeded { .. })
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn allows(&self, next: &RequirementState) -> bool {
        use RequirementState::*;
        match (self, next) {
            (Pending, Running { iteration: 1 }) => true,
            (Pending, Blocked { reason: BlockReason::Dependency { .. } }) => true,
            (Running { iteration: k }, Verifying { iteration: j }) => k == j,
            (
                Running { .. } | Verifying { .. },
                Blocked {
                    reason: BlockReason::Interrupted { .. },
                },
            ) => true,
            (Verifying { iteration: k }, Running { iteration: j }) => *j == k + 1,
            (Verifying { iteration: k }, Succeeded { iterations }) => k == iterations,
            (Verifying { iteration: k }, FailedExhausted { iterations }) => k == iterations,
            _ => false,
        }
    }
}

impl fmt::Display for RequirementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequirementState::Running { iteration } | RequirementState::Verifying { iteration } => {
                write!(f, "{}({iteration})", self.label())
            }
            RequirementState::Blocked { reason } => write!(f, "BLOCKED ({reason})"),
            _ => f.write_str(self.label()),
        }
    }
}

/// One verify of one iteration. Only the final status is ever persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RequirementOutcome {
    pub requirement_id: RequirementId,
    pub iteration: u32,
    pub pipeline_result: PipelineResult,
    pub timestamp: DateTime<Utc>,
}

/// Fingerprint of one failing diagnostic, stable across line shifts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailureSignature {
    pub gate: String,
    pub file: Option<String>,
    pub error_hash: String,
}

impl FailureSignature {
    /// One signature per diagnostic of every failing gate.
    pub fn from_pipeline(result: &PipelineResult) -> Vec<Self> {
        result
            .failing_gates()
            .flat_map(|g| {
                g.errors.iter().map(move |e| Self {
                    gate: g.gate.clone(),
                    file: e.file.clone(),
                    error_hash: hash_diagnostic(e),
                })
            })
            .collect()
    }
}

impl fmt::Display for FailureSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.gate,
            self.file.as_deref().unwrap_or("-"),
            &self.error_hash[..self.error_hash.len().min(8)]
        )
    }
}

/// The retry strategy to use, escalating with repeated failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// Failure report only.
    Normal,
    /// A diagnostic failed twice: ask for a root-cause fix.
    ExpandedContext,
    /// Three or more times: ask for a different design.
    DifferentApproach,
}

impl RetryStrategy {
    /// Strategy for a signature seen `count` times so far.
    pub fn from_occurrence_count(count: u32) -> Self {
        match count {
            0 | 1 => RetryStrategy::Normal,
            2 => RetryStrategy::ExpandedContext,
            _ => RetryStrategy::DifferentApproach,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RetryStrategy::Normal => "normal",
            RetryStrategy::ExpandedContext => "expanded-context",
            RetryStrategy::DifferentApproach => "different-approach",
        }
    }

    /// Extra prompt text appended after the failure report.
    pub fn prompt_augmentation(&self, repeated: &[FailureSignature]) -> String {
        let sig_list = repeated
            .iter()
            .map(|s| format!("  - {} in {}", s.gate, s.file.as_deref().unwrap_or("(no file)")))
            .collect::<Vec<_>>()
            .join("\n");

        match self {
            RetryStrategy::Normal => String::new(),
            RetryStrategy::ExpandedContext => format!(
                "\n## Repeated Failure\n\
                 These diagnostics also failed on the previous attempt:\n\
                 {sig_list}\n\n\
                 The last fix did not address the root cause. Read the full \
                 diagnostic, check the surrounding code and its callers, and \
                 fix why it fails rather than the symptom.\n"
            ),
            RetryStrategy::DifferentApproach => format!(
                "\n## Change Approach\n\
                 These diagnostics have failed across several attempts:\n\
                 {sig_list}\n\n\
                 Do NOT repeat the previous fix. Reconsider the design of this \
                 requirement, look for an alternative implementation, and check \
                 whether a dependency needs to change first.\n"
            ),
        }
    }
}

/// Tracks failure signatures across the iterations of one requirement.
#[derive(Debug, Clone, Default)]
pub struct FailureHistory {
    counts: HashMap<FailureSignature, u32>,
}

/// Result of folding one failing pipeline run into the history.
#[derive(Debug, Clone)]
pub struct ConvergenceAnalysis {
    /// Escalation for the next prompt, driven by the most repeated signature.
    pub strategy: RetryStrategy,
    /// Signatures of this run that had already failed before, deduplicated.
    pub repeated: Vec<FailureSignature>,
}

impl FailureHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failing run and decide how the next prompt should escalate.
    pub fn record(&mut self, result: &PipelineResult) -> ConvergenceAnalysis {
        let mut repeated = Vec::new();
        let mut worst = 0;
        let mut seen = HashSet::new();

        for sig in FailureSignature::from_pipeline(result) {
            if !seen.insert(sig.clone()) {
                continue;
            }
            let count = self.counts.entry(sig.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                repeated.push(sig);
            }
            worst = worst.max(*count);
        }

        let strategy = if repeated.is_empty() {
            RetryStrategy::Normal
        } else {
            RetryStrategy::from_occurrence_count(worst)
        };
        ConvergenceAnalysis { strategy, repeated }
    }
}

/// FNV-1a over the diagnostic text with digits removed, so the same error
/// at a shifted line still matches.
fn hash_diagnostic(err: &GateError) -> String {
    let normalized: String = err
        .rule
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(err.message.as_str()))
        .collect::<Vec<_>>()
        .join("|")
        .chars()
        .filter(|c| !c.is_ascii_digit())
        .collect();

    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in normalized.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}
