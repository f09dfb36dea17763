//! The iterative convergence loop.
//!
//! Requirements run one at a time in dependency order. Each gets up to
//! `max_iterations` dispatch+verify cycles; the gate verdict alone decides
//! success. Every terminal transition is checkpointed to the status store
//! before the loop moves on, so a rerun resumes after the last requirement
//! that succeeded.

use crate::backend::{AgentBackend, AgentRequest};
use crate::event_bus::EventBus;
use crate::pipeline::GatePipeline;
use crate::sync::LifecycleSync;
use crate::tracker::Tracker;
use anyhow::{Context, Result};
use chrono::Utc;
use ralph_core::config::Config;
use ralph_core::convergence::{BlockReason, FailureHistory, RequirementOutcome, RequirementState};
use ralph_core::event::{EventKind, LogLevel};
use ralph_core::gate::PipelineResult;
use ralph_core::lifecycle::ProjectState;
use ralph_core::prompt::IterationContext;
use ralph_core::requirement::{Requirement, RequirementGraph, RequirementId};
use ralph_core::status::{MilestoneStatus, ProjectStatus, RequirementRecord};
use ralph_store::StatusStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What one loop run works on.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Working tree the agent edits and the gates check.
    pub project_dir: PathBuf,
    pub project: String,
    /// Status file key; one slug per independent run history.
    pub slug: String,
    pub branch: String,
    /// Gates verified after every iteration, in report order.
    pub gates: Vec<String>,
    /// Dispatch+verify cycles allowed per requirement. Must be at least 1.
    pub max_iterations: u32,
    /// Tracker project to mirror lifecycle into, if not already recorded in status.
    pub external_project_id: Option<String>,
    /// Stop after the first requirement that was actually dispatched.
    pub once: bool,
}

impl EngineConfig {
    /// Take gates and budget from `config`. The project name is the last
    /// component of `project_dir`, the branch is `ralph/<slug>`.
    pub fn new(project_dir: PathBuf, slug: impl Into<String>, config: &Config) -> Self {
        let project = project_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".into());
        let slug = slug.into();
        Self {
            branch: format!("ralph/{slug}"),
            project_dir,
            project,
            slug,
            gates: config.gates.clone(),
            max_iterations: config.max_iterations,
            external_project_id: None,
            once: false,
        }
    }
}

/// Final state of one requirement in one run.
#[derive(Debug, Clone)]
pub struct RequirementReport {
    pub id: RequirementId,
    pub state: RequirementState,
    /// Verifies performed in this run, in order.
    pub attempts: Vec<RequirementOutcome>,
    /// Already succeeded in an earlier run; not dispatched.
    pub resumed: bool,
}

/// Everything one [`ConvergenceLoop::run`] did.
#[derive(Debug, Clone, Default)]
pub struct LoopReport {
    /// In the order requirements reached a final state.
    pub requirements: Vec<RequirementReport>,
    /// A stop signal ended the run early.
    pub interrupted: bool,
    /// Last project lifecycle state confirmed by the tracker, if synced.
    pub project_state: Option<ProjectState>,
}

impl LoopReport {
    pub fn get(&self, id: &str) -> Option<&RequirementReport> {
        self.requirements.iter().find(|r| r.id.as_str() == id)
    }

    /// Requirements whose state label is `label` (`"SUCCEEDED"`, `"BLOCKED"`, ...).
    pub fn count(&self, label: &str) -> usize {
        self.requirements.iter().filter(|r| r.state.label() == label).count()
    }

    /// One line per requirement, for the CLI.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for r in &self.requirements {
            let note = if r.resumed { " (resumed)" } else { "" };
            out.push_str(&format!("{:<16} {}{note}\n", r.id.as_str(), r.state));
        }
        if self.interrupted {
            out.push_str("run interrupted\n");
        }
        out
    }
}

/// Outcome of converging a single requirement.
struct Converged {
    state: RequirementState,
    last_result: Option<PipelineResult>,
    attempts: Vec<RequirementOutcome>,
}

/// Drives every outstanding requirement of a graph to a terminal state.
///
/// Requirements run one at a time. The status store is the source of truth
/// across runs, and an optional tracker mirrors the project lifecycle.
pub struct ConvergenceLoop {
    config: EngineConfig,
    graph: RequirementGraph,
    pipeline: GatePipeline,
    agent: Arc<dyn AgentBackend>,
    store: StatusStore,
    lifecycle: Option<LifecycleSync<Arc<dyn Tracker>>>,
    event_bus: EventBus,
}

impl ConvergenceLoop {
    pub fn new(
        config: EngineConfig,
        graph: RequirementGraph,
        pipeline: GatePipeline,
        agent: Arc<dyn AgentBackend>,
        store: StatusStore,
    ) -> Self {
        Self {
            config,
            graph,
            pipeline,
            agent,
            store,
            lifecycle: None,
            event_bus: EventBus::new(),
        }
    }

    /// Mirror lifecycle moves into `tracker`. Tracker errors are logged only.
    pub fn with_tracker(mut self, tracker: Arc<dyn Tracker>) -> Self {
        self.lifecycle = Some(LifecycleSync::new(tracker).with_event_bus(self.event_bus.clone()));
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.lifecycle = self.lifecycle.map(|l| l.with_event_bus(bus.clone()));
        self.event_bus = bus;
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Run until every requirement is terminal, `once` stops it, or `cancel`
    /// fires. Errors are limited to status IO; gate and agent failures end
    /// up in the report.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<LoopReport> {
        let mut status = self.load_status().await?;
        let mut states: HashMap<RequirementId, RequirementState> = HashMap::new();
        let mut report = LoopReport::default();
        let mut lifecycle_started = false;

        tracing::info!(
            slug = %self.config.slug,
            requirements = self.graph.len(),
            max_iterations = self.config.max_iterations,
            "convergence loop starting"
        );

        for requirement in self.graph.ordered() {
            let id = &requirement.id;

            if let Some(state) = states.get(id)
                && state.is_terminal()
            {
                // Blocked earlier by a failing dependency; already recorded.
                continue;
            }

            if let Some(prior) = status.requirement_state(id)
                && prior.is_succeeded()
            {
                tracing::info!(requirement = %id, "already succeeded, skipping");
                states.insert(id.clone(), prior.clone());
                report.requirements.push(RequirementReport {
                    id: id.clone(),
                    state: prior.clone(),
                    attempts: Vec::new(),
                    resumed: true,
                });
                continue;
            }

            if let Some(dep) = requirement
                .dependencies
                .iter()
                .find(|d| !states.get(*d).is_some_and(RequirementState::is_succeeded))
            {
                let blocked = RequirementState::Blocked {
                    reason: BlockReason::Dependency { requirement: dep.clone() },
                };
                self.finish(&mut status, &mut states, &mut report, id, blocked, None, Vec::new())
                    .await?;
                continue;
            }

            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }

            if !lifecycle_started {
                lifecycle_started = true;
                report.project_state =
                    self.advance_lifecycle(&status, ProjectState::InProgress).await;
            }
            if let Some(ref milestone) = requirement.milestone
                && status.advance_milestone(milestone, MilestoneStatus::InProgress, Utc::now())
            {
                tracing::info!(milestone = %milestone, "milestone in progress");
            }

            let converged = self.converge(requirement, &states, cancel).await?;
            let state = converged.state.clone();
            self.finish(
                &mut status,
                &mut states,
                &mut report,
                id,
                converged.state,
                converged.last_result,
                converged.attempts,
            )
            .await?;

            match state {
                RequirementState::Blocked {
                    reason: BlockReason::Interrupted { .. },
                } => {
                    report.interrupted = true;
                    break;
                }
                RequirementState::FailedExhausted { .. } => {
                    self.block_dependents(&mut status, &mut states, &mut report, id)
                        .await?;
                }
                RequirementState::Succeeded { .. } => {
                    self.complete_milestone(&mut status, requirement).await?;
                }
                _ => {}
            }

            if self.config.once {
                break;
            }
        }

        let all_succeeded = self
            .graph
            .ordered()
            .all(|r| states.get(&r.id).is_some_and(RequirementState::is_succeeded));
        if all_succeeded && !self.graph.is_empty() {
            if let Some(state) = self.advance_lifecycle(&status, ProjectState::InReview).await {
                report.project_state = Some(state);
            }
        }

        tracing::info!(
            succeeded = report.count("SUCCEEDED"),
            failed = report.count("FAILED_EXHAUSTED"),
            blocked = report.count("BLOCKED"),
            interrupted = report.interrupted,
            "convergence loop finished"
        );
        Ok(report)
    }

    async fn load_status(&self) -> Result<ProjectStatus> {
        let store = self.store.clone();
        let slug = self.config.slug.clone();
        let mut status = tokio::task::spawn_blocking(move || store.try_read(&slug))
            .await
            .context("status reader task failed")?
            .context("failed to load project status")?
            .unwrap_or_else(|| {
                ProjectStatus::new(&self.config.project, &self.config.slug, &self.config.branch)
            });
        if status.external_project_id.is_none() {
            status.external_project_id = self.config.external_project_id.clone();
        }
        Ok(status)
    }

    /// Dispatch and verify until the gates pass, the budget runs out, or
    /// a stop signal arrives between iterations.
    async fn converge(
        &self,
        requirement: &Requirement,
        states: &HashMap<RequirementId, RequirementState>,
        cancel: &CancellationToken,
    ) -> Result<Converged> {
        let id = &requirement.id;
        let max = self.config.max_iterations;
        let completed: Vec<&Requirement> = requirement
            .dependencies
            .iter()
            .filter(|d| states.get(*d).is_some_and(RequirementState::is_succeeded))
            .filter_map(|d| self.graph.get(d))
            .collect();

        let mut state = RequirementState::Pending;
        let mut history = FailureHistory::new();
        let mut previous: Option<PipelineResult> = None;
        let mut augmentation = String::new();
        let mut attempts = Vec::new();

        for k in 1..=max {
            if k > 1 && cancel.is_cancelled() {
                self.step(id, &mut state, RequirementState::Blocked {
                    reason: BlockReason::Interrupted { iteration: k - 1 },
                });
                return Ok(Converged { state, last_result: previous, attempts });
            }

            self.step(id, &mut state, RequirementState::Running { iteration: k });
            let prompt = IterationContext {
                overview: self.graph.overview(),
                requirement,
                completed_dependencies: completed.clone(),
                iteration: k,
                max_iterations: max,
                previous_failure: previous.as_ref(),
                augmentation: std::mem::take(&mut augmentation),
            }
            .render();

            self.event_bus.emit(EventKind::AgentDispatched {
                requirement: id.clone(),
                iteration: k,
                agent: self.agent.name().to_string(),
            });
            let dispatched = self
                .agent
                .dispatch(&AgentRequest {
                    prompt,
                    cwd: self.config.project_dir.clone(),
                    requirement: id.clone(),
                    iteration: k,
                })
                .await;
            match dispatched {
                Ok(response) => {
                    self.event_bus.emit(EventKind::AgentFinished {
                        requirement: id.clone(),
                        iteration: k,
                        success: response.success(),
                        elapsed_secs: response.elapsed.as_secs_f64(),
                    });
                    if !response.success() {
                        tracing::warn!(
                            requirement = %id,
                            iteration = k,
                            exit_code = ?response.exit_code,
                            timed_out = response.timed_out,
                            "agent did not exit cleanly, verifying anyway"
                        );
                    }
                }
                Err(e) => {
                    // The tree may still have changed, and the gates decide.
                    tracing::warn!(
                        requirement = %id,
                        iteration = k,
                        error = %format!("{e:#}"),
                        "agent could not be run, verifying anyway"
                    );
                    self.event_bus.emit(EventKind::AgentFinished {
                        requirement: id.clone(),
                        iteration: k,
                        success: false,
                        elapsed_secs: 0.0,
                    });
                    self.event_bus.log(
                        LogLevel::Warn,
                        format!("agent dispatch for {id} iteration {k} failed: {e:#}"),
                    );
                }
            }

            if cancel.is_cancelled() {
                self.step(id, &mut state, RequirementState::Blocked {
                    reason: BlockReason::Interrupted { iteration: k },
                });
                return Ok(Converged { state, last_result: previous, attempts });
            }

            self.step(id, &mut state, RequirementState::Verifying { iteration: k });
            let result = self
                .pipeline
                .run(&self.config.project_dir, &self.config.gates, cancel)
                .await;
            self.event_bus.emit(EventKind::PipelineFinished {
                requirement: Some(id.clone()),
                verdict: result.result,
                error_count: result.error_count(),
            });
            attempts.push(RequirementOutcome {
                requirement_id: id.clone(),
                iteration: k,
                pipeline_result: result.clone(),
                timestamp: Utc::now(),
            });

            if result.passed() {
                self.step(id, &mut state, RequirementState::Succeeded { iterations: k });
                return Ok(Converged { state, last_result: Some(result), attempts });
            }

            if cancel.is_cancelled() {
                // The verdict may only reflect gates skipped by the stop signal.
                self.step(id, &mut state, RequirementState::Blocked {
                    reason: BlockReason::Interrupted { iteration: k },
                });
                return Ok(Converged { state, last_result: Some(result), attempts });
            }

            if k == max {
                tracing::warn!(requirement = %id, iterations = k, "iteration budget exhausted");
                self.step(id, &mut state, RequirementState::FailedExhausted { iterations: k });
                return Ok(Converged { state, last_result: Some(result), attempts });
            }

            let analysis = history.record(&result);
            tracing::info!(
                requirement = %id,
                iteration = k,
                errors = result.error_count(),
                strategy = analysis.strategy.label(),
                repeated = analysis.repeated.len(),
                "verification failed, retrying"
            );
            augmentation = analysis.strategy.prompt_augmentation(&analysis.repeated);
            previous = Some(result);
        }

        // max_iterations is validated > 0, so the loop always returns.
        anyhow::bail!("requirement {id} ran with an iteration budget of 0")
    }

    fn step(&self, id: &RequirementId, state: &mut RequirementState, next: RequirementState) {
        if !state.allows(&next) {
            tracing::error!(
                requirement = %id,
                from = %state,
                to = %next,
                "unexpected requirement transition"
            );
        }
        tracing::debug!(requirement = %id, from = %state, to = %next, "requirement state");
        self.event_bus.emit(EventKind::RequirementStateChange {
            requirement: id.clone(),
            from: state.label().to_string(),
            to: next.label().to_string(),
        });
        *state = next;
    }

    /// Record a terminal state and checkpoint it.
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        status: &mut ProjectStatus,
        states: &mut HashMap<RequirementId, RequirementState>,
        report: &mut LoopReport,
        id: &RequirementId,
        state: RequirementState,
        last_result: Option<PipelineResult>,
        attempts: Vec<RequirementOutcome>,
    ) -> Result<()> {
        if let RequirementState::Blocked { ref reason } = state {
            tracing::warn!(requirement = %id, %reason, "requirement blocked");
            if matches!(reason, BlockReason::Dependency { .. }) {
                // Never dispatched, so no step() announced the move.
                self.event_bus.emit(EventKind::RequirementStateChange {
                    requirement: id.clone(),
                    from: RequirementState::Pending.label().to_string(),
                    to: state.label().to_string(),
                });
            }
        }
        let iterations = attempts.len() as u32;
        status.record_requirement(
            id.clone(),
            RequirementRecord {
                state: state.clone(),
                iterations,
                last_result,
                updated_at: Utc::now(),
            },
        );
        self.checkpoint(status, id).await?;
        states.insert(id.clone(), state.clone());
        report.requirements.push(RequirementReport {
            id: id.clone(),
            state,
            attempts,
            resumed: false,
        });
        Ok(())
    }

    async fn block_dependents(
        &self,
        status: &mut ProjectStatus,
        states: &mut HashMap<RequirementId, RequirementState>,
        report: &mut LoopReport,
        failed: &RequirementId,
    ) -> Result<()> {
        let dependents: Vec<RequirementId> = self
            .graph
            .transitive_dependents(failed)
            .into_iter()
            .map(|r| r.id.clone())
            .collect();
        for dependent in dependents {
            if states.get(&dependent).is_some_and(RequirementState::is_terminal) {
                continue;
            }
            let blocked = RequirementState::Blocked {
                reason: BlockReason::Dependency {
                    requirement: failed.clone(),
                },
            };
            self.finish(status, states, report, &dependent, blocked, None, Vec::new())
                .await?;
        }
        Ok(())
    }

    async fn complete_milestone(
        &self,
        status: &mut ProjectStatus,
        requirement: &Requirement,
    ) -> Result<()> {
        let Some(ref milestone) = requirement.milestone else {
            return Ok(());
        };
        let done = self.graph.in_milestone(milestone).all(|r| {
            r.id == requirement.id
                || status
                    .requirement_state(&r.id)
                    .is_some_and(RequirementState::is_succeeded)
        });
        if !done || !status.advance_milestone(milestone, MilestoneStatus::Complete, Utc::now()) {
            return Ok(());
        }
        tracing::info!(milestone = %milestone, "milestone complete");
        self.checkpoint(status, &requirement.id).await?;

        if let Some(ref lifecycle) = self.lifecycle
            && let Some(issues) = status
                .milestones
                .get(milestone)
                .and_then(|m| m.external_issue_ids.clone())
        {
            let ids: Vec<String> = issues.into_iter().collect();
            match lifecycle.milestone_progress(&ids).await {
                Ok(progress) => tracing::info!(
                    milestone = %milestone,
                    closed = progress.closed,
                    total = progress.total,
                    percent = progress.percent(),
                    "tracker milestone progress"
                ),
                Err(e) => tracing::warn!(
                    milestone = %milestone,
                    error = %e,
                    "could not read milestone progress"
                ),
            }
        }
        Ok(())
    }

    /// Persist `status` off the async worker threads; the atomic write
    /// fsyncs and may back off on a contended rename.
    async fn checkpoint(&self, status: &ProjectStatus, id: &RequirementId) -> Result<()> {
        let store = self.store.clone();
        let slug = self.config.slug.clone();
        let snapshot = status.clone();
        tokio::task::spawn_blocking(move || store.write(&slug, &snapshot))
            .await
            .context("status writer task failed")?
            .with_context(|| format!("failed to checkpoint status after {id}"))?;
        self.event_bus.emit(EventKind::CheckpointSaved {
            requirement: id.clone(),
            slug: self.config.slug.clone(),
        });
        Ok(())
    }

    /// Tracker failures are logged, never fatal to the loop.
    async fn advance_lifecycle(
        &self,
        status: &ProjectStatus,
        target: ProjectState,
    ) -> Option<ProjectState> {
        let lifecycle = self.lifecycle.as_ref()?;
        let Some(ref project_id) = status.external_project_id else {
            tracing::debug!("no external project id, skipping lifecycle sync");
            return None;
        };
        match lifecycle.advance_at_least(project_id, target).await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(
                    project = %project_id,
                    target = %target,
                    error = %e,
                    "lifecycle sync failed"
                );
                self.event_bus
                    .log(LogLevel::Warn, format!("lifecycle sync to {target} failed: {e}"));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_takes_defaults_from_config() {
        let config = Config::default();
        let engine = EngineConfig::new(PathBuf::from("/work/converter"), "v2", &config);
        assert_eq!(engine.project, "converter");
        assert_eq!(engine.branch, "ralph/v2");
        assert_eq!(engine.gates, config.gates);
        assert_eq!(engine.max_iterations, config.max_iterations);
        assert!(!engine.once);
    }

    #[test]
    fn summary_marks_resumed_and_interrupted() {
        let report = LoopReport {
            requirements: vec![
                RequirementReport {
                    id: RequirementId::new("REQ-1"),
                    state: RequirementState::Succeeded { iterations: 2 },
                    attempts: Vec::new(),
                    resumed: true,
                },
                RequirementReport {
                    id: RequirementId::new("REQ-2"),
                    state: RequirementState::Blocked {
                        reason: BlockReason::Interrupted { iteration: 1 },
                    },
                    attempts: Vec::new(),
                    resumed: false,
                },
            ],
            interrupted: true,
            project_state: None,
        };
        let summary = report.summary();
        assert!(summary.contains("REQ-1"));
        assert!(summary.contains("SUCCEEDED (resumed)"));
        assert!(summary.contains("BLOCKED"));
        assert!(summary.ends_with("run interrupted\n"));
        assert_eq!(report.count("SUCCEEDED"), 1);
        assert!(report.get("REQ-3").is_none());
    }
}
