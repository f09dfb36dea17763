//! Gate pipeline: run a list of named gates and aggregate one verdict.
//!
//! Registered gates run concurrently, each bounded by its timeout. Output
//! order always equals request order, and every requested name (known or
//! not) yields exactly one `GateResult`. Gate failures never become `Err`.

use crate::checker::{Checker, CheckerRegistry};
use crate::event_bus::EventBus;
use futures::future::join_all;
use ralph_core::config::Config;
use ralph_core::event::EventKind;
use ralph_core::gate::{GateResult, PipelineResult};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Runs a list of named gates concurrently and aggregates the verdict.
pub struct GatePipeline {
    registry: CheckerRegistry,
    timeouts: BTreeMap<String, Duration>,
    event_bus: Option<EventBus>,
}

impl GatePipeline {
    pub fn new(registry: CheckerRegistry) -> Self {
        Self {
            registry,
            timeouts: BTreeMap::new(),
            event_bus: None,
        }
    }

    /// Registry and timeout overrides taken from config.
    pub fn from_config(config: &Config) -> Self {
        let mut pipeline = Self::new(CheckerRegistry::from_config(config));
        for (gate, ms) in &config.gate_timeouts {
            pipeline = pipeline.with_timeout(gate, Duration::from_millis(*ms));
        }
        pipeline
    }

    /// Override the checker's default timeout for `gate`.
    pub fn with_timeout(mut self, gate: &str, timeout: Duration) -> Self {
        self.timeouts.insert(gate.to_string(), timeout);
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn registry(&self) -> &CheckerRegistry {
        &self.registry
    }

    /// Configured override, else the checker's own default.
    fn timeout_for(&self, checker: &dyn Checker) -> Duration {
        self.timeouts
            .get(checker.name())
            .copied()
            .unwrap_or_else(|| checker.default_timeout())
    }

    pub async fn run(
        &self,
        project_dir: &Path,
        gates: &[String],
        cancel: &CancellationToken,
    ) -> PipelineResult {
        let span = tracing::info_span!("pipeline", gates = ?gates, dir = %project_dir.display());
        async {
            let runs = gates.iter().map(|gate| self.run_gate(project_dir, gate, cancel));
            let result = PipelineResult::from_gates(join_all(runs).await);
            tracing::info!(
                verdict = %result.result,
                errors = result.error_count(),
                duration_ms = result.total_duration().as_millis() as u64,
                "pipeline finished"
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn run_gate(
        &self,
        project_dir: &Path,
        gate: &str,
        cancel: &CancellationToken,
    ) -> GateResult {
        let Some(checker) = self.registry.get(gate) else {
            tracing::warn!(gate, "gate is not registered, treating as passed");
            let result = GateResult::unknown(gate);
            self.report(&result);
            return result;
        };

        if cancel.is_cancelled() {
            tracing::info!(gate, "cancelled before gate ran");
            let result = GateResult::cancelled(gate);
            self.report(&result);
            return result;
        }

        let timeout = self.timeout_for(checker.as_ref());
        let result = invoke_bounded(checker, project_dir, timeout).await.normalized();

        tracing::info!(
            gate,
            passed = result.passed,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            duration_ms = result.duration.as_millis() as u64,
            "gate finished"
        );
        self.report(&result);
        result
    }

    fn report(&self, result: &GateResult) {
        if let Some(ref bus) = self.event_bus {
            bus.emit(EventKind::GateFinished {
                gate: result.gate.clone(),
                passed: result.passed,
                errors: result.errors.len(),
                duration_secs: result.duration.as_secs_f64(),
            });
        }
    }
}

/// Enforce the timeout even for checkers that ignore it. Dropping the
/// checker future drops its child process handle, which kills the child.
async fn invoke_bounded(
    checker: Arc<dyn Checker>,
    project_dir: &Path,
    timeout: Duration,
) -> GateResult {
    let name = checker.name().to_string();
    match tokio::time::timeout(timeout, checker.invoke(project_dir, timeout)).await {
        Ok(result) => {
            if result.gate != name {
                tracing::warn!(
                    gate = %name,
                    reported = %result.gate,
                    "checker reported under another name"
                );
            }
            GateResult { gate: name, ..result }
        }
        Err(_) => {
            tracing::warn!(gate = %name, ?timeout, "gate timed out");
            GateResult::timed_out(&name, timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ralph_core::gate::Verdict;

    struct Fixed(&'static str, bool);

    #[async_trait]
    impl Checker for Fixed {
        fn name(&self) -> &str {
            self.0
        }
        fn default_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
        async fn invoke(&self, _: &Path, _: Duration) -> GateResult {
            if self.1 {
                GateResult::passed(self.0, Duration::ZERO)
            } else {
                GateResult::failed(self.0, Vec::new(), Duration::ZERO)
            }
        }
    }

    fn names(gates: &[&str]) -> Vec<String> {
        gates.iter().map(|g| g.to_string()).collect()
    }

    #[tokio::test]
    async fn failing_gate_with_no_errors_is_normalized() {
        let pipeline =
            GatePipeline::new(CheckerRegistry::new().with(Arc::new(Fixed("lint", false))));
        let result = pipeline
            .run(Path::new("."), &names(&["lint"]), &CancellationToken::new())
            .await;
        assert_eq!(result.result, Verdict::Failed);
        assert_eq!(result.gates[0].errors.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_fails_registered_gates_only() {
        let pipeline =
            GatePipeline::new(CheckerRegistry::new().with(Arc::new(Fixed("types", true))));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = pipeline.run(Path::new("."), &names(&["types", "docs"]), &cancel).await;
        assert_eq!(result.gates.len(), 2);
        assert!(!result.gates[0].passed);
        assert!(result.gates[0].errors[0].message.contains("cancelled before types ran"));
        assert!(result.gates[1].passed);
    }

    #[tokio::test]
    async fn gate_events_are_emitted() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let registry = CheckerRegistry::new().with(Arc::new(Fixed("types", true)));
        let pipeline = GatePipeline::new(registry).with_event_bus(bus);
        pipeline
            .run(Path::new("."), &names(&["types"]), &CancellationToken::new())
            .await;
        let events = crate::event_bus::drain(&mut rx);
        assert!(matches!(
            &events[0].kind,
            EventKind::GateFinished { gate, passed: true, .. } if gate == "types"
        ));
    }

    #[test]
    fn timeouts_come_from_config() {
        let config = Config::from_json(r#"{"gateTimeouts": {"tests": 1500}}"#).unwrap();
        let pipeline = GatePipeline::from_config(&config);
        let tests = pipeline.registry().get("tests").unwrap();
        let types = pipeline.registry().get("types").unwrap();
        assert_eq!(pipeline.timeout_for(tests.as_ref()), Duration::from_millis(1500));
        assert_eq!(pipeline.timeout_for(types.as_ref()), Duration::from_secs(300));
    }
}
