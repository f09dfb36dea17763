//! Agent prompt for one iteration of one requirement.

use crate::gate::PipelineResult;
use crate::requirement::Requirement;

/// Everything iteration `k` of a requirement is grounded in.
#[derive(Debug, Clone)]
pub struct IterationContext<'a> {
    pub overview: &'a str,
    pub requirement: &'a Requirement,
    /// Dependencies that already succeeded, in dependency order.
    pub completed_dependencies: Vec<&'a Requirement>,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Failing result of iteration `k - 1`. Ignored on the first iteration.
    pub previous_failure: Option<&'a PipelineResult>,
    /// Extra escalation text from convergence analysis, may be empty.
    pub augmentation: String,
}

impl IterationContext<'_> {
    pub fn render(&self) -> String {
        let mut prompt = String::new();

        if !self.overview.trim().is_empty() {
            prompt.push_str("# Project Overview\n\n");
            prompt.push_str(self.overview.trim_end());
            prompt.push_str("\n\n");
        }

        if !self.completed_dependencies.is_empty() {
            prompt.push_str("# Completed Dependencies\n\n");
            prompt.push_str(
                "These requirements are already implemented and verified. Build on them.\n\n",
            );
            for dep in &self.completed_dependencies {
                prompt.push_str(&dep.to_markdown());
            }
        }

        prompt.push_str(&format!(
            "# Current Requirement (iteration {} of {})\n\n",
            self.iteration, self.max_iterations
        ));
        prompt.push_str(&self.requirement.to_markdown());

        if self.iteration > 1
            && let Some(failure) = self.previous_failure
            && !failure.passed()
        {
            prompt.push_str("# Previous Attempt Failed Verification\n\n");
            prompt.push_str(
                "Fix every diagnostic below. Do not weaken or delete checks to make them pass.\n\n",
            );
            prompt.push_str(&failure.failure_report());
            prompt.push_str(&self.augmentation);
        }

        prompt.push_str(
            "\nWhen you are done, leave the working tree in a state where every \
             quality gate passes.\n",
        );
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{GateError, GateResult};
    use std::time::Duration;

    fn req() -> Requirement {
        let mut r = Requirement::new("REQ-2", "Write output");
        r.body = "Write the converted rows.".into();
        r.acceptance_criteria = vec!["Writes a valid file".into()];
        r
    }

    #[test]
    fn first_iteration_has_no_failure_section() {
        let dep = Requirement::new("REQ-1", "Parse input");
        let requirement = req();
        let failure = PipelineResult::from_gates(vec![GateResult::failed(
            "types",
            vec![GateError::message("stale")],
            Duration::ZERO,
        )]);
        let prompt = IterationContext {
            overview: "A converter.",
            requirement: &requirement,
            completed_dependencies: vec![&dep],
            iteration: 1,
            max_iterations: 5,
            previous_failure: Some(&failure),
            augmentation: String::new(),
        }
        .render();

        assert!(prompt.contains("# Project Overview\n\nA converter."));
        assert!(prompt.contains("REQ-1"));
        assert!(prompt.contains("iteration 1 of 5"));
        assert!(prompt.contains("- [ ] Writes a valid file"));
        assert!(!prompt.contains("Previous Attempt"));
        assert!(!prompt.contains("stale"));
    }

    #[test]
    fn retry_includes_grouped_failures_and_augmentation() {
        let requirement = req();
        let failure = PipelineResult::from_gates(vec![
            GateResult::failed(
                "types",
                vec![
                    GateError::at("src/out.rs", 4, Some(2), "mismatched types")
                        .with_rule("E0308"),
                ],
                Duration::ZERO,
            ),
            GateResult::passed("lint", Duration::ZERO),
        ]);
        let prompt = IterationContext {
            overview: "",
            requirement: &requirement,
            completed_dependencies: Vec::new(),
            iteration: 2,
            max_iterations: 3,
            previous_failure: Some(&failure),
            augmentation: "\n## Repeated Failure\n".into(),
        }
        .render();

        assert!(!prompt.contains("Project Overview"));
        assert!(prompt.contains("### types (1 error)"));
        assert!(prompt.contains("src/out.rs:4:2 — mismatched types [E0308]"));
        assert!(prompt.contains("## Repeated Failure"));
        let overview_pos = prompt.find("Current Requirement").unwrap();
        let failure_pos = prompt.find("Previous Attempt").unwrap();
        assert!(overview_pos < failure_pos);
    }
}
