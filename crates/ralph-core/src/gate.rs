//! Normalized gate results and the aggregated pipeline verdict.
//!
//! Every checker, whatever tool it wraps, reports through these types.
//! The pipeline in `ralph-runner` only ever constructs and aggregates them;
//! the convergence loop only ever renders them back into prompt text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Maximum diagnostics kept per gate before the overflow trailer.
pub const MAX_ERRORS_PER_GATE: usize = 50;

/// A single diagnostic produced by a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl GateError {
    /// A diagnostic with no source location.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            file: None,
            line: None,
            column: None,
            message: message.into(),
            rule: None,
            remediation: None,
        }
    }

    pub fn at(
        file: impl Into<String>,
        line: u32,
        column: Option<u32>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            file: Some(file.into()),
            line: Some(line),
            column,
            ..Self::message(message)
        }
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    /// Fill `remediation` from the hint table if nothing set it already.
    pub fn with_derived_remediation(mut self) -> Self {
        if self.remediation.is_none() {
            self.remediation = remediation_for(self.rule.as_deref(), &self.message);
        }
        self
    }

    /// `file:line[:column]`, or `None` for location-less diagnostics.
    pub fn location(&self) -> Option<String> {
        let file = self.file.as_deref()?;
        Some(match (self.line, self.column) {
            (Some(l), Some(c)) => format!("{file}:{l}:{c}"),
            (Some(l), None) => format!("{file}:{l}"),
            _ => file.to_string(),
        })
    }
}

impl fmt::Display for GateError {
    /// `file:line[:column] — message [rule]`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(loc) = self.location() {
            write!(f, "{loc} — ")?;
        }
        write!(f, "{}", self.message)?;
        if let Some(ref rule) = self.rule {
            write!(f, " [{rule}]")?;
        }
        Ok(())
    }
}

/// Outcome of one gate in one pipeline run. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub passed: bool,
    #[serde(default)]
    pub errors: Vec<GateError>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

impl GateResult {
    pub fn passed(gate: impl Into<String>, duration: Duration) -> Self {
        Self {
            gate: gate.into(),
            passed: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            duration,
        }
    }

    pub fn failed(gate: impl Into<String>, errors: Vec<GateError>, duration: Duration) -> Self {
        Self {
            gate: gate.into(),
            passed: false,
            errors,
            warnings: Vec::new(),
            duration,
        }
    }

    /// Lenient result for a gate name with no registered checker.
    pub fn unknown(gate: &str) -> Self {
        Self {
            gate: gate.to_string(),
            passed: true,
            errors: Vec::new(),
            warnings: vec![format!("{gate} is not in the verify pipeline")],
            duration: Duration::ZERO,
        }
    }

    pub fn timed_out(gate: &str, timeout: Duration) -> Self {
        Self::failed(
            gate,
            vec![
                GateError::message(format!(
                    "{gate} timed out after {}s and was terminated",
                    timeout.as_secs_f64()
                ))
                .with_rule("timeout")
                .with_derived_remediation(),
            ],
            timeout,
        )
    }

    pub fn cancelled(gate: &str) -> Self {
        Self::failed(
            gate,
            vec![GateError::message(format!(
                "verification was cancelled before {gate} ran"
            ))],
            Duration::ZERO,
        )
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    /// Enforce the output contract every caller relies on:
    ///
    /// - a failed gate carries at least one diagnostic
    /// - at most [`MAX_ERRORS_PER_GATE`] diagnostics plus one overflow trailer
    /// - diagnostics get a remediation hint where one is known
    pub fn normalized(mut self) -> Self {
        if !self.passed && self.errors.is_empty() {
            self.errors.push(GateError::message(format!(
                "{} failed but no errors could be parsed from its output",
                self.gate
            )));
        }
        if self.errors.len() > MAX_ERRORS_PER_GATE {
            let omitted = self.errors.len() - MAX_ERRORS_PER_GATE;
            self.errors.truncate(MAX_ERRORS_PER_GATE);
            self.errors.push(GateError::message(format!(
                "... {omitted} more errors omitted"
            )));
        }
        self.errors = self
            .errors
            .into_iter()
            .map(GateError::with_derived_remediation)
            .collect();
        self
    }
}

/// Overall pipeline verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Passed,
    Failed,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Passed => write!(f, "PASSED"),
            Verdict::Failed => write!(f, "FAILED"),
        }
    }
}

/// Aggregated result of one pipeline run, gates in requested order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub result: Verdict,
    pub gates: Vec<GateResult>,
}

impl PipelineResult {
    /// Aggregate gate results. The verdict is derived, never supplied.
    pub fn from_gates(gates: Vec<GateResult>) -> Self {
        let result = if gates.iter().all(|g| g.passed) {
            Verdict::Passed
        } else {
            Verdict::Failed
        };
        Self { result, gates }
    }

    pub fn passed(&self) -> bool {
        self.result == Verdict::Passed
    }

    pub fn failing_gates(&self) -> impl Iterator<Item = &GateResult> {
        self.gates.iter().filter(|g| !g.passed)
    }

    pub fn error_count(&self) -> usize {
        self.failing_gates().map(|g| g.errors.len()).sum()
    }

    pub fn total_duration(&self) -> Duration {
        self.gates.iter().map(|g| g.duration).sum()
    }

    /// Render failing gates as actionable text, grouped per gate.
    ///
    /// Empty for a passing result.
    pub fn failure_report(&self) -> String {
        let mut out = String::new();
        for gate in self.failing_gates() {
            let n = gate.errors.len();
            out.push_str(&format!(
                "### {} ({n} error{})\n",
                gate.gate,
                if n == 1 { "" } else { "s" }
            ));
            for err in &gate.errors {
                out.push_str(&format!("- {err}\n"));
                if let Some(ref hint) = err.remediation {
                    out.push_str(&format!("  hint: {hint}\n"));
                }
            }
            out.push('\n');
        }
        out
    }
}

const UNRESOLVED_IMPORT: &str =
    "An import does not resolve. Check the module path and that the dependency is declared.";
const MISMATCHED_TYPES: &str = "Types do not match. Compare the expected and found types \
     and convert or change the signature.";

/// Static hint table. Matched against the rule first, then the message.
const REMEDIATIONS: &[(&str, &str)] = &[
    (
        "timeout",
        "The check ran past its time budget. Look for hangs or infinite loops, \
         or raise gateTimeouts for this gate.",
    ),
    (
        "unused",
        "Remove the unused item or prefix it with an underscore if it is intentionally unused.",
    ),
    (
        "e0425",
        "A name is not in scope. Check spelling, add the missing `use`, or declare the item.",
    ),
    ("e0432", UNRESOLVED_IMPORT),
    ("unresolved import", UNRESOLVED_IMPORT),
    ("e0308", MISMATCHED_TYPES),
    ("mismatched types", MISMATCHED_TYPES),
    (
        "test failed",
        "A test assertion failed. Read the assertion output and fix the implementation, \
         not the test.",
    ),
    ("panicked", "Code panicked at runtime. Handle the failing case instead of unwrapping."),
    ("fmt", "Run the formatter and commit the result."),
];

/// Derive a remediation hint from a rule id and message.
pub fn remediation_for(rule: Option<&str>, message: &str) -> Option<String> {
    let rule = rule.map(str::to_lowercase);
    let message = message.to_lowercase();
    REMEDIATIONS
        .iter()
        .find(|(key, _)| rule.as_deref().is_some_and(|r| r.contains(key)))
        .or_else(|| REMEDIATIONS.iter().find(|(key, _)| message.contains(key)))
        .map(|(_, hint)| hint.to_string())
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
