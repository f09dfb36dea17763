//! Checker adapters: named producers of normalized gate results.
//!
//! The pipeline only sees the [`Checker`] trait. [`CommandChecker`] is the
//! one built-in adapter; it runs a shell command and scrapes the common
//! `path:line[:col]: [severity[rule]:] message` diagnostic shape.

use crate::subprocess::{SubprocessOutput, run_cmd};
use async_trait::async_trait;
use ralph_core::config::Config;
use ralph_core::gate::{GateError, GateResult};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lines of output quoted in a crash diagnostic.
const CRASH_TAIL_LINES: usize = 20;

/// One quality gate.
#[async_trait]
pub trait Checker: Send + Sync {
    /// Gate name as written in the config's `gates` list.
    fn name(&self) -> &str;

    /// Used when the config has no timeout override for this gate.
    fn default_timeout(&self) -> Duration;

    /// Run against `project_dir`. Failures are data, never `Err`.
    async fn invoke(&self, project_dir: &Path, timeout: Duration) -> GateResult;
}

/// Explicit gate name → checker mapping handed to the pipeline.
#[derive(Clone, Default)]
pub struct CheckerRegistry {
    checkers: BTreeMap<String, Arc<dyn Checker>>,
}

impl CheckerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`CommandChecker`] per configured (or built-in) checker spec.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for (name, spec) in config.checker_specs() {
            registry.register(Arc::new(CommandChecker::new(
                name,
                spec.command.clone(),
                spec.default_timeout(),
            )));
        }
        registry
    }

    /// Register under the checker's own name, replacing any previous entry.
    pub fn register(&mut self, checker: Arc<dyn Checker>) {
        self.checkers.insert(checker.name().to_string(), checker);
    }

    pub fn with(mut self, checker: Arc<dyn Checker>) -> Self {
        self.register(checker);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Checker>> {
        self.checkers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.checkers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.checkers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }
}

/// Runs `sh -c <command>` in the project directory.
pub struct CommandChecker {
    name: String,
    command: String,
    default_timeout: Duration,
}

impl CommandChecker {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            default_timeout,
        }
    }

    /// Turn finished process output into a gate result.
    pub fn interpret(&self, output: &SubprocessOutput, duration: Duration) -> GateResult {
        let diagnostics = parse_diagnostics(&output.combined());
        let (mut errors, warnings): (Vec<_>, Vec<_>) = diagnostics
            .into_iter()
            .partition(|(severity, _)| *severity == Severity::Error);
        let warnings: Vec<GateError> = warnings.into_iter().map(|(_, e)| e).collect();

        if output.success() {
            // The exit code is the verdict; anything parsed is advisory.
            let advisory = errors
                .iter()
                .map(|(_, e)| e)
                .chain(warnings.iter())
                .map(ToString::to_string)
                .collect();
            return GateResult::passed(&self.name, duration).with_warnings(advisory);
        }

        if errors.is_empty() && !warnings.is_empty() {
            // Tools run with warnings-as-errors still print them as warnings.
            return GateResult::failed(&self.name, warnings, duration);
        }

        if errors.is_empty() {
            let tail = output.tail(CRASH_TAIL_LINES);
            let mut message = format!(
                "{} exited with status {} and no errors could be parsed from its output",
                self.name, output.exit_code
            );
            if !tail.is_empty() {
                message.push_str(":\n");
                message.push_str(&tail);
            }
            errors.push((Severity::Error, GateError::message(message).with_rule("crash")));
        }

        GateResult::failed(&self.name, errors.into_iter().map(|(_, e)| e).collect(), duration)
            .with_warnings(warnings.iter().map(ToString::to_string).collect())
    }
}

#[async_trait]
impl Checker for CommandChecker {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    async fn invoke(&self, project_dir: &Path, timeout: Duration) -> GateResult {
        let start = Instant::now();
        tracing::debug!(gate = %self.name, command = %self.command, "running checker");

        match run_cmd(&self.command, project_dir, timeout).await {
            Ok(output) if output.timed_out => GateResult::timed_out(&self.name, timeout),
            Ok(output) => self.interpret(&output, start.elapsed()),
            Err(e) => GateResult::failed(
                &self.name,
                vec![
                    GateError::message(format!("{} could not be started: {e:#}", self.name))
                        .with_rule("crash"),
                ],
                start.elapsed(),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Scan output for `path:line[:col]: [severity[rule]:] message` lines.
///
/// Notes and help lines are dropped. Exact duplicates are reported once.
pub fn parse_diagnostics(output: &str) -> Vec<(Severity, GateError)> {
    let mut seen = std::collections::HashSet::new();
    output
        .lines()
        .filter_map(parse_line)
        .filter(|(_, e)| seen.insert(e.to_string()))
        .collect()
}

fn parse_line(raw: &str) -> Option<(Severity, GateError)> {
    let line = raw.trim();
    let (path, rest) = split_path(line)?;
    let (line_no, rest) = rest.split_once(':')?;
    let line_no: u32 = line_no.trim().parse().ok()?;

    let (column, rest) = match rest.split_once(':') {
        Some((col, tail)) if !col.is_empty() && col.chars().all(|c| c.is_ascii_digit()) => {
            (col.parse().ok(), tail)
        }
        _ => (None, rest),
    };

    let rest = rest.trim();
    let (severity, rule, message) = match rest.split_once(':') {
        Some((head, msg)) => match parse_severity(head.trim()) {
            Some((Some(severity), rule)) => (severity, rule, msg.trim()),
            // note/help: not a finding.
            Some((None, _)) => return None,
            None => (Severity::Error, None, rest),
        },
        None => (Severity::Error, None, rest),
    };
    if message.is_empty() {
        return None;
    }

    let mut err = GateError::at(path, line_no, column, message);
    if let Some(rule) = rule {
        err = err.with_rule(rule);
    }
    Some((severity, err))
}

/// Split off the leading path, keeping a Windows drive prefix (`C:\`) and
/// interior spaces. A path with spaces must still look like a file, which
/// keeps prose such as `Finished at 10:30:00: ok` out.
fn split_path(line: &str) -> Option<(&str, &str)> {
    let bytes = line.as_bytes();
    let drive = bytes.len() > 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && matches!(bytes[2], b'\\' | b'/');
    let skip = if drive { 2 } else { 0 };
    let colon = skip + line[skip..].find(':')?;
    let path = &line[..colon];
    if path.is_empty() || path.ends_with(char::is_whitespace) {
        return None;
    }
    if path.contains(char::is_whitespace) && !looks_like_file(path) {
        return None;
    }
    Some((path, &line[colon + 1..]))
}

fn looks_like_file(path: &str) -> bool {
    path.contains(['/', '\\'])
        || path.rsplit_once('.').is_some_and(|(stem, ext)| {
            !stem.is_empty() && !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
}

/// `error`, `warning[unused]`, `note` ... → (severity, rule).
/// `None` when `head` is not a severity word at all.
fn parse_severity(head: &str) -> Option<(Option<Severity>, Option<String>)> {
    let (word, rule) = match head.split_once('[') {
        Some((word, rule)) => (word, Some(rule.strip_suffix(']')?.to_string())),
        None => (head, None),
    };
    let severity = match word.to_ascii_lowercase().as_str() {
        "error" | "fatal" => Some(Severity::Error),
        "warning" | "warn" => Some(Severity::Warning),
        "note" | "help" | "info" => None,
        _ => return None,
    };
    Some((severity, rule))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stdout: &str, exit_code: i32) -> SubprocessOutput {
        SubprocessOutput {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code,
            timed_out: false,
        }
    }

    fn checker() -> CommandChecker {
        CommandChecker::new("types", "true", Duration::from_secs(5))
    }

    #[test]
    fn parses_cargo_short_format() {
        let diags = parse_diagnostics(
            "src/lib.rs:5:5: error[E0425]: cannot find value `y` in this scope\n\
             src/main.rs:3:9: warning: unused variable: `x`\n\
             src/main.rs:3:9: note: `#[warn(unused_variables)]` on by default\n\
             error: could not compile `demo` due to 1 previous error\n",
        );
        assert_eq!(diags.len(), 2);
        let (sev, err) = &diags[0];
        assert_eq!(*sev, Severity::Error);
        assert_eq!(err.file.as_deref(), Some("src/lib.rs"));
        assert_eq!(err.line, Some(5));
        assert_eq!(err.column, Some(5));
        assert_eq!(err.rule.as_deref(), Some("E0425"));
        assert_eq!(err.message, "cannot find value `y` in this scope");
        assert_eq!(diags[1].0, Severity::Warning);
    }

    #[test]
    fn parses_without_column_or_severity() {
        let diags = parse_diagnostics("app/models.py:12: Incompatible return value type\n");
        assert_eq!(diags.len(), 1);
        let (sev, err) = &diags[0];
        assert_eq!(*sev, Severity::Error);
        assert_eq!(err.column, None);
        assert_eq!(err.message, "Incompatible return value type");
    }

    #[test]
    fn keeps_drive_prefixes_and_spaced_paths() {
        let diags = parse_diagnostics(
            "C:\\src\\lib.rs:3:1: error: x\n\
             my dir/lib.rs:2: error: y\n\
             D:/work/app.py:7:4: warning[W0611]: unused import\n",
        );
        assert_eq!(diags.len(), 3);
        assert_eq!(diags[0].1.file.as_deref(), Some("C:\\src\\lib.rs"));
        assert_eq!((diags[0].1.line, diags[0].1.column), (Some(3), Some(1)));
        assert_eq!(diags[0].1.message, "x");
        assert_eq!(diags[1].1.file.as_deref(), Some("my dir/lib.rs"));
        assert_eq!(diags[1].1.line, Some(2));
        assert_eq!(diags[1].1.message, "y");
        assert_eq!(diags[2].0, Severity::Warning);
        assert_eq!(diags[2].1.file.as_deref(), Some("D:/work/app.py"));
        assert_eq!(diags[2].1.rule.as_deref(), Some("W0611"));
    }

    #[test]
    fn spaced_prose_with_clock_times_is_not_a_path() {
        assert!(parse_diagnostics("Note at 10:30:00: something\n").is_empty());
        assert!(parse_diagnostics("2024-01-01 10:30:00: error: flaky\n").is_empty());
    }

    #[test]
    fn ignores_prose_and_timestamps() {
        assert!(parse_diagnostics("Compiling demo v0.1.0\nFinished in 12:30 seconds\n").is_empty());
        assert!(parse_diagnostics("running 3 tests\ntest result: ok.").is_empty());
    }

    #[test]
    fn duplicates_are_collapsed() {
        let line = "src/a.rs:1:1: error: boom\n";
        assert_eq!(parse_diagnostics(&line.repeat(3)).len(), 1);
    }

    #[test]
    fn exit_zero_passes_with_warnings() {
        let out = output("src/a.rs:1:1: warning: unused import\n", 0);
        let r = checker().interpret(&out, Duration::ZERO);
        assert!(r.passed);
        assert!(r.errors.is_empty());
        assert_eq!(r.warnings, vec!["src/a.rs:1:1 — unused import"]);
    }

    #[test]
    fn nonzero_with_errors_fails() {
        let r = checker().interpret(
            &output("src/a.rs:1:1: error: one\nsrc/b.rs:2:2: error: two\n", 101),
            Duration::ZERO,
        );
        assert!(!r.passed);
        assert_eq!(r.errors.len(), 2);
    }

    #[test]
    fn nonzero_with_only_warnings_promotes_them() {
        let r = checker().interpret(&output("src/a.rs:1:1: warning: unused\n", 1), Duration::ZERO);
        assert!(!r.passed);
        assert_eq!(r.errors.len(), 1);
        assert_eq!(r.errors[0].message, "unused");
    }

    #[test]
    fn nonzero_with_garbage_is_a_crash_diagnostic() {
        let r = checker().interpret(&output("Segmentation fault\n", 139), Duration::ZERO);
        assert!(!r.passed);
        assert_eq!(r.errors.len(), 1);
        assert_eq!(r.errors[0].rule.as_deref(), Some("crash"));
        assert!(r.errors[0].message.contains("status 139"));
        assert!(r.errors[0].message.contains("Segmentation fault"));
    }

    #[tokio::test]
    async fn command_checker_runs_shell() {
        let dir = tempfile::tempdir().unwrap();
        let checker = CommandChecker::new(
            "lint",
            "echo 'src/x.rs:4:2: error[E1]: bad thing'; exit 1",
            Duration::from_secs(5),
        );
        let r = checker.invoke(dir.path(), checker.default_timeout()).await;
        assert!(!r.passed);
        assert_eq!(r.errors[0].to_string(), "src/x.rs:4:2 — bad thing [E1]");
    }

    #[tokio::test]
    async fn command_checker_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let checker = CommandChecker::new("tests", "sleep 5", Duration::from_secs(5));
        let r = checker.invoke(dir.path(), Duration::from_millis(100)).await;
        assert!(!r.passed);
        assert_eq!(r.errors.len(), 1);
        assert_eq!(r.errors[0].rule.as_deref(), Some("timeout"));
    }

    #[test]
    fn registry_from_default_config() {
        let registry = CheckerRegistry::from_config(&Config::default());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["lint", "tests", "types"]);
        assert!(registry.get("docs").is_none());
    }
}
