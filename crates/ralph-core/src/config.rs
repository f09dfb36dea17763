//! Run configuration loaded from `<project>/.ralph/config.json`.
//!
//! Every key is optional. A missing file yields the defaults; a file that is
//! present but malformed or out of range is a [`ConfigError`] and stops the
//! run before any gate executes.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory under the project root holding config, requirements and status.
pub const RALPH_DIR: &str = ".ralph";
pub const CONFIG_FILE: &str = "config.json";
pub const REQUIREMENTS_FILE: &str = "requirements.toml";

/// How to run one gate as a shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckerSpec {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl CheckerSpec {
    fn new(command: &str, timeout_ms: u64) -> Self {
        Self {
            command: command.to_string(),
            timeout_ms: Some(timeout_ms),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_CHECKER_TIMEOUT_MS))
    }
}

const DEFAULT_CHECKER_TIMEOUT_MS: u64 = 300_000;

/// The coding agent command.
///
/// The prompt reaches the agent on stdin unless `args` name it: `{prompt}`
/// is replaced by the prompt text and `{prompt_file}` by the path of a
/// temporary file holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_agent_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_agent_timeout_ms() -> u64 {
    1_800_000
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            command: "claude".into(),
            args: vec![
                "-p".into(),
                "--dangerously-skip-permissions".into(),
            ],
            timeout_ms: default_agent_timeout_ms(),
        }
    }
}

impl AgentSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Immutable per-run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_gates")]
    pub gates: Vec<String>,
    /// Per-gate timeout overrides in milliseconds.
    #[serde(default)]
    pub gate_timeouts: BTreeMap<String, u64>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Freshness window for cached verify results, in milliseconds.
    #[serde(default = "default_verify_freshness")]
    pub verify_freshness: u64,
    /// Checker commands, overlaid on [`default_checkers`] by name.
    #[serde(default)]
    pub checkers: BTreeMap<String, CheckerSpec>,
    #[serde(default)]
    pub agent: AgentSpec,
    /// Status directory, relative to the project root.
    #[serde(default = "default_status_dir")]
    pub status_dir: PathBuf,
}

fn default_gates() -> Vec<String> {
    vec!["types".into(), "lint".into(), "tests".into()]
}

fn default_max_iterations() -> u32 {
    5
}

fn default_verify_freshness() -> u64 {
    600_000
}

fn default_status_dir() -> PathBuf {
    Path::new(RALPH_DIR).join("status")
}

/// Built-in checkers for a cargo project.
pub fn default_checkers() -> BTreeMap<String, CheckerSpec> {
    BTreeMap::from([
        (
            "types".to_string(),
            CheckerSpec::new("cargo check --message-format short", 300_000),
        ),
        (
            "lint".to_string(),
            CheckerSpec::new("cargo clippy --message-format short -- -D warnings", 300_000),
        ),
        ("tests".to_string(), CheckerSpec::new("cargo test", 600_000)),
    ])
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gates: default_gates(),
            gate_timeouts: BTreeMap::new(),
            max_iterations: default_max_iterations(),
            verify_freshness: default_verify_freshness(),
            checkers: BTreeMap::new(),
            agent: AgentSpec::default(),
            status_dir: default_status_dir(),
        }
    }
}

impl Config {
    /// Path of the config file for a project root.
    pub fn path_for(project_dir: &Path) -> PathBuf {
        project_dir.join(RALPH_DIR).join(CONFIG_FILE)
    }

    /// Load `<project>/.ralph/config.json`, falling back to defaults.
    pub fn for_project(project_dir: &Path) -> Result<Self, ConfigError> {
        Self::load(&Self::path_for(project_dir))
    }

    /// Load from a JSON file. Returns defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::info!(
            gates = ?config.gates,
            max_iterations = config.max_iterations,
            path = %path.display(),
            "loaded config"
        );
        Ok(config)
    }

    /// Parse and validate an in-memory JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::Validation(
                "maxIterations must be greater than 0".into(),
            ));
        }
        if self.gates.is_empty() {
            return Err(ConfigError::Validation("gates must not be empty".into()));
        }
        if let Some(gate) = self.gates.iter().find(|g| g.trim().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "gate names must not be blank (got {gate:?})"
            )));
        }
        if let Some((gate, _)) = self.gate_timeouts.iter().find(|(_, ms)| **ms == 0) {
            return Err(ConfigError::Validation(format!(
                "gateTimeouts.{gate} must be greater than 0"
            )));
        }
        for (name, spec) in &self.checkers {
            if spec.command.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "checkers.{name}.command must not be empty"
                )));
            }
            if spec.timeout_ms == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "checkers.{name}.timeoutMs must be greater than 0"
                )));
            }
        }
        if self.agent.command.trim().is_empty() {
            return Err(ConfigError::Validation("agent.command must not be empty".into()));
        }
        if self.agent.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "agent.timeoutMs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Explicit per-gate timeout, if configured.
    pub fn gate_timeout(&self, gate: &str) -> Option<Duration> {
        self.gate_timeouts.get(gate).copied().map(Duration::from_millis)
    }

    pub fn verify_freshness(&self) -> Duration {
        Duration::from_millis(self.verify_freshness)
    }

    /// Built-in checkers with the configured ones laid over them.
    pub fn checker_specs(&self) -> BTreeMap<String, CheckerSpec> {
        let mut specs = default_checkers();
        specs.extend(self.checkers.clone());
        specs
    }

    pub fn status_dir(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.status_dir)
    }
}
