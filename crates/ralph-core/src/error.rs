//! Structural error kinds.
//!
//! Only configuration, graph, lifecycle and status failures are errors.
//! A gate that fails is data (`GateResult::passed == false`) and never
//! shows up here.

use crate::lifecycle::ProjectState;
use std::path::PathBuf;
use thiserror::Error;

/// Malformed or invalid run configuration. Fatal before any gate runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Validation(String),
}

/// Problems with the declared requirement graph, detected at load time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("requirement {requirement} depends on unknown requirement {dependency}")]
    UnknownDependency {
        requirement: String,
        dependency: String,
    },

    #[error("requirement {0} is declared more than once")]
    DuplicateRequirement(String),
}

/// A lifecycle move that is not strictly forward.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: ProjectState, to: ProjectState },
}

/// Failures reading or writing a persisted `ProjectStatus`.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("no status for slug {slug} at {path}")]
    NotFound { slug: String, path: PathBuf },

    #[error("status file {path} is invalid: {reason}")]
    Validation { path: PathBuf, reason: String },

    #[error("status io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
