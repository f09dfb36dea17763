//! Last standalone verify result, reused inside the freshness window.

use crate::atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ralph_core::config::RALPH_DIR;
use ralph_core::gate::PipelineResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const VERIFY_CACHE_FILE: &str = "last-verify.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedVerify {
    pub recorded_at: DateTime<Utc>,
    pub gates: Vec<String>,
    pub result: PipelineResult,
}

impl CachedVerify {
    /// Reusable when it passed, covers the same gate list, and is younger
    /// than `freshness` at `now`.
    pub fn is_fresh(&self, gates: &[String], freshness: Duration, now: DateTime<Utc>) -> bool {
        if !self.result.passed() || self.gates != gates {
            return false;
        }
        let age = now.signed_duration_since(self.recorded_at);
        match age.to_std() {
            Ok(age) => age < freshness,
            // Recorded in the future: clock skew, do not trust it.
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifyCache {
    path: PathBuf,
}

impl VerifyCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_project(project_dir: &Path) -> Self {
        Self::new(project_dir.join(RALPH_DIR).join(VERIFY_CACHE_FILE))
    }

    /// The cached entry, or `None` when absent or unreadable.
    pub fn load(&self) -> Option<CachedVerify> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(cached) => Some(cached),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "ignoring corrupt verify cache"
                );
                None
            }
        }
    }

    /// A cached PASSED result usable for `gates` right now.
    pub fn fresh(&self, gates: &[String], freshness: Duration) -> Option<CachedVerify> {
        self.load()
            .filter(|cached| cached.is_fresh(gates, freshness, Utc::now()))
    }

    pub fn store(&self, gates: &[String], result: &PipelineResult) -> Result<()> {
        let entry = CachedVerify {
            recorded_at: Utc::now(),
            gates: gates.to_vec(),
            result: result.clone(),
        };
        atomic::write_json(&self.path, &entry)
            .with_context(|| format!("failed to write verify cache {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ralph_core::gate::{GateError, GateResult};

    fn gates() -> Vec<String> {
        vec!["types".into(), "lint".into()]
    }

    fn passing() -> PipelineResult {
        PipelineResult::from_gates(vec![
            GateResult::passed("types", Duration::ZERO),
            GateResult::passed("lint", Duration::ZERO),
        ])
    }

    #[test]
    fn fresh_pass_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VerifyCache::for_project(dir.path());
        assert!(cache.load().is_none());

        cache.store(&gates(), &passing()).unwrap();
        let hit = cache.fresh(&gates(), Duration::from_secs(600)).unwrap();
        assert_eq!(hit.result, passing());
    }

    #[test]
    fn different_gate_list_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VerifyCache::for_project(dir.path());
        cache.store(&gates(), &passing()).unwrap();
        assert!(cache.fresh(&["types".to_string()], Duration::from_secs(600)).is_none());
    }

    #[test]
    fn failures_and_stale_entries_are_not_reused() {
        let now = Utc::now();
        let failed = CachedVerify {
            recorded_at: now,
            gates: gates(),
            result: PipelineResult::from_gates(vec![GateResult::failed(
                "types",
                vec![GateError::message("boom")],
                Duration::ZERO,
            )]),
        };
        assert!(!failed.is_fresh(&gates(), Duration::from_secs(600), now));

        let stale = CachedVerify {
            recorded_at: now - chrono::Duration::minutes(11),
            gates: gates(),
            result: passing(),
        };
        assert!(!stale.is_fresh(&gates(), Duration::from_secs(600), now));
        assert!(stale.is_fresh(&gates(), Duration::from_secs(3600), now));
    }

    #[test]
    fn corrupt_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VerifyCache::for_project(dir.path());
        std::fs::create_dir_all(dir.path().join(RALPH_DIR)).unwrap();
        std::fs::write(dir.path().join(RALPH_DIR).join(VERIFY_CACHE_FILE), "nope").unwrap();
        assert!(cache.load().is_none());
    }
}
