//! Per-slug project status files.
//!
//! One JSON document per slug at `<status_dir>/<slug>.json`, replaced
//! atomically on every write. Concurrent writers are last-writer-wins.

use crate::atomic::{self, TMP_SUFFIX};
use ralph_core::config::Config;
use ralph_core::error::StatusError;
use ralph_core::status::ProjectStatus;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StatusStore {
    dir: PathBuf,
}

impl StatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at the configured status directory of a project.
    pub fn for_project(project_dir: &Path, config: &Config) -> Self {
        Self::new(config.status_dir(project_dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, slug: &str) -> PathBuf {
        self.dir.join(format!("{slug}.json"))
    }

    /// Load and validate the status for `slug`.
    pub fn read(&self, slug: &str) -> Result<ProjectStatus, StatusError> {
        let path = self.path_for(slug);
        check_slug(slug, &path)?;

        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StatusError::NotFound {
                    slug: slug.to_string(),
                    path,
                });
            }
            Err(source) => return Err(StatusError::Io { path, source }),
        };

        let status: ProjectStatus =
            serde_json::from_str(&contents).map_err(|e| StatusError::Validation {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        status
            .validate(slug)
            .map_err(|reason| StatusError::Validation { path, reason })?;
        Ok(status)
    }

    /// Like [`read`](Self::read), but a missing file is `Ok(None)`.
    pub fn try_read(&self, slug: &str) -> Result<Option<ProjectStatus>, StatusError> {
        match self.read(slug) {
            Ok(status) => Ok(Some(status)),
            Err(StatusError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Atomically replace the status for `slug`.
    ///
    /// Blocks on fsync and on rename backoff; async callers go through
    /// `tokio::task::spawn_blocking`.
    pub fn write(&self, slug: &str, status: &ProjectStatus) -> Result<(), StatusError> {
        let path = self.path_for(slug);
        check_slug(slug, &path)?;
        status
            .validate(slug)
            .map_err(|reason| StatusError::Validation {
                path: path.clone(),
                reason,
            })?;

        atomic::write_json(&path, status).map_err(|source| StatusError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(slug, path = %path.display(), "status written");
        Ok(())
    }

    /// Slugs with a valid status file, sorted. Temp files and invalid
    /// documents are skipped.
    pub fn list(&self) -> Result<Vec<String>, StatusError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StatusError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut slugs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StatusError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TMP_SUFFIX) || name.starts_with('.') {
                continue;
            }
            let Some(slug) = name.strip_suffix(".json") else {
                continue;
            };
            match self.read(slug) {
                Ok(_) => slugs.push(slug.to_string()),
                Err(e) => tracing::warn!(slug, error = %e, "skipping unreadable status file"),
            }
        }
        slugs.sort();
        Ok(slugs)
    }
}

fn check_slug(slug: &str, path: &Path) -> Result<(), StatusError> {
    let ok = !slug.is_empty()
        && slug != "."
        && slug != ".."
        && !slug.contains(['/', '\\'])
        && !slug.ends_with(TMP_SUFFIX);
    if ok {
        Ok(())
    } else {
        Err(StatusError::Validation {
            path: path.to_path_buf(),
            reason: format!("invalid slug {slug:?}"),
        })
    }
}
