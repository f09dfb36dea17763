//! Tracing subscriber setup and local trace storage.
//!
//! Console output is always on (plain or JSON). When a trace directory is
//! configured, every event is also appended as JSON to a daily
//! `spans-YYYY-MM-DD.jsonl` file so a run can be inspected after the fact.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Telemetry configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Whether to output JSON-structured logs to console.
    pub json_logs: bool,
    /// Log level filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Directory for local JSONL trace files. `None` disables the file layer.
    pub trace_dir: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json_logs: false,
            log_filter: "ralph=info".into(),
            trace_dir: None,
        }
    }
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    // Boxed to erase the json vs plain type difference.
    let console_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::NONE)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::NONE)
            .boxed()
    };

    // Option<Layer> is itself a Layer, a no-op when None.
    let file_layer = if let Some(ref trace_dir) = config.trace_dir {
        std::fs::create_dir_all(trace_dir).context(format!(
            "failed to create trace dir: {}",
            trace_dir.display()
        ))?;

        let today = chrono::Utc::now().format("%Y-%m-%d");
        let trace_file_path = trace_dir.join(format!("spans-{today}.jsonl"));

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&trace_file_path)
            .context(format!(
                "failed to open trace file: {}",
                trace_file_path.display()
            ))?;

        Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(Mutex::new(file))
                .with_ansi(false),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(())
}

// ─── Local Trace Reader ─────────────────────────────────────────────────

/// A stored trace event read back from a JSONL file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTraceEvent {
    pub timestamp: Option<String>,
    pub level: Option<String>,
    #[serde(default)]
    pub fields: serde_json::Value,
    pub target: Option<String>,
}

impl StoredTraceEvent {
    pub fn message(&self) -> &str {
        self.fields
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("")
    }
}

impl std::fmt::Display for StoredTraceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ts = self.timestamp.as_deref().unwrap_or("?");
        let level = self.level.as_deref().unwrap_or("?");
        let target = self.target.as_deref().unwrap_or("");

        // HH:MM:SS
        let short_ts = if ts.len() >= 19 { &ts[11..19] } else { ts };

        write!(f, "{short_ts} {level:<5} {target:<32} {}", self.message())?;

        if let serde_json::Value::Object(ref map) = self.fields {
            let interesting: Vec<_> = map.iter().filter(|(k, _)| *k != "message").collect();
            if !interesting.is_empty() {
                write!(f, " |")?;
                for (k, v) in interesting {
                    write!(f, " {k}={v}")?;
                }
            }
        }
        Ok(())
    }
}

/// Reader for locally stored JSONL trace files, newest file first.
pub struct TraceReader {
    trace_dir: PathBuf,
}

impl TraceReader {
    pub fn new(trace_dir: impl Into<PathBuf>) -> Self {
        Self {
            trace_dir: trace_dir.into(),
        }
    }

    pub fn trace_files(&self) -> Result<Vec<PathBuf>> {
        if !self.trace_dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.trace_dir)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                path.extension().is_some_and(|e| e == "jsonl").then_some(path)
            })
            .collect();
        files.sort();
        files.reverse();
        Ok(files)
    }

    /// Read up to `limit` events whose fields carry `requirement == id`,
    /// or all events when `requirement` is `None`. Malformed lines are skipped.
    pub fn read_events(
        &self,
        requirement: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredTraceEvent>> {
        let mut events = Vec::new();
        for file_path in self.trace_files()? {
            let file = std::fs::File::open(&file_path)
                .with_context(|| format!("failed to open {}", file_path.display()))?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(event) = serde_json::from_str::<StoredTraceEvent>(&line) else {
                    continue;
                };
                let keep = requirement.is_none_or(|id| {
                    event.fields.get("requirement").and_then(|v| v.as_str()) == Some(id)
                });
                if keep {
                    events.push(event);
                }
                if events.len() >= limit {
                    return Ok(events);
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn stored_event_display() {
        let event = StoredTraceEvent {
            timestamp: Some("2026-06-15T10:30:45.123Z".into()),
            level: Some("INFO".into()),
            fields: serde_json::json!({"message": "gate finished", "gate": "types"}),
            target: Some("ralph_runner::pipeline".into()),
        };
        let display = event.to_string();
        assert!(display.contains("10:30:45"));
        assert!(display.contains("gate finished"));
        assert!(display.contains("gate=\"types\""));
    }

    #[test]
    fn reader_filters_by_requirement_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("spans-2026-01-01.jsonl")).unwrap();
        let event = |message: &str, requirement: &str| {
            serde_json::json!({
                "level": "INFO",
                "fields": { "message": message, "requirement": requirement },
            })
        };
        writeln!(file, "{}", event("a", "REQ-1")).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file, "{}", event("b", "REQ-2")).unwrap();

        let reader = TraceReader::new(dir.path());
        let all = reader.read_events(None, 10).unwrap();
        assert_eq!(all.len(), 2);
        let only = reader.read_events(Some("REQ-2"), 10).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].message(), "b");
    }

    #[test]
    fn missing_dir_has_no_files() {
        let reader = TraceReader::new("/definitely/not/here");
        assert!(reader.trace_files().unwrap().is_empty());
    }
}
