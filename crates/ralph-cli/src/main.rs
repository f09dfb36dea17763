use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ralph_core::config::{Config, RALPH_DIR, REQUIREMENTS_FILE};
use ralph_core::lifecycle::{ProjectState, transition};
use ralph_core::requirement::{RequirementGraph, RequirementsFile};
use ralph_core::telemetry::{TelemetryConfig, TraceReader, init_telemetry};
use ralph_runner::backend::{AgentBackend, CliAgentBackend};
use ralph_runner::engine::{ConvergenceLoop, EngineConfig};
use ralph_runner::event_bus::EventBus;
use ralph_runner::pipeline::GatePipeline;
use ralph_runner::tracker::{LINEAR_API_KEY_VAR, LinearTracker, Tracker};
use ralph_store::{StatusStore, VerifyCache};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const TRACES_DIR: &str = "traces";

#[derive(Parser)]
#[command(
    name = "ralph",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("RALPH_GIT_COMMIT"), ")"),
    about = "Drive a coding agent through requirements until every quality gate passes"
)]
struct Cli {
    /// Project root (holds the .ralph directory).
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Directory for JSONL trace files [default: <project-dir>/.ralph/traces].
    #[arg(long)]
    trace_dir: Option<PathBuf>,

    /// Output JSON-structured logs to console.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the convergence loop over every outstanding requirement.
    Run {
        /// Status slug for this run.
        #[arg(long, default_value = "default")]
        slug: String,
        /// Stop after the first requirement that gets dispatched.
        #[arg(long)]
        once: bool,
        /// Tracker project to mirror lifecycle into (needs LINEAR_API_KEY).
        #[arg(long)]
        project_id: Option<String>,
    },
    /// Run the gate pipeline once against the working tree.
    Verify {
        /// Comma-separated gate list; defaults to the configured gates.
        #[arg(long, value_delimiter = ',')]
        gates: Vec<String>,
        /// Ignore a fresh cached result.
        #[arg(long)]
        force: bool,
    },
    /// Show recorded status for one slug, or list all slugs.
    Status {
        #[arg(long)]
        slug: Option<String>,
    },
    /// Print requirements in the order the loop will work on them.
    Plan,
    /// Check whether a project lifecycle move is allowed.
    Transition { from: String, to: String },
    /// Show events from local trace files.
    Traces {
        /// Only events mentioning this requirement.
        #[arg(long)]
        requirement: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let trace_dir = cli.trace_dir();

    let telemetry_config = TelemetryConfig {
        json_logs: cli.json_logs,
        trace_dir: Some(trace_dir.clone()),
        ..TelemetryConfig::default()
    };
    init_telemetry(&telemetry_config)?;

    let project_dir = cli.project_dir.as_path();
    match cli.command {
        Commands::Run {
            slug,
            once,
            project_id,
        } => cmd_run(project_dir, slug, once, project_id).await,
        Commands::Verify { gates, force } => cmd_verify(project_dir, gates, force).await,
        Commands::Status { slug } => cmd_status(project_dir, slug.as_deref()),
        Commands::Plan => cmd_plan(project_dir),
        Commands::Transition { from, to } => cmd_transition(&from, &to),
        Commands::Traces { requirement, limit } => {
            cmd_traces(&trace_dir, requirement.as_deref(), limit)
        }
    }
}

impl Cli {
    /// Where traces are written and read back, so both sides agree.
    fn trace_dir(&self) -> PathBuf {
        self.trace_dir
            .clone()
            .unwrap_or_else(|| self.project_dir.join(RALPH_DIR).join(TRACES_DIR))
    }
}

// ─── Shared setup ───────────────────────────────────────────────────────

fn load_config(project_dir: &Path) -> Result<Config> {
    Config::for_project(project_dir).context("failed to load .ralph/config.json")
}

fn load_graph(project_dir: &Path) -> Result<RequirementGraph> {
    let path = project_dir.join(RALPH_DIR).join(REQUIREMENTS_FILE);
    let file = RequirementsFile::load(&path)?;
    RequirementGraph::from_file(file)
        .with_context(|| format!("invalid requirement graph in {}", path.display()))
}

/// Cancel `token` on Ctrl-C. In-flight gates and the agent are killed when
/// their futures are dropped.
fn cancel_on_ctrl_c(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl+C, stopping after the current step");
            token.cancel();
        }
    });
}

/// Print every bus event to stdout until the bus is dropped.
fn spawn_event_printer(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => println!("{event}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

// ─── Commands ───────────────────────────────────────────────────────────

async fn cmd_run(
    project_dir: &Path,
    slug: String,
    once: bool,
    project_id: Option<String>,
) -> Result<()> {
    let config = load_config(project_dir)?;
    let graph = load_graph(project_dir)?;

    let agent = CliAgentBackend::from_spec(&config.agent);
    if let Err(e) = agent.health_check().await {
        anyhow::bail!("agent is not runnable: {e:#}");
    }

    let bus = EventBus::new();
    let printer = spawn_event_printer(&bus);

    let mut engine_config = EngineConfig::new(project_dir.to_path_buf(), slug, &config);
    engine_config.once = once;
    engine_config.external_project_id = project_id;

    let pipeline = GatePipeline::from_config(&config).with_event_bus(bus.clone());
    let store = StatusStore::for_project(project_dir, &config);
    let mut engine = ConvergenceLoop::new(engine_config, graph, pipeline, Arc::new(agent), store)
        .with_event_bus(bus.clone());

    if std::env::var_os(LINEAR_API_KEY_VAR).is_some() {
        let tracker: Arc<dyn Tracker> = Arc::new(LinearTracker::from_env()?);
        tracing::info!(tracker = tracker.name(), "lifecycle sync enabled");
        engine = engine.with_tracker(tracker);
    }

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    let report = engine.run(&cancel).await;
    drop(engine);
    drop(bus);
    let _ = printer.await;
    let report = report?;

    print!("\n{}", report.summary());
    if let Some(state) = report.project_state {
        println!("project lifecycle: {state}");
    }

    if report.interrupted {
        anyhow::bail!("run interrupted");
    }
    let unfinished = report.requirements.len() - report.count("SUCCEEDED");
    if unfinished > 0 {
        anyhow::bail!("{unfinished} requirement(s) did not converge");
    }
    Ok(())
}

async fn cmd_verify(project_dir: &Path, gates: Vec<String>, force: bool) -> Result<()> {
    let config = load_config(project_dir)?;
    let gates = if gates.is_empty() { config.gates.clone() } else { gates };
    let cache = VerifyCache::for_project(project_dir);

    if !force && let Some(cached) = cache.fresh(&gates, config.verify_freshness()) {
        println!(
            "PASSED (cached from {}, use --force to rerun)",
            cached.recorded_at.format("%H:%M:%S")
        );
        return Ok(());
    }

    let bus = EventBus::new();
    let printer = spawn_event_printer(&bus);
    let pipeline = GatePipeline::from_config(&config).with_event_bus(bus.clone());

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);
    let result = pipeline.run(project_dir, &gates, &cancel).await;
    drop(pipeline);
    drop(bus);
    let _ = printer.await;

    let stored = {
        let (gates, result) = (gates.clone(), result.clone());
        tokio::task::spawn_blocking(move || cache.store(&gates, &result)).await
    };
    match stored {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "could not write verify cache"),
        Err(e) => tracing::warn!(error = %e, "verify cache writer task failed"),
    }

    for gate in &result.gates {
        for warning in &gate.warnings {
            println!("warning ({}): {warning}", gate.gate);
        }
    }
    if result.passed() {
        println!("{} ({:.1}s)", result.result, result.total_duration().as_secs_f64());
        Ok(())
    } else {
        println!("\n{}", result.failure_report());
        anyhow::bail!(
            "{} error(s) across {} failing gate(s)",
            result.error_count(),
            result.failing_gates().count()
        )
    }
}

fn cmd_status(project_dir: &Path, slug: Option<&str>) -> Result<()> {
    let config = load_config(project_dir)?;
    let store = StatusStore::for_project(project_dir, &config);

    let Some(slug) = slug else {
        let slugs = store.list()?;
        if slugs.is_empty() {
            println!("no status recorded under {}", store.dir().display());
        }
        for slug in slugs {
            println!("{slug}");
        }
        return Ok(());
    };

    let status = store.read(slug)?;
    println!("{} [{}] on {}", status.project, status.slug, status.branch);
    if let Some(ref id) = status.external_project_id {
        println!("tracker project: {id}");
    }

    if !status.milestones.is_empty() {
        println!("\nMilestones:");
        for (name, milestone) in &status.milestones {
            print!("  {name:<20} {}", milestone.status);
            if let Some(at) = milestone.completed_at {
                print!(" ({})", at.format("%Y-%m-%d %H:%M"));
            }
            println!();
        }
    }

    println!("\nRequirements:");
    for (id, record) in &status.requirements {
        println!(
            "  {:<16} {:<40} {} iteration(s)",
            id.as_str(),
            record.state.to_string(),
            record.iterations
        );
    }
    Ok(())
}

fn cmd_plan(project_dir: &Path) -> Result<()> {
    let graph = load_graph(project_dir)?;
    for (i, req) in graph.ordered().enumerate() {
        print!("{:>3}. {} — {}", i + 1, req.id, req.title);
        if !req.dependencies.is_empty() {
            let deps: Vec<&str> = req.dependencies.iter().map(|d| d.as_str()).collect();
            print!(" (after {})", deps.join(", "));
        }
        if let Some(ref milestone) = req.milestone {
            print!(" [{milestone}]");
        }
        println!();
    }
    Ok(())
}

fn cmd_transition(from: &str, to: &str) -> Result<()> {
    let from: ProjectState = from.parse().map_err(anyhow::Error::msg)?;
    let to: ProjectState = to.parse().map_err(anyhow::Error::msg)?;
    let next = transition(from, to)?;
    println!("{from} -> {next}: allowed");
    Ok(())
}

fn cmd_traces(trace_dir: &Path, requirement: Option<&str>, limit: usize) -> Result<()> {
    let reader = TraceReader::new(trace_dir);
    let events = reader.read_events(requirement, limit)?;
    if events.is_empty() {
        println!("no trace events in {}", trace_dir.display());
    }
    for event in events {
        println!("{event}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traces_default_under_the_project() {
        let cli = Cli::parse_from(["ralph", "--project-dir", "/work/app", "plan"]);
        assert_eq!(cli.trace_dir(), PathBuf::from("/work/app/.ralph/traces"));

        let cli = Cli::parse_from(["ralph", "--trace-dir", "/tmp/t", "traces"]);
        assert_eq!(cli.trace_dir(), PathBuf::from("/tmp/t"));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
