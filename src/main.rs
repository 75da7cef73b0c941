mod dry_run;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ora_core::config::AppConfig;
use ora_core::graph::{validate, Graph};
use ora_core::security::{AuthorityContext, AuthorityLevel, GateSnapshot, SecurityMonitor, VaultStatus};
use ora_core::types::{Bindings, EngineEvent, RunId, RunOutcome};
use ora_engine::{verify_chain, AuditSink, Orchestrator, RunReport, RunSnapshot, SnapshotStore};

use crate::dry_run::DryRunCapability;

#[derive(Parser)]
#[command(name = "ora", version, about = "Secure multi-agent workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "ora.toml", env = "ORA_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow file without running it
    Validate {
        /// Workflow definition (.toml or .json)
        workflow: PathBuf,
    },
    /// Run a workflow with the dry-run capability
    Run {
        /// Workflow definition (.toml or .json)
        workflow: PathBuf,
        /// Authority level (A0-A5 or role name)
        #[arg(long, default_value = "A1")]
        authority: String,
        /// Initial binding, repeatable: key=value (value parsed as JSON if possible)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Start with the credential vault unlocked
        #[arg(long)]
        unlock_vault: bool,
        /// Continue from the latest stored snapshot of this workflow
        #[arg(long, conflicts_with_all = ["authority", "vars"])]
        resume: bool,
    },
    /// Inspect audit logs
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
    /// Inspect stored run snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
    /// Show the effective configuration
    Config,
}

#[derive(Subcommand)]
enum AuditAction {
    /// Verify the hash chain of an audit file
    Verify { file: PathBuf },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Print a run's snapshot as JSON
    Show { run_id: String },
    /// List stored snapshots
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ora=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { workflow } => validate_workflow(&workflow),
        Commands::Run {
            workflow,
            authority,
            vars,
            unlock_vault,
            resume,
        } => {
            let graph = Graph::load(&workflow)?;
            let launch = if resume {
                let store = SnapshotStore::open(&config.snapshot.path())?;
                Launch::Resume(latest_snapshot(&store, &graph.id)?)
            } else {
                Launch::Submit {
                    authority: authority.parse().map_err(|e: String| anyhow!(e))?,
                    bindings: vars
                        .iter()
                        .map(|v| parse_var(v))
                        .collect::<anyhow::Result<Bindings>>()?,
                }
            };
            run_workflow(&config, &graph, launch, unlock_vault).await
        }
        Commands::Audit {
            action: AuditAction::Verify { file },
        } => {
            let count = verify_chain(&file)
                .with_context(|| format!("audit chain check failed for {}", file.display()))?;
            println!("{}: {} records, chain intact", file.display(), count);
            Ok(())
        }
        Commands::Snapshot { action } => {
            let store = SnapshotStore::open(&config.snapshot.path())?;
            match action {
                SnapshotAction::Show { run_id } => {
                    let snapshot = store
                        .load(&RunId::from_string(&run_id))?
                        .ok_or_else(|| anyhow!("no snapshot for run {}", run_id))?;
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                }
                SnapshotAction::List => {
                    for entry in store.list()? {
                        println!(
                            "{}  {}  {}",
                            entry.taken_at.format("%Y-%m-%d %H:%M:%S"),
                            entry.run_id,
                            entry.graph_id
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        info!(path = %path.display(), "No config file, using defaults");
        Ok(AppConfig::default())
    }
}

fn validate_workflow(path: &Path) -> anyhow::Result<()> {
    let graph = Graph::load(path)?;
    match validate(&graph) {
        Ok(valid) => {
            println!(
                "{}: ok ({} nodes, {} edges, {} back edges, entries: {})",
                graph.id,
                graph.nodes.len(),
                graph.edges.len(),
                valid.back_edges().count(),
                valid.entries().join(", ")
            );
            Ok(())
        }
        Err(e) => {
            for violation in &e.violations {
                eprintln!("  - {}", violation);
            }
            bail!("{} is malformed ({} violations)", path.display(), e.violations.len())
        }
    }
}

/// Parse `key=value`. Values that are valid JSON keep their type; anything
/// else becomes a string.
fn parse_var(raw: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got {:?}", raw))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("empty variable name in {:?}", raw);
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// How `ora run` starts its run.
enum Launch {
    Submit {
        authority: AuthorityLevel,
        bindings: Bindings,
    },
    Resume(RunSnapshot),
}

/// Latest snapshot of `graph_id`, for `ora run --resume`.
fn latest_snapshot(store: &SnapshotStore, graph_id: &str) -> anyhow::Result<RunSnapshot> {
    store
        .latest_for_graph(graph_id)?
        .ok_or_else(|| anyhow!("no snapshot stored for workflow {}", graph_id))
}

async fn run_workflow(
    config: &AppConfig,
    graph: &Graph,
    launch: Launch,
    unlock_vault: bool,
) -> anyhow::Result<()> {

    let vault = if unlock_vault {
        VaultStatus::unlocked()
    } else {
        config.vault.initial_status()
    };
    let security = Arc::new(SecurityMonitor::new(GateSnapshot::all_secure(), vault));

    let mut orchestrator = Orchestrator::new(config, Arc::new(DryRunCapability), security);
    if config.snapshot.enabled {
        let store = SnapshotStore::open(&config.snapshot.path())?;
        orchestrator = orchestrator.with_snapshots(Arc::new(store));
    }

    let shutdown = CancellationToken::new();
    let audit = config.audit.enabled.then(|| {
        let sink = AuditSink::new(
            config.audit.log_dir(),
            config.audit.level,
            config.audit.buffer_capacity,
        );
        sink.spawn(&orchestrator.event_bus(), shutdown.clone())
    });

    let mut rx = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                EngineEvent::NodeStatusChanged {
                    node_id, status, ..
                } => eprintln!("[{}] {}", node_id, status),
                EngineEvent::BranchSelected {
                    node_id, branch, ..
                } => eprintln!("[{}] branch {}", node_id, branch),
                EngineEvent::AuthorizationDenied { node_id, error, .. } => {
                    eprintln!("[{}] DENIED: {}", node_id, error)
                }
                EngineEvent::RunCompleted { .. } => break,
                _ => {}
            }
        }
    });

    let run_id = match launch {
        Launch::Submit {
            authority: level,
            bindings,
        } => {
            let run_id = orchestrator
                .submit_run(graph, AuthorityContext::for_level(level), bindings)
                .await?;
            info!(run_id = %run_id, graph_id = %graph.id, %level, "Run submitted");
            run_id
        }
        Launch::Resume(snapshot) => {
            let run_id = orchestrator.resume_run(graph, &snapshot).await?;
            info!(run_id = %run_id, from_run = %snapshot.run_id, graph_id = %graph.id, "Run resumed");
            run_id
        }
    };

    let report = tokio::select! {
        report = orchestrator.wait(&run_id) => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %run_id, "Interrupted, cancelling run");
            orchestrator.cancel_run(&run_id).await?;
            orchestrator.wait(&run_id).await?
        }
    };

    printer.await.ok();
    shutdown.cancel();
    if let Some(handle) = audit {
        handle.await.ok();
    }

    print_report(&report);
    match report.outcome {
        RunOutcome::Succeeded => Ok(()),
        outcome => bail!("run {} {}", report.run_id, outcome),
    }
}

fn print_report(report: &RunReport) {
    println!("run {} ({})", report.run_id, report.graph_id);
    for (node, status) in &report.nodes {
        println!("  {:<24} {}", node, status);
    }
    println!("outcome: {} ({} dispatches)", report.outcome, report.dispatches);
}
