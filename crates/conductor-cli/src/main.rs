//! `conductor` command-line interface.

mod simulate;

use clap::{Parser, Subcommand};
use conductor_checkpoint::{CheckpointStore, SqliteCheckpointStore, WorkflowCheckpoint};
use conductor_orchestrator::{
    voters_from_config, AdaptiveRouter, AgentRegistry, ConductorConfig, ConsensusGate,
    SessionBudgets, StaticBallot, StatsSnapshot, TaskScheduler,
};
use conductor_workflow::{archive, describe, force_resume, recoverable};
use simulate::{synthetic_task, SimulatedAgent};
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "conductor",
    about = "Conductor — durable workflows and adaptive agent scheduling"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and operate on checkpointed workflows
    Workflows {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Print the last scheduler stats snapshot
    Stats,
    /// Run the scheduler against simulated agents and write a stats snapshot
    Simulate {
        /// Number of tasks to submit
        #[arg(short, long, default_value_t = 200)]
        tasks: usize,
        /// Agents that fail often (repeatable)
        #[arg(long)]
        unreliable: Vec<String>,
        /// Failure rate of unreliable agents
        #[arg(long, default_value_t = 0.6)]
        failure_rate: f64,
        /// Give up waiting for the queue to drain after this many seconds
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// List workflows left in progress, paused or awaiting approval
    List {
        /// Include finished workflows
        #[arg(long)]
        all: bool,
    },
    /// Show a workflow and its steps as JSON
    Show { id: String },
    /// Resume a paused or approval-blocked workflow
    Resume { id: String },
    /// Delete a finished workflow and its steps
    Archive { id: String },
}

/// Failure rate of agents not named with `--unreliable`.
const BASELINE_FAILURE_RATE: f64 = 0.05;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Workflows { action } => {
            let store = open_store(&config)?;
            match action {
                WorkflowAction::List { all } => {
                    let workflows = if all {
                        store.list_workflows().await?
                    } else {
                        recoverable(&*store).await?
                    };
                    print_workflows(&workflows);
                }
                WorkflowAction::Show { id } => {
                    let (workflow, steps) = describe(&*store, &id).await?;
                    let out = serde_json::json!({ "workflow": workflow, "steps": steps });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                WorkflowAction::Resume { id } => {
                    let workflow = force_resume(&*store, &id).await?;
                    println!("Workflow {id} is {}", workflow.status);
                }
                WorkflowAction::Archive { id } => {
                    archive(&*store, &id).await?;
                    println!("Workflow {id} archived");
                }
            }
        }
        Commands::Stats => {
            let path = config.stats_path();
            let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
                anyhow::anyhow!(
                    "No stats snapshot at '{}' (run `conductor simulate` first): {}",
                    path.display(),
                    e
                )
            })?;
            let snapshot: StatsSnapshot = serde_json::from_str(&raw)?;
            print_stats(&snapshot);
        }
        Commands::Simulate {
            tasks,
            unreliable,
            failure_rate,
            timeout_secs,
        } => {
            run_simulation(&config, tasks, &unreliable, failure_rate, timeout_secs).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<ConductorConfig> {
    if path.exists() {
        Ok(ConductorConfig::load(path)?)
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        Ok(ConductorConfig::default())
    }
}

fn open_store(config: &ConductorConfig) -> anyhow::Result<Arc<dyn CheckpointStore>> {
    std::fs::create_dir_all(&config.data_dir)?;
    let store = SqliteCheckpointStore::open(config.checkpoint_path())?;
    Ok(Arc::new(store))
}

async fn run_simulation(
    config: &ConductorConfig,
    tasks: usize,
    unreliable: &[String],
    failure_rate: f64,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let categories = config.categories()?;
    let agents: BTreeSet<String> = categories.values().flatten().cloned().collect();
    for name in unreliable {
        if !agents.contains(name) {
            anyhow::bail!("Unknown agent '{name}'");
        }
    }

    let registry = Arc::new(AgentRegistry::new(categories, config.registry.clone()));
    let router = Arc::new(AdaptiveRouter::new(config.router.clone()));
    let consensus = Arc::new(ConsensusGate::from_config(&config.consensus));
    let voters = voters_from_config(&config.consensus)?;
    let scheduler = Arc::new(
        TaskScheduler::new(config.scheduler.clone(), registry, router, consensus)
            .with_ballot(voters, Arc::new(StaticBallot::new(true))),
    );

    let store = open_store(config)?;
    let budgets = Arc::new(SessionBudgets::new(config.budget.clone()));
    for name in &agents {
        let rate = if unreliable.contains(name) {
            failure_rate
        } else {
            BASELINE_FAILURE_RATE
        };
        scheduler.register_handler(
            name.clone(),
            Arc::new(SimulatedAgent::new(
                name.clone(),
                rate,
                store.clone(),
                budgets.clone(),
                config.workflow.clone(),
            )),
        );
    }

    info!(tasks, agents = agents.len(), "Starting simulation");
    let handles = scheduler.start();
    for seq in 0..tasks {
        scheduler.submit(synthetic_task(seq));
    }

    if !scheduler.drain(Duration::from_secs(timeout_secs)).await {
        warn!(timeout_secs, "Queue did not drain in time");
    }
    let stats_path = config.stats_path();
    scheduler.write_stats(&stats_path).await?;
    scheduler.shutdown();
    for handle in handles {
        handle.await?;
    }

    print_stats(&scheduler.snapshot());
    println!("\nSnapshot written to {}", stats_path.display());
    Ok(())
}

fn print_workflows(workflows: &[WorkflowCheckpoint]) {
    if workflows.is_empty() {
        println!("No workflows.");
        return;
    }
    println!(
        "{:<40} {:<18} {:<18} {:<14} STEPS",
        "ID", "TYPE", "STATUS", "CURRENT"
    );
    for wf in workflows {
        println!(
            "{:<40} {:<18} {:<18} {:<14} {}/{}",
            wf.workflow_id,
            wf.workflow_type,
            wf.status.as_str(),
            wf.current_step.as_deref().unwrap_or("-"),
            wf.steps_completed,
            wf.steps_total
        );
    }
    println!("\nTotal: {} workflow(s)", workflows.len());
}

fn print_stats(snapshot: &StatsSnapshot) {
    let t = &snapshot.tasks;
    println!("Snapshot taken {}", snapshot.generated_at);
    println!(
        "Tasks: {} submitted, {} completed, {} failed, {} cancelled, {} pending, {} running",
        t.submitted, t.completed, t.failed, t.cancelled, t.pending, t.running
    );
    println!("  re-routed: {}, holds: {}", t.rerouted, t.holds);

    println!("\nAgents:");
    for a in &snapshot.agents {
        println!(
            "  {:<18} {:<11} ok={:<5} failed={:<5} error_rate={:.2} routed={}",
            a.name,
            format!("{:?}", a.status).to_lowercase(),
            a.total_successes,
            a.total_failures,
            a.error_rate(),
            snapshot.router.routes.get(&a.name).copied().unwrap_or(0)
        );
    }

    let r = &snapshot.router;
    println!(
        "\nRouter: epsilon={:.3}, explore/exploit={}/{}, updates={}, q-entries={}",
        r.epsilon, r.explorations, r.exploitations, r.updates, r.table_size
    );

    let c = &snapshot.consensus;
    println!(
        "Consensus: {} proposals, {} approved, {} rejected ({:.0}% approval)",
        c.proposals,
        c.approvals,
        c.rejections,
        c.approval_rate * 100.0
    );
}
