//! `conductor` command-line entry point.

use anyhow::Context;
use clap::{Parser, Subcommand};
use conductor_core::{logging, MessageBus};
use conductor_orchestrator::{
    route, AgentOrchestrator, AgentType, ConductorConfig, EchoAgent, TaskSpec,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: agent orchestration core")]
struct Cli {
    /// Path to config file (defaults apply when it does not exist)
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the priority and agent a task description routes to
    Route {
        #[arg(required = true)]
        description: Vec<String>,
    },
    /// Run each description as a task against echo agents and print the final status
    Run {
        #[arg(required = true)]
        tasks: Vec<String>,
        /// Send every task to this agent instead of routing by keyword
        #[arg(short, long)]
        agent: Option<AgentType>,
        /// Seconds to wait for the queue to drain
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Start the configured default agents and print the orchestrator status
    Status,
}

/// Returns the config and whether it came from a file.
fn load_config(path: &Path) -> anyhow::Result<(ConductorConfig, bool)> {
    if !path.exists() {
        return Ok((ConductorConfig::default(), false));
    }
    let config = ConductorConfig::load(path)
        .with_context(|| format!("Failed to load config file '{}'", path.display()))?;
    Ok((config, true))
}

async fn boot(config: &ConductorConfig) -> anyhow::Result<(MessageBus, AgentOrchestrator)> {
    let bus = MessageBus::new(config.bus.clone());
    bus.start();

    let orchestrator = AgentOrchestrator::from_config(config);
    for agent in EchoAgent::all() {
        orchestrator.register_agent(agent);
    }
    orchestrator.initialize(&bus).await?;
    Ok((bus, orchestrator))
}

async fn wait_until_drained(
    bus: &MessageBus,
    orchestrator: &AgentOrchestrator,
    limit: Duration,
) -> anyhow::Result<()> {
    let drained = async {
        while orchestrator.outstanding_tasks() > 0 {
            bus.flush().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(limit, drained).await.map_err(|_| {
        anyhow::anyhow!(
            "{} task(s) still outstanding after {}s",
            orchestrator.outstanding_tasks(),
            limit.as_secs()
        )
    })
}

async fn teardown(bus: &MessageBus, orchestrator: &AgentOrchestrator) {
    orchestrator.shutdown().await;
    bus.flush().await;
    bus.stop();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, from_file) = load_config(&cli.config)?;
    logging::init(&config.logging)?;
    if !from_file {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Route { description } => {
            let routed = route(&description.join(" "));
            println!("{}", serde_json::to_string_pretty(&routed)?);
        }
        Commands::Run {
            tasks,
            agent,
            timeout,
        } => {
            let (bus, orchestrator) = boot(&config).await?;

            let mut ids = Vec::with_capacity(tasks.len());
            for description in tasks {
                let mut spec = TaskSpec::new(description);
                spec.agent = agent;
                ids.push(orchestrator.execute_task_with(spec).await?);
            }

            let drained =
                wait_until_drained(&bus, &orchestrator, Duration::from_secs(timeout)).await;
            for id in &ids {
                match orchestrator.task_outcome(id) {
                    Ok(result) => info!(task_id = %id, result = %result, "Task finished"),
                    Err(e) => warn!(task_id = %id, error = %e, "Task did not succeed"),
                }
            }
            println!("{}", serde_json::to_string_pretty(&orchestrator.status())?);

            teardown(&bus, &orchestrator).await;
            drained?;
        }
        Commands::Status => {
            let (bus, orchestrator) = boot(&config).await?;
            bus.flush().await;
            println!("{}", serde_json::to_string_pretty(&orchestrator.status())?);
            teardown(&bus, &orchestrator).await;
        }
    }

    Ok(())
}
