use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use orcd::workflow::model::UserInstruction;
use orcd::{Orchestrator, OrchestratorConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "orcd", about = "Distributed agent orchestration core", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Redis host (overrides ORC_REDIS_HOST)
    #[arg(long, env = "ORC_REDIS_HOST")]
    redis_host: Option<String>,

    /// Redis port (overrides ORC_REDIS_PORT)
    #[arg(long, env = "ORC_REDIS_PORT")]
    redis_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ORC_LOG")]
    log: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator in the foreground until SIGINT/SIGTERM.
    ///
    /// Examples:
    ///   orcd serve
    Serve,
    /// Submit a free-form instruction about a document and wait for the
    /// resulting workflow to finish.
    ///
    /// Examples:
    ///   orcd submit --user u1 --document d1 "Generate a summary of this document"
    Submit {
        #[arg(long)]
        user: String,
        #[arg(long)]
        document: String,
        /// The instruction text.
        text: String,
        /// Maximum time to wait for the workflow to reach a terminal state.
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },
    /// Print broker reachability and queue depths as JSON.
    ///
    /// Examples:
    ///   orcd health
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_level).compact().init();

    let mut config = OrchestratorConfig::from_env();
    if let Some(host) = args.redis_host.clone() {
        config.redis_host = host;
    }
    if let Some(port) = args.redis_port {
        config.redis_port = port;
    }

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(config).await,
        Command::Submit { user, document, text, timeout_secs } => {
            run_submit(config, user, document, text, timeout_secs).await
        }
        Command::Health => run_health(config).await,
    }
}

async fn run_serve(config: OrchestratorConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "orcd starting");
    let orchestrator = Orchestrator::new();
    orchestrator
        .initialize(&config)
        .await
        .context("failed to initialize orchestrator")?;

    info!("orcd serving — press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutting down");
    orchestrator.shutdown().await.context("failed to shut down cleanly")?;
    Ok(())
}

async fn run_submit(
    config: OrchestratorConfig,
    user: String,
    document: String,
    text: String,
    timeout_secs: u64,
) -> Result<()> {
    let orchestrator = Orchestrator::new();
    orchestrator.initialize(&config).await.context("failed to initialize orchestrator")?;

    let instruction = UserInstruction::new(user, document, text);
    let workflow_id = orchestrator
        .submit_instruction(instruction)
        .await
        .context("failed to submit instruction")?;
    println!("workflow: {workflow_id}");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        let workflow = orchestrator.get_workflow_status(&workflow_id).await?;
        if workflow.is_terminal() {
            println!("status: {:?}", workflow.status);
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "results": workflow.results,
                "errors": workflow.errors,
            }))?);
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            println!("status: still {:?} after {timeout_secs}s", workflow.status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    orchestrator.shutdown().await.ok();
    Ok(())
}

async fn run_health(config: OrchestratorConfig) -> Result<()> {
    let orchestrator = Orchestrator::new();
    orchestrator.initialize(&config).await.context("failed to initialize orchestrator")?;
    let health = orchestrator.get_system_health().await?;
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "brokerHealthy": health.broker_healthy,
        "queues": health.queues.iter().map(|q| serde_json::json!({
            "agentClass": q.agent_class.as_str(),
            "currentTasks": q.counters.current_tasks,
            "pendingCount": q.pending_count,
            "maxConcurrency": q.config.max_concurrency,
        })).collect::<Vec<_>>(),
    }))?);
    orchestrator.shutdown().await.ok();
    Ok(())
}
