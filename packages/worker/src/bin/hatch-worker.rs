// ABOUTME: Command-line entry point running a list of tasks and printing their outcomes as JSON
// ABOUTME: Engine and plugins are selected through HATCH_* environment variables

use anyhow::{Context, Result};
use clap::Parser;
use hatch_worker::telemetry::init_tracing;
use hatch_worker::{TaskDefinition, Worker, WorkerConfig};
use serde_json::json;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "hatch-worker")]
#[command(about = "Run tasks in sandboxes and report their outcomes")]
#[command(version)]
struct Cli {
    /// JSON file holding `[{taskId, runId, payload}]`
    tasks: PathBuf,

    /// Print one JSON object per line instead of a single array
    #[arg(long)]
    lines: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let raw = tokio::fs::read_to_string(&cli.tasks)
        .await
        .with_context(|| format!("failed to read {}", cli.tasks.display()))?;
    let tasks: Vec<TaskDefinition> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a list of tasks", cli.tasks.display()))?;

    let worker = Worker::from_config(&config).context("failed to start worker")?;
    info!("Running {} tasks", tasks.len());
    let outcomes = worker.run_all(&tasks).await;

    let reports: Vec<_> = outcomes
        .iter()
        .map(|(task, outcome)| json!({"taskId": task.task_id, "runId": task.run_id, "outcome": outcome}))
        .collect();
    if cli.lines {
        for report in &reports {
            println!("{}", report);
        }
    } else {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }

    if let Err(e) = worker.dispose().await {
        error!("Worker shutdown failed: {}", e);
    }
    Ok(())
}
