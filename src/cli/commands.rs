//! CLI command definitions for prepforge.
//!
//! Thin wrappers over the library: `run` drives a pipeline over a source
//! directory and waits for the terminal status, `results` prints an
//! execution's result rows, `drop` deletes a per-execution store file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::orchestrator::{Task, TaskOrchestrator};
use crate::runner::PipelineSpec;
use crate::store::ResultStore;

/// Default wait for a triggered execution to reach a terminal status.
const DEFAULT_WAIT_SECS: u64 = 3600;

/// Data-preparation pipeline runner.
#[derive(Parser)]
#[command(name = "prepforge")]
#[command(about = "Run operator pipelines over raw files and inspect per-file outcomes")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a pipeline over a source directory and wait for the outcome.
    Run(RunArgs),

    /// Print the result rows of one or more executions.
    Results(ResultsArgs),

    /// Delete the result store file of an execution.
    Drop(DropArgs),
}

/// Arguments for `prepforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Source directory to ingest.
    #[arg(short, long)]
    pub source: PathBuf,

    /// Export directory for processed payloads.
    #[arg(short, long)]
    pub export: PathBuf,

    /// Pipeline spec file (JSON or YAML with an `operators` list).
    #[arg(short, long)]
    pub pipeline: PathBuf,

    /// Task name recorded in the control plane.
    #[arg(short, long, default_value = "cli-task")]
    pub name: String,

    /// Flow root directory (can also be set via PREPFORGE_FLOW_ROOT).
    #[arg(long, env = "PREPFORGE_FLOW_ROOT", default_value = "./flow")]
    pub flow_root: PathBuf,

    /// Execution timeout in seconds.
    #[arg(long, default_value_t = 3600)]
    pub timeout_secs: i64,

    /// Seconds to wait for the terminal status before giving up.
    #[arg(long, default_value_t = DEFAULT_WAIT_SECS)]
    pub wait_secs: u64,
}

/// Arguments for `prepforge results`.
#[derive(Parser, Debug)]
pub struct ResultsArgs {
    /// Execution ids to query.
    #[arg(required = true)]
    pub executions: Vec<Uuid>,

    /// Flow root directory holding the store files.
    #[arg(long, env = "PREPFORGE_FLOW_ROOT", default_value = "./flow")]
    pub flow_root: PathBuf,
}

/// Arguments for `prepforge drop`.
#[derive(Parser, Debug)]
pub struct DropArgs {
    /// Execution id whose store file should be deleted.
    pub execution: Uuid,

    /// Flow root directory holding the store files.
    #[arg(long, env = "PREPFORGE_FLOW_ROOT", default_value = "./flow")]
    pub flow_root: PathBuf,
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed CLI command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline(args).await,
        Commands::Results(args) => print_results(args).await,
        Commands::Drop(args) => drop_store(args).await,
    }
}

/// Loads a pipeline spec from a JSON or YAML file.
fn load_pipeline_spec(path: &PathBuf) -> anyhow::Result<PipelineSpec> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading pipeline spec {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let spec = if is_yaml {
        serde_yaml::from_str(&raw).with_context(|| "parsing YAML pipeline spec")?
    } else {
        PipelineSpec::from_json(&raw).with_context(|| "parsing JSON pipeline spec")?
    };
    Ok(spec)
}

async fn run_pipeline(args: RunArgs) -> anyhow::Result<()> {
    let spec = load_pipeline_spec(&args.pipeline)?;
    if spec.is_empty() {
        bail!("pipeline spec declares no operators");
    }

    let config = CoreConfig::new().with_flow_root(&args.flow_root);
    let orchestrator = TaskOrchestrator::new(config).await?;

    let task = Task::new(&args.name)
        .with_config(serde_json::to_string(&spec)?)
        .with_source_path(&args.source)
        .with_export_path(&args.export)
        .with_timeout_seconds(args.timeout_secs)
        .with_actor("cli");
    orchestrator.control_plane().create_task(&task).await?;

    let execution_id = orchestrator.run(task.id).await?;
    info!(execution_id = %execution_id, "Execution scheduled");

    let execution = orchestrator
        .await_terminal(execution_id, Duration::from_secs(args.wait_secs))
        .await?;
    println!("execution {} -> {}", execution.id, execution.status);

    let results = orchestrator.query_results(&[execution_id]).await?;
    if let Some(rows) = results.get(&execution_id) {
        println!(
            "{} row(s): {} ok, {} failed",
            rows.len(),
            rows.iter().filter(|r| r.status == 0).count(),
            rows.iter().filter(|r| r.status != 0).count(),
        );
    }
    Ok(())
}

async fn print_results(args: ResultsArgs) -> anyhow::Result<()> {
    let results = ResultStore::query(&args.flow_root, &args.executions).await?;
    for (execution_id, rows) in results {
        for row in rows {
            println!(
                "{}",
                serde_json::json!({
                    "instance_id": execution_id,
                    "file_id": row.file_id,
                    "file_name": row.file_name,
                    "child_id": row.child_id,
                    "status": row.status,
                    "operator_id": row.operator_id,
                    "error_code": row.error_code,
                    "slice_num": row.slice_num,
                })
            );
        }
    }
    Ok(())
}

async fn drop_store(args: DropArgs) -> anyhow::Result<()> {
    ResultStore::drop_store(&args.flow_root, args.execution).await;
    info!(execution_id = %args.execution, "Store dropped");
    Ok(())
}
