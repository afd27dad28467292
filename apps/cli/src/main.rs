//! Nuclear CLI - fine-tune BERT, GPT-2 and Llama classifiers from a CSV file.
//!
//! `run` trains on one device, or with `--world-size N` re-executes this
//! binary N times through the hidden `worker` command for data-parallel
//! training.

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::{checkpoints, run, worker};
use config::CliConfig;

/// Nuclear - fine-tuning orchestration for text classification
#[derive(Parser, Debug)]
#[command(name = "nuclear-cli", author, version, about = "Nuclear - fine-tuning orchestration")]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fine-tune a model family on a labeled CSV file
    Run(run::RunArgs),

    /// Run one rank of a distributed fine-tune
    #[command(hide = true)]
    Worker(worker::WorkerArgs),

    /// List the checkpoint paths a run writes
    Checkpoints(checkpoints::CheckpointsArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cli_config = CliConfig::discover_and_load()?;

    let log_level = args
        .log_level
        .clone()
        .or_else(|| cli_config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Run(run_args) => run::execute(run_args, &cli_config, &log_level).await,
        Command::Worker(worker_args) => worker::execute(&worker_args, &cli_config),
        Command::Checkpoints(ck_args) => checkpoints::execute(&ck_args, &cli_config),
    }
}
