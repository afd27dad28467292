//! `run`: fine-tune one model family on one device or across workers.

use crate::commands::args::TrainArgs;
use crate::config::CliConfig;
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use nuclear_training::{FineTuner, Rendezvous, RunSummary, WorkerLauncher, free_port};
use std::time::Duration;
use tracing::info;

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub train: TrainArgs,

    /// Number of worker processes; more than one selects distributed training
    #[arg(long, default_value_t = 1)]
    pub world_size: usize,

    /// Use the distributed path even with a single worker
    #[arg(long)]
    pub ddp: bool,

    #[arg(long, default_value = "127.0.0.1")]
    pub master_addr: String,

    /// Rendezvous port (a free port is picked when omitted)
    #[arg(long)]
    pub master_port: Option<u16>,

    /// Kill all workers if the distributed run takes longer (seconds)
    #[arg(long)]
    pub timeout: Option<u64>,
}

pub async fn execute(args: RunArgs, config: &CliConfig, log_level: &str) -> Result<()> {
    let options = args.train.data_options(config);
    let hp = args.train.hyper_params(config);
    let tuner = FineTuner::new(args.train.family, &options)
        .with_context(|| format!("Failed to prepare dataset {}", options.data_path.display()))?;

    let summary = if args.ddp || args.world_size > 1 {
        let master_port = match args.master_port {
            Some(port) => port,
            None => free_port().context("Failed to pick a rendezvous port")?,
        };
        let rendezvous = Rendezvous {
            master_addr: args.master_addr.clone(),
            master_port,
            ..Rendezvous::default()
        };
        let mut launcher = WorkerLauncher::current_exe(args.world_size, rendezvous)
            .context("Failed to locate the current executable")?
            .args(["--log-level", log_level, "worker"])
            .args(args.train.worker_args(&options, &hp));
        if let Some(secs) = args.timeout {
            launcher = launcher.timeout(Duration::from_secs(secs));
        }

        info!(world_size = args.world_size, port = master_port, "Launching workers");
        tuner.run_distributed(&hp, &launcher).await.context("Distributed run failed")?
    } else {
        tokio::task::spawn_blocking(move || tuner.run(&hp))
            .await
            .context("Training task panicked")?
            .context("Training run failed")?
    };

    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "{}",
        format!("{} fine-tune complete ({} worker(s))", summary.model_name, summary.world_size)
            .bold()
            .green()
    );
    println!("RUNTIME : {:.3}", summary.runtime.as_secs_f64());
    match summary.test {
        Some(report) => {
            println!(
                "TEST ACCURACY : {:.4} ({}/{})",
                report.accuracy, report.correct, report.total
            );
            println!("TEST LOSS : {:.4}", report.loss);
        }
        None => println!("{}", "No test report was produced".yellow()),
    }
    if let Some(path) = &summary.manifest_path {
        println!("MANIFEST : {}", path.display());
    }
}
