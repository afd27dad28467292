//! Hidden `worker` command: one rank of a distributed run.

use crate::commands::args::TrainArgs;
use crate::config::CliConfig;
use anyhow::{Context, Result};
use clap::Args;
use nuclear_training::{FineTuner, Rendezvous};
use std::time::Duration;
use tracing::info;

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub train: TrainArgs,

    #[arg(long)]
    pub rank: usize,

    #[arg(long)]
    pub world_size: usize,

    #[arg(long)]
    pub master_addr: String,

    #[arg(long)]
    pub master_port: u16,

    /// Seconds to wait for every rank to join
    #[arg(long, default_value_t = 60)]
    pub rendezvous_timeout: u64,
}

pub fn execute(args: &WorkerArgs, config: &CliConfig) -> Result<()> {
    let options = args.train.data_options(config);
    let hp = args.train.hyper_params(config);
    let tuner = FineTuner::new(args.train.family, &options)
        .with_context(|| format!("Rank {} failed to prepare its dataset", args.rank))?;

    let rendezvous = Rendezvous {
        master_addr: args.master_addr.clone(),
        master_port: args.master_port,
        rendezvous_timeout: Duration::from_secs(args.rendezvous_timeout),
        ..Rendezvous::default()
    };
    let report = tuner
        .run_worker(&hp, args.rank, args.world_size, &rendezvous)
        .with_context(|| format!("Rank {} failed", args.rank))?;

    if let Some(report) = report {
        info!(rank = args.rank, accuracy = report.accuracy, loss = report.loss, "Test finished");
    }
    Ok(())
}
