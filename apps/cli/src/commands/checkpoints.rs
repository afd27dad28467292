//! `checkpoints`: show where a run writes (or wrote) its checkpoints.

use crate::config::CliConfig;
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use nuclear_training::{ModelFamily, expected_checkpoints};
use std::path::PathBuf;

#[derive(Args, Debug, Clone)]
pub struct CheckpointsArgs {
    /// Model family (bert, gpt2, llama)
    #[arg(long)]
    pub family: ModelFamily,

    #[arg(long, default_value_t = 5)]
    pub epochs: usize,

    #[arg(long, default_value_t = 1)]
    pub save_every: usize,

    /// Show the distributed run's directory
    #[arg(long)]
    pub ddp: bool,

    /// Directory checkpoints are written under (overrides config)
    #[arg(long)]
    pub checkpoint_root: Option<PathBuf>,
}

pub fn execute(args: &CheckpointsArgs, config: &CliConfig) -> Result<()> {
    let root = args
        .checkpoint_root
        .clone()
        .or_else(|| config.checkpoint_root.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    let model_name = if args.ddp {
        args.family.distributed_model_name()
    } else {
        args.family.model_name()
    };

    let paths = expected_checkpoints(&root, model_name, args.epochs, args.save_every);
    if paths.is_empty() {
        println!("{}", "No checkpoints would be written (epochs or save-every is zero)".yellow());
        return Ok(());
    }

    for path in paths {
        let status = if path.is_file() { "present".green() } else { "missing".dimmed() };
        println!("{}  {}", path.display(), status);
    }
    Ok(())
}
