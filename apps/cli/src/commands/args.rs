//! Flags shared by `run` and the hidden `worker` command.

use crate::config::CliConfig;
use clap::Args;
use nuclear_training::{
    DataOptions, DevicePreference, HyperParams, ModelFamily, SplitOptions, TextEncoding,
};
use std::path::PathBuf;

#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Model family (bert, gpt2, llama)
    #[arg(long)]
    pub family: ModelFamily,

    /// CSV file with one text column and one label column
    #[arg(long)]
    pub data: PathBuf,

    /// Column holding the input text
    #[arg(long, default_value = "text")]
    pub input_col: String,

    /// Column holding the label
    #[arg(long, default_value = "label")]
    pub output_col: String,

    /// CSV text encoding (utf-8, latin-1)
    #[arg(long, default_value = "utf-8")]
    pub encoding: TextEncoding,

    #[arg(long, default_value_t = 128)]
    pub max_length: usize,

    #[arg(long, default_value_t = 0.2)]
    pub test_size: f64,

    #[arg(long, default_value_t = 0.1)]
    pub val_size: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value_t = 5)]
    pub epochs: usize,

    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,

    /// Learning rate
    #[arg(long = "lr", default_value_t = 2e-5)]
    pub learning_rate: f64,

    /// Save a checkpoint every N epochs (the last epoch is always saved)
    #[arg(long, default_value_t = 1)]
    pub save_every: usize,

    #[arg(long, default_value_t = 0.01)]
    pub weight_decay: f64,

    /// Classifier head width (defaults to the number of labels)
    #[arg(long)]
    pub num_classes: Option<usize>,

    #[arg(long, default_value_t = 64)]
    pub hidden_size: usize,

    /// Vocabulary size of the fallback hashing tokenizer
    #[arg(long)]
    pub vocab_size: Option<usize>,

    /// Encode batches on the tokenizer's thread pool
    #[arg(long)]
    pub tokenizer_parallel: bool,

    /// Directory checkpoints are written under (overrides config)
    #[arg(long)]
    pub checkpoint_root: Option<PathBuf>,

    /// Directory with pretrained weights and tokenizers (overrides config)
    #[arg(long)]
    pub models_dir: Option<PathBuf>,

    /// Device preference (auto, cpu; overrides config)
    #[arg(long)]
    pub device: Option<DevicePreference>,
}

impl TrainArgs {
    pub fn data_options(&self, config: &CliConfig) -> DataOptions {
        DataOptions {
            encoding: self.encoding,
            max_length: self.max_length,
            split: SplitOptions {
                test_size: self.test_size,
                val_size: self.val_size,
                seed: self.seed,
            },
            models_dir: self.models_dir.clone().or_else(|| config.models_dir.clone()),
            tokenizer_parallel: self.tokenizer_parallel,
            vocab_size: self.vocab_size,
            hidden_size: self.hidden_size,
            ..DataOptions::new(&self.data, &self.input_col, &self.output_col)
        }
    }

    pub fn hyper_params(&self, config: &CliConfig) -> HyperParams {
        HyperParams {
            epochs: self.epochs,
            batch_size: self.batch_size,
            learning_rate: self.learning_rate,
            save_every: self.save_every,
            weight_decay: self.weight_decay,
            checkpoint_root: self
                .checkpoint_root
                .clone()
                .or_else(|| config.checkpoint_root.clone())
                .unwrap_or_else(|| PathBuf::from(".")),
            num_classes: self.num_classes,
            device: self.device.or(config.device).unwrap_or_default(),
        }
    }

    /// Flags that make a worker see exactly the run this process resolved.
    pub fn worker_args(&self, options: &DataOptions, hp: &HyperParams) -> Vec<String> {
        let mut args = vec![
            "--family".to_string(),
            self.family.to_string(),
            "--data".to_string(),
            options.data_path.display().to_string(),
            "--input-col".to_string(),
            options.input_col.clone(),
            "--output-col".to_string(),
            options.output_col.clone(),
            "--encoding".to_string(),
            options.encoding.to_string(),
            "--max-length".to_string(),
            options.max_length.to_string(),
            "--test-size".to_string(),
            options.split.test_size.to_string(),
            "--val-size".to_string(),
            options.split.val_size.to_string(),
            "--seed".to_string(),
            options.split.seed.to_string(),
            "--epochs".to_string(),
            hp.epochs.to_string(),
            "--batch-size".to_string(),
            hp.batch_size.to_string(),
            "--lr".to_string(),
            hp.learning_rate.to_string(),
            "--save-every".to_string(),
            hp.save_every.to_string(),
            "--weight-decay".to_string(),
            hp.weight_decay.to_string(),
            "--hidden-size".to_string(),
            options.hidden_size.to_string(),
            "--checkpoint-root".to_string(),
            hp.checkpoint_root.display().to_string(),
            "--device".to_string(),
            hp.device.to_string(),
        ];
        if let Some(n) = hp.num_classes {
            args.extend(["--num-classes".to_string(), n.to_string()]);
        }
        if let Some(v) = options.vocab_size {
            args.extend(["--vocab-size".to_string(), v.to_string()]);
        }
        if let Some(dir) = &options.models_dir {
            args.extend(["--models-dir".to_string(), dir.display().to_string()]);
        }
        if options.tokenizer_parallel {
            args.push("--tokenizer-parallel".to_string());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        train: TrainArgs,
    }

    fn parse(args: &[&str]) -> TrainArgs {
        Harness::try_parse_from(std::iter::once("nuclear").chain(args.iter().copied()))
            .unwrap()
            .train
    }

    #[test]
    fn test_cli_flags_override_config() {
        let args = parse(&["--family", "bert", "--data", "d.csv", "--checkpoint-root", "cli"]);
        let config = CliConfig {
            checkpoint_root: Some(PathBuf::from("cfg")),
            models_dir: Some(PathBuf::from("models")),
            device: Some(DevicePreference::Cpu),
            ..CliConfig::default()
        };

        let hp = args.hyper_params(&config);
        assert_eq!(hp.checkpoint_root, PathBuf::from("cli"));
        assert_eq!(hp.device, DevicePreference::Cpu);
        assert_eq!(args.data_options(&config).models_dir, Some(PathBuf::from("models")));
    }

    #[test]
    fn test_worker_args_parse_back_to_same_run() {
        let args = parse(&[
            "--family",
            "llama",
            "--data",
            "d.csv",
            "--epochs",
            "3",
            "--lr",
            "0.001",
            "--vocab-size",
            "256",
            "--encoding",
            "latin1",
        ]);
        let config = CliConfig::default();
        let options = args.data_options(&config);
        let hp = args.hyper_params(&config);

        let forwarded = args.worker_args(&options, &hp);
        let reparsed = parse(&forwarded.iter().map(String::as_str).collect::<Vec<_>>());

        assert_eq!(reparsed.family, ModelFamily::Llama);
        assert_eq!(reparsed.epochs, 3);
        assert!((reparsed.learning_rate - 0.001).abs() < f64::EPSILON);
        assert_eq!(reparsed.vocab_size, Some(256));
        assert_eq!(reparsed.encoding, TextEncoding::Latin1);
        assert_eq!(reparsed.checkpoint_root, Some(PathBuf::from(".")));
    }
}
