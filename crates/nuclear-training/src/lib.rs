//! Nuclear Training - fine-tuning orchestration for sequence classifiers.
//!
//! This crate provides:
//! - Dataset loading, tokenization and train/val/test splitting
//! - Single-device and data-parallel trainers sharing one training step
//! - A TCP process group with scoped setup/teardown and a worker launcher
//! - Checkpoints under `trained_<model_name>/Nuclear_epoch<epoch>.pt`
//! - [`FineTuner`], which ties the pieces together per model family
//!
//! # Example
//!
//! ```rust,no_run
//! use nuclear_training::{DataOptions, FineTuner, HyperParams};
//!
//! fn main() -> nuclear_training::TrainingResult<()> {
//!     let options = DataOptions::new("reviews.csv", "text", "label");
//!     let tuner = FineTuner::bert(&options)?;
//!     let summary = tuner.run(&HyperParams::default())?;
//!     println!("{:?}", summary.test);
//!     Ok(())
//! }
//! ```

pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod distributed;
pub mod error;
pub mod finetune;
pub mod layout;
pub mod loader;
pub mod metrics;
pub mod progress;
pub mod sampler;
pub mod tokenizer;
pub mod trainer;

pub use artifacts::{CheckpointArtifact, RunManifest, saved_checkpoints, sha256_file};
pub use checkpoint::{load_checkpoint, save_checkpoint};
pub use config::{TrainingConfig, TrainingConfigBuilder};
pub use dataset::{DatasetSplits, Example, SplitOptions};
pub use distributed::{
    Communicator, DistributedTrainer, ProcessGroupSession, Rendezvous, TcpProcessGroup,
    WorkerLauncher, device_for_rank, free_port,
};
pub use error::{TrainingError, TrainingResult};
pub use finetune::{
    DataOptions, DevicePreference, FineTuner, HyperParams, RunSummary, expected_checkpoints,
};
pub use layout::CheckpointLayout;
pub use loader::{LabelEncoder, LabeledTable, TextEncoding, load_labeled_csv, parse_labeled_csv};
pub use metrics::{EpochSummary, EvalAccumulator, EvalReport};
pub use progress::{NoopProgressSink, ProgressEvent, ProgressSink, TracingProgressSink};
pub use sampler::{EpochSampler, eval_shard};
pub use tokenizer::{
    HashingTokenizer, PretrainedTokenizer, TextEncoder, TokenizerOptions, encoder_for,
};
pub use trainer::{SingleDeviceTrainer, Trainer, TrainerPhase};

pub use nuclear_models::{Device, ModelFamily};
