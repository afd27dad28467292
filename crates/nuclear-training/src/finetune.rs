//! Family-generic fine-tuning entry point.
//!
//! A [`FineTuner`] owns the prepared dataset for one model family and runs it
//! either on a single device ([`FineTuner::run`]) or as a set of worker
//! processes ([`FineTuner::run_distributed`], each worker executing
//! [`FineTuner::run_worker`]).

use crate::artifacts::RunManifest;
use crate::config::TrainingConfig;
use crate::dataset::{DatasetSplits, SplitOptions};
use crate::distributed::{
    Communicator, DistributedTrainer, ProcessGroupSession, Rendezvous, WorkerLauncher,
};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::CheckpointLayout;
use crate::loader::{LabelEncoder, TextEncoding, load_labeled_csv};
use crate::metrics::{EpochSummary, EvalReport};
use crate::progress::{ProgressSink, TracingProgressSink};
use crate::tokenizer::{TokenizerOptions, encoder_for};
use crate::trainer::{SingleDeviceTrainer, Trainer};
use chrono::Utc;
use nuclear_models::{
    CandleModelFactory, Device, ModelFactory, ModelFamily, ModelSpec, SequenceClassifier,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where the data comes from and how it is prepared.
#[derive(Debug, Clone)]
pub struct DataOptions {
    pub data_path: PathBuf,
    pub input_col: String,
    pub output_col: String,
    pub encoding: TextEncoding,
    pub max_length: usize,
    pub split: SplitOptions,
    /// Directory holding `<checkpoint id>/{model.safetensors,tokenizer.json}`.
    pub models_dir: Option<PathBuf>,
    pub tokenizer_parallel: bool,
    /// Vocabulary of the hashing tokenizer used when no `tokenizer.json` exists.
    pub vocab_size: Option<usize>,
    pub hidden_size: usize,
}

impl DataOptions {
    #[must_use]
    pub fn new(
        data_path: impl Into<PathBuf>,
        input_col: impl Into<String>,
        output_col: impl Into<String>,
    ) -> Self {
        Self {
            data_path: data_path.into(),
            input_col: input_col.into(),
            output_col: output_col.into(),
            encoding: TextEncoding::Utf8,
            max_length: 128,
            split: SplitOptions::default(),
            models_dir: None,
            tokenizer_parallel: false,
            vocab_size: None,
            hidden_size: 64,
        }
    }
}

/// Where a single-device run places its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    /// The CUDA device matching the rank when available, else CPU.
    #[default]
    Auto,
    Cpu,
}

impl DevicePreference {
    #[must_use]
    pub fn resolve(self, rank: usize) -> Device {
        match self {
            Self::Auto => crate::distributed::device_for_rank(rank),
            Self::Cpu => Device::Cpu,
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Cpu => f.write_str("cpu"),
        }
    }
}

impl FromStr for DevicePreference {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "cuda" | "gpu" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            other => Err(TrainingError::InvalidConfig(format!("unknown device: {other}"))),
        }
    }
}

/// Per-run training knobs.
#[derive(Debug, Clone)]
pub struct HyperParams {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub save_every: usize,
    pub weight_decay: f64,
    pub checkpoint_root: PathBuf,
    /// Head width; defaults to the number of distinct labels.
    pub num_classes: Option<usize>,
    pub device: DevicePreference,
}

impl Default for HyperParams {
    fn default() -> Self {
        Self {
            epochs: 5,
            batch_size: 16,
            learning_rate: 2e-5,
            save_every: 1,
            weight_decay: 0.01,
            checkpoint_root: PathBuf::from("."),
            num_classes: None,
            device: DevicePreference::Auto,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub model_name: String,
    pub world_size: usize,
    pub epochs: Vec<EpochSummary>,
    pub test: Option<EvalReport>,
    pub runtime: Duration,
    pub manifest_path: Option<PathBuf>,
}

pub struct FineTuner {
    family: ModelFamily,
    spec: ModelSpec,
    splits: DatasetSplits,
    labels: LabelEncoder,
    pad_id: u32,
    factory: Arc<dyn ModelFactory>,
    progress: Arc<dyn ProgressSink>,
}

impl FineTuner {
    /// Loads, label-encodes, tokenizes and splits the dataset for `family`.
    pub fn new(family: ModelFamily, options: &DataOptions) -> TrainingResult<Self> {
        let table = load_labeled_csv(
            &options.data_path,
            &options.input_col,
            &options.output_col,
            options.encoding,
        )?;

        let factory = CandleModelFactory::new(options.models_dir.clone());
        let mut spec = ModelSpec::for_family(family)
            .with_hidden_size(options.hidden_size)
            .with_seed(options.split.seed);
        if let Some(vocab_size) = options.vocab_size {
            spec = spec.with_vocab_size(vocab_size);
        }
        // A pretrained base fixes the embedding table's shape.
        if let Some((vocab_size, hidden_size)) = factory.pretrained_dims(&spec.checkpoint_id)? {
            debug!(vocab_size, hidden_size, "Using pretrained base dimensions");
            spec = spec.with_vocab_size(vocab_size).with_hidden_size(hidden_size);
        }

        let tokenizer_options = TokenizerOptions {
            parallel: options.tokenizer_parallel,
            max_length: options.max_length,
        };
        let encoder = encoder_for(&spec, options.models_dir.as_deref(), tokenizer_options)?;
        let spec = spec.with_vocab_size(encoder.vocab_size());
        let splits = DatasetSplits::build(&table, encoder.as_ref(), &options.split)?;

        info!(
            %family,
            checkpoint = %spec.checkpoint_id,
            rows = table.len(),
            classes = table.encoder.num_classes(),
            train = splits.train.len(),
            val = splits.val.len(),
            test = splits.test.len(),
            "Dataset prepared"
        );

        Ok(Self {
            family,
            spec,
            splits,
            labels: table.encoder,
            pad_id: encoder.pad_id(),
            factory: Arc::new(factory),
            progress: Arc::new(TracingProgressSink),
        })
    }

    pub fn bert(options: &DataOptions) -> TrainingResult<Self> {
        Self::new(ModelFamily::Bert, options)
    }

    pub fn gpt2(options: &DataOptions) -> TrainingResult<Self> {
        Self::new(ModelFamily::Gpt2, options)
    }

    pub fn llama(options: &DataOptions) -> TrainingResult<Self> {
        Self::new(ModelFamily::Llama, options)
    }

    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn ModelFactory>) -> Self {
        self.factory = factory;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn family(&self) -> ModelFamily {
        self.family
    }

    #[must_use]
    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    #[must_use]
    pub fn splits(&self) -> &DatasetSplits {
        &self.splits
    }

    #[must_use]
    pub fn labels(&self) -> &LabelEncoder {
        &self.labels
    }

    /// Config for `model_name` with hyperparameters from `hp`.
    #[must_use]
    pub fn config(&self, hp: &HyperParams, model_name: &str) -> TrainingConfig {
        TrainingConfig::builder()
            .epochs(hp.epochs)
            .batch_size(hp.batch_size)
            .learning_rate(hp.learning_rate)
            .weight_decay(hp.weight_decay)
            .save_every(hp.save_every)
            .model_name(model_name)
            .seed(self.spec.seed)
            .layout(CheckpointLayout::new(hp.checkpoint_root.clone()))
            .build()
    }

    fn build_model(
        &self,
        hp: &HyperParams,
        device: &Device,
    ) -> TrainingResult<Box<dyn SequenceClassifier>> {
        let num_classes = hp.num_classes.unwrap_or_else(|| self.labels.num_classes());
        Ok(self.factory.build(&self.spec, num_classes, device)?)
    }

    fn write_manifest(
        &self,
        config: &TrainingConfig,
        world_size: usize,
        epochs: Vec<EpochSummary>,
        test: Option<EvalReport>,
        runtime: Duration,
    ) -> TrainingResult<PathBuf> {
        let manifest = RunManifest::new(
            self.family,
            config,
            world_size,
            self.splits.fingerprint()?,
            epochs,
            test,
            runtime.as_secs_f64(),
        )?;
        let path = config.layout().manifest_path(config.model_name());
        manifest.write(&path)?;
        Ok(path)
    }

    /// Single-device fine-tune: train, test the final checkpoint, report.
    pub fn run(&self, hp: &HyperParams) -> TrainingResult<RunSummary> {
        let device = hp.device.resolve(0);
        let config = self.config(hp, self.family.model_name());
        let model = self.build_model(hp, &device)?;
        let mut trainer = SingleDeviceTrainer::new(
            model,
            &self.splits,
            config.clone(),
            self.pad_id,
            self.progress.as_ref(),
        )?;

        let started = Instant::now();
        let (epochs, report) = train_and_test(&mut trainer, hp.epochs)?;
        let runtime = started.elapsed();

        let manifest_path = self.write_manifest(&config, 1, epochs.clone(), Some(report), runtime)?;
        Ok(RunSummary {
            model_name: config.model_name().to_string(),
            world_size: 1,
            epochs,
            test: Some(report),
            runtime,
            manifest_path: Some(manifest_path),
        })
    }

    /// Distributed fine-tune: spawn the launcher's workers and wait for all.
    ///
    /// Each worker must rebuild this tuner from the same data options and run
    /// [`FineTuner::run_worker`] with the same hyperparameters.
    pub async fn run_distributed(
        &self,
        hp: &HyperParams,
        launcher: &WorkerLauncher,
    ) -> TrainingResult<RunSummary> {
        let launched_at = Utc::now();
        let started = Instant::now();
        launcher.launch().await?;
        let runtime = started.elapsed();

        let config = self.config(hp, self.family.distributed_model_name());
        let manifest_path = config.layout().manifest_path(config.model_name());
        let manifest = match RunManifest::read(&manifest_path) {
            Ok(m) if m.created_at >= launched_at => Some(m),
            Ok(_) | Err(_) => {
                warn!(
                    path = %manifest_path.display(),
                    "Workers finished without a fresh run manifest"
                );
                None
            }
        };

        Ok(RunSummary {
            model_name: config.model_name().to_string(),
            world_size: launcher.world_size(),
            epochs: manifest.as_ref().map(|m| m.epochs.clone()).unwrap_or_default(),
            test: manifest.as_ref().and_then(|m| m.test),
            runtime,
            manifest_path: manifest.map(|_| manifest_path),
        })
    }

    /// Body of one worker process: join the group, train, test, tear down.
    pub fn run_worker(
        &self,
        hp: &HyperParams,
        rank: usize,
        world_size: usize,
        rendezvous: &Rendezvous,
    ) -> TrainingResult<Option<EvalReport>> {
        let session = ProcessGroupSession::setup(rank, world_size, rendezvous)?;
        self.run_in_session(hp, session)
    }

    /// Runs a worker on an already formed session, which is torn down
    /// exactly once before returning.
    pub fn run_in_session<C: Communicator>(
        &self,
        hp: &HyperParams,
        session: ProcessGroupSession<C>,
    ) -> TrainingResult<Option<EvalReport>> {
        session.scope(|session| {
            let world_size = session.world_size();
            let device = match hp.device {
                DevicePreference::Auto => session.device().clone(),
                DevicePreference::Cpu => Device::Cpu,
            };
            let config = self.config(hp, self.family.distributed_model_name());
            let model = self.build_model(hp, &device)?;
            let mut trainer = DistributedTrainer::new(
                model,
                &self.splits,
                config.clone(),
                self.pad_id,
                session.communicator_mut(),
                self.progress.as_ref(),
            )?;

            let started = Instant::now();
            let (epochs, report) = train_and_test(&mut trainer, hp.epochs)?;
            if report.is_some() {
                self.write_manifest(&config, world_size, epochs, report, started.elapsed())?;
            }
            Ok(report)
        })
    }
}

fn train_and_test<T: Trainer>(
    trainer: &mut T,
    epochs: usize,
) -> TrainingResult<(Vec<EpochSummary>, T::Report)> {
    let summaries = trainer.train(epochs)?;
    let final_path = trainer.config().final_checkpoint_path();
    let report = trainer.test(&final_path)?;
    Ok((summaries, report))
}

/// Checkpoint paths a run of `epochs` epochs with `save_every` would write.
#[must_use]
pub fn expected_checkpoints(
    root: &Path,
    model_name: &str,
    epochs: usize,
    save_every: usize,
) -> Vec<PathBuf> {
    let config = TrainingConfig::builder()
        .epochs(epochs)
        .save_every(save_every)
        .model_name(model_name)
        .layout(CheckpointLayout::new(root.to_path_buf()))
        .build();
    (0..epochs)
        .filter(|&e| config.should_save(e, epochs))
        .map(|e| config.checkpoint_path(e))
        .collect()
}
