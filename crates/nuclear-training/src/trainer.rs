use crate::checkpoint::{load_checkpoint, save_checkpoint};
use crate::config::TrainingConfig;
use crate::dataset::{DatasetSplits, Example};
use crate::distributed::group::Communicator;
use crate::error::{TrainingError, TrainingResult};
use crate::metrics::{EpochSummary, EvalAccumulator, EvalReport};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::sampler::EpochSampler;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use nuclear_models::{SequenceClassifier, TokenBatch};
use std::path::Path;

/// Where a trainer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    Created,
    Training { epoch: usize },
    Saving { epoch: usize },
    Trained,
    Testing,
    Done,
}

/// The train/evaluate/checkpoint loop shared by every execution strategy.
pub trait Trainer {
    /// What `test` yields; distributed ranks other than 0 yield nothing.
    type Report;

    fn phase(&self) -> TrainerPhase;

    fn config(&self) -> &TrainingConfig;

    fn train(&mut self, max_epochs: usize) -> TrainingResult<Vec<EpochSummary>>;

    fn test(&mut self, final_model_path: &Path) -> TrainingResult<Self::Report>;

    fn model(&self) -> &dyn SequenceClassifier;
}

/// Model, optimizer and batching shared by the single-device and
/// distributed trainers.
pub(crate) struct StepEngine<'a> {
    model: Box<dyn SequenceClassifier>,
    params: Vec<(String, Var)>,
    optimizer: AdamW,
    config: TrainingConfig,
    splits: &'a DatasetSplits,
    pad_id: u32,
    rank: usize,
    progress: &'a dyn ProgressSink,
}

impl<'a> StepEngine<'a> {
    pub(crate) fn new(
        model: Box<dyn SequenceClassifier>,
        splits: &'a DatasetSplits,
        config: TrainingConfig,
        pad_id: u32,
        rank: usize,
        progress: &'a dyn ProgressSink,
    ) -> TrainingResult<Self> {
        if model.num_classes() < splits.num_classes {
            return Err(TrainingError::InvalidConfig(format!(
                "model has {} classes but the dataset has {}",
                model.num_classes(),
                splits.num_classes
            )));
        }
        let params = model.trainable_parameters()?;
        let optimizer = AdamW::new(
            params.iter().map(|(_, var)| var.clone()).collect(),
            ParamsAdamW {
                lr: config.learning_rate(),
                weight_decay: config.weight_decay(),
                ..ParamsAdamW::default()
            },
        )?;
        Ok(Self { model, params, optimizer, config, splits, pad_id, rank, progress })
    }

    pub(crate) fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub(crate) fn splits(&self) -> &'a DatasetSplits {
        self.splits
    }

    pub(crate) fn model(&self) -> &dyn SequenceClassifier {
        self.model.as_ref()
    }

    pub(crate) fn params(&self) -> &[(String, Var)] {
        &self.params
    }

    pub(crate) fn emit(&self, event: ProgressEvent) {
        self.progress.on_event(event);
    }

    fn make_batch(
        &self,
        split: &[Example],
        indices: &[usize],
    ) -> TrainingResult<(TokenBatch, Tensor)> {
        let sequences: Vec<&[u32]> =
            indices.iter().map(|&i| split[i].input_ids.as_slice()).collect();
        let labels: Vec<u32> = indices.iter().map(|&i| split[i].label).collect();
        let device = self.model.device();
        let batch = TokenBatch::new(&sequences, self.model.spec().pooling, self.pad_id, device)?;
        let labels = Tensor::from_vec(labels, indices.len(), device)?;
        Ok((batch, labels))
    }

    /// Runs one pass over `order`, returning `(sum of batch losses, steps)`.
    ///
    /// With a communicator, gradients are averaged across ranks before each
    /// optimizer step.
    pub(crate) fn train_epoch(
        &mut self,
        epoch: usize,
        order: &[usize],
        mut comm: Option<&mut dyn Communicator>,
    ) -> TrainingResult<(f64, u64)> {
        let batch_size = self.config.batch_size();
        let total = order.len().div_ceil(batch_size) as u64;
        let mut loss_sum = 0.0;
        let mut steps = 0u64;

        for chunk in order.chunks(batch_size) {
            let (batch, labels) = self.make_batch(&self.splits.train, chunk)?;
            let logits = self.model.forward(&batch)?;
            let loss = candle_nn::loss::cross_entropy(&logits, &labels)?;
            let mut grads = loss.backward()?;
            if let Some(comm) = comm.as_deref_mut() {
                average_gradients(&self.params, &mut grads, comm)?;
            }
            self.optimizer.step(&grads)?;

            let loss = f64::from(loss.to_scalar::<f32>()?);
            loss_sum += loss;
            steps += 1;
            self.emit(ProgressEvent::Step {
                model_name: self.config.model_name().to_string(),
                rank: self.rank,
                epoch,
                step: steps,
                total,
                loss,
            });
        }
        Ok((loss_sum, steps))
    }

    pub(crate) fn evaluate(
        &self,
        split: &[Example],
        indices: &[usize],
    ) -> TrainingResult<EvalAccumulator> {
        let mut acc = EvalAccumulator::default();
        for chunk in indices.chunks(self.config.batch_size()) {
            let (batch, labels) = self.make_batch(split, chunk)?;
            let logits = self.model.forward(&batch)?;
            let loss = candle_nn::loss::cross_entropy(&logits, &labels)?.to_scalar::<f32>()?;
            let predictions = logits.argmax(1)?.to_vec1::<u32>()?;
            let correct = predictions
                .iter()
                .zip(chunk)
                .filter(|&(&p, &i)| p == split[i].label)
                .count();
            acc.add_batch(f64::from(loss), correct as u64, chunk.len() as u64);
        }
        Ok(acc)
    }

    pub(crate) fn save(&self, epoch: usize) -> TrainingResult<std::path::PathBuf> {
        let path = self.config.checkpoint_path(epoch);
        save_checkpoint(self.model.as_ref(), &path)?;
        self.emit(ProgressEvent::CheckpointSaved {
            model_name: self.config.model_name().to_string(),
            epoch,
            path: path.clone(),
        });
        Ok(path)
    }

    pub(crate) fn load(&mut self, path: &Path) -> TrainingResult<()> {
        load_checkpoint(self.model.as_mut(), path)
    }
}

/// Flattens gradients in parameter-name order, sums them across ranks and
/// writes back the mean.
fn average_gradients(
    params: &[(String, Var)],
    grads: &mut GradStore,
    comm: &mut dyn Communicator,
) -> TrainingResult<()> {
    let mut flat = Vec::with_capacity(params.iter().map(|(_, v)| v.elem_count()).sum());
    for (_, var) in params {
        match grads.get(var.as_tensor()) {
            Some(grad) => flat.extend(grad.flatten_all()?.to_vec1::<f32>()?),
            None => flat.extend(std::iter::repeat_n(0f32, var.elem_count())),
        }
    }

    comm.all_reduce_sum_f32(&mut flat)?;

    let scale = 1.0 / comm.world_size() as f32;
    let mut offset = 0;
    for (_, var) in params {
        let n = var.elem_count();
        let mean: Vec<f32> = flat[offset..offset + n].iter().map(|g| g * scale).collect();
        offset += n;
        let grad = Tensor::from_vec(mean, var.shape().clone(), var.device())?;
        grads.insert(var.as_tensor(), grad);
    }
    Ok(())
}

/// Trains and evaluates one model on one device.
pub struct SingleDeviceTrainer<'a> {
    engine: StepEngine<'a>,
    phase: TrainerPhase,
}

impl<'a> SingleDeviceTrainer<'a> {
    pub fn new(
        model: Box<dyn SequenceClassifier>,
        splits: &'a DatasetSplits,
        config: TrainingConfig,
        pad_id: u32,
        progress: &'a dyn ProgressSink,
    ) -> TrainingResult<Self> {
        Ok(Self {
            engine: StepEngine::new(model, splits, config, pad_id, 0, progress)?,
            phase: TrainerPhase::Created,
        })
    }
}

impl Trainer for SingleDeviceTrainer<'_> {
    type Report = EvalReport;

    fn phase(&self) -> TrainerPhase {
        self.phase
    }

    fn config(&self) -> &TrainingConfig {
        self.engine.config()
    }

    fn train(&mut self, max_epochs: usize) -> TrainingResult<Vec<EpochSummary>> {
        self.engine.config().validate()?;
        if max_epochs == 0 {
            return Err(TrainingError::InvalidConfig("max_epochs must be >= 1".to_string()));
        }

        let model_name = self.engine.config().model_name().to_string();
        let splits = self.engine.splits();
        let sampler = EpochSampler::single(splits.train.len(), self.engine.config().seed());
        let val_indices: Vec<usize> = (0..splits.val.len()).collect();

        self.engine.emit(ProgressEvent::Started {
            model_name: model_name.clone(),
            rank: 0,
            epochs: max_epochs,
        });

        let mut summaries = Vec::with_capacity(max_epochs);
        for epoch in 0..max_epochs {
            self.phase = TrainerPhase::Training { epoch };
            let order = sampler.indices(epoch);
            let (loss_sum, steps) = self.engine.train_epoch(epoch, &order, None)?;
            let validation = self.engine.evaluate(&splits.val, &val_indices)?.finish();

            let checkpoint = if self.engine.config().should_save(epoch, max_epochs) {
                self.phase = TrainerPhase::Saving { epoch };
                Some(self.engine.save(epoch)?)
            } else {
                None
            };

            let summary = EpochSummary {
                epoch,
                train_loss: if steps == 0 { 0.0 } else { loss_sum / steps as f64 },
                steps,
                validation,
                checkpoint,
            };
            self.engine.emit(ProgressEvent::EpochFinished {
                model_name: model_name.clone(),
                rank: 0,
                summary: summary.clone(),
            });
            summaries.push(summary);
        }

        self.phase = TrainerPhase::Trained;
        self.engine.emit(ProgressEvent::Finished { model_name, rank: 0 });
        Ok(summaries)
    }

    fn test(&mut self, final_model_path: &Path) -> TrainingResult<EvalReport> {
        self.phase = TrainerPhase::Testing;
        self.engine.load(final_model_path)?;

        let splits = self.engine.splits();
        let indices: Vec<usize> = (0..splits.test.len()).collect();
        let report = self.engine.evaluate(&splits.test, &indices)?.finish();

        self.engine.emit(ProgressEvent::Tested {
            model_name: self.engine.config().model_name().to_string(),
            report,
        });
        self.phase = TrainerPhase::Done;
        Ok(report)
    }

    fn model(&self) -> &dyn SequenceClassifier {
        self.engine.model()
    }
}
