//! Data-parallel trainer: one replica per rank, gradients averaged each step.

use crate::config::TrainingConfig;
use crate::dataset::DatasetSplits;
use crate::distributed::group::Communicator;
use crate::error::{TrainingError, TrainingResult};
use crate::metrics::{EpochSummary, EvalAccumulator, EvalReport};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::sampler::{EpochSampler, eval_shard};
use crate::trainer::{StepEngine, Trainer, TrainerPhase};
use candle_core::Tensor;
use nuclear_models::SequenceClassifier;
use std::path::Path;
use tracing::debug;

pub struct DistributedTrainer<'a> {
    engine: StepEngine<'a>,
    comm: &'a mut dyn Communicator,
    phase: TrainerPhase,
}

impl<'a> DistributedTrainer<'a> {
    /// Wraps a replica and makes its weights identical to rank 0's.
    pub fn new(
        model: Box<dyn SequenceClassifier>,
        splits: &'a DatasetSplits,
        config: TrainingConfig,
        pad_id: u32,
        comm: &'a mut dyn Communicator,
        progress: &'a dyn ProgressSink,
    ) -> TrainingResult<Self> {
        let engine = StepEngine::new(model, splits, config, pad_id, comm.rank(), progress)?;
        let mut trainer = Self { engine, comm, phase: TrainerPhase::Created };
        trainer.broadcast_parameters()?;
        Ok(trainer)
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    fn broadcast_parameters(&mut self) -> TrainingResult<()> {
        let params = self.engine.params();
        let mut flat = Vec::new();
        for (_, var) in params {
            flat.extend(var.as_tensor().flatten_all()?.to_vec1::<f32>()?);
        }
        self.comm.broadcast_f32(&mut flat)?;
        if self.comm.rank() == 0 {
            return Ok(());
        }

        let mut offset = 0;
        for (name, var) in params {
            let n = var.elem_count();
            let values = flat[offset..offset + n].to_vec();
            offset += n;
            var.set(&Tensor::from_vec(values, var.shape().clone(), var.device())?)?;
            debug!(rank = self.comm.rank(), param = %name, "Synchronized parameter from rank 0");
        }
        Ok(())
    }

    fn reduce(&mut self, acc: EvalAccumulator) -> TrainingResult<EvalAccumulator> {
        let mut values = acc.to_array();
        self.comm.all_reduce_sum_f64(&mut values)?;
        Ok(EvalAccumulator::from_array(values))
    }
}

impl Trainer for DistributedTrainer<'_> {
    type Report = Option<EvalReport>;

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

        let rank = self.comm.rank();
        let world_size = self.comm.world_size();
        let model_name = self.engine.config().model_name().to_string();
        let splits = self.engine.splits();
        let seed = self.engine.config().seed();
        let sampler = EpochSampler::distributed(splits.train.len(), seed, rank, world_size)?;
        let val_indices = eval_shard(splits.val.len(), rank, world_size);

        self.engine.emit(ProgressEvent::Started {
            model_name: model_name.clone(),
            rank,
            epochs: max_epochs,
        });

        let mut summaries = Vec::with_capacity(max_epochs);
        for epoch in 0..max_epochs {
            self.phase = TrainerPhase::Training { epoch };
            let order = sampler.indices(epoch);
            let (loss_sum, steps) = self.engine.train_epoch(epoch, &order, Some(&mut *self.comm))?;

            let mut train_stats = [loss_sum, steps as f64];
            self.comm.all_reduce_sum_f64(&mut train_stats)?;
            let local_val = self.engine.evaluate(&splits.val, &val_indices)?;
            let validation = self.reduce(local_val)?.finish();

            let checkpoint = if self.engine.config().should_save(epoch, max_epochs) {
                self.phase = TrainerPhase::Saving { epoch };
                if rank == 0 {
                    Some(self.engine.save(epoch)?)
                } else {
                    Some(self.engine.config().checkpoint_path(epoch))
                }
            } else {
                None
            };
            self.comm.barrier()?;

            let summary = EpochSummary {
                epoch,
                train_loss: if train_stats[1] == 0.0 {
                    0.0
                } else {
                    train_stats[0] / train_stats[1]
                },
                steps,
                validation,
                checkpoint,
            };
            if rank == 0 {
                self.engine.emit(ProgressEvent::EpochFinished {
                    model_name: model_name.clone(),
                    rank,
                    summary: summary.clone(),
                });
            }
            summaries.push(summary);
        }

        self.comm.barrier()?;
        self.phase = TrainerPhase::Trained;
        self.engine.emit(ProgressEvent::Finished { model_name, rank });
        Ok(summaries)
    }

    /// Every rank loads `final_model_path` and scores its test shard; the
    /// sums are reduced and only rank 0 returns the report.
    fn test(&mut self, final_model_path: &Path) -> TrainingResult<Option<EvalReport>> {
        self.phase = TrainerPhase::Testing;
        self.engine.load(final_model_path)?;

        let rank = self.comm.rank();
        let splits = self.engine.splits();
        let indices = eval_shard(splits.test.len(), rank, self.comm.world_size());
        let local = self.engine.evaluate(&splits.test, &indices)?;
        let report = self.reduce(local)?.finish();
        self.phase = TrainerPhase::Done;

        if rank != 0 {
            return Ok(None);
        }
        self.engine.emit(ProgressEvent::Tested {
            model_name: self.engine.config().model_name().to_string(),
            report,
        });
        Ok(Some(report))
    }

    fn model(&self) -> &dyn SequenceClassifier {
        self.engine.model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Example;
    use crate::distributed::group::{Rendezvous, TcpProcessGroup, free_port};
    use crate::distributed::session::testing::CountingCommunicator;
    use crate::layout::CheckpointLayout;
    use crate::progress::NoopProgressSink;
    use crate::trainer::SingleDeviceTrainer;
    use nuclear_models::{CandleModelFactory, Device, ModelFactory, ModelFamily, ModelSpec};
    use std::time::Duration;
    use tempfile::TempDir;

    fn splits() -> DatasetSplits {
        let make = |range: std::ops::Range<u32>| -> Vec<Example> {
            range
                .map(|i| Example { input_ids: vec![1, 2 + i % 5, 8 + i % 4], label: i % 3 })
                .collect()
        };
        DatasetSplits { train: make(0..14), val: make(14..19), test: make(19..26), num_classes: 3 }
    }

    fn model(seed: u64) -> Box<dyn SequenceClassifier> {
        let spec = ModelSpec::for_family(ModelFamily::Gpt2)
            .with_vocab_size(24)
            .with_hidden_size(6)
            .with_seed(seed);
        CandleModelFactory::default().build(&spec, 3, &Device::Cpu).unwrap()
    }

    fn config(root: &Path, name: &str) -> TrainingConfig {
        TrainingConfig::builder()
            .epochs(2)
            .batch_size(4)
            .learning_rate(5e-3)
            .save_every(1)
            .model_name(name)
            .layout(CheckpointLayout::new(root.to_path_buf()))
            .build()
    }

    fn weights(model: &dyn SequenceClassifier) -> Vec<Vec<f32>> {
        model
            .trainable_parameters()
            .unwrap()
            .iter()
            .map(|(_, v)| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn test_single_rank_matches_single_device() {
        let temp = TempDir::new().unwrap();
        let data = splits();
        let sink = NoopProgressSink;

        let single_config = config(temp.path(), "single");
        let mut single =
            SingleDeviceTrainer::new(model(1), &data, single_config, 0, &sink).unwrap();
        let single_summaries = single.train(2).unwrap();

        let mut comm = CountingCommunicator::default();
        let ddp_config = config(temp.path(), "ddp");
        let mut ddp =
            DistributedTrainer::new(model(1), &data, ddp_config, 0, &mut comm, &sink).unwrap();
        let ddp_summaries = ddp.train(2).unwrap();

        assert_eq!(weights(single.model()), weights(ddp.model()));
        let steps = |s: &[EpochSummary]| s.iter().map(|e| e.steps).collect::<Vec<_>>();
        assert_eq!(steps(&single_summaries), steps(&ddp_summaries));
        assert_eq!(single_summaries[1].train_loss, ddp_summaries[1].train_loss);
    }

    #[test]
    fn test_barriers_per_epoch_and_before_test() {
        let temp = TempDir::new().unwrap();
        let data = splits();
        let sink = NoopProgressSink;
        let mut comm = CountingCommunicator::default();
        let barriers = comm.barriers.clone();
        let cfg = config(temp.path(), "BERT_DDP");
        let mut ddp = DistributedTrainer::new(model(1), &data, cfg, 0, &mut comm, &sink).unwrap();
        ddp.train(2).unwrap();
        assert_eq!(barriers.load(std::sync::atomic::Ordering::SeqCst), 3);

        let report = ddp.test(&ddp.config().final_checkpoint_path()).unwrap();
        assert_eq!(report.map(|r| r.total), Some(7));
    }

    #[test]
    fn test_two_ranks_stay_in_sync_and_only_rank_zero_saves() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let rendezvous = Rendezvous {
            rendezvous_timeout: Duration::from_secs(20),
            collective_timeout: Some(Duration::from_secs(20)),
            ..Rendezvous::local(free_port().unwrap())
        };

        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let root = root.clone();
                let rendezvous = rendezvous.clone();
                std::thread::spawn(move || {
                    let data = splits();
                    let sink = NoopProgressSink;
                    let mut group = TcpProcessGroup::connect(rank, 2, &rendezvous).unwrap();
                    // Seeds differ per rank; construction aligns them to rank 0.
                    let mut ddp = DistributedTrainer::new(
                        model(rank as u64 + 10),
                        &data,
                        config(&root, "BERT_DDP"),
                        0,
                        &mut group,
                        &sink,
                    )
                    .unwrap();
                    let summaries = ddp.train(1).unwrap();
                    let report = ddp.test(&ddp.config().checkpoint_path(0)).unwrap();
                    let w = weights(ddp.model());
                    drop(ddp);
                    group.teardown().unwrap();
                    (summaries[0].steps, report, w)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results[0].2, results[1].2);
        assert_eq!(results[0].0, 2);
        assert_eq!(results[1].0, 2);
        assert_eq!(results[0].1.map(|r| r.total), Some(7));
        assert!(results[1].1.is_none());

        let layout = CheckpointLayout::new(root);
        assert_eq!(layout.list_checkpoints("BERT_DDP").unwrap(), vec![0]);
    }

    #[test]
    fn test_missing_checkpoint_errors_on_every_rank() {
        let temp = TempDir::new().unwrap();
        let data = splits();
        let sink = NoopProgressSink;
        let mut comm = CountingCommunicator::default();
        let cfg = config(temp.path(), "GPT2");
        let mut ddp = DistributedTrainer::new(model(1), &data, cfg, 0, &mut comm, &sink).unwrap();
        let path = ddp.config().final_checkpoint_path();
        assert!(matches!(ddp.test(&path), Err(TrainingError::MissingCheckpoint(_))));
    }
}
