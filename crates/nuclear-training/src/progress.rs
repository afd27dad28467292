use crate::metrics::{EpochSummary, EvalReport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { model_name: String, rank: usize, epochs: usize },
    Step { model_name: String, rank: usize, epoch: usize, step: u64, total: u64, loss: f64 },
    EpochFinished { model_name: String, rank: usize, summary: EpochSummary },
    CheckpointSaved { model_name: String, epoch: usize, path: PathBuf },
    Tested { model_name: String, report: EvalReport },
    Finished { model_name: String, rank: usize },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Forwards progress to `tracing`; per-step events go out at debug level.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { model_name, rank, epochs } => {
                tracing::info!(%model_name, rank, epochs, "Training started");
            }
            ProgressEvent::Step { model_name, rank, epoch, step, total, loss } => {
                tracing::debug!(%model_name, rank, epoch, step, total, loss, "Step");
            }
            ProgressEvent::EpochFinished { model_name, rank, summary } => {
                tracing::info!(
                    %model_name,
                    rank,
                    epoch = summary.epoch,
                    train_loss = summary.train_loss,
                    val_loss = summary.validation.loss,
                    val_accuracy = summary.validation.accuracy,
                    "Epoch finished"
                );
            }
            ProgressEvent::CheckpointSaved { model_name, epoch, path } => {
                tracing::info!(%model_name, epoch, path = %path.display(), "Checkpoint saved");
            }
            ProgressEvent::Tested { model_name, report } => {
                tracing::info!(
                    %model_name,
                    loss = report.loss,
                    accuracy = report.accuracy,
                    correct = report.correct,
                    total = report.total,
                    "Test finished"
                );
            }
            ProgressEvent::Finished { model_name, rank } => {
                tracing::info!(%model_name, rank, "Training finished");
            }
        }
    }
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn on_event(&self, _event: ProgressEvent) {}
}

#[cfg(test)]
pub(crate) mod recording {
    use super::{ProgressEvent, ProgressSink};
    use std::sync::Mutex;

    /// Test sink that keeps every event.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressSink for RecordingSink {
        fn on_event(&self, event: ProgressEvent) {
            if let Ok(mut events) = self.events.lock() {
                events.push(event);
            }
        }
    }
}
