use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Aggregate loss and accuracy over an evaluated split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    /// Mean cross-entropy per example.
    pub loss: f64,
    pub accuracy: f64,
    pub correct: u64,
    pub total: u64,
}

/// Running sums for an [`EvalReport`].
///
/// Kept as plain sums so shards from several ranks can be added together
/// before averaging.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalAccumulator {
    pub loss_sum: f64,
    pub correct: u64,
    pub total: u64,
}

impl EvalAccumulator {
    /// Adds a batch whose mean loss was `mean_loss`.
    pub fn add_batch(&mut self, mean_loss: f64, correct: u64, batch_len: u64) {
        self.loss_sum += mean_loss * batch_len as f64;
        self.correct += correct;
        self.total += batch_len;
    }

    /// `[loss_sum, correct, total]`, the shape exchanged between ranks.
    #[must_use]
    pub fn to_array(&self) -> [f64; 3] {
        [self.loss_sum, self.correct as f64, self.total as f64]
    }

    #[must_use]
    pub fn from_array(values: [f64; 3]) -> Self {
        Self {
            loss_sum: values[0],
            correct: values[1].round() as u64,
            total: values[2].round() as u64,
        }
    }

    #[must_use]
    pub fn finish(&self) -> EvalReport {
        if self.total == 0 {
            return EvalReport { loss: 0.0, accuracy: 0.0, correct: 0, total: 0 };
        }
        let total = self.total as f64;
        EvalReport {
            loss: self.loss_sum / total,
            accuracy: self.correct as f64 / total,
            correct: self.correct,
            total: self.total,
        }
    }
}

/// What happened in one training epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub steps: u64,
    pub validation: EvalReport,
    /// Set when this epoch wrote a checkpoint.
    pub checkpoint: Option<PathBuf>,
}
