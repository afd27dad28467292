use crate::error::{TrainingError, TrainingResult};
use crate::layout::CheckpointLayout;
use serde::Serialize;
use std::path::PathBuf;

/// Immutable hyperparameters and naming for one training run.
///
/// Built once through [`TrainingConfig::builder`]. Ranges are not checked
/// here; trainers call [`TrainingConfig::validate`] when they start.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingConfig {
    epochs: usize,
    batch_size: usize,
    learning_rate: f64,
    weight_decay: f64,
    save_every: usize,
    model_name: String,
    seed: u64,
    #[serde(skip)]
    layout: CheckpointLayout,
}

impl TrainingConfig {
    #[must_use]
    pub fn builder() -> TrainingConfigBuilder {
        TrainingConfigBuilder::default()
    }

    #[must_use]
    pub fn total_epochs(&self) -> usize {
        self.epochs
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    #[must_use]
    pub fn weight_decay(&self) -> f64 {
        self.weight_decay
    }

    #[must_use]
    pub fn save_every(&self) -> usize {
        self.save_every
    }

    #[must_use]
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub fn layout(&self) -> &CheckpointLayout {
        &self.layout
    }

    #[must_use]
    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.layout.checkpoint_path(&self.model_name, epoch)
    }

    /// Checkpoint of epoch `total_epochs - 1`, the one the test phase reads.
    #[must_use]
    pub fn final_checkpoint_path(&self) -> PathBuf {
        self.checkpoint_path(self.epochs.saturating_sub(1))
    }

    /// Whether `epoch` of a `max_epochs` run writes a checkpoint.
    #[must_use]
    pub fn should_save(&self, epoch: usize, max_epochs: usize) -> bool {
        self.save_every > 0 && (epoch % self.save_every == 0 || epoch + 1 == max_epochs)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.epochs == 0 {
            return Err(TrainingError::InvalidConfig("epochs must be >= 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::InvalidConfig("batch_size must be >= 1".to_string()));
        }
        if self.save_every == 0 {
            return Err(TrainingError::InvalidConfig("save_every must be >= 1".to_string()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(TrainingError::InvalidConfig("learning_rate must be > 0".to_string()));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(TrainingError::InvalidConfig("weight_decay must be >= 0".to_string()));
        }
        if self.model_name.trim().is_empty() {
            return Err(TrainingError::InvalidConfig("model_name is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TrainingConfigBuilder {
    epochs: usize,
    batch_size: usize,
    learning_rate: f64,
    weight_decay: f64,
    save_every: usize,
    model_name: String,
    seed: u64,
    layout: CheckpointLayout,
}

impl Default for TrainingConfigBuilder {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 16,
            learning_rate: 2e-5,
            weight_decay: 0.01,
            save_every: 1,
            model_name: String::new(),
            seed: 42,
            layout: CheckpointLayout::default(),
        }
    }
}

impl TrainingConfigBuilder {
    #[must_use]
    pub fn epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    #[must_use]
    pub fn weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    #[must_use]
    pub fn save_every(mut self, save_every: usize) -> Self {
        self.save_every = save_every;
        self
    }

    #[must_use]
    pub fn model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn layout(mut self, layout: CheckpointLayout) -> Self {
        self.layout = layout;
        self
    }

    #[must_use]
    pub fn build(self) -> TrainingConfig {
        TrainingConfig {
            epochs: self.epochs,
            batch_size: self.batch_size,
            learning_rate: self.learning_rate,
            weight_decay: self.weight_decay,
            save_every: self.save_every,
            model_name: self.model_name,
            seed: self.seed,
            layout: self.layout,
        }
    }
}
