use std::path::PathBuf;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training config: {0}")]
    InvalidConfig(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("checkpoint not found: {}", .0.display())]
    MissingCheckpoint(PathBuf),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("distributed error: {0}")]
    Distributed(String),

    #[error("worker rank {rank} failed: {status}")]
    WorkerFailed { rank: usize, status: String },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Model(#[from] nuclear_models::ModelError),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    pub(crate) fn distributed(message: impl Into<String>) -> Self {
        Self::Distributed(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_checkpoint_names_the_path() {
        let err = TrainingError::MissingCheckpoint(PathBuf::from("trained_BERT/Nuclear_epoch1.pt"));
        assert_eq!(err.to_string(), "checkpoint not found: trained_BERT/Nuclear_epoch1.pt");
    }

    #[test]
    fn test_model_error_conversion() {
        let err: TrainingError = nuclear_models::ModelError::EmptyBatch.into();
        assert!(matches!(err, TrainingError::Model(_)));
    }
}
