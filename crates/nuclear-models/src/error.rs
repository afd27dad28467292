use thiserror::Error;

pub type ModelResult<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown model family: {0}")]
    UnknownFamily(String),

    #[error("invalid model spec: {0}")]
    InvalidSpec(String),

    #[error("incompatible pretrained weights for {checkpoint}: {reason}")]
    IncompatibleWeights { checkpoint: String, reason: String },

    #[error("empty batch")]
    EmptyBatch,

    #[error("parameter store lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
