//! Nuclear Models
//!
//! Classification models for fine-tuning runs:
//! - Model families and the `ModelSpec`s they resolve to (`ModelFamily`, `ModelSpec`)
//! - The classifier seam trainers drive (`SequenceClassifier`)
//! - A candle implementation with optional LoRA-over-int8 adaptation
//! - The factory that builds classifiers from pretrained or seeded bases

pub mod adapter;
pub mod classifier;
pub mod error;
pub mod factory;
pub mod family;
pub mod quant;

pub use adapter::LoraLinear;
pub use classifier::{CandleClassifier, SequenceClassifier, TokenBatch};
pub use error::{ModelError, ModelResult};
pub use factory::{BaseWeights, CandleModelFactory, ModelFactory};
pub use family::{AdapterKind, ModelFamily, ModelSpec, Pooling};
pub use quant::QuantizedWeight;

pub use candle_core::Device;
