//! Model families and the `ModelSpec` a factory builds from.

use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pretrained model family a run fine-tunes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    /// Bidirectional encoder, pooled on the leading `[CLS]` position.
    Bert,
    /// Causal decoder, pooled on the last non-padding position.
    Gpt2,
    /// Causal decoder fine-tuned through a LoRA adapter over a quantized base.
    Llama,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 3] = [Self::Bert, Self::Gpt2, Self::Llama];

    /// Hub identifier of the pretrained checkpoint.
    #[must_use]
    pub fn checkpoint_id(self) -> &'static str {
        match self {
            Self::Bert => "bert-base-uncased",
            Self::Gpt2 => "gpt2",
            Self::Llama => "meta-llama/Llama-2-7b-hf",
        }
    }

    /// Tag used in checkpoint directories for single-device runs.
    #[must_use]
    pub fn model_name(self) -> &'static str {
        match self {
            Self::Bert => "BERT",
            Self::Gpt2 => "GPT2",
            Self::Llama => "Llama",
        }
    }

    /// Tag used in checkpoint directories for distributed runs.
    ///
    /// GPT-2 shares its tag between both modes.
    #[must_use]
    pub fn distributed_model_name(self) -> &'static str {
        match self {
            Self::Bert => "BERT_DDP",
            Self::Gpt2 => "GPT2",
            Self::Llama => "Llama_DDP",
        }
    }

    #[must_use]
    pub fn pooling(self) -> Pooling {
        match self {
            Self::Bert => Pooling::First,
            Self::Gpt2 => Pooling::Last,
            Self::Llama => Pooling::Mean,
        }
    }

    #[must_use]
    pub fn adapter(self) -> AdapterKind {
        match self {
            Self::Bert | Self::Gpt2 => AdapterKind::None,
            Self::Llama => AdapterKind::Lora { rank: 8, alpha: 16.0 },
        }
    }

    /// Vocabulary size of the family's stock tokenizer.
    #[must_use]
    pub fn vocab_size(self) -> usize {
        match self {
            Self::Bert => 30_522,
            Self::Gpt2 => 50_257,
            Self::Llama => 32_000,
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bert => "bert",
            Self::Gpt2 => "gpt2",
            Self::Llama => "llama",
        };
        f.write_str(name)
    }
}

impl FromStr for ModelFamily {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bert" => Ok(Self::Bert),
            "gpt2" | "gpt" | "gpt-2" => Ok(Self::Gpt2),
            "llama" | "llama2" | "llama-2" => Ok(Self::Llama),
            other => Err(ModelError::UnknownFamily(other.to_string())),
        }
    }
}

/// How per-token hidden states collapse into one vector per sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pooling {
    First,
    Last,
    Mean,
}

/// Which weights a fine-tune updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterKind {
    /// Every weight is trainable.
    None,
    /// Base weights are int8-quantized and frozen; only a rank-`rank` LoRA
    /// delta and the classification head train.
    Lora { rank: usize, alpha: f64 },
}

impl AdapterKind {
    #[must_use]
    pub fn is_adapter(&self) -> bool {
        matches!(self, Self::Lora { .. })
    }
}

/// Everything a factory needs to build a classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub family: ModelFamily,
    pub checkpoint_id: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub pooling: Pooling,
    pub adapter: AdapterKind,
    /// Seed for weights not supplied by a pretrained file.
    pub seed: u64,
}

impl ModelSpec {
    #[must_use]
    pub fn for_family(family: ModelFamily) -> Self {
        Self {
            family,
            checkpoint_id: family.checkpoint_id().to_string(),
            vocab_size: family.vocab_size(),
            hidden_size: 64,
            pooling: family.pooling(),
            adapter: family.adapter(),
            seed: 42,
        }
    }

    #[must_use]
    pub fn with_vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = vocab_size;
        self
    }

    #[must_use]
    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    #[must_use]
    pub fn with_adapter(mut self, adapter: AdapterKind) -> Self {
        self.adapter = adapter;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.vocab_size < 2 {
            return Err(ModelError::InvalidSpec("vocab_size must be >= 2".to_string()));
        }
        if self.hidden_size == 0 {
            return Err(ModelError::InvalidSpec("hidden_size must be >= 1".to_string()));
        }
        if let AdapterKind::Lora { rank, alpha } = self.adapter {
            if rank == 0 || rank > self.hidden_size {
                return Err(ModelError::InvalidSpec(format!(
                    "lora rank must be in 1..={}, got {rank}",
                    self.hidden_size
                )));
            }
            if !alpha.is_finite() || alpha <= 0.0 {
                return Err(ModelError::InvalidSpec("lora alpha must be > 0".to_string()));
            }
        }
        Ok(())
    }
}
