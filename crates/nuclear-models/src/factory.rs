//! Model factory for building classifiers from a family spec.
//!
//! Pretrained base weights are looked up under
//! `<models_dir>/<checkpoint_id>/model.safetensors`. When the file is absent
//! the base is generated from the `ModelSpec` seed, which keeps every rank of a
//! distributed run on identical weights.

use crate::classifier::{CandleClassifier, SequenceClassifier};
use crate::error::{ModelError, ModelResult};
use crate::family::ModelSpec;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const WEIGHTS_FILENAME: &str = "model.safetensors";
const BASE_SEED_OFFSET: u64 = 0x9E37_79B9_7F4A_7C15;

/// Base (pre-head) weights of a classifier.
#[derive(Debug, Clone)]
pub struct BaseWeights {
    pub embeddings: Tensor,
    pub projection_weight: Tensor,
    pub projection_bias: Tensor,
}

impl BaseWeights {
    /// Deterministic stand-in for a pretrained base.
    pub fn seeded(spec: &ModelSpec, device: &Device) -> ModelResult<Self> {
        let mut rng = StdRng::seed_from_u64(spec.seed ^ BASE_SEED_OFFSET);
        let h = spec.hidden_size;
        let bound = 1.0 / (h as f32).sqrt();
        let mut uniform = |count: usize| -> Vec<f32> {
            (0..count).map(|_| rng.gen_range(-bound..bound)).collect()
        };

        Ok(Self {
            embeddings: Tensor::from_vec(
                uniform(spec.vocab_size * h),
                (spec.vocab_size, h),
                device,
            )?,
            projection_weight: Tensor::from_vec(uniform(h * h), (h, h), device)?,
            projection_bias: Tensor::zeros(h, candle_core::DType::F32, device)?,
        })
    }

    /// Reads `embeddings.weight`, `projection.weight` and `projection.bias`.
    pub fn from_safetensors(path: &Path, spec: &ModelSpec, device: &Device) -> ModelResult<Self> {
        let mut tensors: HashMap<String, Tensor> = candle_core::safetensors::load(path, device)?;
        let mut take = |name: &str| {
            tensors.remove(name).ok_or_else(|| ModelError::IncompatibleWeights {
                checkpoint: spec.checkpoint_id.clone(),
                reason: format!("missing tensor {name} in {}", path.display()),
            })
        };

        let weights = Self {
            embeddings: take("embeddings.weight")?,
            projection_weight: take("projection.weight")?,
            projection_bias: take("projection.bias")?,
        };
        weights.check_shapes(spec)?;
        Ok(weights)
    }

    pub fn check_shapes(&self, spec: &ModelSpec) -> ModelResult<()> {
        let h = spec.hidden_size;
        let expected: [(&str, &Tensor, Vec<usize>); 3] = [
            ("embeddings.weight", &self.embeddings, vec![spec.vocab_size, h]),
            ("projection.weight", &self.projection_weight, vec![h, h]),
            ("projection.bias", &self.projection_bias, vec![h]),
        ];
        for (name, tensor, dims) in expected {
            if tensor.dims() != dims.as_slice() {
                return Err(ModelError::IncompatibleWeights {
                    checkpoint: spec.checkpoint_id.clone(),
                    reason: format!("{name} has shape {:?}, expected {:?}", tensor.dims(), dims),
                });
            }
        }
        Ok(())
    }
}

/// Produces classification-ready models.
pub trait ModelFactory: Send + Sync {
    fn build(
        &self,
        spec: &ModelSpec,
        num_classes: usize,
        device: &Device,
    ) -> ModelResult<Box<dyn SequenceClassifier>>;
}

/// Builds [`CandleClassifier`]s, preferring on-disk pretrained bases.
#[derive(Debug, Clone, Default)]
pub struct CandleModelFactory {
    models_dir: Option<PathBuf>,
}

impl CandleModelFactory {
    #[must_use]
    pub fn new(models_dir: Option<PathBuf>) -> Self {
        Self { models_dir }
    }

    /// Location of the pretrained weights for `checkpoint_id`, if configured.
    #[must_use]
    pub fn weights_path(&self, checkpoint_id: &str) -> Option<PathBuf> {
        self.models_dir
            .as_ref()
            .map(|dir| dir.join(checkpoint_id).join(WEIGHTS_FILENAME))
    }

    /// `(vocab_size, hidden_size)` of the pretrained embedding table for
    /// `checkpoint_id`, or `None` when no weights file is present.
    pub fn pretrained_dims(&self, checkpoint_id: &str) -> ModelResult<Option<(usize, usize)>> {
        let Some(path) = self.weights_path(checkpoint_id).filter(|p| p.is_file()) else {
            return Ok(None);
        };
        let tensors = candle_core::safetensors::load(&path, &Device::Cpu)?;
        let embeddings =
            tensors.get("embeddings.weight").ok_or_else(|| ModelError::IncompatibleWeights {
                checkpoint: checkpoint_id.to_string(),
                reason: format!("missing tensor embeddings.weight in {}", path.display()),
            })?;
        match embeddings.dims() {
            &[vocab_size, hidden_size] => Ok(Some((vocab_size, hidden_size))),
            dims => Err(ModelError::IncompatibleWeights {
                checkpoint: checkpoint_id.to_string(),
                reason: format!("embeddings.weight has shape {dims:?}, expected two dimensions"),
            }),
        }
    }

    fn base_weights(&self, spec: &ModelSpec, device: &Device) -> ModelResult<BaseWeights> {
        match self.weights_path(&spec.checkpoint_id) {
            Some(path) if path.is_file() => {
                debug!(
                    checkpoint = %spec.checkpoint_id,
                    path = %path.display(),
                    "Loading pretrained base"
                );
                BaseWeights::from_safetensors(&path, spec, device)
            }
            _ => {
                warn!(
                    checkpoint = %spec.checkpoint_id,
                    "No pretrained weights found; using seeded base weights"
                );
                BaseWeights::seeded(spec, device)
            }
        }
    }
}

impl ModelFactory for CandleModelFactory {
    fn build(
        &self,
        spec: &ModelSpec,
        num_classes: usize,
        device: &Device,
    ) -> ModelResult<Box<dyn SequenceClassifier>> {
        debug!(
            family = %spec.family,
            checkpoint = %spec.checkpoint_id,
            num_classes,
            adapter = ?spec.adapter,
            "Creating classifier"
        );
        let base = self.base_weights(spec, device)?;
        let model = CandleClassifier::new(spec.clone(), num_classes, &base, device)?;
        Ok(Box::new(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::ModelFamily;
    use candle_core::DType;
    use tempfile::TempDir;

    fn tiny(family: ModelFamily) -> ModelSpec {
        ModelSpec::for_family(family).with_vocab_size(16).with_hidden_size(4)
    }

    /// Writes an all-ones base of `vocab x hidden` for `spec` under `root`.
    fn write_base(root: &Path, spec: &ModelSpec, vocab: usize, hidden: usize) {
        let dir = root.join(&spec.checkpoint_id);
        std::fs::create_dir_all(&dir).unwrap();

        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "embeddings.weight".to_string(),
            Tensor::ones((vocab, hidden), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            "projection.weight".to_string(),
            Tensor::ones((hidden, hidden), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            "projection.bias".to_string(),
            Tensor::zeros(hidden, DType::F32, &device).unwrap(),
        );
        candle_core::safetensors::save(&tensors, dir.join(WEIGHTS_FILENAME)).unwrap();
    }

    #[test]
    fn test_factory_builds_without_models_dir() {
        let factory = CandleModelFactory::default();
        let model = factory.build(&tiny(ModelFamily::Bert), 2, &Device::Cpu).unwrap();
        assert_eq!(model.num_classes(), 2);
    }

    #[test]
    fn test_factory_loads_pretrained_base() {
        let temp = TempDir::new().unwrap();
        let spec = tiny(ModelFamily::Bert);
        write_base(temp.path(), &spec, 16, 4);

        let factory = CandleModelFactory::new(Some(temp.path().to_path_buf()));
        let model = factory.build(&spec, 3, &Device::Cpu).unwrap();
        let params = model.trainable_parameters().unwrap();
        let (name, emb) = &params[0];
        assert_eq!(name, "embeddings.weight");
        let total = emb.as_tensor().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(total, 64.0);
    }

    #[test]
    fn test_mismatched_pretrained_shapes_are_rejected() {
        let temp = TempDir::new().unwrap();
        let spec = tiny(ModelFamily::Gpt2);
        write_base(temp.path(), &spec, 8, 4);

        let factory = CandleModelFactory::new(Some(temp.path().to_path_buf()));
        let result = factory.build(&spec, 3, &Device::Cpu);
        assert!(matches!(result, Err(ModelError::IncompatibleWeights { .. })));
    }

    #[test]
    fn test_pretrained_dims_come_from_embedding_table() {
        let temp = TempDir::new().unwrap();
        let spec = tiny(ModelFamily::Llama);
        write_base(temp.path(), &spec, 24, 12);

        let factory = CandleModelFactory::new(Some(temp.path().to_path_buf()));
        assert_eq!(factory.pretrained_dims(&spec.checkpoint_id).unwrap(), Some((24, 12)));
        assert_eq!(factory.pretrained_dims("no/such-model").unwrap(), None);
        let unconfigured = CandleModelFactory::default();
        assert_eq!(unconfigured.pretrained_dims(&spec.checkpoint_id).unwrap(), None);

        let wide = spec.with_vocab_size(24).with_hidden_size(12);
        let model = factory.build(&wide, 2, &Device::Cpu).unwrap();
        assert_eq!(model.num_classes(), 2);
    }
}
