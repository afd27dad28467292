//! Sequence classifiers built on candle.

use crate::adapter::LoraLinear;
use crate::error::{ModelError, ModelResult};
use crate::factory::BaseWeights;
use crate::family::{AdapterKind, ModelSpec, Pooling};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Embedding, Linear, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

/// A right-padded batch of token ids plus per-position pooling weights.
#[derive(Debug, Clone)]
pub struct TokenBatch {
    input_ids: Tensor,
    pool_weights: Tensor,
    /// Mean weights over the non-padding positions of each row.
    context_weights: Tensor,
    len: usize,
}

impl TokenBatch {
    pub fn new(
        sequences: &[&[u32]],
        pooling: Pooling,
        pad_id: u32,
        device: &Device,
    ) -> ModelResult<Self> {
        if sequences.is_empty() {
            return Err(ModelError::EmptyBatch);
        }
        let width = sequences.iter().map(|s| s.len()).max().unwrap_or(0).max(1);

        let mut ids = Vec::with_capacity(sequences.len() * width);
        let mut weights = Vec::with_capacity(sequences.len() * width);
        let mut context = Vec::with_capacity(sequences.len() * width);
        for seq in sequences {
            ids.extend_from_slice(seq);
            ids.extend(std::iter::repeat_n(pad_id, width - seq.len()));
            weights.extend(pool_row(seq.len(), width, pooling));
            context.extend(pool_row(seq.len(), width, Pooling::Mean));
        }

        let shape = (sequences.len(), width);
        Ok(Self {
            input_ids: Tensor::from_vec(ids, shape, device)?,
            pool_weights: Tensor::from_vec(weights, shape, device)?,
            context_weights: Tensor::from_vec(context, shape, device)?,
            len: sequences.len(),
        })
    }

    #[must_use]
    pub fn input_ids(&self) -> &Tensor {
        &self.input_ids
    }

    #[must_use]
    pub fn pool_weights(&self) -> &Tensor {
        &self.pool_weights
    }

    #[must_use]
    pub fn context_weights(&self) -> &Tensor {
        &self.context_weights
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn pool_row(len: usize, width: usize, pooling: Pooling) -> Vec<f32> {
    let mut row = vec![0f32; width];
    let len = len.max(1);
    match pooling {
        Pooling::First => row[0] = 1.0,
        Pooling::Last => row[len - 1] = 1.0,
        Pooling::Mean => {
            let w = 1.0 / len as f32;
            row[..len].iter_mut().for_each(|v| *v = w);
        }
    }
    row
}

/// A model mapping token batches to class logits.
///
/// Trainable weights are exposed by name so trainers can checkpoint them and
/// synchronize them across ranks in a stable order.
pub trait SequenceClassifier: Send {
    fn spec(&self) -> &ModelSpec;

    fn num_classes(&self) -> usize;

    fn device(&self) -> &Device;

    /// Logits of shape `[batch, num_classes]`.
    fn forward(&self, batch: &TokenBatch) -> ModelResult<Tensor>;

    /// Trainable parameters sorted by name.
    fn trainable_parameters(&self) -> ModelResult<Vec<(String, Var)>>;

    fn save_trainable(&self, path: &Path) -> ModelResult<()>;

    fn load_trainable(&mut self, path: &Path) -> ModelResult<()>;
}

#[derive(Debug, Clone)]
enum Projection {
    Dense(Linear),
    Lora(LoraLinear),
}

impl Module for Projection {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Dense(linear) => linear.forward(xs),
            Self::Lora(lora) => lora.forward(xs),
        }
    }
}

/// Embedding → sequence-context residual → projection (dense or LoRA) → tanh
/// → pooling → linear head.
///
/// Every position receives the mean embedding of its row, so the `[CLS]`
/// position pooled by `Pooling::First` still sees the whole sequence.
pub struct CandleClassifier {
    spec: ModelSpec,
    num_classes: usize,
    device: Device,
    varmap: VarMap,
    embeddings: Embedding,
    projection: Projection,
    head: Linear,
}

impl CandleClassifier {
    pub fn new(
        spec: ModelSpec,
        num_classes: usize,
        base: &BaseWeights,
        device: &Device,
    ) -> ModelResult<Self> {
        spec.validate()?;
        if num_classes == 0 {
            return Err(ModelError::InvalidSpec("num_classes must be >= 1".to_string()));
        }
        base.check_shapes(&spec)?;

        let hidden = spec.hidden_size;
        let mut varmap = VarMap::new();
        let (embeddings, projection, head) = {
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
            let (embeddings, projection) = match spec.adapter {
                AdapterKind::None => (
                    candle_nn::embedding(spec.vocab_size, hidden, vb.pp("embeddings"))?,
                    Projection::Dense(candle_nn::linear(hidden, hidden, vb.pp("projection"))?),
                ),
                AdapterKind::Lora { rank, alpha } => (
                    Embedding::new(base.embeddings.detach(), hidden),
                    Projection::Lora(LoraLinear::new(
                        &base.projection_weight,
                        Some(base.projection_bias.clone()),
                        rank,
                        alpha,
                        vb.pp("projection"),
                    )?),
                ),
            };
            let head = candle_nn::linear(hidden, num_classes, vb.pp("head"))?;
            (embeddings, projection, head)
        };

        initialize_parameters(&varmap, spec.seed)?;
        if !spec.adapter.is_adapter() {
            varmap.set_one("embeddings.weight", &base.embeddings)?;
            varmap.set_one("projection.weight", &base.projection_weight)?;
            varmap.set_one("projection.bias", &base.projection_bias)?;
        }

        Ok(Self {
            spec,
            num_classes,
            device: device.clone(),
            varmap,
            embeddings,
            projection,
            head,
        })
    }

    pub fn parameter_count(&self) -> ModelResult<usize> {
        Ok(self
            .trainable_parameters()?
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum())
    }
}

impl SequenceClassifier for CandleClassifier {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, batch: &TokenBatch) -> ModelResult<Tensor> {
        let embedded = self.embeddings.forward(batch.input_ids())?;
        let context = embedded
            .broadcast_mul(&batch.context_weights().unsqueeze(2)?)?
            .sum_keepdim(1)?;
        let mixed = embedded.broadcast_add(&context)?;
        let hidden = self.projection.forward(&mixed)?.tanh()?;
        let pooled = hidden
            .broadcast_mul(&batch.pool_weights().unsqueeze(2)?)?
            .sum(1)?;
        Ok(self.head.forward(&pooled)?)
    }

    fn trainable_parameters(&self) -> ModelResult<Vec<(String, Var)>> {
        let data = self.varmap.data().lock().map_err(|_| ModelError::Poisoned)?;
        let mut params: Vec<(String, Var)> =
            data.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    fn save_trainable(&self, path: &Path) -> ModelResult<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    fn load_trainable(&mut self, path: &Path) -> ModelResult<()> {
        self.varmap.load(path)?;
        Ok(())
    }
}

/// Seeded uniform init in `±1/sqrt(fan_in)`; biases and LoRA `B` start at zero.
fn initialize_parameters(varmap: &VarMap, seed: u64) -> ModelResult<()> {
    let data = varmap.data().lock().map_err(|_| ModelError::Poisoned)?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let mut rng = StdRng::seed_from_u64(seed);
    for name in names {
        let var = &data[name];
        let count = var.elem_count();
        let values = if name.ends_with("bias") || name.ends_with("lora_b") {
            vec![0f32; count]
        } else {
            let fan_in = var.dims().last().copied().unwrap_or(1).max(1);
            let bound = 1.0 / (fan_in as f32).sqrt();
            (0..count).map(|_| rng.gen_range(-bound..bound)).collect()
        };
        var.set(&Tensor::from_vec(values, var.shape().clone(), var.device())?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::ModelFamily;

    fn tiny_spec(family: ModelFamily) -> ModelSpec {
        let spec = ModelSpec::for_family(family).with_vocab_size(32).with_hidden_size(8);
        match spec.adapter {
            AdapterKind::Lora { alpha, .. } => {
                spec.with_adapter(AdapterKind::Lora { rank: 2, alpha })
            }
            AdapterKind::None => spec,
        }
    }

    fn build(family: ModelFamily) -> CandleClassifier {
        let device = Device::Cpu;
        let spec = tiny_spec(family);
        let base = BaseWeights::seeded(&spec, &device).unwrap();
        CandleClassifier::new(spec, 3, &base, &device).unwrap()
    }

    #[test]
    fn test_pool_rows() {
        assert_eq!(pool_row(2, 4, Pooling::First), vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(pool_row(2, 4, Pooling::Last), vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(pool_row(2, 4, Pooling::Mean), vec![0.5, 0.5, 0.0, 0.0]);
        assert_eq!(pool_row(0, 3, Pooling::Last), vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_forward_shapes_for_every_family() {
        for family in ModelFamily::ALL {
            let model = build(family);
            let a: &[u32] = &[1, 5, 6];
            let b: &[u32] = &[1, 7];
            let batch = TokenBatch::new(&[a, b], model.spec().pooling, 0, model.device()).unwrap();
            let logits = model.forward(&batch).unwrap();
            assert_eq!(logits.dims(), &[2, 3]);
        }
    }

    #[test]
    fn test_adapter_family_trains_only_adapter_and_head() {
        let model = build(ModelFamily::Llama);
        let names: Vec<String> =
            model.trainable_parameters().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["head.bias", "head.weight", "projection.lora_a", "projection.lora_b"]
        );
    }

    #[test]
    fn test_same_seed_gives_same_weights() {
        let a = build(ModelFamily::Bert);
        let b = build(ModelFamily::Bert);
        for ((na, va), (nb, vb)) in a
            .trainable_parameters()
            .unwrap()
            .iter()
            .zip(b.trainable_parameters().unwrap().iter())
        {
            assert_eq!(na, nb);
            let diff = (va.as_tensor() - vb.as_tensor())
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert_eq!(diff, 0.0);
        }
    }

    #[test]
    fn test_save_then_load_restores_weights() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("weights.pt");

        let trained = build(ModelFamily::Gpt2);
        trained.save_trainable(&path).unwrap();

        let mut fresh = CandleClassifier::new(
            tiny_spec(ModelFamily::Gpt2).with_seed(7),
            3,
            &BaseWeights::seeded(&tiny_spec(ModelFamily::Gpt2), &Device::Cpu).unwrap(),
            &Device::Cpu,
        )
        .unwrap();
        fresh.load_trainable(&path).unwrap();

        let head = |m: &CandleClassifier| {
            let params = m.trainable_parameters().unwrap();
            assert_eq!(params[1].0, "head.weight");
            params[1].1.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()
        };
        assert_eq!(head(&trained), head(&fresh));
    }

    #[test]
    fn test_first_pooling_depends_on_whole_sequence() {
        let model = build(ModelFamily::Bert);
        let a: &[u32] = &[1, 5, 9, 12];
        let b: &[u32] = &[1, 20, 21];
        let batch = TokenBatch::new(&[a, b], Pooling::First, 0, model.device()).unwrap();
        let rows = model.forward(&batch).unwrap().to_vec2::<f32>().unwrap();
        assert_ne!(rows[0], rows[1]);
    }

    #[test]
    fn test_padding_does_not_change_logits() {
        let model = build(ModelFamily::Gpt2);
        let short: &[u32] = &[1, 5];
        let long: &[u32] = &[1, 6, 7, 8, 9];
        let alone = TokenBatch::new(&[short], Pooling::Last, 0, model.device()).unwrap();
        let padded = TokenBatch::new(&[short, long], Pooling::Last, 0, model.device()).unwrap();

        let alone = model.forward(&alone).unwrap().to_vec2::<f32>().unwrap();
        let padded = model.forward(&padded).unwrap().to_vec2::<f32>().unwrap();
        for (x, y) in alone[0].iter().zip(&padded[0]) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let result = TokenBatch::new(&[], Pooling::First, 0, &Device::Cpu);
        assert!(matches!(result, Err(ModelError::EmptyBatch)));
    }
}
