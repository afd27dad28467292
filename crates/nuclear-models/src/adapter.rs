//! Low-rank adapter over a frozen, int8-quantized linear layer.

use crate::error::ModelResult;
use crate::quant::QuantizedWeight;
use candle_core::{Module, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

/// `y = x·Wᵀ + b + (alpha / rank) · x·Aᵀ·Bᵀ`, with `W` frozen.
///
/// `A` (`rank × in`) and `B` (`out × rank`) live in the trainable parameter
/// store under `<prefix>.lora_a` / `<prefix>.lora_b`. `B` starts at zero so
/// an untrained adapter reproduces the base layer exactly.
#[derive(Debug, Clone)]
pub struct LoraLinear {
    base: Linear,
    quantized: QuantizedWeight,
    lora_a: Linear,
    lora_b: Linear,
    scale: f64,
}

impl LoraLinear {
    pub fn new(
        base_weight: &Tensor,
        base_bias: Option<Tensor>,
        rank: usize,
        alpha: f64,
        vb: VarBuilder,
    ) -> ModelResult<Self> {
        let (out_dim, in_dim) = base_weight.dims2()?;
        let quantized = QuantizedWeight::quantize(base_weight)?;
        let frozen = quantized.dequantize(base_weight.device())?.detach();
        let base = Linear::new(frozen, base_bias.map(|b| b.detach()));

        let a = vb.get_with_hints((rank, in_dim), "lora_a", Init::Const(0.0))?;
        let b = vb.get_with_hints((out_dim, rank), "lora_b", Init::Const(0.0))?;

        Ok(Self {
            base,
            quantized,
            lora_a: Linear::new(a, None),
            lora_b: Linear::new(b, None),
            scale: alpha / rank as f64,
        })
    }

    #[must_use]
    pub fn quantized(&self) -> &QuantizedWeight {
        &self.quantized
    }
}

impl Module for LoraLinear {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let base = self.base.forward(xs)?;
        let delta = self.lora_b.forward(&self.lora_a.forward(xs)?)?;
        base + delta.affine(self.scale, 0.0)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_zero_adapter_matches_dequantized_base() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let weight = Tensor::new(&[[1.0f32, 0.0], [0.0, -1.0]], &device).unwrap();
        let layer = LoraLinear::new(&weight, None, 1, 2.0, vb.pp("proj")).unwrap();

        let xs = Tensor::new(&[[2.0f32, 3.0]], &device).unwrap();
        let ys = layer.forward(&xs).unwrap().to_vec2::<f32>().unwrap();
        assert!((ys[0][0] - 2.0).abs() < 1e-4);
        assert!((ys[0][1] + 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_only_adapter_weights_are_registered() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let weight = Tensor::zeros((4, 4), DType::F32, &device).unwrap();
        let _layer = LoraLinear::new(&weight, None, 2, 4.0, vb.pp("proj")).unwrap();

        let mut names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["proj.lora_a".to_string(), "proj.lora_b".to_string()]);
    }
}
