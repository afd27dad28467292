//! Row-wise absmax int8 quantization for frozen base weights.

use crate::error::ModelResult;
use candle_core::{Device, Tensor};

/// A 2-D weight stored as int8 values with one f32 scale per row.
#[derive(Debug, Clone)]
pub struct QuantizedWeight {
    values: Vec<i8>,
    scales: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl QuantizedWeight {
    pub fn quantize(weight: &Tensor) -> ModelResult<Self> {
        let (rows, cols) = weight.dims2()?;
        let data = weight.to_vec2::<f32>()?;

        let mut values = Vec::with_capacity(rows * cols);
        let mut scales = Vec::with_capacity(rows);
        for row in &data {
            let absmax = row.iter().fold(0f32, |acc, v| acc.max(v.abs()));
            let scale = if absmax > 0.0 { absmax / 127.0 } else { 1.0 };
            scales.push(scale);
            values.extend(row.iter().map(|v| (v / scale).round().clamp(-127.0, 127.0) as i8));
        }

        Ok(Self { values, scales, rows, cols })
    }

    pub fn dequantize(&self, device: &Device) -> ModelResult<Tensor> {
        let data: Vec<f32> = self
            .values
            .chunks(self.cols)
            .zip(&self.scales)
            .flat_map(|(row, scale)| row.iter().map(move |q| f32::from(*q) * scale))
            .collect();
        Ok(Tensor::from_vec(data, (self.rows, self.cols), device)?)
    }

    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Bytes held by the quantized representation.
    #[must_use]
    pub fn storage_bytes(&self) -> usize {
        self.values.len() + self.scales.len() * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dequantize_is_close_to_source() {
        let device = Device::Cpu;
        let source = Tensor::new(&[[0.5f32, -1.0, 0.25], [0.0, 0.0, 0.0]], &device).unwrap();
        let q = QuantizedWeight::quantize(&source).unwrap();
        let restored = q.dequantize(&device).unwrap().to_vec2::<f32>().unwrap();

        assert!((restored[0][0] - 0.5).abs() < 0.01);
        assert!((restored[0][1] + 1.0).abs() < 1e-6);
        assert_eq!(restored[1], vec![0.0, 0.0, 0.0]);
        assert_eq!(q.shape(), (2, 3));
    }

    #[test]
    fn test_storage_is_smaller_than_f32() {
        let device = Device::Cpu;
        let source = Tensor::ones((16, 16), candle_core::DType::F32, &device).unwrap();
        let q = QuantizedWeight::quantize(&source).unwrap();
        assert!(q.storage_bytes() < 16 * 16 * 4);
    }
}
