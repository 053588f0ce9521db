//! Dense linear sublayers.
//!
//! Weights use the `[out_features, in_features]` layout and `matmul` computes
//! `y = x @ W^T + b`. A block swaps a float layer for its packed replacement by
//! name through [`crate::block::TransformerBlock::replace_linear`]; the bias is
//! carried over unchanged.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::checkpoint::TensorData;
use crate::config::QuantConfig;
use crate::error::{AwqError, AwqResult};
use crate::packing::PackedWeight;

/// Weight storage of a linear layer.
#[derive(Debug, Clone, PartialEq)]
pub enum LinearData {
    F32(Array2<f32>),
    Packed(PackedWeight),
}

/// A linear transformation `y = x W^T + b`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearLayer {
    pub data: LinearData,
    pub bias: Option<Array1<f32>>,
}

impl From<Array2<f32>> for LinearLayer {
    fn from(weights: Array2<f32>) -> Self {
        Self::new_f32(weights, None)
    }
}

impl LinearLayer {
    pub fn new_f32(weights: Array2<f32>, bias: impl Into<Option<Array1<f32>>>) -> Self {
        Self {
            data: LinearData::F32(weights),
            bias: bias.into(),
        }
    }

    /// Computes `y = x @ W^T + b`.
    ///
    /// Packed layers are dequantized first; this is a reference path used to
    /// evaluate quantized blocks, not an inference kernel.
    pub fn matmul(&self, input: &ArrayView2<f32>) -> Array2<f32> {
        let mut result = match &self.data {
            LinearData::F32(w) => input.dot(&w.t()),
            LinearData::Packed(p) => input.dot(&p.dequantize().t()),
        };
        if let Some(b) = &self.bias {
            result.outer_iter_mut().for_each(|mut row| row += b);
        }
        result
    }

    pub fn out_features(&self) -> usize {
        match &self.data {
            LinearData::F32(w) => w.nrows(),
            LinearData::Packed(p) => p.out_features,
        }
    }

    pub fn in_features(&self) -> usize {
        match &self.data {
            LinearData::F32(w) => w.ncols(),
            LinearData::Packed(p) => p.in_features,
        }
    }

    pub fn is_packed(&self) -> bool {
        matches!(self.data, LinearData::Packed(_))
    }

    /// Float weight, `None` once packed.
    pub fn weight(&self) -> Option<&Array2<f32>> {
        match &self.data {
            LinearData::F32(w) => Some(w),
            LinearData::Packed(_) => None,
        }
    }

    /// Float weight for in-place mutation; packed layers are immutable.
    pub fn weight_mut(&mut self, name: &str) -> AwqResult<&mut Array2<f32>> {
        match &mut self.data {
            LinearData::F32(w) => Ok(w),
            LinearData::Packed(_) => Err(AwqError::topology(format!(
                "{} is already packed and cannot be modified",
                name
            ))),
        }
    }

    /// Multiplies input channel `j` of the weight by `scales[j]`.
    pub fn scale_inputs(&mut self, name: &str, scales: &ArrayView1<f32>) -> AwqResult<()> {
        let in_features = self.in_features();
        if scales.len() != in_features {
            return Err(AwqError::topology(format!(
                "{} expects {} input scales, got {}",
                name,
                in_features,
                scales.len()
            )));
        }
        let w = self.weight_mut(name)?;
        w.axis_iter_mut(Axis(0)).for_each(|mut row| row *= scales);
        Ok(())
    }

    /// Divides the last `scales.len()` output channels (rows and bias) by
    /// `scales`. A fused projection only rescales its trailing slice.
    pub fn scale_outputs_down(&mut self, name: &str, scales: &ArrayView1<f32>) -> AwqResult<()> {
        let out_features = self.out_features();
        let n = scales.len();
        if n > out_features {
            return Err(AwqError::topology(format!(
                "{} has {} outputs, cannot divide the last {}",
                name, out_features, n
            )));
        }
        let start = out_features - n;
        let w = self.weight_mut(name)?;
        w.slice_mut(s![start.., ..])
            .axis_iter_mut(Axis(1))
            .for_each(|mut col| col /= scales);
        if let Some(b) = &mut self.bias {
            let mut tail = b.slice_mut(s![start..]);
            tail /= scales;
        }
        Ok(())
    }

    /// Builds the packed replacement from this layer's dequantized weight and
    /// its quantization parameters. The bias is kept.
    pub fn to_packed(
        &self,
        name: &str,
        scales: &ArrayView2<f32>,
        zeros: &ArrayView2<f32>,
        config: &QuantConfig,
    ) -> AwqResult<LinearLayer> {
        let w = self.weight().ok_or_else(|| {
            AwqError::topology(format!("{} is already packed", name))
        })?;
        Ok(LinearLayer {
            data: LinearData::Packed(PackedWeight::from_float(&w.view(), scales, zeros, config)?),
            bias: self.bias.clone(),
        })
    }

    pub fn param_bytes(&self) -> u64 {
        let weight = match &self.data {
            LinearData::F32(w) => w.len() as u64 * 4,
            LinearData::Packed(p) => p.param_bytes(),
        };
        weight + self.bias.as_ref().map_or(0, |b| b.len() as u64 * 4)
    }

    /// Checkpoint tensors under `prefix`: `weight` for float layers,
    /// `qweight`/`qzeros`/`scales` for packed ones, plus `bias`.
    pub fn named_tensors(&self, prefix: &str) -> Vec<(String, TensorData)> {
        let mut out = match &self.data {
            LinearData::F32(w) => vec![(format!("{}.weight", prefix), TensorData::from(w.clone()))],
            LinearData::Packed(p) => vec![
                (format!("{}.qweight", prefix), TensorData::from(p.qweight.clone())),
                (format!("{}.qzeros", prefix), TensorData::from(p.qzeros.clone())),
                (format!("{}.scales", prefix), TensorData::from(p.scales.clone())),
            ],
        };
        if let Some(b) = &self.bias {
            out.push((format!("{}.bias", prefix), TensorData::from(b.clone())));
        }
        out
    }
}
