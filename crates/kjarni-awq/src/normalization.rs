//! Normalization layers that can absorb an inverse channel scale.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::checkpoint::TensorData;
use crate::error::{AwqError, AwqResult};

/// Root Mean Square Layer Normalization
///
/// Formula: y = (x / RMS(x)) * weight
/// where RMS(x) = sqrt(mean(x^2) + eps)
#[derive(Debug, Clone, PartialEq)]
pub struct RMSNorm {
    pub weight: Array1<f32>,
    pub eps: f32,
}

impl RMSNorm {
    pub fn new(weight: Array1<f32>, eps: f32) -> Self {
        Self { weight, eps }
    }

    /// `hidden` is `[tokens, hidden_size]`.
    pub fn forward_2d(&self, hidden: &ArrayView2<f32>) -> Array2<f32> {
        let mean_squared = hidden.mapv(|x| x * x).sum_axis(Axis(1)) / hidden.ncols() as f32;
        let rms = (mean_squared + self.eps).mapv(f32::sqrt).insert_axis(Axis(1));
        let normalized = hidden / &rms;
        normalized * &self.weight
    }
}

/// Layer normalization with an optional bias.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Option<Array1<f32>>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(weight: Array1<f32>, bias: impl Into<Option<Array1<f32>>>, eps: f32) -> Self {
        Self {
            weight,
            bias: bias.into(),
            eps,
        }
    }

    pub fn forward_2d(&self, hidden: &ArrayView2<f32>) -> Array2<f32> {
        let n = hidden.ncols() as f32;
        let mean = (hidden.sum_axis(Axis(1)) / n).insert_axis(Axis(1));
        let centered = hidden - &mean;
        let variance = (centered.mapv(|x| x * x).sum_axis(Axis(1)) / n).insert_axis(Axis(1));
        let inv_std = (variance + self.eps).mapv(|v| 1.0 / v.sqrt());
        let mut out = centered * &inv_std * &self.weight;
        if let Some(b) = &self.bias {
            out += b;
        }
        out
    }
}

/// A normalization sublayer of a block.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalization {
    RMSNorm(RMSNorm),
    LayerNorm(LayerNorm),
}

impl From<RMSNorm> for Normalization {
    fn from(n: RMSNorm) -> Self {
        Normalization::RMSNorm(n)
    }
}

impl From<LayerNorm> for Normalization {
    fn from(n: LayerNorm) -> Self {
        Normalization::LayerNorm(n)
    }
}

impl Normalization {
    pub fn forward_2d(&self, hidden: &ArrayView2<f32>) -> Array2<f32> {
        match self {
            Normalization::RMSNorm(n) => n.forward_2d(hidden),
            Normalization::LayerNorm(n) => n.forward_2d(hidden),
        }
    }

    pub fn hidden_size(&self) -> usize {
        match self {
            Normalization::RMSNorm(n) => n.weight.len(),
            Normalization::LayerNorm(n) => n.weight.len(),
        }
    }

    /// Divides weight and bias by `scales`, so the output is scaled down
    /// channel-wise.
    pub fn scale_output_down(&mut self, name: &str, scales: &ArrayView1<f32>) -> AwqResult<()> {
        if scales.len() != self.hidden_size() {
            return Err(AwqError::topology(format!(
                "{} has {} channels, got {} scales",
                name,
                self.hidden_size(),
                scales.len()
            )));
        }
        match self {
            Normalization::RMSNorm(n) => n.weight /= scales,
            Normalization::LayerNorm(n) => {
                n.weight /= scales;
                if let Some(b) = &mut n.bias {
                    *b /= scales;
                }
            }
        }
        Ok(())
    }

    pub fn param_bytes(&self) -> u64 {
        match self {
            Normalization::RMSNorm(n) => n.weight.len() as u64 * 4,
            Normalization::LayerNorm(n) => {
                (n.weight.len() + n.bias.as_ref().map_or(0, |b| b.len())) as u64 * 4
            }
        }
    }

    pub fn named_tensors(&self, prefix: &str) -> Vec<(String, TensorData)> {
        match self {
            Normalization::RMSNorm(n) => {
                vec![(format!("{}.weight", prefix), TensorData::from(n.weight.clone()))]
            }
            Normalization::LayerNorm(n) => {
                let mut out = vec![(format!("{}.weight", prefix), TensorData::from(n.weight.clone()))];
                if let Some(b) = &n.bias {
                    out.push((format!("{}.bias", prefix), TensorData::from(b.clone())));
                }
                out
            }
        }
    }
}
