//! Activation functions and the output-scaling wrapper used after scale
//! search folds a scale into an activation.

use std::str::FromStr;

use libm::{erff, expf, tanhf};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::checkpoint::TensorData;
use crate::error::{AwqError, AwqResult};

/// Minimum array size for parallel execution.
pub const PARALLEL_THRESHOLD: usize = 16_384;

const SQRT_2_INV: f32 = 0.7071067811865475;
const SQRT_2_OVER_PI: f32 = 0.7978845608;
const GELU_COEFF: f32 = 0.044715;

/// Supported activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Gelu,
    #[default]
    #[serde(alias = "gelu_new")]
    GeluNew,
    Relu,
    #[serde(alias = "silu", alias = "swish")]
    SilU,
}

impl FromStr for Activation {
    type Err = AwqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_fast" | "gelu_pytorch_tanh" => Ok(Activation::GeluNew),
            "relu" => Ok(Activation::Relu),
            "silu" | "swish" => Ok(Activation::SilU),
            _ => Err(AwqError::config(format!("unknown activation function: {}", s))),
        }
    }
}

#[inline(always)]
pub fn gelu_scalar(x: f32) -> f32 {
    0.5 * x * (1.0 + erff(x * SQRT_2_INV))
}

#[inline(always)]
pub fn gelu_new_scalar(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
    0.5 * x * (1.0 + tanhf(inner))
}

#[inline(always)]
pub fn silu_scalar(x: f32) -> f32 {
    if x <= -20.0 {
        0.0
    } else if x >= 20.0 {
        x
    } else {
        x / (1.0 + expf(-x))
    }
}

impl Activation {
    #[inline(always)]
    pub fn scalar(self, x: f32) -> f32 {
        match self {
            Activation::Gelu => gelu_scalar(x),
            Activation::GeluNew => gelu_new_scalar(x),
            Activation::Relu => x.max(0.0),
            Activation::SilU => silu_scalar(x),
        }
    }

    /// Applies the activation in place.
    pub fn apply(self, x: &mut Array2<f32>) {
        if x.len() >= PARALLEL_THRESHOLD {
            x.par_mapv_inplace(|v| self.scalar(v));
        } else {
            x.mapv_inplace(|v| self.scalar(v));
        }
    }
}

/// An activation whose output is divided channel-wise by `scales`.
///
/// Scale search folds a scale into the activation feeding a linear layer by
/// dividing the activation's output here and multiplying the consumer's
/// weight columns by the same amount.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledActivation {
    pub act: Activation,
    pub scales: Array1<f32>,
}

impl ScaledActivation {
    pub fn forward(&self, x: &mut Array2<f32>) {
        self.act.apply(x);
        x.axis_iter_mut(Axis(0)).for_each(|mut row| row /= &self.scales);
    }
}

/// A non-linear sublayer, optionally wrapped for output scaling.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationOp {
    Plain(Activation),
    Scaled(ScaledActivation),
}

impl From<Activation> for ActivationOp {
    fn from(act: Activation) -> Self {
        ActivationOp::Plain(act)
    }
}

impl ActivationOp {
    pub fn forward(&self, x: &mut Array2<f32>) {
        match self {
            ActivationOp::Plain(act) => act.apply(x),
            ActivationOp::Scaled(scaled) => scaled.forward(x),
        }
    }

    /// Wraps a plain activation with unit scales of width `shape`.
    pub fn ensure_scaled(&mut self, shape: usize) {
        if let ActivationOp::Plain(act) = *self {
            *self = ActivationOp::Scaled(ScaledActivation {
                act,
                scales: Array1::ones(shape),
            });
        }
    }

    /// Divides the output by `scales`, composing with any existing scale.
    pub fn scale_output_down(&mut self, name: &str, scales: &ArrayView1<f32>) -> AwqResult<()> {
        self.ensure_scaled(scales.len());
        if let ActivationOp::Scaled(scaled) = self {
            if scaled.scales.len() != scales.len() {
                return Err(AwqError::topology(format!(
                    "{} holds {} scales, got {}",
                    name,
                    scaled.scales.len(),
                    scales.len()
                )));
            }
            scaled.scales *= scales;
        }
        Ok(())
    }

    pub fn param_bytes(&self) -> u64 {
        match self {
            ActivationOp::Plain(_) => 0,
            ActivationOp::Scaled(s) => s.scales.len() as u64 * 4,
        }
    }

    /// `<prefix>.scales` once wrapped, nothing otherwise.
    pub fn named_tensors(&self, prefix: &str) -> Vec<(String, TensorData)> {
        match self {
            ActivationOp::Plain(_) => Vec::new(),
            ActivationOp::Scaled(s) => vec![(
                format!("{}.scales", prefix),
                TensorData::from(s.scales.clone()),
            )],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_scalars() {
        assert_abs_diff_eq!(gelu_scalar(0.0), 0.0);
        assert_abs_diff_eq!(gelu_scalar(1.0), 0.841_344_7, epsilon = 1e-5);
        assert_abs_diff_eq!(gelu_new_scalar(1.0), 0.841_192, epsilon = 1e-4);
        assert_abs_diff_eq!(silu_scalar(1.0), 0.731_058_6, epsilon = 1e-5);
        assert_eq!(silu_scalar(-30.0), 0.0);
        assert_eq!(Activation::Relu.scalar(-2.0), 0.0);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("swish".parse::<Activation>().unwrap(), Activation::SilU);
        assert_eq!("gelu".parse::<Activation>().unwrap(), Activation::Gelu);
        assert!("softplus".parse::<Activation>().is_err());
    }

    #[test]
    fn test_wrapping_with_ones_is_identity() {
        let x = arr2(&[[-1.0f32, 0.5, 2.0], [0.0, 3.0, -0.25]]);
        let mut plain = x.clone();
        ActivationOp::Plain(Activation::Gelu).forward(&mut plain);

        let mut op = ActivationOp::from(Activation::Gelu);
        op.ensure_scaled(3);
        let mut wrapped = x.clone();
        op.forward(&mut wrapped);
        assert_eq!(plain, wrapped);
        assert_eq!(op.named_tensors("ffn.act")[0].0, "ffn.act.scales");
    }

    #[test]
    fn test_scale_output_down_composes() {
        let mut op = ActivationOp::from(Activation::Relu);
        op.scale_output_down("act", &arr1(&[2.0f32, 4.0]).view()).unwrap();
        op.scale_output_down("act", &arr1(&[0.5f32, 2.0]).view()).unwrap();
        let mut x = arr2(&[[2.0f32, 8.0]]);
        op.forward(&mut x);
        assert_eq!(x, arr2(&[[2.0f32, 1.0]]));

        let err = op.scale_output_down("act", &arr1(&[1.0f32]).view()).unwrap_err();
        assert!(matches!(err, AwqError::DependencyInterface(_)));
    }
}
