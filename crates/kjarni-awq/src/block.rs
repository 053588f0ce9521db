//! The block-side half of the model adapter interface.
//!
//! A model family describes its repeated transformer block through
//! [`TransformerBlock`]: which linear sublayers it owns, how scale groups are
//! wired, which sublayers can absorb an inverse scale, and how to evaluate the
//! block or any of its submodules. The search and quant passes never look at
//! a block's concrete type.

use std::collections::HashMap;

use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::activations::ActivationOp;
use crate::capture::LinearObserver;
use crate::checkpoint::TensorData;
use crate::error::{AwqError, AwqResult};
use crate::linear::LinearLayer;
use crate::normalization::Normalization;

/// Module name that evaluates the whole block.
pub const WHOLE_BLOCK: &str = "";

/// State produced by the model prefix that every block needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockKwargs {
    /// Tokens per sequence; hidden states are `[n_seqs * seq_len, hidden]`.
    pub seq_len: usize,
}

/// Replacement layers used instead of the block's own, by name.
pub type LinearOverrides = HashMap<String, LinearLayer>;

/// Per-call evaluation context: an optional observer of linear inputs and
/// optional linear overrides.
#[derive(Default)]
pub struct ForwardCtx<'a> {
    observer: Option<&'a mut dyn LinearObserver>,
    overrides: Option<&'a LinearOverrides>,
}

impl<'a> ForwardCtx<'a> {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn observed(observer: &'a mut dyn LinearObserver) -> Self {
        Self {
            observer: Some(observer),
            overrides: None,
        }
    }

    pub fn with_overrides(overrides: &'a LinearOverrides) -> Self {
        Self {
            observer: None,
            overrides: Some(overrides),
        }
    }

    /// Evaluates the linear sublayer `name`, reporting its input first.
    pub fn linear(&mut self, name: &str, layer: &LinearLayer, x: &ArrayView2<f32>) -> Array2<f32> {
        if let Some(observer) = self.observer.as_deref_mut() {
            observer.observe(name, x);
        }
        let layer = self
            .overrides
            .and_then(|o| o.get(name))
            .unwrap_or(layer);
        layer.matmul(x)
    }
}

/// Linear sublayers sharing one input, together with the operation producing
/// that input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleGroup {
    /// Operation whose output is divided by the scale.
    pub prev_op: String,
    /// Linear layers whose input columns are multiplied by the scale.
    pub linears: Vec<String>,
    /// Captured input feature key.
    pub input: String,
    /// Module evaluated to score candidate scales.
    pub inspect: String,
}

impl ScaleGroup {
    /// A group inspected through `inspect`, or through its single linear
    /// layer when `inspect` is `None`.
    pub fn new(prev_op: &str, linears: &[&str], inspect: Option<&str>) -> Self {
        let first = linears.first().copied().unwrap_or_default();
        Self {
            prev_op: prev_op.to_string(),
            linears: linears.iter().map(|s| s.to_string()).collect(),
            input: first.to_string(),
            inspect: inspect.unwrap_or(first).to_string(),
        }
    }
}

/// A sublayer that can absorb an inverse scale on its output.
pub enum ScalableOp<'a> {
    Norm(&'a mut Normalization),
    Linear(&'a mut LinearLayer),
    Activation(&'a mut ActivationOp),
}

impl ScalableOp<'_> {
    /// Divides the op's output channels by `scales`.
    pub fn scale_output_down(self, name: &str, scales: &ArrayView1<f32>) -> AwqResult<()> {
        match self {
            ScalableOp::Norm(n) => n.scale_output_down(name, scales),
            ScalableOp::Linear(l) => l.scale_outputs_down(name, scales),
            ScalableOp::Activation(a) => a.scale_output_down(name, scales),
        }
    }
}

/// Whether a block's activation must be wrapped for output scaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActScaling {
    NotScalable,
    Scalable { scale_name: String, scale_shape: usize },
}

/// One repeated transformer unit.
///
/// Hidden states are `[tokens, hidden]`, with tokens laid out sequence by
/// sequence as described by [`BlockKwargs`].
pub trait TransformerBlock: Send + Sync {
    /// Evaluates a named submodule, [`WHOLE_BLOCK`] or any linear sublayer.
    fn forward_module(
        &self,
        module: &str,
        x: &ArrayView2<f32>,
        kwargs: &BlockKwargs,
        ctx: &mut ForwardCtx<'_>,
    ) -> AwqResult<Array2<f32>>;

    /// Linear sublayers in a fixed order.
    fn named_linears(&self) -> Vec<(String, &LinearLayer)>;

    fn linear_mut(&mut self, name: &str) -> Option<&mut LinearLayer>;

    /// The op named by a [`ScaleGroup::prev_op`].
    fn scalable_op_mut(&mut self, name: &str) -> Option<ScalableOp<'_>>;

    fn layers_for_scaling(&self) -> Vec<ScaleGroup>;

    fn act_for_scaling(&self) -> ActScaling;

    /// Parameters with block-relative names.
    fn named_tensors(&self) -> Vec<(String, TensorData)>;

    fn param_bytes(&self) -> u64;

    fn forward(
        &self,
        hidden: &ArrayView2<f32>,
        kwargs: &BlockKwargs,
        ctx: &mut ForwardCtx<'_>,
    ) -> AwqResult<Array2<f32>> {
        self.forward_module(WHOLE_BLOCK, hidden, kwargs, ctx)
    }

    fn linear(&self, name: &str) -> Option<&LinearLayer> {
        self.named_linears()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, l)| l)
    }

    /// Swaps the sublayer `name` for `layer`, returning the old one.
    fn replace_linear(&mut self, name: &str, layer: LinearLayer) -> AwqResult<LinearLayer> {
        let slot = self
            .linear_mut(name)
            .ok_or_else(|| AwqError::topology(format!("block has no linear '{}'", name)))?;
        Ok(std::mem::replace(slot, layer))
    }

    /// Wraps the activation reported by [`Self::act_for_scaling`] in a unit
    /// scaling adapter.
    fn wrap_scaled_activation(&mut self) -> AwqResult<()> {
        match self.act_for_scaling() {
            ActScaling::NotScalable => Ok(()),
            ActScaling::Scalable {
                scale_name,
                scale_shape,
            } => match self.scalable_op_mut(&scale_name) {
                Some(ScalableOp::Activation(op)) => {
                    op.ensure_scaled(scale_shape);
                    Ok(())
                }
                _ => Err(AwqError::topology(format!(
                    "'{}' is reported as a scalable activation but the block has no such activation",
                    scale_name
                ))),
            },
        }
    }
}

/// Evaluates a linear sublayer addressed by name, the fallback arm of
/// [`TransformerBlock::forward_module`].
pub fn forward_named_linear<B: TransformerBlock + ?Sized>(
    block: &B,
    name: &str,
    x: &ArrayView2<f32>,
    ctx: &mut ForwardCtx<'_>,
) -> AwqResult<Array2<f32>> {
    let layer = block
        .linear(name)
        .ok_or_else(|| AwqError::topology(format!("unknown module '{}'", name)))?;
    Ok(ctx.linear(name, layer, x))
}
