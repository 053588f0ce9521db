// Shared by the integration tests; not every test uses every helper.
#![allow(dead_code)]

use kjarni_awq::activations::{Activation, ActivationOp};
use kjarni_awq::adapter::embed_tokens;
use kjarni_awq::block::forward_named_linear;
use kjarni_awq::normalization::{Normalization, RMSNorm};
use kjarni_awq::{
    ActScaling, AwqResult, BlockKwargs, Device, ForwardCtx, LinearLayer, ModelAdapter, ScalableOp,
    ScaleGroup, TensorData, TransformerBlock, WHOLE_BLOCK,
};
use ndarray::{Array1, Array2, ArrayView2};
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

pub const HIDDEN: usize = 8;
pub const INNER: usize = 4;
pub const VOCAB: usize = 16;

/// `x + down(gelu(up(norm(x))))`, or just `up(norm(x))` without `down`.
#[derive(Debug, Clone)]
pub struct ToyBlock {
    pub norm: Normalization,
    pub up: LinearLayer,
    pub act: ActivationOp,
    pub down: Option<LinearLayer>,
}

impl ToyBlock {
    pub fn mlp(rng: &mut StdRng) -> Self {
        let up = Array2::random_using((INNER, HIDDEN), Uniform::new(-0.35f32, 0.35), rng);
        let down = Array2::random_using((HIDDEN, INNER), Uniform::new(-0.5f32, 0.5), rng);
        Self {
            norm: RMSNorm::new(Array1::ones(HIDDEN), 1e-6).into(),
            up: LinearLayer::from(up),
            act: Activation::Gelu.into(),
            down: Some(LinearLayer::from(down)),
        }
    }

    pub fn projection(weight: Array2<f32>) -> Self {
        Self {
            norm: RMSNorm::new(Array1::ones(weight.ncols()), 1e-6).into(),
            up: LinearLayer::from(weight),
            act: Activation::Gelu.into(),
            down: None,
        }
    }
}

impl TransformerBlock for ToyBlock {
    fn forward_module(
        &self,
        module: &str,
        x: &ArrayView2<f32>,
        _kwargs: &BlockKwargs,
        ctx: &mut ForwardCtx<'_>,
    ) -> AwqResult<Array2<f32>> {
        match module {
            WHOLE_BLOCK => {
                let normed = self.norm.forward_2d(x);
                let mut h = ctx.linear("up", &self.up, &normed.view());
                match &self.down {
                    Some(down) => {
                        self.act.forward(&mut h);
                        Ok(x + &ctx.linear("down", down, &h.view()))
                    }
                    None => Ok(h),
                }
            }
            name => forward_named_linear(self, name, x, ctx),
        }
    }

    fn named_linears(&self) -> Vec<(String, &LinearLayer)> {
        let mut out = vec![("up".to_string(), &self.up)];
        if let Some(down) = &self.down {
            out.push(("down".to_string(), down));
        }
        out
    }

    fn linear_mut(&mut self, name: &str) -> Option<&mut LinearLayer> {
        match name {
            "up" => Some(&mut self.up),
            "down" => self.down.as_mut(),
            _ => None,
        }
    }

    fn scalable_op_mut(&mut self, name: &str) -> Option<ScalableOp<'_>> {
        match name {
            "norm" => Some(ScalableOp::Norm(&mut self.norm)),
            "act" if self.down.is_some() => Some(ScalableOp::Activation(&mut self.act)),
            _ => None,
        }
    }

    fn layers_for_scaling(&self) -> Vec<ScaleGroup> {
        let mut groups = vec![ScaleGroup::new("norm", &["up"], None)];
        if self.down.is_some() {
            groups.push(ScaleGroup::new("act", &["down"], None));
        }
        groups
    }

    fn act_for_scaling(&self) -> ActScaling {
        if self.down.is_some() {
            ActScaling::Scalable {
                scale_name: "act".to_string(),
                scale_shape: self.up.out_features(),
            }
        } else {
            ActScaling::NotScalable
        }
    }

    fn named_tensors(&self) -> Vec<(String, TensorData)> {
        let mut out = self.norm.named_tensors("norm");
        out.extend(self.up.named_tensors("up"));
        out.extend(self.act.named_tensors("act"));
        if let Some(down) = &self.down {
            out.extend(down.named_tensors("down"));
        }
        out
    }

    fn param_bytes(&self) -> u64 {
        self.norm.param_bytes()
            + self.up.param_bytes()
            + self.act.param_bytes()
            + self.down.as_ref().map_or(0, |d| d.param_bytes())
    }
}

#[derive(Debug, Clone)]
pub struct ToyModel {
    pub embed: Array2<f32>,
    pub blocks: Vec<ToyBlock>,
    pub embed_device: Device,
}

impl ToyModel {
    /// Two residual MLP blocks with uniform random weights and embeddings.
    pub fn random(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let embed = Array2::random_using((VOCAB, HIDDEN), Uniform::new(-1.0f32, 1.0), &mut rng);
        let blocks = (0..2).map(|_| ToyBlock::mlp(&mut rng)).collect();
        Self {
            embed,
            blocks,
            embed_device: Device::Host,
        }
    }

    /// One projection block whose first output channel has a single huge
    /// weight on an input channel that is always zero.
    pub fn with_outlier() -> Self {
        let weight = Array2::from_shape_fn((INNER, HIDDEN), |(r, c)| match (r, c) {
            (0, 0) => 1.0,
            (0, 1) => -0.8,
            (0, 2) => 0.9,
            (0, 3) => 100.0,
            (0, _) => 0.0,
            _ => 0.1 * ((r * HIDDEN + c) as f32 * 1.3).sin(),
        });
        Self {
            embed: dead_channel_embed(),
            blocks: vec![ToyBlock::projection(weight)],
            embed_device: Device::Host,
        }
    }

    /// One projection block where every group is exact at 4 bits and group
    /// size 4, except the first group of row 0: `[1, 2, 3, 20]` with the 20
    /// on the dead input channel. Clamping it to 15 makes that group exact
    /// too.
    pub fn with_clippable_outlier() -> Self {
        let rows: [[f32; HIDDEN]; INNER] = [
            [1.0, 2.0, 3.0, 20.0, 0.0, 0.0, 0.0, 0.0],
            [-5.0, 10.0, 1.0, 3.0, 4.0, -11.0, 2.0, 0.0],
            [7.0, -8.0, 0.0, 2.0, -3.0, 12.0, 5.0, -1.0],
            [15.0, 4.0, 6.0, 9.0, 0.0, -15.0, -6.0, -3.0],
        ];
        // Power-of-two scaling keeps the exact rows exact and balances the
        // output channels.
        let weight = Array2::from_shape_fn((INNER, HIDDEN), |(r, c)| {
            if r == 0 {
                rows[r][c]
            } else {
                rows[r][c] * 0.125
            }
        });
        Self {
            embed: dead_channel_embed(),
            blocks: vec![ToyBlock::projection(weight)],
            embed_device: Device::Host,
        }
    }
}

/// Embeddings whose input channel 3 is zero for every token.
fn dead_channel_embed() -> Array2<f32> {
    Array2::from_shape_fn((VOCAB, HIDDEN), |(t, c)| {
        let t = t as f32;
        match c {
            0 => 1.0 + 0.1 * (t % 5.0),
            1 => -1.0 - 0.05 * (t % 3.0),
            2 => 0.8 + 0.1 * (t % 4.0),
            3 => 0.0,
            4 => 0.5 * t.sin(),
            5 => 0.5 * t.cos(),
            6 => 0.3 * (2.0 * t + 1.0).sin(),
            _ => 0.4 * (3.0 * t).cos(),
        }
    })
}

impl ModelAdapter for ToyModel {
    type Block = ToyBlock;

    fn model_type(&self) -> &'static str {
        "toy"
    }

    fn layer_prefix(&self) -> &str {
        "blocks"
    }

    fn layers(&self) -> &[ToyBlock] {
        &self.blocks
    }

    fn layers_mut(&mut self) -> &mut [ToyBlock] {
        &mut self.blocks
    }

    fn move_embed(&mut self, device: Device) {
        self.embed_device = device;
    }

    fn embed_device(&self) -> Device {
        self.embed_device
    }

    fn embed_bytes(&self) -> u64 {
        self.embed.len() as u64 * 4
    }

    fn prefix_forward(&self, input_ids: &Array2<u32>) -> AwqResult<(Array2<f32>, BlockKwargs)> {
        let hidden = embed_tokens(&self.embed.view(), input_ids)?;
        Ok((hidden, BlockKwargs { seq_len: input_ids.ncols() }))
    }

    fn outer_tensors(&self) -> Vec<(String, TensorData)> {
        vec![("embed.weight".to_string(), TensorData::from(self.embed.clone()))]
    }
}

/// All sixteen token ids as one sequence.
pub fn all_tokens() -> Array2<u32> {
    Array2::from_shape_fn((1, VOCAB), |(_, t)| t as u32)
}
