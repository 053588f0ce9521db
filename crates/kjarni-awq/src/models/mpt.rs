//! MPT-style decoder blocks: LayerNorm, a fused query/key/value projection,
//! ALiBi attention and a GELU MLP whose activation can absorb a scale.

use ndarray::{s, Array1, Array2, ArrayView2};
use serde::Deserialize;

use crate::activations::{Activation, ActivationOp};
use crate::adapter::{embed_tokens, ModelAdapter};
use crate::block::{
    forward_named_linear, ActScaling, BlockKwargs, ForwardCtx, ScalableOp, ScaleGroup,
    TransformerBlock, WHOLE_BLOCK,
};
use crate::checkpoint::TensorData;
use crate::device::Device;
use crate::error::{AwqError, AwqResult};
use crate::linear::LinearLayer;
use crate::models::attention::{alibi_slopes, causal_attention, AttentionShape, PositionEncoding};
use crate::models::load_linear_checked;
use crate::normalization::{LayerNorm, Normalization};
use crate::weights::WeightSource;

pub const NORM_1: &str = "norm_1";
pub const NORM_2: &str = "norm_2";
pub const ATTN: &str = "attn";
pub const FFN: &str = "ffn";
pub const WQKV: &str = "attn.Wqkv";
pub const OUT_PROJ: &str = "attn.out_proj";
pub const UP_PROJ: &str = "ffn.up_proj";
pub const ACT: &str = "ffn.act";
pub const DOWN_PROJ: &str = "ffn.down_proj";

#[derive(Debug, Clone, Deserialize)]
pub struct MptAttnConfig {
    #[serde(default = "default_alibi_bias_max")]
    pub alibi_bias_max: f32,
}

impl Default for MptAttnConfig {
    fn default() -> Self {
        Self {
            alibi_bias_max: default_alibi_bias_max(),
        }
    }
}

fn default_alibi_bias_max() -> f32 {
    8.0
}
fn default_expansion_ratio() -> usize {
    4
}
fn default_layer_norm_epsilon() -> f32 {
    1e-5
}

#[derive(Debug, Clone, Deserialize)]
pub struct MptConfig {
    pub d_model: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_expansion_ratio")]
    pub expansion_ratio: usize,
    #[serde(default)]
    pub no_bias: bool,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f32,
    #[serde(default)]
    pub attn_config: MptAttnConfig,
}

impl MptConfig {
    pub fn from_json(json: &str) -> AwqResult<Self> {
        serde_json::from_str(json).map_err(|e| AwqError::config(format!("invalid mpt config: {}", e)))
    }
}

/// One MPT layer.
#[derive(Debug, Clone)]
pub struct MptBlock {
    pub norm_1: Normalization,
    pub wqkv: LinearLayer,
    pub out_proj: LinearLayer,
    pub norm_2: Normalization,
    pub up_proj: LinearLayer,
    pub act: ActivationOp,
    pub down_proj: LinearLayer,
    pub shape: AttentionShape,
    pub slopes: Array1<f32>,
}

impl MptBlock {
    pub fn load<W: WeightSource + ?Sized>(config: &MptConfig, weights: &W, prefix: &str) -> AwqResult<Self> {
        let d = config.d_model;
        if config.n_heads == 0 || d % config.n_heads != 0 {
            return Err(AwqError::config(format!(
                "d_model {} is not divisible by n_heads {}",
                d, config.n_heads
            )));
        }
        let shape = AttentionShape {
            num_heads: config.n_heads,
            num_kv_heads: config.n_heads,
            head_dim: d / config.n_heads,
        };
        let inter = config.expansion_ratio * d;
        let linear = |name: &str, out: usize, inp: usize| {
            load_linear_checked(weights, &format!("{}{}", prefix, name), out, inp)
        };
        let norm = |name: &str| -> AwqResult<Normalization> {
            let weight = weights.get_array1(&format!("{}{}.weight", prefix, name))?;
            let bias = weights.get_optional_array1(&format!("{}{}.bias", prefix, name))?;
            Ok(LayerNorm::new(weight, bias, config.layer_norm_epsilon).into())
        };

        // a previously wrapped activation carries its scales
        let act_scales = weights.get_optional_array1(&format!("{}{}.scales", prefix, ACT))?;
        let mut act = ActivationOp::from(Activation::Gelu);
        if let Some(scales) = act_scales {
            act.scale_output_down(ACT, &scales.view())?;
        }

        Ok(Self {
            norm_1: norm(NORM_1)?,
            wqkv: linear(WQKV, 3 * d, d)?,
            out_proj: linear(OUT_PROJ, d, d)?,
            norm_2: norm(NORM_2)?,
            up_proj: linear(UP_PROJ, inter, d)?,
            act,
            down_proj: linear(DOWN_PROJ, d, inter)?,
            slopes: alibi_slopes(shape.num_heads, config.attn_config.alibi_bias_max),
            shape,
        })
    }

    fn attention(
        &self,
        x: &ArrayView2<f32>,
        kwargs: &BlockKwargs,
        ctx: &mut ForwardCtx<'_>,
    ) -> AwqResult<Array2<f32>> {
        let qkv = ctx.linear(WQKV, &self.wqkv, x);
        let d = self.shape.num_heads * self.shape.head_dim;
        let context = causal_attention(
            &qkv.slice(s![.., ..d]),
            &qkv.slice(s![.., d..2 * d]),
            &qkv.slice(s![.., 2 * d..]),
            kwargs.seq_len,
            &self.shape,
            &PositionEncoding::Alibi(self.slopes.clone()),
        )?;
        Ok(ctx.linear(OUT_PROJ, &self.out_proj, &context.view()))
    }

    fn ffn(&self, x: &ArrayView2<f32>, ctx: &mut ForwardCtx<'_>) -> Array2<f32> {
        let mut hidden = ctx.linear(UP_PROJ, &self.up_proj, x);
        self.act.forward(&mut hidden);
        ctx.linear(DOWN_PROJ, &self.down_proj, &hidden.view())
    }
}

impl TransformerBlock for MptBlock {
    fn forward_module(
        &self,
        module: &str,
        x: &ArrayView2<f32>,
        kwargs: &BlockKwargs,
        ctx: &mut ForwardCtx<'_>,
    ) -> AwqResult<Array2<f32>> {
        match module {
            WHOLE_BLOCK => {
                let normed = self.norm_1.forward_2d(x);
                let attn = self.attention(&normed.view(), kwargs, ctx)?;
                let residual = x + &attn;
                let normed = self.norm_2.forward_2d(&residual.view());
                let ffn = self.ffn(&normed.view(), ctx);
                Ok(residual + &ffn)
            }
            ATTN => self.attention(x, kwargs, ctx),
            FFN => Ok(self.ffn(x, ctx)),
            name => forward_named_linear(self, name, x, ctx),
        }
    }

    fn named_linears(&self) -> Vec<(String, &LinearLayer)> {
        vec![
            (WQKV.to_string(), &self.wqkv),
            (OUT_PROJ.to_string(), &self.out_proj),
            (UP_PROJ.to_string(), &self.up_proj),
            (DOWN_PROJ.to_string(), &self.down_proj),
        ]
    }

    fn linear_mut(&mut self, name: &str) -> Option<&mut LinearLayer> {
        match name {
            WQKV => Some(&mut self.wqkv),
            OUT_PROJ => Some(&mut self.out_proj),
            UP_PROJ => Some(&mut self.up_proj),
            DOWN_PROJ => Some(&mut self.down_proj),
            _ => None,
        }
    }

    fn scalable_op_mut(&mut self, name: &str) -> Option<ScalableOp<'_>> {
        match name {
            NORM_1 => Some(ScalableOp::Norm(&mut self.norm_1)),
            NORM_2 => Some(ScalableOp::Norm(&mut self.norm_2)),
            WQKV => Some(ScalableOp::Linear(&mut self.wqkv)),
            ACT => Some(ScalableOp::Activation(&mut self.act)),
            _ => None,
        }
    }

    fn layers_for_scaling(&self) -> Vec<ScaleGroup> {
        vec![
            ScaleGroup::new(NORM_1, &[WQKV], Some(ATTN)),
            ScaleGroup::new(WQKV, &[OUT_PROJ], None),
            ScaleGroup::new(NORM_2, &[UP_PROJ], Some(FFN)),
            ScaleGroup::new(ACT, &[DOWN_PROJ], None),
        ]
    }

    fn act_for_scaling(&self) -> ActScaling {
        ActScaling::Scalable {
            scale_name: ACT.to_string(),
            scale_shape: self.up_proj.out_features(),
        }
    }

    fn named_tensors(&self) -> Vec<(String, TensorData)> {
        let mut out = self.norm_1.named_tensors(NORM_1);
        out.extend(self.wqkv.named_tensors(WQKV));
        out.extend(self.out_proj.named_tensors(OUT_PROJ));
        out.extend(self.norm_2.named_tensors(NORM_2));
        out.extend(self.up_proj.named_tensors(UP_PROJ));
        out.extend(self.act.named_tensors(ACT));
        out.extend(self.down_proj.named_tensors(DOWN_PROJ));
        out
    }

    fn param_bytes(&self) -> u64 {
        self.norm_1.param_bytes()
            + self.norm_2.param_bytes()
            + self.act.param_bytes()
            + self
                .named_linears()
                .iter()
                .map(|(_, l)| l.param_bytes())
                .sum::<u64>()
    }
}

/// An MPT causal language model. The output head is tied to `wte`.
#[derive(Debug, Clone)]
pub struct MptModel {
    pub config: MptConfig,
    pub wte: Array2<f32>,
    pub blocks: Vec<MptBlock>,
    pub norm_f: Normalization,
    embed_device: Device,
}

impl MptModel {
    pub const LAYER_PREFIX: &'static str = "transformer.blocks";

    pub fn load<W: WeightSource + ?Sized>(config: MptConfig, weights: &W) -> AwqResult<Self> {
        let wte = weights.get_array2("transformer.wte.weight")?;
        let blocks = (0..config.n_layers)
            .map(|i| MptBlock::load(&config, weights, &format!("{}.{}.", Self::LAYER_PREFIX, i)))
            .collect::<AwqResult<Vec<_>>>()?;
        let norm_f = LayerNorm::new(
            weights.get_array1("transformer.norm_f.weight")?,
            weights.get_optional_array1("transformer.norm_f.bias")?,
            config.layer_norm_epsilon,
        )
        .into();
        log::debug!(
            "mpt: {} blocks, d_model {}, {} heads",
            blocks.len(),
            config.d_model,
            config.n_heads
        );
        Ok(Self {
            config,
            wte,
            blocks,
            norm_f,
            embed_device: Device::Host,
        })
    }
}

impl ModelAdapter for MptModel {
    type Block = MptBlock;

    fn model_type(&self) -> &'static str {
        "mpt"
    }

    fn layer_prefix(&self) -> &str {
        Self::LAYER_PREFIX
    }

    fn layers(&self) -> &[MptBlock] {
        &self.blocks
    }

    fn layers_mut(&mut self) -> &mut [MptBlock] {
        &mut self.blocks
    }

    fn move_embed(&mut self, device: Device) {
        self.embed_device = device;
    }

    fn embed_device(&self) -> Device {
        self.embed_device
    }

    fn embed_bytes(&self) -> u64 {
        self.wte.len() as u64 * 4
    }

    fn prefix_forward(&self, input_ids: &Array2<u32>) -> AwqResult<(Array2<f32>, BlockKwargs)> {
        let hidden = embed_tokens(&self.wte.view(), input_ids)?;
        Ok((hidden, BlockKwargs { seq_len: input_ids.ncols() }))
    }

    fn outer_tensors(&self) -> Vec<(String, TensorData)> {
        let mut out = vec![(
            "transformer.wte.weight".to_string(),
            TensorData::from(self.wte.clone()),
        )];
        out.extend(self.norm_f.named_tensors("transformer.norm_f"));
        out
    }
}
