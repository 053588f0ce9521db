//! LLaMA-style decoder blocks: RMSNorm, rotary attention with grouped
//! key/value heads and a gated MLP.

use ndarray::{Array2, ArrayView2};
use serde::Deserialize;

use crate::activations::Activation;
use crate::adapter::{embed_tokens, ModelAdapter};
use crate::block::{
    forward_named_linear, ActScaling, BlockKwargs, ForwardCtx, ScalableOp, ScaleGroup,
    TransformerBlock, WHOLE_BLOCK,
};
use crate::checkpoint::TensorData;
use crate::device::Device;
use crate::error::{AwqError, AwqResult};
use crate::linear::LinearLayer;
use crate::models::attention::{causal_attention, AttentionShape, PositionEncoding, RoPE};
use crate::models::load_linear_checked;
use crate::normalization::{Normalization, RMSNorm};
use crate::weights::WeightSource;

pub const INPUT_LAYERNORM: &str = "input_layernorm";
pub const POST_ATTENTION_LAYERNORM: &str = "post_attention_layernorm";
pub const SELF_ATTN: &str = "self_attn";
pub const MLP: &str = "mlp";
pub const Q_PROJ: &str = "self_attn.q_proj";
pub const K_PROJ: &str = "self_attn.k_proj";
pub const V_PROJ: &str = "self_attn.v_proj";
pub const O_PROJ: &str = "self_attn.o_proj";
pub const GATE_PROJ: &str = "mlp.gate_proj";
pub const UP_PROJ: &str = "mlp.up_proj";
pub const DOWN_PROJ: &str = "mlp.down_proj";

#[derive(Debug, Clone, Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,

    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,

    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rms_norm_eps() -> f32 {
    1e-6
}
fn default_rope_theta() -> f32 {
    10000.0
}
fn default_hidden_act() -> String {
    "silu".to_string()
}

impl LlamaConfig {
    pub fn from_json(json: &str) -> AwqResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| AwqError::config(format!("invalid llama config: {}", e)))
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    fn attention_shape(&self) -> AwqResult<AttentionShape> {
        let shape = AttentionShape {
            num_heads: self.num_attention_heads,
            num_kv_heads: self.num_kv_heads(),
            head_dim: self.head_dim(),
        };
        shape.validate()?;
        Ok(shape)
    }
}

/// One decoder layer.
#[derive(Debug, Clone)]
pub struct LlamaBlock {
    pub input_layernorm: Normalization,
    pub q_proj: LinearLayer,
    pub k_proj: LinearLayer,
    pub v_proj: LinearLayer,
    pub o_proj: LinearLayer,
    pub post_attention_layernorm: Normalization,
    pub gate_proj: LinearLayer,
    pub up_proj: LinearLayer,
    pub down_proj: LinearLayer,
    pub act: Activation,
    pub shape: AttentionShape,
    pub rope: RoPE,
}

impl LlamaBlock {
    /// Loads the block whose parameters start with `prefix`, e.g.
    /// `model.layers.0.`.
    pub fn load<W: WeightSource + ?Sized>(
        config: &LlamaConfig,
        weights: &W,
        prefix: &str,
    ) -> AwqResult<Self> {
        let shape = config.attention_shape()?;
        let hidden = config.hidden_size;
        let q_dim = shape.num_heads * shape.head_dim;
        let kv_dim = shape.num_kv_heads * shape.head_dim;
        let inter = config.intermediate_size;
        let linear = |name: &str, out: usize, inp: usize| {
            load_linear_checked(weights, &format!("{}{}", prefix, name), out, inp)
        };
        let norm = |name: &str| -> AwqResult<Normalization> {
            let weight = weights.get_array1(&format!("{}{}.weight", prefix, name))?;
            Ok(RMSNorm::new(weight, config.rms_norm_eps).into())
        };

        Ok(Self {
            input_layernorm: norm(INPUT_LAYERNORM)?,
            q_proj: linear(Q_PROJ, q_dim, hidden)?,
            k_proj: linear(K_PROJ, kv_dim, hidden)?,
            v_proj: linear(V_PROJ, kv_dim, hidden)?,
            o_proj: linear(O_PROJ, hidden, q_dim)?,
            post_attention_layernorm: norm(POST_ATTENTION_LAYERNORM)?,
            gate_proj: linear(GATE_PROJ, inter, hidden)?,
            up_proj: linear(UP_PROJ, inter, hidden)?,
            down_proj: linear(DOWN_PROJ, hidden, inter)?,
            act: config.hidden_act.parse()?,
            rope: RoPE::new(shape.head_dim, config.rope_theta),
            shape,
        })
    }

    fn attention(
        &self,
        x: &ArrayView2<f32>,
        kwargs: &BlockKwargs,
        ctx: &mut ForwardCtx<'_>,
    ) -> AwqResult<Array2<f32>> {
        let q = ctx.linear(Q_PROJ, &self.q_proj, x);
        let k = ctx.linear(K_PROJ, &self.k_proj, x);
        let v = ctx.linear(V_PROJ, &self.v_proj, x);
        let context = causal_attention(
            &q.view(),
            &k.view(),
            &v.view(),
            kwargs.seq_len,
            &self.shape,
            &PositionEncoding::Rotary(self.rope.clone()),
        )?;
        Ok(ctx.linear(O_PROJ, &self.o_proj, &context.view()))
    }

    fn mlp(&self, x: &ArrayView2<f32>, ctx: &mut ForwardCtx<'_>) -> Array2<f32> {
        let mut gate = ctx.linear(GATE_PROJ, &self.gate_proj, x);
        self.act.apply(&mut gate);
        let up = ctx.linear(UP_PROJ, &self.up_proj, x);
        let hidden = gate * &up;
        ctx.linear(DOWN_PROJ, &self.down_proj, &hidden.view())
    }
}

impl TransformerBlock for LlamaBlock {
    fn forward_module(
        &self,
        module: &str,
        x: &ArrayView2<f32>,
        kwargs: &BlockKwargs,
        ctx: &mut ForwardCtx<'_>,
    ) -> AwqResult<Array2<f32>> {
        match module {
            WHOLE_BLOCK => {
                let normed = self.input_layernorm.forward_2d(x);
                let attn = self.attention(&normed.view(), kwargs, ctx)?;
                let residual = x + &attn;
                let normed = self.post_attention_layernorm.forward_2d(&residual.view());
                let mlp = self.mlp(&normed.view(), ctx);
                Ok(residual + &mlp)
            }
            SELF_ATTN => self.attention(x, kwargs, ctx),
            MLP => Ok(self.mlp(x, ctx)),
            name => forward_named_linear(self, name, x, ctx),
        }
    }

    fn named_linears(&self) -> Vec<(String, &LinearLayer)> {
        vec![
            (Q_PROJ.to_string(), &self.q_proj),
            (K_PROJ.to_string(), &self.k_proj),
            (V_PROJ.to_string(), &self.v_proj),
            (O_PROJ.to_string(), &self.o_proj),
            (GATE_PROJ.to_string(), &self.gate_proj),
            (UP_PROJ.to_string(), &self.up_proj),
            (DOWN_PROJ.to_string(), &self.down_proj),
        ]
    }

    fn linear_mut(&mut self, name: &str) -> Option<&mut LinearLayer> {
        match name {
            Q_PROJ => Some(&mut self.q_proj),
            K_PROJ => Some(&mut self.k_proj),
            V_PROJ => Some(&mut self.v_proj),
            O_PROJ => Some(&mut self.o_proj),
            GATE_PROJ => Some(&mut self.gate_proj),
            UP_PROJ => Some(&mut self.up_proj),
            DOWN_PROJ => Some(&mut self.down_proj),
            _ => None,
        }
    }

    fn scalable_op_mut(&mut self, name: &str) -> Option<ScalableOp<'_>> {
        match name {
            INPUT_LAYERNORM => Some(ScalableOp::Norm(&mut self.input_layernorm)),
            POST_ATTENTION_LAYERNORM => Some(ScalableOp::Norm(&mut self.post_attention_layernorm)),
            V_PROJ => Some(ScalableOp::Linear(&mut self.v_proj)),
            UP_PROJ => Some(ScalableOp::Linear(&mut self.up_proj)),
            _ => None,
        }
    }

    fn layers_for_scaling(&self) -> Vec<ScaleGroup> {
        let mut groups = vec![ScaleGroup::new(
            INPUT_LAYERNORM,
            &[Q_PROJ, K_PROJ, V_PROJ],
            Some(SELF_ATTN),
        )];
        // with grouped kv heads the value rows no longer line up with o_proj inputs
        if self.v_proj.out_features() == self.o_proj.in_features() {
            groups.push(ScaleGroup::new(V_PROJ, &[O_PROJ], None));
        }
        groups.push(ScaleGroup::new(
            POST_ATTENTION_LAYERNORM,
            &[GATE_PROJ, UP_PROJ],
            Some(MLP),
        ));
        groups.push(ScaleGroup::new(UP_PROJ, &[DOWN_PROJ], None));
        groups
    }

    fn act_for_scaling(&self) -> ActScaling {
        ActScaling::NotScalable
    }

    fn named_tensors(&self) -> Vec<(String, TensorData)> {
        let mut out = self.input_layernorm.named_tensors(INPUT_LAYERNORM);
        for (name, layer) in self.named_linears() {
            out.extend(layer.named_tensors(&name));
        }
        out.extend(self.post_attention_layernorm.named_tensors(POST_ATTENTION_LAYERNORM));
        out
    }

    fn param_bytes(&self) -> u64 {
        self.input_layernorm.param_bytes()
            + self.post_attention_layernorm.param_bytes()
            + self
                .named_linears()
                .iter()
                .map(|(_, l)| l.param_bytes())
                .sum::<u64>()
    }
}

/// A LLaMA-style causal language model.
#[derive(Debug, Clone)]
pub struct LlamaModel {
    pub config: LlamaConfig,
    pub embed_tokens: Array2<f32>,
    pub layers: Vec<LlamaBlock>,
    pub norm: Normalization,
    /// `None` when tied to the embeddings.
    pub lm_head: Option<Array2<f32>>,
    embed_device: Device,
}

impl LlamaModel {
    pub const LAYER_PREFIX: &'static str = "model.layers";

    pub fn load<W: WeightSource + ?Sized>(config: LlamaConfig, weights: &W) -> AwqResult<Self> {
        let embed_tokens = weights.get_array2("model.embed_tokens.weight")?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| LlamaBlock::load(&config, weights, &format!("{}.{}.", Self::LAYER_PREFIX, i)))
            .collect::<AwqResult<Vec<_>>>()?;
        let norm = RMSNorm::new(weights.get_array1("model.norm.weight")?, config.rms_norm_eps).into();
        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            weights.get_optional_array2("lm_head.weight")?
        };
        log::debug!(
            "llama: {} layers, hidden {}, {} heads / {} kv heads",
            layers.len(),
            config.hidden_size,
            config.num_attention_heads,
            config.num_kv_heads()
        );
        Ok(Self {
            config,
            embed_tokens,
            layers,
            norm,
            lm_head,
            embed_device: Device::Host,
        })
    }
}

impl ModelAdapter for LlamaModel {
    type Block = LlamaBlock;

    fn model_type(&self) -> &'static str {
        "llama"
    }

    fn layer_prefix(&self) -> &str {
        Self::LAYER_PREFIX
    }

    fn layers(&self) -> &[LlamaBlock] {
        &self.layers
    }

    fn layers_mut(&mut self) -> &mut [LlamaBlock] {
        &mut self.layers
    }

    fn move_embed(&mut self, device: Device) {
        self.embed_device = device;
    }

    fn embed_device(&self) -> Device {
        self.embed_device
    }

    fn embed_bytes(&self) -> u64 {
        self.embed_tokens.len() as u64 * 4
    }

    fn prefix_forward(&self, input_ids: &Array2<u32>) -> AwqResult<(Array2<f32>, BlockKwargs)> {
        let hidden = embed_tokens(&self.embed_tokens.view(), input_ids)?;
        Ok((hidden, BlockKwargs { seq_len: input_ids.ncols() }))
    }

    fn outer_tensors(&self) -> Vec<(String, TensorData)> {
        let mut out = vec![(
            "model.embed_tokens.weight".to_string(),
            TensorData::from(self.embed_tokens.clone()),
        )];
        out.extend(self.norm.named_tensors("model.norm"));
        if let Some(head) = &self.lm_head {
            out.push(("lm_head.weight".to_string(), TensorData::from(head.clone())));
        }
        out
    }
}
