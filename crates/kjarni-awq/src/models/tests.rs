use std::collections::HashMap;

use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2};
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use super::*;
use crate::adapter::ModelAdapter;
use crate::block::{ActScaling, BlockKwargs, ForwardCtx, TransformerBlock};
use crate::capture::ActivationCapture;
use crate::checkpoint::{save_checkpoint, TensorData, DEFAULT_SHARD_SIZE};

pub(crate) const LLAMA_JSON: &str = r#"{
    "model_type": "llama",
    "hidden_size": 16,
    "num_hidden_layers": 2,
    "num_attention_heads": 4,
    "num_key_value_heads": 4,
    "intermediate_size": 32,
    "vocab_size": 32,
    "rms_norm_eps": 1e-6
}"#;

pub(crate) const MPT_JSON: &str = r#"{
    "model_type": "mpt",
    "d_model": 16,
    "n_heads": 4,
    "n_layers": 2,
    "vocab_size": 32,
    "expansion_ratio": 2,
    "no_bias": false
}"#;

fn uniform(rng: &mut StdRng, shape: (usize, usize), bound: f32) -> TensorData {
    TensorData::from(Array2::random_using(shape, Uniform::new(-bound, bound), rng))
}

fn near_one(rng: &mut StdRng, n: usize) -> TensorData {
    TensorData::from(Array1::random_using(n, Uniform::new(0.8f32, 1.2), rng))
}

pub(crate) fn llama_weights(config: &LlamaConfig, seed: u64) -> HashMap<String, TensorData> {
    let mut rng = StdRng::seed_from_u64(seed);
    let h = config.hidden_size;
    let kv = config.num_kv_heads() * config.head_dim();
    let i = config.intermediate_size;
    let mut w = HashMap::new();
    w.insert("model.embed_tokens.weight".to_string(), uniform(&mut rng, (config.vocab_size, h), 1.0));
    for l in 0..config.num_hidden_layers {
        let p = format!("model.layers.{}.", l);
        let shapes = [
            ("self_attn.q_proj", (h, h)),
            ("self_attn.k_proj", (kv, h)),
            ("self_attn.v_proj", (kv, h)),
            ("self_attn.o_proj", (h, h)),
            ("mlp.gate_proj", (i, h)),
            ("mlp.up_proj", (i, h)),
            ("mlp.down_proj", (h, i)),
        ];
        for (name, shape) in shapes {
            let bound = 1.0 / (shape.1 as f32).sqrt();
            w.insert(format!("{}{}.weight", p, name), uniform(&mut rng, shape, bound));
        }
        w.insert(format!("{}input_layernorm.weight", p), near_one(&mut rng, h));
        w.insert(format!("{}post_attention_layernorm.weight", p), near_one(&mut rng, h));
    }
    w.insert("model.norm.weight".to_string(), near_one(&mut rng, h));
    w.insert("lm_head.weight".to_string(), uniform(&mut rng, (config.vocab_size, h), 0.25));
    w
}

pub(crate) fn mpt_weights(config: &MptConfig, seed: u64) -> HashMap<String, TensorData> {
    let mut rng = StdRng::seed_from_u64(seed);
    let d = config.d_model;
    let i = config.expansion_ratio * d;
    let mut w = HashMap::new();
    w.insert("transformer.wte.weight".to_string(), uniform(&mut rng, (config.vocab_size, d), 1.0));
    for l in 0..config.n_layers {
        let p = format!("transformer.blocks.{}.", l);
        let shapes = [
            ("attn.Wqkv", (3 * d, d)),
            ("attn.out_proj", (d, d)),
            ("ffn.up_proj", (i, d)),
            ("ffn.down_proj", (d, i)),
        ];
        for (name, shape) in shapes {
            let bound = 1.0 / (shape.1 as f32).sqrt();
            w.insert(format!("{}{}.weight", p, name), uniform(&mut rng, shape, bound));
        }
        for norm in ["norm_1", "norm_2"] {
            w.insert(format!("{}{}.weight", p, norm), near_one(&mut rng, d));
            w.insert(
                format!("{}{}.bias", p, norm),
                TensorData::from(Array1::random_using(d, Uniform::new(-0.1f32, 0.1), &mut rng)),
            );
        }
    }
    w.insert("transformer.norm_f.weight".to_string(), near_one(&mut rng, d));
    w
}

pub(crate) fn tiny_llama(seed: u64) -> LlamaModel {
    let config = LlamaConfig::from_json(LLAMA_JSON).unwrap();
    let weights = llama_weights(&config, seed);
    LlamaModel::load(config, &weights).unwrap()
}

pub(crate) fn tiny_mpt(seed: u64) -> MptModel {
    let config = MptConfig::from_json(MPT_JSON).unwrap();
    let weights = mpt_weights(&config, seed);
    MptModel::load(config, &weights).unwrap()
}

pub(crate) fn token_batch(n: usize, seq_len: usize, vocab: u32) -> Array2<u32> {
    Array2::from_shape_fn((n, seq_len), |(r, c)| ((r * 7 + c * 3 + 1) as u32) % vocab)
}

#[test]
fn test_llama_forward_shapes() {
    let model = tiny_llama(0);
    assert_eq!(model.layers().len(), 2);
    let out = model.forward_blocks(&token_batch(2, 5, 32)).unwrap();
    assert_eq!(out.dim(), (10, 16));
    assert!(out.iter().all(|v| v.is_finite()));
}

#[test]
fn test_mpt_forward_shapes() {
    let model = tiny_mpt(0);
    let out = model.forward_blocks(&token_batch(3, 4, 32)).unwrap();
    assert_eq!(out.dim(), (12, 16));
    assert!(out.iter().all(|v| v.is_finite()));
}

#[test]
fn test_capture_sees_every_linear() {
    let llama = tiny_llama(1);
    let (x, kwargs) = llama.prefix_forward(&token_batch(2, 4, 32)).unwrap();
    let rows = run_capture(&llama.layers()[0], &x, &kwargs);
    assert!(rows.iter().all(|(_, n)| *n == 8));

    let mpt = tiny_mpt(1);
    let (x, kwargs) = mpt.prefix_forward(&token_batch(2, 4, 32)).unwrap();
    let rows = run_capture(&mpt.layers()[0], &x, &kwargs);
    assert!(rows.iter().all(|(_, n)| *n == 8));
}

fn run_capture<B: TransformerBlock>(block: &B, x: &Array2<f32>, kwargs: &BlockKwargs) -> Vec<(String, usize)> {
    let names: Vec<String> = block.named_linears().into_iter().map(|(n, _)| n).collect();
    let mut capture = ActivationCapture::for_linears(names.clone());
    block
        .forward(&x.view(), kwargs, &mut ForwardCtx::observed(&mut capture))
        .unwrap();
    let feats = capture.finish().unwrap();
    assert_eq!(feats.len(), names.len());
    feats.iter().map(|(n, a)| (n.clone(), a.nrows())).collect()
}

#[test]
fn test_submodules_match_whole_block() {
    let model = tiny_llama(2);
    let block = &model.layers()[0];
    let (x, kwargs) = model.prefix_forward(&token_batch(1, 6, 32)).unwrap();
    let whole = block.forward(&x.view(), &kwargs, &mut ForwardCtx::plain()).unwrap();

    let normed = block.input_layernorm.forward_2d(&x.view());
    let attn = block
        .forward_module("self_attn", &normed.view(), &kwargs, &mut ForwardCtx::plain())
        .unwrap();
    let residual = &x + &attn;
    let normed = block.post_attention_layernorm.forward_2d(&residual.view());
    let mlp = block
        .forward_module("mlp", &normed.view(), &kwargs, &mut ForwardCtx::plain())
        .unwrap();
    let manual = residual + &mlp;
    for (a, b) in whole.iter().zip(manual.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
    }
    assert!(block
        .forward_module("nonexistent", &x.view(), &kwargs, &mut ForwardCtx::plain())
        .is_err());
}

#[test]
fn test_llama_scale_groups() {
    let model = tiny_llama(3);
    let groups = model.layers()[0].layers_for_scaling();
    let prev: Vec<&str> = groups.iter().map(|g| g.prev_op.as_str()).collect();
    assert_eq!(
        prev,
        vec!["input_layernorm", "self_attn.v_proj", "post_attention_layernorm", "mlp.up_proj"]
    );
    assert_eq!(groups[0].inspect, "self_attn");
    assert_eq!(groups[0].linears.len(), 3);

    let mut config = LlamaConfig::from_json(LLAMA_JSON).unwrap();
    config.num_key_value_heads = Some(2);
    let gqa = LlamaModel::load(config.clone(), &llama_weights(&config, 3)).unwrap();
    let groups = gqa.layers()[0].layers_for_scaling();
    assert_eq!(groups.len(), 3);
    assert!(groups.iter().all(|g| g.prev_op != "self_attn.v_proj"));
}

#[test]
fn test_mpt_activation_is_scalable() {
    let mut model = tiny_mpt(4);
    let block = &mut model.layers_mut()[0];
    assert_eq!(
        block.act_for_scaling(),
        ActScaling::Scalable {
            scale_name: "ffn.act".to_string(),
            scale_shape: 32,
        }
    );
    let before = block.named_tensors().len();
    block.wrap_scaled_activation().unwrap();
    let names: Vec<String> = block.named_tensors().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names.len(), before + 1);
    assert!(names.contains(&"ffn.act.scales".to_string()));

    // wrapping twice keeps a single scale tensor
    block.wrap_scaled_activation().unwrap();
    assert_eq!(block.named_tensors().len(), before + 1);
}

#[test]
fn test_named_tensors_cover_loaded_weights() {
    let config = LlamaConfig::from_json(LLAMA_JSON).unwrap();
    let weights = llama_weights(&config, 5);
    let model = LlamaModel::load(config, &weights).unwrap();
    let mut names: Vec<String> = model.named_tensors().into_iter().map(|(n, _)| n).collect();
    names.sort();
    let mut expected: Vec<String> = weights.keys().cloned().collect();
    expected.sort();
    assert_eq!(names, expected);
}

#[test]
fn test_load_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    let config = MptConfig::from_json(MPT_JSON).unwrap();
    let weights = mpt_weights(&config, 6);
    let tensors: Vec<(String, TensorData)> = weights.into_iter().collect();
    save_checkpoint(dir.path(), &tensors, DEFAULT_SHARD_SIZE).unwrap();
    std::fs::write(dir.path().join(CONFIG_FILE), MPT_JSON).unwrap();

    let model = AnyModel::load(dir.path()).unwrap();
    assert_eq!(model.model_type(), "mpt");
    match model {
        AnyModel::Mpt(m) => assert_eq!(m.layers().len(), 2),
        AnyModel::Llama(_) => panic!("loaded the wrong family"),
    }
}

#[test]
fn test_unsupported_model_type() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(CONFIG_FILE), r#"{"model_type": "bert"}"#).unwrap();
    let tensors = vec![("x".to_string(), TensorData::from(Array1::<f32>::zeros(1)))];
    save_checkpoint(dir.path(), &tensors, DEFAULT_SHARD_SIZE).unwrap();
    assert!(matches!(AnyModel::load(dir.path()), Err(AwqError::Config(_))));
}

#[test]
fn test_shape_mismatch_is_reported() {
    let config = LlamaConfig::from_json(LLAMA_JSON).unwrap();
    let mut weights = llama_weights(&config, 7);
    weights.insert(
        "model.layers.0.mlp.down_proj.weight".to_string(),
        TensorData::from(Array2::<f32>::zeros((16, 16))),
    );
    assert!(matches!(LlamaModel::load(config, &weights), Err(AwqError::Config(_))));
}
