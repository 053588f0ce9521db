//! Activation-aware weight quantization for transformer language models.
//!
//! The crate searches, block by block, for per-channel scales and per-group
//! weight clamps that keep a block's output close to its unquantized output
//! on a calibration batch, then packs every linear sublayer into a low-bit
//! grouped format.
//!
//! ```ignore
//! use kjarni_awq::{get_calib_dataset, AnyModel, AwqPipeline, QuantConfig, QuantizeOptions, RandomTokens};
//!
//! let AnyModel::Llama(model) = AnyModel::load("models/llama")? else { return Ok(()) };
//! let samples = get_calib_dataset(&RandomTokens { vocab_size: 32000, n_docs: 128, doc_len: 512, seed: 0 }, 128, 512)?;
//! let mut pipeline = AwqPipeline::new(model, QuantConfig::default())?;
//! pipeline.quantize(&samples, &QuantizeOptions::default())?;
//! pipeline.save_quantized("models/llama-awq", kjarni_awq::DEFAULT_SHARD_SIZE)?;
//! ```

pub mod activations;
pub mod adapter;
pub mod block;
pub mod calib;
pub mod cancellation;
pub mod capture;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod error;
pub mod linear;
pub mod models;
pub mod normalization;
pub mod packing;
pub mod pipeline;
pub mod quantizer;
pub mod search;
pub mod utils;
pub mod weights;

pub use crate::{
    adapter::ModelAdapter,
    block::{ActScaling, BlockKwargs, ForwardCtx, ScalableOp, ScaleGroup, TransformerBlock, WHOLE_BLOCK},
    calib::{get_calib_dataset, CalibrationSource, RandomTokens, TokenFile},
    cancellation::{CancellationHandle, CancellationToken},
    capture::{ActivationCapture, InputFeatures, LinearObserver},
    checkpoint::{save_checkpoint, TensorData, DEFAULT_SHARD_SIZE},
    config::{parse_byte_size, GemmVersion, QuantConfig, QuantizeOptions, SearchConfig},
    device::{assign_blocks, Device, DevicePool},
    error::{AwqError, AwqResult},
    linear::LinearLayer,
    models::AnyModel,
    pipeline::AwqPipeline,
    quantizer::{pseudo_quantize, pseudo_quantize_tensor},
    search::{ClipRecord, ScaleRecord, SearchResult},
    weights::{SafeTensorsLoader, WeightSource},
};
