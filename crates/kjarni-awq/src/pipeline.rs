//! Block streaming pipeline.
//!
//! Blocks are visited strictly in order. For each block the search pass runs
//!
//! ```text
//! Evicted -> Resident -> Captured -> Scaled -> Clipped -> SearchOnly -> Evicted
//! ```
//!
//! and the quant pass runs `Evicted -> Resident -> Quantized -> Evicted`. The
//! output of block `i` on the calibration batch, computed during capture and
//! before any weight is touched, is the input of block `i + 1`.

use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::adapter::ModelAdapter;
use crate::block::{BlockKwargs, ForwardCtx, TransformerBlock};
use crate::cancellation::CancellationToken;
use crate::capture::ActivationCapture;
use crate::checkpoint::save_checkpoint;
use crate::config::{QuantConfig, QuantizeOptions};
use crate::device::{Device, DevicePool, Residency};
use crate::error::{AwqError, AwqResult};
use crate::quantizer::pseudo_quantize_tensor;
use crate::search::{
    apply_clip, apply_scale, auto_clip_block, auto_scale_block, ClipRecord, ScaleRecord, SearchResult,
};

/// Drives search and quantization over a model, one block at a time.
pub struct AwqPipeline<M: ModelAdapter> {
    model: M,
    quant: QuantConfig,
    devices: DevicePool,
    cancel: CancellationToken,
    search_result: Option<SearchResult>,
}

impl<M: ModelAdapter> AwqPipeline<M> {
    pub fn new(model: M, quant: QuantConfig) -> AwqResult<Self> {
        quant.validate()?;
        Ok(Self {
            model,
            quant,
            devices: DevicePool::host_only(),
            cancel: CancellationToken::never(),
            search_result: None,
        })
    }

    /// Compute devices blocks are streamed onto.
    pub fn with_devices(mut self, devices: DevicePool) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn quant_config(&self) -> &QuantConfig {
        &self.quant
    }

    /// The most recent search result, complete or partial.
    pub fn search_result(&self) -> Option<&SearchResult> {
        self.search_result.as_ref()
    }

    fn residency(&self) -> Residency {
        Residency::plan(self.devices.clone(), &self.model.block_param_bytes())
    }

    /// Runs the model prefix with the embeddings on the first block's device.
    fn prefix_forward(
        &mut self,
        residency: &mut Residency,
        samples: &Array2<u32>,
    ) -> AwqResult<(Array2<f32>, BlockKwargs)> {
        let device = residency.device_of(0);
        residency.reserve_transient(device, self.model.embed_bytes(), 0)?;
        self.model.move_embed(device);
        log::debug!("embeddings moved to {}", device);

        let out = self.model.prefix_forward(samples);

        self.model.move_embed(Device::Host);
        residency.release_transient();
        log::debug!("embeddings returned to host");
        out
    }

    /// Parameter bytes plus an estimate of what capture will hold for one
    /// block: block input, block output and one input copy per linear.
    fn block_footprint(&self, index: usize, tokens: usize, hidden: usize) -> u64 {
        let block = &self.model.layers()[index];
        let linear_inputs: usize = block
            .named_linears()
            .iter()
            .map(|(_, l)| l.in_features())
            .sum();
        block.param_bytes() + (tokens * (2 * hidden + linear_inputs)) as u64 * 4
    }

    fn load_or_start(&self, checkpoint: Option<&Path>) -> AwqResult<SearchResult> {
        let result = match checkpoint {
            Some(path) if path.exists() => {
                let result = SearchResult::load(path)?;
                log::info!(
                    "resuming search from {} ({} blocks done)",
                    path.display(),
                    result.completed_blocks
                );
                result
            }
            _ => SearchResult::default(),
        };
        if result.completed_blocks > self.model.layers().len() {
            return Err(AwqError::config(format!(
                "search checkpoint covers {} blocks but the model has {}",
                result.completed_blocks,
                self.model.layers().len()
            )));
        }
        Ok(result)
    }

    fn persist(&self, result: &SearchResult, checkpoint: Option<&Path>) -> AwqResult<()> {
        if let Some(path) = checkpoint {
            result.save(path)?;
        }
        Ok(())
    }

    /// Runs scale and clip search over `samples` (`[n_samples, seqlen]` token
    /// ids), folding the winning scales and clamps into the model as it goes.
    ///
    /// With `opts.search_checkpoint` set, the result is persisted after every
    /// block and an existing checkpoint is resumed: its blocks are replayed
    /// instead of searched.
    pub fn search(&mut self, samples: &Array2<u32>, opts: &QuantizeOptions) -> AwqResult<SearchResult> {
        opts.search.validate()?;
        let checkpoint = opts.search_checkpoint.as_deref();
        let mut result = self.load_or_start(checkpoint)?;
        let outcome = self.search_blocks(samples, opts, &mut result);
        self.search_result = Some(result.clone());
        outcome?;
        Ok(result)
    }

    fn search_blocks(
        &mut self,
        samples: &Array2<u32>,
        opts: &QuantizeOptions,
        result: &mut SearchResult,
    ) -> AwqResult<()> {
        let checkpoint = opts.search_checkpoint.as_deref();
        let n_blocks = self.model.layers().len();
        let quant = self.quant;
        let mut residency = self.residency();

        let (mut hidden, kwargs) = self.prefix_forward(&mut residency, samples)?;
        let tokens = hidden.nrows();
        log::info!(
            "searching {} blocks over {} calibration tokens (w_bit={}, group={})",
            n_blocks,
            tokens,
            quant.w_bit,
            quant.q_group_size
        );

        for i in 0..n_blocks {
            if let Err(err) = self.cancel.check_boundary(result.completed_blocks) {
                log::warn!("search stopped before block {}", i);
                self.persist(result, checkpoint)?;
                return Err(err);
            }

            let prefix = self.model.block_prefix(i);
            let footprint = self.block_footprint(i, tokens, hidden.ncols());
            let device = residency.make_resident(i, footprint)?;
            log::debug!("block {}: Evicted -> Resident ({})", i, device);

            let block = &mut self.model.layers_mut()[i];
            if i < result.completed_blocks {
                let next = block.forward(&hidden.view(), &kwargs, &mut ForwardCtx::plain())?;
                let (scale, clip) = result.for_block(&prefix);
                apply_scale(block, &scale, None)?;
                apply_clip(block, &clip, &quant)?;
                hidden = next;
                residency.evict(i);
                log::info!("block {}/{}: replayed from checkpoint", i + 1, n_blocks);
                continue;
            }

            let (next, scale, clip) = search_block(block, i, &hidden, &kwargs, &quant, opts)?;
            hidden = next;
            result.push_block(&prefix, &scale, &clip);
            self.persist(result, checkpoint)?;

            residency.evict(i);
            log::debug!("block {}: SearchOnly -> Evicted", i);
            log::info!(
                "block {}/{}: {} scale groups, {} clipped linears",
                i + 1,
                n_blocks,
                scale.len(),
                clip.len()
            );
        }
        Ok(())
    }

    /// Replays a search result onto the model without recomputing it.
    pub fn apply_search_result(&mut self, result: &SearchResult) -> AwqResult<()> {
        let quant = self.quant;
        for i in 0..self.model.layers().len() {
            let prefix = self.model.block_prefix(i);
            let (scale, clip) = result.for_block(&prefix);
            let block = &mut self.model.layers_mut()[i];
            apply_scale(block, &scale, None)?;
            apply_clip(block, &clip, &quant)?;
            log::debug!(
                "block {}: replayed {} scale and {} clip records",
                i,
                scale.len(),
                clip.len()
            );
        }
        self.search_result = Some(result.clone());
        Ok(())
    }

    /// Quantizes every linear sublayer in place.
    ///
    /// With `real_quant` the layers are replaced by packed ones; otherwise
    /// they keep float storage holding the dequantized weights.
    pub fn quantize_weights(&mut self, real_quant: bool) -> AwqResult<()> {
        let quant = self.quant;
        if real_quant {
            quant.pack_num()?;
        }
        let n_blocks = self.model.layers().len();
        let mut residency = self.residency();

        for i in 0..n_blocks {
            self.cancel.check_boundary(i)?;
            let footprint = self.model.layers()[i].param_bytes();
            let device = residency.make_resident(i, footprint)?;
            log::debug!("block {}: Evicted -> Resident ({})", i, device);

            let block = &mut self.model.layers_mut()[i];
            quantize_block(block, &quant, real_quant)?;

            residency.evict(i);
            log::debug!("block {}: Quantized -> Evicted", i);
            log::info!(
                "block {}/{}: {} linears {}",
                i + 1,
                n_blocks,
                block.named_linears().len(),
                if real_quant { "packed" } else { "fake-quantized" }
            );
        }
        Ok(())
    }

    /// Search (unless disabled) followed by quantization (unless disabled).
    pub fn quantize(&mut self, samples: &Array2<u32>, opts: &QuantizeOptions) -> AwqResult<()> {
        if opts.run_search {
            self.search(samples, opts)?;
        }
        if opts.run_quant {
            self.quantize_weights(opts.real_quant)?;
        }
        Ok(())
    }

    /// Writes the model's tensors as safetensors shards plus
    /// `quant_config.json` into `dir`.
    pub fn save_quantized(&self, dir: impl AsRef<Path>, max_shard_size: u64) -> AwqResult<Vec<PathBuf>> {
        let dir = dir.as_ref();
        let shards = save_checkpoint(dir, &self.model.named_tensors(), max_shard_size)?;
        self.quant.save(dir)?;
        Ok(shards)
    }
}

/// Captures, scales and clips one block. Returns the block's output on
/// `hidden`, computed before any weight changes, and the records applied.
fn search_block<B: TransformerBlock>(
    block: &mut B,
    index: usize,
    hidden: &Array2<f32>,
    kwargs: &BlockKwargs,
    quant: &QuantConfig,
    opts: &QuantizeOptions,
) -> AwqResult<(Array2<f32>, Vec<ScaleRecord>, Vec<ClipRecord>)> {
    let names: Vec<String> = block.named_linears().into_iter().map(|(n, _)| n).collect();
    let mut capture = ActivationCapture::for_linears(names);
    let next = block.forward(&hidden.view(), kwargs, &mut ForwardCtx::observed(&mut capture))?;
    log::debug!(
        "block {}: Resident -> Captured ({} bytes of inputs)",
        index,
        capture.bytes()
    );
    let mut input_feat = capture.finish()?;

    let scale = if opts.auto_scale {
        let records = auto_scale_block(&*block, kwargs, quant, &opts.search, &input_feat, index)?;
        apply_scale(block, &records, Some(&mut input_feat))?;
        records
    } else {
        Vec::new()
    };
    log::debug!("block {}: Captured -> Scaled", index);

    let clip = if opts.mse_range {
        let records = auto_clip_block(&*block, quant, &opts.search, &input_feat, index)?;
        apply_clip(block, &records, quant)?;
        records
    } else {
        Vec::new()
    };
    log::debug!("block {}: Scaled -> Clipped", index);

    Ok((next, scale, clip))
}

fn quantize_block<B: TransformerBlock>(block: &mut B, quant: &QuantConfig, real_quant: bool) -> AwqResult<()> {
    block.wrap_scaled_activation()?;
    let names: Vec<String> = block.named_linears().into_iter().map(|(n, _)| n).collect();
    for name in names {
        let layer = block
            .linear_mut(&name)
            .ok_or_else(|| AwqError::topology(format!("block has no linear '{}'", name)))?;
        let weight = layer.weight_mut(&name)?;
        quant.check_in_features(&name, weight.ncols())?;
        let q = pseudo_quantize_tensor(&weight.view(), quant.w_bit, quant.q_group_size)?;
        *weight = q.weight;
        if real_quant {
            let packed = layer.to_packed(&name, &q.scales.view(), &q.zeros.view(), quant)?;
            block.replace_linear(&name, packed)?;
        }
    }
    Ok(())
}
