//! Activation-aware scale search.
//!
//! For every scale group of a block the search tries the candidates
//! `s = x^α / w^(1-α)` over a grid of mixing ratios `α`, where `x` is the mean
//! input magnitude per channel and `w` the mean group-normalized weight
//! magnitude. A candidate is scored by quantizing `W·diag(s)`, dividing the
//! result back by `s`, and comparing the inspected module's output against
//! the unquantized output on the captured inputs. Candidates are independent
//! and run in parallel; selection depends only on their losses.

use std::cmp::Ordering;

use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;

use crate::block::{BlockKwargs, ForwardCtx, LinearOverrides, ScaleGroup, TransformerBlock};
use crate::capture::InputFeatures;
use crate::config::{QuantConfig, SearchConfig};
use crate::error::{AwqError, AwqResult};
use crate::linear::LinearLayer;
use crate::quantizer::pseudo_quantize;
use crate::search::result::ScaleRecord;
use crate::utils::{mean_abs_columns, mse};

const SCALE_MIN: f32 = 1e-4;
const SCALE_MAX: f32 = 1e4;

/// Per input channel mean of `|w|` normalized by the max of its group.
pub fn weight_magnitude(w: &ArrayView2<f32>, group_size: usize) -> Array1<f32> {
    let mut normalized = w.mapv(f32::abs);
    for mut row in normalized.rows_mut() {
        for mut group in row.exact_chunks_mut(group_size) {
            let max = group.fold(0.0f32, |a, &b| a.max(b));
            if max > 0.0 {
                group /= max;
            }
        }
    }
    mean_abs_columns(&normalized.view())
}

/// Candidate scale for mixing ratio `ratio`, normalized so that
/// `max(s) * min(s) == 1`.
pub fn candidate_scales(x_mean: &Array1<f32>, w_mean: &Array1<f32>, ratio: f32) -> Array1<f32> {
    let mut s = Array1::from_iter(x_mean.iter().zip(w_mean.iter()).map(|(&x, &w)| {
        (x.powf(ratio) / (w.powf(1.0 - ratio) + SCALE_MIN)).clamp(SCALE_MIN, SCALE_MAX)
    }));
    let max = s.fold(f32::MIN, |a, &b| a.max(b));
    let min = s.fold(f32::MAX, |a, &b| a.min(b));
    let norm = (max * min).sqrt();
    if norm.is_finite() && norm > 0.0 {
        s /= norm;
    }
    s
}

/// One scored grid point.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    ratio: f32,
    loss: f64,
}

/// Lowest loss, then closest to the middle of the grid, then lower ratio.
fn prefer(a: &Candidate, b: &Candidate) -> Ordering {
    a.loss
        .total_cmp(&b.loss)
        .then_with(|| (a.ratio - 0.5).abs().total_cmp(&(b.ratio - 0.5).abs()))
        .then_with(|| a.ratio.total_cmp(&b.ratio))
}

fn group_label(group: &ScaleGroup) -> String {
    format!("{} -> {}", group.prev_op, group.linears.join(", "))
}

/// Searches one scale group, returning the winning per-channel scale.
pub fn search_group_scale<B: TransformerBlock + ?Sized>(
    block: &B,
    group: &ScaleGroup,
    kwargs: &BlockKwargs,
    quant: &QuantConfig,
    search: &SearchConfig,
    input_feat: &InputFeatures,
    block_idx: usize,
) -> AwqResult<Array1<f32>> {
    let x = input_feat.get(&group.input).ok_or_else(|| {
        AwqError::topology(format!("no captured input for '{}'", group.input))
    })?;

    let mut layers: Vec<(&str, &LinearLayer, &Array2<f32>)> = Vec::with_capacity(group.linears.len());
    for name in &group.linears {
        let layer = block
            .linear(name)
            .ok_or_else(|| AwqError::topology(format!("scale group names unknown linear '{}'", name)))?;
        let weight = layer
            .weight()
            .ok_or_else(|| AwqError::topology(format!("{} is packed and cannot be searched", name)))?;
        quant.check_in_features(name, weight.ncols())?;
        layers.push((name.as_str(), layer, weight));
    }

    let reference = block.forward_module(&group.inspect, &x.view(), kwargs, &mut ForwardCtx::plain())?;

    let x_mean = mean_abs_columns(&x.view());
    let weights: Vec<_> = layers.iter().map(|(_, _, w)| w.view()).collect();
    let stacked = concatenate(Axis(0), &weights)?;
    let w_mean = weight_magnitude(&stacked.view(), quant.q_group_size);

    let candidates: Vec<(Candidate, Array1<f32>)> = search
        .scale_ratios()
        .into_par_iter()
        .map(|ratio| -> AwqResult<(Candidate, Array1<f32>)> {
            let scales = candidate_scales(&x_mean, &w_mean, ratio);
            let mut overrides = LinearOverrides::with_capacity(layers.len());
            for (name, layer, weight) in &layers {
                let scaled = *weight * &scales;
                let fake = pseudo_quantize(&scaled.view(), quant.w_bit, quant.q_group_size)? / &scales;
                overrides.insert(
                    name.to_string(),
                    LinearLayer::new_f32(fake, layer.bias.clone()),
                );
            }
            let out = block.forward_module(
                &group.inspect,
                &x.view(),
                kwargs,
                &mut ForwardCtx::with_overrides(&overrides),
            )?;
            let loss = mse(&reference, &out);
            Ok((Candidate { ratio, loss }, scales))
        })
        .collect::<AwqResult<Vec<_>>>()?;

    let best = candidates
        .into_iter()
        .filter(|(c, _)| {
            if !c.loss.is_finite() {
                log::debug!("[{}] ratio {:.2} excluded: non-finite loss", group_label(group), c.ratio);
            }
            c.loss.is_finite()
        })
        .min_by(|(a, _), (b, _)| prefer(a, b));

    match best {
        Some((c, scales)) => {
            log::debug!(
                "block {} [{}]: best ratio {:.2}, loss {:.3e}",
                block_idx,
                group_label(group),
                c.ratio,
                c.loss
            );
            Ok(scales)
        }
        None => Err(AwqError::SearchDiverged {
            block: block_idx,
            group: group_label(group),
        }),
    }
}

/// Runs scale search for every group the block reports.
///
/// All groups are searched against the block's current weights; nothing is
/// modified until [`apply_scale`].
pub fn auto_scale_block<B: TransformerBlock + ?Sized>(
    block: &B,
    kwargs: &BlockKwargs,
    quant: &QuantConfig,
    search: &SearchConfig,
    input_feat: &InputFeatures,
    block_idx: usize,
) -> AwqResult<Vec<ScaleRecord>> {
    block
        .layers_for_scaling()
        .iter()
        .map(|group| {
            let scales = search_group_scale(block, group, kwargs, quant, search, input_feat, block_idx)?;
            Ok(ScaleRecord {
                prev_op_name: group.prev_op.clone(),
                linear_names: group.linears.clone(),
                scales,
            })
        })
        .collect()
}

/// Folds each record into the block: the preceding op's output is divided by
/// the scale and the linear layers' input columns are multiplied by it.
///
/// When `input_feat` is given, the captured inputs of the scaled linears are
/// divided by the scale as well so later passes see what the block now
/// computes.
pub fn apply_scale<B: TransformerBlock + ?Sized>(
    block: &mut B,
    records: &[ScaleRecord],
    mut input_feat: Option<&mut InputFeatures>,
) -> AwqResult<()> {
    for record in records {
        let scales = record.scales.view();
        let op = block.scalable_op_mut(&record.prev_op_name).ok_or_else(|| {
            AwqError::topology(format!(
                "'{}' cannot absorb a scale: the block reports no such op",
                record.prev_op_name
            ))
        })?;
        op.scale_output_down(&record.prev_op_name, &scales)?;

        for name in &record.linear_names {
            let layer = block
                .linear_mut(name)
                .ok_or_else(|| AwqError::topology(format!("block has no linear '{}'", name)))?;
            layer.scale_inputs(name, &scales)?;

            if let Some(feats) = input_feat.as_deref_mut() {
                if let Some(x) = feats.get_mut(name) {
                    *x /= &scales;
                }
            }
        }
    }
    Ok(())
}
