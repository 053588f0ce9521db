//! Per-group weight clipping search.
//!
//! Each `(output channel, group)` pair independently picks the clamp
//! `r * max|w_group|` over a grid of ratios `r`, scoring each ratio by the
//! squared error of the group's partial dot products with the captured
//! inputs. Output channels are processed in chunks, in parallel.

use ndarray::{concatenate, s, Array2, ArrayView2, Axis, Zip};
use rayon::prelude::*;

use crate::block::TransformerBlock;
use crate::capture::InputFeatures;
use crate::config::{QuantConfig, SearchConfig};
use crate::error::{AwqError, AwqResult};
use crate::quantizer::pseudo_quantize;
use crate::search::result::ClipRecord;

const QK_MARKERS: [&str; 5] = ["q_", "k_", "query", "key", "Wqkv"];

/// Whether `name` is an attention query/key projection.
pub fn is_qk_projection(name: &str) -> bool {
    QK_MARKERS.iter().any(|m| name.contains(m))
}

/// Best clamps for one linear layer.
#[derive(Debug, Clone)]
pub struct ClipOutcome {
    /// `[out_features, n_groups]`.
    pub max_val: Array2<f32>,
    /// Error at the chosen ratio, same shape.
    pub best_err: Array2<f32>,
    /// Error without clipping, same shape.
    pub unclipped_err: Array2<f32>,
}

/// Tokens kept for clip search: every `max(1, n / n_sample_token)`-th row.
pub fn subsample_tokens<'a>(x: &ArrayView2<'a, f32>, n_sample_token: usize) -> ArrayView2<'a, f32> {
    let step = (x.nrows() / n_sample_token.max(1)).max(1);
    x.clone().slice_move(s![..;step, ..])
}

/// Per `(row, group)` mean over tokens of the squared difference between
/// partial dot products of `x` with `a` and with `b`.
fn grouped_error(x: &ArrayView2<f32>, a: &ArrayView2<f32>, b: &ArrayView2<f32>, group: usize) -> Array2<f32> {
    let (rows, cols) = a.dim();
    let n_groups = cols / group;
    let tokens = x.nrows().max(1) as f32;
    let mut err = Array2::<f32>::zeros((rows, n_groups));
    for g in 0..n_groups {
        let cols = g * group..(g + 1) * group;
        let xg = x.slice(s![.., cols.clone()]);
        let diff = &a.slice(s![.., cols.clone()]) - &b.slice(s![.., cols]);
        let out = xg.dot(&diff.t());
        let col = out.mapv(|v| v * v).sum_axis(Axis(0)) / tokens;
        err.column_mut(g).assign(&col);
    }
    err
}

fn group_abs_max(w: &ArrayView2<f32>, group: usize) -> Array2<f32> {
    let (rows, cols) = w.dim();
    Array2::from_shape_fn((rows, cols / group), |(o, g)| {
        w.slice(s![o, g * group..(g + 1) * group])
            .fold(0.0f32, |a, &b| a.max(b.abs()))
    })
}

/// Clamps every group of `w` to `[-max_val, max_val]` in place.
pub fn clamp_groups(w: &mut Array2<f32>, max_val: &Array2<f32>, group: usize) {
    for (mut row, limits) in w.rows_mut().into_iter().zip(max_val.rows()) {
        for (mut chunk, &m) in row.exact_chunks_mut(group).into_iter().zip(limits.iter()) {
            chunk.mapv_inplace(|v| v.clamp(-m, m));
        }
    }
}

fn concat_rows(views: Vec<ArrayView2<f32>>) -> AwqResult<Array2<f32>> {
    Ok(concatenate(Axis(0), &views)?)
}

fn clip_chunk(
    w: &ArrayView2<f32>,
    x: &ArrayView2<f32>,
    quant: &QuantConfig,
    ratios: &[f32],
) -> AwqResult<ClipOutcome> {
    let group = quant.q_group_size;
    let org_max = group_abs_max(w, group);
    let mut best_max = org_max.clone();
    let mut best_err = Array2::<f32>::from_elem(org_max.dim(), f32::INFINITY);
    let mut unclipped_err = Array2::<f32>::from_elem(org_max.dim(), f32::NAN);

    for (i, &ratio) in ratios.iter().enumerate() {
        let max_val = &org_max * ratio;
        let mut clipped = w.to_owned();
        clamp_groups(&mut clipped, &max_val, group);
        let q = pseudo_quantize(&clipped.view(), quant.w_bit, quant.q_group_size)?;
        let err = grouped_error(x, w, &q.view(), group);
        if i == 0 {
            unclipped_err.assign(&err);
        }
        Zip::from(&mut best_err)
            .and(&mut best_max)
            .and(&err)
            .and(&max_val)
            .for_each(|best, best_m, &e, &m| {
                if e < *best {
                    *best = e;
                    *best_m = m;
                }
            });
    }
    Ok(ClipOutcome {
        max_val: best_max,
        best_err,
        unclipped_err,
    })
}

/// Searches clamps for one weight `[out, in]` against its captured inputs
/// `[tokens, in]`.
///
/// Non-finite errors never win; groups where every ratio was non-finite keep
/// an infinite `best_err`.
pub fn auto_clip_layer(
    w: &ArrayView2<f32>,
    x: &ArrayView2<f32>,
    quant: &QuantConfig,
    search: &SearchConfig,
) -> AwqResult<ClipOutcome> {
    quant.check_in_features("clip", w.ncols())?;
    if x.ncols() != w.ncols() {
        return Err(AwqError::topology(format!(
            "captured input has {} channels, weight expects {}",
            x.ncols(),
            w.ncols()
        )));
    }
    let xs = subsample_tokens(x, search.n_sample_token);
    let ratios = search.clip_ratios();

    let chunk = search.clip_chunk;
    let n_chunks = w.nrows().div_ceil(chunk);
    let parts = (0..n_chunks)
        .into_par_iter()
        .map(|c| {
            let rows = c * chunk..((c + 1) * chunk).min(w.nrows());
            clip_chunk(&w.slice(s![rows, ..]), &xs, quant, &ratios)
        })
        .collect::<AwqResult<Vec<_>>>()?;

    Ok(ClipOutcome {
        max_val: concat_rows(parts.iter().map(|p| p.max_val.view()).collect())?,
        best_err: concat_rows(parts.iter().map(|p| p.best_err.view()).collect())?,
        unclipped_err: concat_rows(parts.iter().map(|p| p.unclipped_err.view()).collect())?,
    })
}

/// Runs clip search for every eligible linear layer of the block.
///
/// Query/key projections are skipped when `search.exempt_qk_clip` is set,
/// and so are layers with fewer output channels than one group.
pub fn auto_clip_block<B: TransformerBlock + ?Sized>(
    block: &B,
    quant: &QuantConfig,
    search: &SearchConfig,
    input_feat: &InputFeatures,
    block_idx: usize,
) -> AwqResult<Vec<ClipRecord>> {
    let mut records = Vec::new();
    for (name, layer) in block.named_linears() {
        if search.exempt_qk_clip && is_qk_projection(&name) {
            log::debug!("block {}: clip skipped for {} (query/key)", block_idx, name);
            continue;
        }
        if layer.out_features() < quant.q_group_size {
            log::debug!(
                "block {}: clip skipped for {} ({} outputs < group size {})",
                block_idx,
                name,
                layer.out_features(),
                quant.q_group_size
            );
            continue;
        }
        let w = layer
            .weight()
            .ok_or_else(|| AwqError::topology(format!("{} is packed and cannot be clipped", name)))?;
        let x = input_feat
            .get(&name)
            .ok_or_else(|| AwqError::topology(format!("no captured input for '{}'", name)))?;
        quant.check_in_features(&name, w.ncols())?;

        let outcome = auto_clip_layer(&w.view(), &x.view(), quant, search)?;
        if outcome.best_err.iter().any(|e| !e.is_finite()) {
            return Err(AwqError::SearchDiverged {
                block: block_idx,
                group: name,
            });
        }
        records.push(ClipRecord {
            linear_name: name,
            max_val: outcome.max_val,
        });
    }
    Ok(records)
}

/// Clamps each recorded layer's groups to its `max_val`.
pub fn apply_clip<B: TransformerBlock + ?Sized>(block: &mut B, records: &[ClipRecord], quant: &QuantConfig) -> AwqResult<()> {
    for record in records {
        let name = &record.linear_name;
        let layer = block
            .linear_mut(name)
            .ok_or_else(|| AwqError::topology(format!("block has no linear '{}'", name)))?;
        let w = layer.weight_mut(name)?;
        let n_groups = quant.check_in_features(name, w.ncols())?;
        if record.max_val.dim() != (w.nrows(), n_groups) {
            return Err(AwqError::topology(format!(
                "clip record for {} has shape {:?}, expected {:?}",
                name,
                record.max_val.dim(),
                (w.nrows(), n_groups)
            )));
        }
        clamp_groups(w, &record.max_val, quant.q_group_size);
    }
    Ok(())
}
