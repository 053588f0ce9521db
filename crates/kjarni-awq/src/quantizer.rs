//! Group-wise asymmetric quantization of weight matrices.
//!
//! Every row of a `[out_features, in_features]` weight is split into groups of
//! `group_size` consecutive input channels. Each group gets one scale and one
//! integer zero point:
//!
//! 1. `lo = min(min(group), 0)`, `hi = max(max(group), 0)`
//! 2. `scale = max(hi - lo, 1e-5) / (2^w - 1)`
//! 3. `zero = clamp(round(-lo / scale), 0, 2^w - 1)`
//! 4. `q = clamp(round(x / scale) + zero, 0, 2^w - 1)`
//! 5. `x' = (q - zero) * scale`
//!
//! The range always includes zero, so the zero point is representable and
//! every element reconstructs within half a quantization step. This is
//! deliberately coarser than the plain `(max - min) / (2^w - 1)` step for
//! groups that do not straddle zero: `[5, 6]` at 4 bits gets a step of
//! `6 / 15 = 0.4`, not `1 / 15`. Packed checkpoints store the zero point as a
//! `w`-bit code, which the plain step cannot guarantee.
//!
//! The kernel is pure and deterministic: scale search, clip search and the
//! final quant pass all call it and must agree bit for bit on equal inputs.

use ndarray::{s, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Zip};

use crate::error::{AwqError, AwqResult};

/// Minimum group range before dividing by the number of levels.
const MIN_RANGE: f32 = 1e-5;

/// Output of [`pseudo_quantize_tensor`].
#[derive(Debug, Clone)]
pub struct GroupQuantized {
    /// Dequantized weight, same shape as the input.
    pub weight: Array2<f32>,
    /// Quantization step per group, `[rows, n_groups]`.
    pub scales: Array2<f32>,
    /// Integer-valued zero point per group, `[rows, n_groups]`.
    pub zeros: Array2<f32>,
}

impl GroupQuantized {
    pub fn n_groups(&self) -> usize {
        self.scales.ncols()
    }
}

/// Quantizes and dequantizes `w` group-wise, returning the quantization
/// parameters alongside.
///
/// # Errors
///
/// `Config` if `group_size` is zero or does not divide the column count, or if
/// `w_bit` is outside `1..=8`.
pub fn pseudo_quantize_tensor(
    w: &ArrayView2<f32>,
    w_bit: u8,
    group_size: usize,
) -> AwqResult<GroupQuantized> {
    let (rows, cols) = w.dim();
    if w_bit == 0 || w_bit > 8 {
        return Err(AwqError::config(format!("unsupported bit width {}", w_bit)));
    }
    if group_size == 0 || cols % group_size != 0 {
        return Err(AwqError::config(format!(
            "last dimension {} is not divisible by group size {}",
            cols, group_size
        )));
    }
    let n_groups = cols / group_size;
    let max_int = ((1u32 << w_bit) - 1) as f32;

    let mut weight = Array2::<f32>::zeros((rows, cols));
    let mut scales = Array2::<f32>::zeros((rows, n_groups));
    let mut zeros = Array2::<f32>::zeros((rows, n_groups));

    Zip::from(weight.rows_mut())
        .and(scales.rows_mut())
        .and(zeros.rows_mut())
        .and(w.rows())
        .par_for_each(|mut out_row, mut scale_row, mut zero_row, src_row| {
            for g in 0..n_groups {
                let start = g * group_size;
                let end = start + group_size;
                let (step, zero) = quantize_group(
                    src_row.slice(s![start..end]),
                    out_row.slice_mut(s![start..end]),
                    max_int,
                );
                scale_row[g] = step;
                zero_row[g] = zero;
            }
        });

    Ok(GroupQuantized {
        weight,
        scales,
        zeros,
    })
}

/// Dequantized weight only.
pub fn pseudo_quantize(w: &ArrayView2<f32>, w_bit: u8, group_size: usize) -> AwqResult<Array2<f32>> {
    Ok(pseudo_quantize_tensor(w, w_bit, group_size)?.weight)
}

#[inline]
fn quantize_group(src: ArrayView1<f32>, mut dst: ArrayViewMut1<f32>, max_int: f32) -> (f32, f32) {
    let (lo, hi) = src
        .iter()
        .fold((0.0f32, 0.0f32), |(lo, hi), &x| (lo.min(x), hi.max(x)));
    let step = (hi - lo).max(MIN_RANGE) / max_int;
    let zero = (-lo / step).round().clamp(0.0, max_int);

    Zip::from(&mut dst).and(&src).for_each(|d, &x| {
        let q = ((x / step).round() + zero).clamp(0.0, max_int);
        *d = (q - zero) * step;
    });
    (step, zero)
}
