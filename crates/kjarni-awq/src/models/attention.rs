//! Causal self-attention over flattened calibration batches.
//!
//! Inputs are the already projected `q`, `k` and `v`, laid out
//! `[n_seqs * seq_len, heads * head_dim]`. Sequences are independent and run
//! in parallel.

use ndarray::{concatenate, s, Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::{AwqError, AwqResult};

const MASK_VALUE: f32 = -1e9;

/// Rotary position embedding with the rotate-half layout.
#[derive(Debug, Clone, PartialEq)]
pub struct RoPE {
    pub inv_freq: Array1<f32>,
}

impl RoPE {
    pub fn new(head_dim: usize, theta: f32) -> Self {
        let inv_freq = Array1::from_iter((0..head_dim / 2).map(|i| {
            let exponent = (2 * i) as f32 / head_dim as f32;
            1.0 / theta.powf(exponent)
        }));
        Self { inv_freq }
    }

    /// Rotates `x`, `[seq_len, head_dim]`, where row `p` is position `p`.
    pub fn rotate(&self, x: &mut Array2<f32>) {
        let half = self.inv_freq.len();
        for (pos, mut row) in x.rows_mut().into_iter().enumerate() {
            for i in 0..half {
                let angle = pos as f32 * self.inv_freq[i];
                let (sin, cos) = angle.sin_cos();
                let x0 = row[i];
                let x1 = row[i + half];
                row[i] = x0 * cos - x1 * sin;
                row[i + half] = x0 * sin + x1 * cos;
            }
        }
    }
}

/// ALiBi head slopes for `n_heads` heads with the given maximum bias.
///
/// Head counts that are not a power of two use the interleaved slopes of the
/// next power of two.
pub fn alibi_slopes(n_heads: usize, bias_max: f32) -> Array1<f32> {
    let padded = n_heads.next_power_of_two();
    let slopes: Vec<f32> = (1..=padded)
        .map(|m| 1.0 / 2f32.powf(m as f32 * bias_max / padded as f32))
        .collect();
    if padded == n_heads {
        return Array1::from(slopes);
    }
    let odd = slopes.iter().skip(1).step_by(2);
    let even = slopes.iter().step_by(2);
    Array1::from_iter(odd.chain(even).copied().take(n_heads))
}

/// How token positions enter the attention scores.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEncoding {
    Rotary(RoPE),
    Alibi(Array1<f32>),
}

/// Head layout of an attention sublayer.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionShape {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl AttentionShape {
    pub fn validate(&self) -> AwqResult<()> {
        if self.num_heads == 0 || self.num_kv_heads == 0 || self.num_heads % self.num_kv_heads != 0 {
            return Err(AwqError::config(format!(
                "{} attention heads cannot share {} key/value heads",
                self.num_heads, self.num_kv_heads
            )));
        }
        Ok(())
    }
}

fn softmax_rows(scores: &mut Array2<f32>) {
    for mut row in scores.rows_mut() {
        let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row /= sum;
        }
    }
}

/// Causal scaled dot-product attention, returns `[tokens, num_heads * head_dim]`.
pub fn causal_attention(
    q: &ArrayView2<f32>,
    k: &ArrayView2<f32>,
    v: &ArrayView2<f32>,
    seq_len: usize,
    shape: &AttentionShape,
    position: &PositionEncoding,
) -> AwqResult<Array2<f32>> {
    let tokens = q.nrows();
    if seq_len == 0 || tokens % seq_len != 0 {
        return Err(AwqError::topology(format!(
            "{} tokens do not split into sequences of {}",
            tokens, seq_len
        )));
    }
    let n_seqs = tokens / seq_len;
    let hd = shape.head_dim;
    let group = shape.num_heads / shape.num_kv_heads;
    let scale = 1.0 / (hd as f32).sqrt();

    let per_seq: Vec<Array2<f32>> = (0..n_seqs)
        .into_par_iter()
        .map(|b| {
            let rows = b * seq_len..(b + 1) * seq_len;
            let mut context = Array2::<f32>::zeros((seq_len, shape.num_heads * hd));
            for h in 0..shape.num_heads {
                let kv = h / group;
                let mut qh = q.slice(s![rows.clone(), h * hd..(h + 1) * hd]).to_owned();
                let mut kh = k.slice(s![rows.clone(), kv * hd..(kv + 1) * hd]).to_owned();
                let vh = v.slice(s![rows.clone(), kv * hd..(kv + 1) * hd]);
                if let PositionEncoding::Rotary(rope) = position {
                    rope.rotate(&mut qh);
                    rope.rotate(&mut kh);
                }

                let mut scores = qh.dot(&kh.t()) * scale;
                for ((i, j), score) in scores.indexed_iter_mut() {
                    if j > i {
                        *score = MASK_VALUE;
                    } else if let PositionEncoding::Alibi(slopes) = position {
                        *score -= slopes[h] * (i - j) as f32;
                    }
                }
                softmax_rows(&mut scores);
                context
                    .slice_mut(s![.., h * hd..(h + 1) * hd])
                    .assign(&scores.dot(&vh));
            }
            context
        })
        .collect();

    let views: Vec<_> = per_seq.iter().map(|a| a.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn test_rope_position_zero_is_identity() {
        let rope = RoPE::new(4, 10_000.0);
        let mut x = arr2(&[[1.0f32, 2.0, 3.0, 4.0]]);
        rope.rotate(&mut x);
        assert_eq!(x, arr2(&[[1.0f32, 2.0, 3.0, 4.0]]));
    }

    #[test]
    fn test_rope_preserves_norm() {
        let rope = RoPE::new(4, 10_000.0);
        let mut x = arr2(&[[0.0f32; 4], [1.0, -2.0, 0.5, 3.0]]);
        let before = x.row(1).mapv(|v| v * v).sum();
        rope.rotate(&mut x);
        assert_abs_diff_eq!(x.row(1).mapv(|v| v * v).sum(), before, epsilon = 1e-5);
    }

    #[test]
    fn test_alibi_slopes() {
        let s = alibi_slopes(4, 8.0);
        assert_abs_diff_eq!(s[0], 0.25, epsilon = 1e-7);
        assert_abs_diff_eq!(s[3], 1.0 / 256.0, epsilon = 1e-9);
        let s = alibi_slopes(3, 8.0);
        assert_eq!(s.len(), 3);
        // odd positions of the padded four first
        assert_abs_diff_eq!(s[0], 1.0 / 16.0, epsilon = 1e-7);
        assert_abs_diff_eq!(s[1], 1.0 / 256.0, epsilon = 1e-9);
        assert_abs_diff_eq!(s[2], 0.25, epsilon = 1e-7);
    }

    #[test]
    fn test_first_token_attends_to_itself() {
        let shape = AttentionShape {
            num_heads: 1,
            num_kv_heads: 1,
            head_dim: 2,
        };
        let q = arr2(&[[1.0f32, 0.0], [0.0, 1.0], [1.0, 0.0], [0.5, 0.5]]);
        let v = arr2(&[[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0], [7.0, 8.0]]);
        let out = causal_attention(
            &q.view(),
            &q.view(),
            &v.view(),
            2,
            &shape,
            &PositionEncoding::Alibi(Array1::zeros(1)),
        )
        .unwrap();
        // first token of each sequence only sees its own value
        assert_eq!(out.row(0).to_vec(), vec![1.0, 2.0]);
        assert_eq!(out.row(2).to_vec(), vec![5.0, 6.0]);
        assert!(causal_attention(&q.view(), &q.view(), &v.view(), 3, &shape, &PositionEncoding::Alibi(Array1::zeros(1))).is_err());
    }

    #[test]
    fn test_grouped_heads_share_values() {
        let shape = AttentionShape {
            num_heads: 2,
            num_kv_heads: 1,
            head_dim: 1,
        };
        let q = arr2(&[[1.0f32, -1.0], [0.5, 2.0]]);
        let k = arr2(&[[1.0f32], [1.0]]);
        let v = arr2(&[[2.0f32], [4.0]]);
        let out = causal_attention(&q.view(), &k.view(), &v.view(), 2, &shape, &PositionEncoding::Alibi(Array1::zeros(2))).unwrap();
        assert_eq!(out.dim(), (2, 2));
        assert_eq!(out.row(0).to_vec(), vec![2.0, 2.0]);
        // equal keys give uniform weights over the visible prefix
        assert_abs_diff_eq!(out[[1, 0]], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(out[[1, 1]], 3.0, epsilon = 1e-6);
    }
}
