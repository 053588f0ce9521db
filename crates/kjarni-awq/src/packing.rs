//! Packed low-bit weight storage.
//!
//! Integer codes are packed `32 / w_bit` to a 32-bit word. Two layouts exist:
//!
//! - **GEMM**: `qweight` is `[in_features, out_features / pack_num]`. Each word
//!   holds `pack_num` consecutive output channels of one input channel in
//!   interleaved order (even lanes first, then odd lanes, e.g.
//!   `[0, 2, 4, 6, 1, 3, 5, 7]` at 4 bits). `qzeros` is
//!   `[n_groups, out_features / pack_num]` with the same interleave and
//!   `scales` is `[n_groups, out_features]`.
//! - **GEMV**: `qweight` is `[out_features, in_features / pack_num]` with codes
//!   stored sequentially along the input axis. `qzeros` is
//!   `[out_features, ceil(n_groups / pack_num)]` and `scales` is
//!   `[out_features, pack_num * ceil(n_groups / pack_num)]`, zero padded.
//!
//! Scales are stored as `f16`. Packed words are stored as `i32`, so words with
//! the top bit set are negative.

use half::f16;
use ndarray::{Array2, ArrayView2};

use crate::config::{GemmVersion, QuantConfig};
use crate::error::{AwqError, AwqResult};

/// A linear weight in one of the packed layouts.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedWeight {
    pub version: GemmVersion,
    pub w_bit: u8,
    pub group_size: usize,
    pub in_features: usize,
    pub out_features: usize,
    pub qweight: Array2<i32>,
    pub qzeros: Array2<i32>,
    pub scales: Array2<f16>,
}

/// Lane order inside a GEMM word: even lanes, then odd lanes.
pub fn gemm_lane_order(pack_num: usize) -> Vec<usize> {
    (0..pack_num)
        .step_by(2)
        .chain((1..pack_num).step_by(2))
        .collect()
}

impl PackedWeight {
    /// Packs a `[out, in]` weight using per-group `scales` and `zeros` of shape
    /// `[out, n_groups]`, as returned by
    /// [`crate::quantizer::pseudo_quantize_tensor`].
    ///
    /// Integer codes are recovered as `round(w / scale) + zero`, so passing the
    /// dequantized weight reproduces the quantizer's codes exactly.
    pub fn from_float(
        weight: &ArrayView2<f32>,
        scales: &ArrayView2<f32>,
        zeros: &ArrayView2<f32>,
        config: &QuantConfig,
    ) -> AwqResult<Self> {
        let (out_features, in_features) = weight.dim();
        let pack_num = config.pack_num()?;
        let group_size = config.q_group_size;
        let n_groups = config.check_in_features("packed linear", in_features)?;
        if scales.dim() != (out_features, n_groups) || zeros.dim() != (out_features, n_groups) {
            return Err(AwqError::config(format!(
                "scales/zeros must be [{}, {}], got {:?} and {:?}",
                out_features,
                n_groups,
                scales.dim(),
                zeros.dim()
            )));
        }

        let max_int = config.max_int();
        let codes = Array2::from_shape_fn((out_features, in_features), |(o, i)| {
            let g = i / group_size;
            let q = (weight[[o, i]] / scales[[o, g]]).round() + zeros[[o, g]];
            q.clamp(0.0, max_int as f32) as u32
        });
        let zero_codes = zeros.mapv(|z| z.clamp(0.0, max_int as f32) as u32);

        let bits = config.w_bit as u32;
        let (qweight, qzeros, packed_scales) = match config.version {
            GemmVersion::Gemm => {
                if out_features % pack_num != 0 {
                    return Err(AwqError::config(format!(
                        "GEMM packing needs out_features divisible by {}, got {}",
                        pack_num, out_features
                    )));
                }
                let order = gemm_lane_order(pack_num);
                let qweight = pack_gemm(&codes.t(), &order, bits);
                let qzeros = pack_gemm(&zero_codes.t(), &order, bits);
                let packed_scales = scales.t().mapv(f16::from_f32);
                (qweight, qzeros, packed_scales)
            }
            GemmVersion::Gemv => {
                if in_features % pack_num != 0 {
                    return Err(AwqError::config(format!(
                        "GEMV packing needs in_features divisible by {}, got {}",
                        pack_num, in_features
                    )));
                }
                let zero_words = n_groups.div_ceil(pack_num);
                let qweight = pack_sequential(&codes.view(), pack_num, in_features / pack_num, bits);
                let qzeros = pack_sequential(&zero_codes.view(), pack_num, zero_words, bits);
                let mut packed_scales = Array2::from_elem((out_features, zero_words * pack_num), f16::ZERO);
                for o in 0..out_features {
                    for g in 0..n_groups {
                        packed_scales[[o, g]] = f16::from_f32(scales[[o, g]]);
                    }
                }
                (qweight, qzeros, packed_scales)
            }
        };

        Ok(Self {
            version: config.version,
            w_bit: config.w_bit,
            group_size,
            in_features,
            out_features,
            qweight,
            qzeros,
            scales: packed_scales,
        })
    }

    /// Reassembles a packed weight from stored tensors, checking their shapes.
    pub fn from_parts(
        config: &QuantConfig,
        in_features: usize,
        out_features: usize,
        qweight: Array2<i32>,
        qzeros: Array2<i32>,
        scales: Array2<f16>,
    ) -> AwqResult<Self> {
        let pack_num = config.pack_num()?;
        let n_groups = config.check_in_features("packed linear", in_features)?;
        let expected = match config.version {
            GemmVersion::Gemm => (
                (in_features, out_features / pack_num),
                (n_groups, out_features / pack_num),
                (n_groups, out_features),
            ),
            GemmVersion::Gemv => {
                let zero_words = n_groups.div_ceil(pack_num);
                (
                    (out_features, in_features / pack_num),
                    (out_features, zero_words),
                    (out_features, zero_words * pack_num),
                )
            }
        };
        if (qweight.dim(), qzeros.dim(), scales.dim()) != expected {
            return Err(AwqError::config(format!(
                "packed tensors have shapes {:?}/{:?}/{:?}, expected {:?}",
                qweight.dim(),
                qzeros.dim(),
                scales.dim(),
                expected
            )));
        }
        Ok(Self {
            version: config.version,
            w_bit: config.w_bit,
            group_size: config.q_group_size,
            in_features,
            out_features,
            qweight,
            qzeros,
            scales,
        })
    }

    fn pack_num(&self) -> usize {
        32 / self.w_bit as usize
    }

    fn n_groups(&self) -> usize {
        self.in_features / self.group_size
    }

    /// Integer codes, `[out, in]`.
    pub fn codes(&self) -> Array2<u32> {
        let pack_num = self.pack_num();
        let bits = self.w_bit as u32;
        match self.version {
            GemmVersion::Gemm => {
                unpack_gemm(&self.qweight, &gemm_lane_order(pack_num), bits, self.out_features)
                    .reversed_axes()
            }
            GemmVersion::Gemv => unpack_sequential(&self.qweight, pack_num, bits, self.in_features),
        }
    }

    /// Integer zero points, `[out, n_groups]`.
    pub fn zero_points(&self) -> Array2<u32> {
        let pack_num = self.pack_num();
        let bits = self.w_bit as u32;
        match self.version {
            GemmVersion::Gemm => {
                unpack_gemm(&self.qzeros, &gemm_lane_order(pack_num), bits, self.out_features)
                    .reversed_axes()
            }
            GemmVersion::Gemv => unpack_sequential(&self.qzeros, pack_num, bits, self.n_groups()),
        }
    }

    /// Per-group scales as `f32`, `[out, n_groups]`.
    pub fn scales_f32(&self) -> Array2<f32> {
        let n_groups = self.n_groups();
        match self.version {
            GemmVersion::Gemm => self.scales.t().mapv(f16::to_f32),
            GemmVersion::Gemv => Array2::from_shape_fn((self.out_features, n_groups), |(o, g)| {
                self.scales[[o, g]].to_f32()
            }),
        }
    }

    /// Reconstructs the `[out, in]` float weight.
    pub fn dequantize(&self) -> Array2<f32> {
        let codes = self.codes();
        let zeros = self.zero_points();
        let scales = self.scales_f32();
        let group_size = self.group_size;
        Array2::from_shape_fn((self.out_features, self.in_features), |(o, i)| {
            let g = i / group_size;
            (codes[[o, i]] as f32 - zeros[[o, g]] as f32) * scales[[o, g]]
        })
    }

    pub fn param_bytes(&self) -> u64 {
        ((self.qweight.len() + self.qzeros.len()) * 4 + self.scales.len() * 2) as u64
    }
}

/// Packs columns of a `[rows, cols]` code matrix into `[rows, cols / pack]`
/// words using `order` as the lane permutation.
fn pack_gemm(codes: &ArrayView2<u32>, order: &[usize], bits: u32) -> Array2<i32> {
    let pack_num = order.len();
    let (rows, cols) = codes.dim();
    Array2::from_shape_fn((rows, cols / pack_num), |(r, c)| {
        let mut word = 0u32;
        for (lane, &src) in order.iter().enumerate() {
            word |= codes[[r, c * pack_num + src]] << (lane as u32 * bits);
        }
        word as i32
    })
}

fn unpack_gemm(words: &Array2<i32>, order: &[usize], bits: u32, cols: usize) -> Array2<u32> {
    let pack_num = order.len();
    let mask = (1u32 << bits) - 1;
    let mut codes = Array2::<u32>::zeros((words.nrows(), cols));
    for ((r, c), &word) in words.indexed_iter() {
        for (lane, &dst) in order.iter().enumerate() {
            codes[[r, c * pack_num + dst]] = ((word as u32) >> (lane as u32 * bits)) & mask;
        }
    }
    codes
}

/// Packs each row sequentially into `width` words, zero padding the tail.
fn pack_sequential(codes: &ArrayView2<u32>, pack_num: usize, width: usize, bits: u32) -> Array2<i32> {
    let cols = codes.ncols();
    Array2::from_shape_fn((codes.nrows(), width), |(r, c)| {
        let mut word = 0u32;
        for lane in 0..pack_num {
            let idx = c * pack_num + lane;
            if idx < cols {
                word |= codes[[r, idx]] << (lane as u32 * bits);
            }
        }
        word as i32
    })
}

fn unpack_sequential(words: &Array2<i32>, pack_num: usize, bits: u32, cols: usize) -> Array2<u32> {
    let mask = (1u32 << bits) - 1;
    Array2::from_shape_fn((words.nrows(), cols), |(r, i)| {
        let word = words[[r, i / pack_num]] as u32;
        (word >> ((i % pack_num) as u32 * bits)) & mask
    })
}
