//! Quantization and search configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AwqError, AwqResult};

/// File name of the persisted quantization config.
pub const QUANT_CONFIG_FILE: &str = "quant_config.json";

/// Packed weight layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GemmVersion {
    /// Input-major packing, codes interleaved within each 32-bit word.
    #[default]
    #[serde(rename = "GEMM")]
    Gemm,
    /// Output-major packing, codes stored sequentially along the input axis.
    #[serde(rename = "GEMV")]
    Gemv,
}

impl fmt::Display for GemmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GemmVersion::Gemm => write!(f, "GEMM"),
            GemmVersion::Gemv => write!(f, "GEMV"),
        }
    }
}

impl FromStr for GemmVersion {
    type Err = AwqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GEMM" => Ok(GemmVersion::Gemm),
            "GEMV" => Ok(GemmVersion::Gemv),
            other => Err(AwqError::config(format!("unknown version tag '{}'", other))),
        }
    }
}

/// Quantization parameters shared by every linear sublayer of a run.
///
/// The serialized form is the `quant_config.json` file written next to a
/// quantized checkpoint. `version` is the only optional field and defaults to
/// [`GemmVersion::Gemm`] when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantConfig {
    pub zero_point: bool,
    pub q_group_size: usize,
    pub w_bit: u8,
    #[serde(default)]
    pub version: GemmVersion,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            zero_point: true,
            q_group_size: 128,
            w_bit: 4,
            version: GemmVersion::Gemm,
        }
    }
}

impl QuantConfig {
    /// Builds a validated asymmetric config.
    pub fn new(w_bit: u8, q_group_size: usize, version: GemmVersion) -> AwqResult<Self> {
        let config = Self {
            zero_point: true,
            q_group_size,
            w_bit,
            version,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AwqResult<()> {
        if !self.zero_point {
            return Err(AwqError::config(
                "zero_point must be true, only asymmetric quantization is supported",
            ));
        }
        if self.w_bit == 0 || self.w_bit > 8 {
            return Err(AwqError::config(format!(
                "w_bit must be between 1 and 8, got {}",
                self.w_bit
            )));
        }
        if self.q_group_size == 0 {
            return Err(AwqError::config("q_group_size must be positive"));
        }
        Ok(())
    }

    /// Largest integer code, `2^w_bit - 1`.
    pub fn max_int(&self) -> u32 {
        (1u32 << self.w_bit) - 1
    }

    /// Number of codes stored in one 32-bit word.
    pub fn pack_num(&self) -> AwqResult<usize> {
        if 32 % self.w_bit as usize != 0 {
            return Err(AwqError::config(format!(
                "{}-bit codes cannot be packed into 32-bit words",
                self.w_bit
            )));
        }
        Ok(32 / self.w_bit as usize)
    }

    /// Checks that `in_features` tiles into whole groups.
    pub fn check_in_features(&self, name: &str, in_features: usize) -> AwqResult<usize> {
        if in_features % self.q_group_size != 0 {
            return Err(AwqError::config(format!(
                "{}: in_features {} is not divisible by q_group_size {}",
                name, in_features, self.q_group_size
            )));
        }
        Ok(in_features / self.q_group_size)
    }

    pub fn from_json_str(s: &str) -> AwqResult<Self> {
        let config: QuantConfig = serde_json::from_str(s)
            .map_err(|e| AwqError::config(format!("cannot parse quant config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> AwqResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Writes `quant_config.json` into `dir`.
    pub fn save(&self, dir: impl AsRef<Path>) -> AwqResult<PathBuf> {
        let path = dir.as_ref().join(QUANT_CONFIG_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

/// Grid and sampling parameters of scale and clip search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Grid resolution for both the mixing ratio and the clip ratio.
    pub n_grid: usize,
    /// Smallest clip ratio tried is `1 - max_shrink`, exclusive.
    pub max_shrink: f32,
    /// Tokens kept by clip search after strided subsampling.
    pub n_sample_token: usize,
    /// Output channels evaluated together by clip search.
    pub clip_chunk: usize,
    /// Skip clip search for attention query/key projections.
    pub exempt_qk_clip: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            n_grid: 20,
            max_shrink: 0.5,
            n_sample_token: 512,
            clip_chunk: 512,
            exempt_qk_clip: true,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> AwqResult<()> {
        if self.n_grid == 0 {
            return Err(AwqError::config("n_grid must be positive"));
        }
        if !(0.0..1.0).contains(&self.max_shrink) {
            return Err(AwqError::config(format!(
                "max_shrink must be in [0, 1), got {}",
                self.max_shrink
            )));
        }
        if self.clip_chunk == 0 || self.n_sample_token == 0 {
            return Err(AwqError::config(
                "clip_chunk and n_sample_token must be positive",
            ));
        }
        Ok(())
    }

    /// Clip ratios, largest first. Always starts at `1.0`, so a zero
    /// `max_shrink` leaves weights unclipped.
    pub fn clip_ratios(&self) -> Vec<f32> {
        let steps = ((self.max_shrink * self.n_grid as f32) as usize).max(1);
        (0..steps)
            .map(|i| 1.0 - i as f32 / self.n_grid as f32)
            .collect()
    }

    /// Mixing ratios `0, 1/n, ..., 1`.
    pub fn scale_ratios(&self) -> Vec<f32> {
        (0..=self.n_grid)
            .map(|i| i as f32 / self.n_grid as f32)
            .collect()
    }
}

/// Options for one [`crate::pipeline::AwqPipeline::quantize`] run.
#[derive(Debug, Clone)]
pub struct QuantizeOptions {
    pub n_samples: usize,
    pub seqlen: usize,
    /// Run scale search.
    pub auto_scale: bool,
    /// Run clip search.
    pub mse_range: bool,
    pub run_search: bool,
    pub run_quant: bool,
    /// Pack weights into the low-bit layout. When false the quant pass only
    /// replaces weights with their dequantized values.
    pub real_quant: bool,
    /// Persist the search result here after every block.
    pub search_checkpoint: Option<PathBuf>,
    pub search: SearchConfig,
}

impl Default for QuantizeOptions {
    fn default() -> Self {
        Self {
            n_samples: 128,
            seqlen: 512,
            auto_scale: true,
            mse_range: true,
            run_search: true,
            run_quant: true,
            real_quant: true,
            search_checkpoint: None,
            search: SearchConfig::default(),
        }
    }
}

/// Parses sizes such as `10GB`, `512MiB` or `4096`.
pub fn parse_byte_size(s: &str) -> AwqResult<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| AwqError::config(format!("invalid size '{}'", s)))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        "KIB" => 1 << 10,
        "MIB" => 1 << 20,
        "GIB" => 1 << 30,
        "TIB" => 1 << 40,
        other => return Err(AwqError::config(format!("unknown size unit '{}'", other))),
    };
    Ok((value * multiplier as f64) as u64)
}
