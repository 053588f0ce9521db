use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kjarni-awq")]
#[command(about = "Activation-aware weight quantization for transformer models", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Search scales and clamps, then write a packed low-bit checkpoint
    Quantize(QuantizeArgs),

    /// Validate a quant_config.json and print it
    InspectConfig {
        /// Path to the config file
        file: PathBuf,
    },
}

#[derive(Args, Debug, PartialEq)]
pub struct QuantizeArgs {
    /// Model directory with config.json and safetensors weights
    #[arg(short, long)]
    pub model: PathBuf,

    /// Output directory
    #[arg(short, long)]
    pub output: PathBuf,

    /// Bits per weight
    #[arg(long, default_value_t = 4)]
    pub w_bit: u8,

    /// Input channels sharing one scale and zero point
    #[arg(long, default_value_t = 128)]
    pub group_size: usize,

    /// Packed layout (gemm or gemv)
    #[arg(long, default_value = "gemm")]
    pub version: String,

    /// Calibration documents to use
    #[arg(long, default_value_t = 128)]
    pub n_samples: usize,

    /// Tokens per calibration row
    #[arg(long, default_value_t = 512)]
    pub seqlen: usize,

    /// Skip scale search
    #[arg(long)]
    pub no_scale: bool,

    /// Skip clip search
    #[arg(long)]
    pub no_clip: bool,

    /// Only run the search and write its result
    #[arg(long, conflicts_with = "search_result")]
    pub search_only: bool,

    /// Keep float weights holding the dequantized values instead of packing
    #[arg(long)]
    pub fake_quant: bool,

    /// Tokenized calibration file (JSON array of arrays, or JSON lines with input_ids)
    #[arg(long, conflicts_with = "random_calib")]
    pub calib: Option<PathBuf>,

    /// Use random calibration tokens from this seed
    #[arg(long)]
    pub random_calib: Option<u64>,

    /// Replay a saved search result instead of searching
    #[arg(long)]
    pub search_result: Option<PathBuf>,

    /// Persist the search after every block and resume from it if present
    #[arg(long)]
    pub search_checkpoint: Option<PathBuf>,

    /// Memory of one compute device, e.g. 24GiB (repeat per device)
    #[arg(long)]
    pub device_memory: Vec<String>,

    /// Largest checkpoint shard
    #[arg(long, default_value = "10GB")]
    pub shard_size: String,

    /// Read w_bit, group size and version from this quant_config.json
    #[arg(long)]
    pub quant_config: Option<PathBuf>,
}

pub fn verbosity_to_log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}
