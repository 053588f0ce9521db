//! Error types for kjarni-awq.

use thiserror::Error;

/// Errors that can terminate a quantization run.
///
/// None of these are retried. Work finished before the error (blocks already
/// searched or quantized, search results already persisted) stays valid.
#[derive(Debug, Error)]
pub enum AwqError {
    /// Invalid or unsupported quantization configuration.
    #[error("Invalid quantization config: {0}")]
    Config(String),

    /// Every scale or clip candidate produced a non-finite simulated error.
    #[error("Search diverged in block {block} for [{group}]: no candidate produced a finite error")]
    SearchDiverged { block: usize, group: String },

    /// A block plus its activation captures does not fit on its device.
    #[error(
        "Block {block} does not fit on device {device}: needs {required} bytes, {available} available"
    )]
    ResourceExhausted {
        block: usize,
        device: usize,
        required: u64,
        available: u64,
    },

    /// The model adapter did not provide a topology hint the pipeline needs.
    #[error("Model adapter is missing topology: {0}")]
    DependencyInterface(String),

    /// The caller stopped the run between blocks.
    #[error("Quantization cancelled after {completed_blocks} completed blocks")]
    Cancelled { completed_blocks: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Search result encoding error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AwqError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        AwqError::Config(msg.into())
    }

    pub(crate) fn topology(msg: impl Into<String>) -> Self {
        AwqError::DependencyInterface(msg.into())
    }
}

/// Result type for kjarni-awq operations.
pub type AwqResult<T> = Result<T, AwqError>;
