//! Calibration corpus.
//!
//! A [`CalibrationSource`] produces tokenized documents; [`get_calib_dataset`]
//! turns them into the fixed-length rows the pipeline runs over.

use std::path::{Path, PathBuf};

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::error::{AwqError, AwqResult};

/// Documents longer than this are skipped.
pub const MAX_DOC_TOKENS: usize = 512;

/// Produces tokenized calibration documents in a fixed order.
pub trait CalibrationSource {
    fn documents(&self) -> AwqResult<Vec<Vec<u32>>>;
}

/// Token ids stored as JSON: either an array of arrays, or one object with an
/// `input_ids` array per line.
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

#[derive(Deserialize)]
struct TokenLine {
    input_ids: Vec<u32>,
}

impl TokenFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn parse(text: &str) -> AwqResult<Vec<Vec<u32>>> {
        let trimmed = text.trim_start();
        if trimmed.starts_with('[') {
            return Ok(serde_json::from_str(trimmed)?);
        }
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| -> AwqResult<Vec<u32>> { Ok(serde_json::from_str::<TokenLine>(l)?.input_ids) })
            .collect()
    }
}

impl CalibrationSource for TokenFile {
    fn documents(&self) -> AwqResult<Vec<Vec<u32>>> {
        let text = std::fs::read_to_string(&self.path)?;
        Self::parse(&text)
    }
}

/// Uniformly random token documents from a seeded generator.
#[derive(Debug, Clone)]
pub struct RandomTokens {
    pub vocab_size: u32,
    pub n_docs: usize,
    pub doc_len: usize,
    pub seed: u64,
}

impl CalibrationSource for RandomTokens {
    fn documents(&self) -> AwqResult<Vec<Vec<u32>>> {
        if self.vocab_size == 0 {
            return Err(AwqError::config("random calibration needs a non-empty vocabulary"));
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        Ok((0..self.n_docs)
            .map(|_| (0..self.doc_len).map(|_| rng.gen_range(0..self.vocab_size)).collect())
            .collect())
    }
}

/// Builds `[rows, block_size]` calibration samples.
///
/// Empty documents and documents over [`MAX_DOC_TOKENS`] are skipped, the
/// first `n_samples` remaining ones are concatenated, and the stream is cut
/// into rows of `block_size`, dropping the incomplete tail.
pub fn get_calib_dataset<S: CalibrationSource + ?Sized>(
    source: &S,
    n_samples: usize,
    block_size: usize,
) -> AwqResult<Array2<u32>> {
    if block_size == 0 {
        return Err(AwqError::config("calibration block size must be positive"));
    }
    let docs = source.documents()?;
    let total = docs.len();
    let stream: Vec<u32> = docs
        .into_iter()
        .filter(|d| !d.is_empty() && d.len() <= MAX_DOC_TOKENS)
        .take(n_samples)
        .flatten()
        .collect();

    let rows = stream.len() / block_size;
    if rows == 0 {
        return Err(AwqError::config(format!(
            "calibration corpus has {} usable tokens, fewer than one block of {}",
            stream.len(),
            block_size
        )));
    }
    log::info!(
        "calibration: {} of {} documents, {} rows of {} tokens",
        n_samples.min(total),
        total,
        rows,
        block_size
    );
    let mut stream = stream;
    stream.truncate(rows * block_size);
    Ok(Array2::from_shape_vec((rows, block_size), stream)?)
}
