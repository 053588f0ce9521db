//! Activation capture for the block being searched.
//!
//! A block's forward pass reports the input of every linear sublayer to a
//! [`LinearObserver`] before computing the sublayer's output. The pipeline
//! passes an [`ActivationCapture`] for the calibration pass and drops it, with
//! everything it accumulated, once the block's search is finished.

use std::collections::{BTreeMap, BTreeSet};

use ndarray::{concatenate, Array2, ArrayView2, Axis};

use crate::error::{AwqError, AwqResult};

/// Receives the input of each linear sublayer as the block evaluates it.
pub trait LinearObserver {
    fn observe(&mut self, name: &str, input: &ArrayView2<f32>);
}

/// Concatenated inputs per linear sublayer, `[n_tokens, in_features]`.
pub type InputFeatures = BTreeMap<String, Array2<f32>>;

/// Accumulates owned copies of the inputs of a fixed set of linear layers.
#[derive(Debug, Default)]
pub struct ActivationCapture {
    registered: BTreeSet<String>,
    chunks: BTreeMap<String, Vec<Array2<f32>>>,
}

impl ActivationCapture {
    /// Captures inputs for the given sublayer names only.
    pub fn for_linears<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            registered: names.into_iter().map(Into::into).collect(),
            chunks: BTreeMap::new(),
        }
    }

    /// Host memory held by the captured chunks.
    pub fn bytes(&self) -> u64 {
        self.chunks
            .values()
            .flat_map(|v| v.iter())
            .map(|a| a.len() as u64 * 4)
            .sum()
    }

    /// Concatenates each sublayer's chunks along the token axis.
    ///
    /// Every registered sublayer must have been observed at least once.
    pub fn finish(self) -> AwqResult<InputFeatures> {
        let mut out = InputFeatures::new();
        for name in &self.registered {
            if !self.chunks.contains_key(name) {
                return Err(AwqError::topology(format!(
                    "linear '{}' was never evaluated by the block's forward pass",
                    name
                )));
            }
        }
        for (name, chunks) in self.chunks {
            let merged = if chunks.len() == 1 {
                chunks.into_iter().next().unwrap_or_default()
            } else {
                let views: Vec<_> = chunks.iter().map(|c| c.view()).collect();
                concatenate(Axis(0), &views)?
            };
            out.insert(name, merged);
        }
        Ok(out)
    }
}

impl LinearObserver for ActivationCapture {
    fn observe(&mut self, name: &str, input: &ArrayView2<f32>) {
        if self.registered.contains(name) {
            self.chunks
                .entry(name.to_string())
                .or_default()
                .push(input.to_owned());
        }
    }
}
