//! The model-side half of the adapter interface.

use ndarray::{Array2, ArrayView2};

use crate::block::{BlockKwargs, ForwardCtx, TransformerBlock};
use crate::checkpoint::TensorData;
use crate::device::Device;
use crate::error::{AwqError, AwqResult};

/// A model family the pipeline can quantize.
///
/// The pipeline reaches every block through [`Self::layers`] and never
/// assumes anything about topology beyond what [`TransformerBlock`] reports.
pub trait ModelAdapter: Send + Sync {
    type Block: TransformerBlock;

    /// Family tag, e.g. `llama`.
    fn model_type(&self) -> &'static str;

    /// Prefix of block parameter names, e.g. `model.layers`.
    fn layer_prefix(&self) -> &str;

    fn layers(&self) -> &[Self::Block];

    fn layers_mut(&mut self) -> &mut [Self::Block];

    /// Records where the embeddings live.
    fn move_embed(&mut self, device: Device);

    fn embed_device(&self) -> Device;

    fn embed_bytes(&self) -> u64;

    /// Runs everything before the first block: returns the first block's
    /// hidden states, `[n_seqs * seq_len, hidden]`, and the shared block
    /// state.
    fn prefix_forward(&self, input_ids: &Array2<u32>) -> AwqResult<(Array2<f32>, BlockKwargs)>;

    /// Parameters outside the blocks (embeddings, final norm, head) with
    /// fully qualified names.
    fn outer_tensors(&self) -> Vec<(String, TensorData)>;

    /// `"<layer_prefix>.<index>."`.
    fn block_prefix(&self, index: usize) -> String {
        format!("{}.{}.", self.layer_prefix(), index)
    }

    /// Every parameter with fully qualified names, blocks in order.
    fn named_tensors(&self) -> Vec<(String, TensorData)> {
        let mut out = self.outer_tensors();
        for (i, block) in self.layers().iter().enumerate() {
            let prefix = self.block_prefix(i);
            out.extend(
                block
                    .named_tensors()
                    .into_iter()
                    .map(|(name, t)| (format!("{}{}", prefix, name), t)),
            );
        }
        out
    }

    /// Hidden states after the last block.
    fn forward_blocks(&self, input_ids: &Array2<u32>) -> AwqResult<Array2<f32>> {
        let (mut hidden, kwargs) = self.prefix_forward(input_ids)?;
        for block in self.layers() {
            hidden = block.forward(&hidden.view(), &kwargs, &mut ForwardCtx::plain())?;
        }
        Ok(hidden)
    }

    fn block_param_bytes(&self) -> Vec<u64> {
        self.layers().iter().map(|b| b.param_bytes()).collect()
    }
}

/// Gathers embedding rows for `input_ids`, flattened to `[n * seq, hidden]`.
pub fn embed_tokens(table: &ArrayView2<f32>, input_ids: &Array2<u32>) -> AwqResult<Array2<f32>> {
    let vocab = table.nrows();
    let mut out = Array2::<f32>::zeros((input_ids.len(), table.ncols()));
    for (mut row, &id) in out.rows_mut().into_iter().zip(input_ids.iter()) {
        if id as usize >= vocab {
            return Err(AwqError::config(format!(
                "token id {} is outside the vocabulary of {}",
                id, vocab
            )));
        }
        row.assign(&table.row(id as usize));
    }
    Ok(out)
}
