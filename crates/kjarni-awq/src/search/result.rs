//! Search records and their persisted form.

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::AwqResult;

/// File name of the persisted search result.
pub const SEARCH_RESULT_FILE: &str = "awq_model_search_result.bin";

/// A scale folded between an op and the linear layers it feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleRecord {
    pub prev_op_name: String,
    pub linear_names: Vec<String>,
    /// One positive value per input channel of the linear layers.
    pub scales: Array1<f32>,
}

/// A per-group weight clamp for one linear layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipRecord {
    pub linear_name: String,
    /// `[out_features, n_groups]`.
    pub max_val: Array2<f32>,
}

impl ScaleRecord {
    fn prefixed(&self, prefix: &str) -> Self {
        Self {
            prev_op_name: format!("{}{}", prefix, self.prev_op_name),
            linear_names: self
                .linear_names
                .iter()
                .map(|n| format!("{}{}", prefix, n))
                .collect(),
            scales: self.scales.clone(),
        }
    }

    fn strip(&self, prefix: &str) -> Option<Self> {
        let prev_op_name = self.prev_op_name.strip_prefix(prefix)?.to_string();
        let linear_names = self
            .linear_names
            .iter()
            .map(|n| n.strip_prefix(prefix).map(str::to_string))
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            prev_op_name,
            linear_names,
            scales: self.scales.clone(),
        })
    }
}

impl ClipRecord {
    fn prefixed(&self, prefix: &str) -> Self {
        Self {
            linear_name: format!("{}{}", prefix, self.linear_name),
            max_val: self.max_val.clone(),
        }
    }

    fn strip(&self, prefix: &str) -> Option<Self> {
        Some(Self {
            linear_name: self.linear_name.strip_prefix(prefix)?.to_string(),
            max_val: self.max_val.clone(),
        })
    }
}

/// Scale and clip records of a search pass, keyed by fully qualified
/// sublayer names such as `model.layers.3.mlp.up_proj`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub scale: Vec<ScaleRecord>,
    pub clip: Vec<ClipRecord>,
    /// Blocks `0..completed_blocks` are fully searched.
    pub completed_blocks: usize,
}

impl SearchResult {
    /// Appends the block-relative records of the next block under `prefix`.
    pub fn push_block(&mut self, prefix: &str, scale: &[ScaleRecord], clip: &[ClipRecord]) {
        self.scale.extend(scale.iter().map(|r| r.prefixed(prefix)));
        self.clip.extend(clip.iter().map(|r| r.prefixed(prefix)));
        self.completed_blocks += 1;
    }

    /// Records belonging to the block at `prefix`, with the prefix removed.
    pub fn for_block(&self, prefix: &str) -> (Vec<ScaleRecord>, Vec<ClipRecord>) {
        (
            self.scale.iter().filter_map(|r| r.strip(prefix)).collect(),
            self.clip.iter().filter_map(|r| r.strip(prefix)).collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.scale.is_empty() && self.clip.is_empty()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> AwqResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::io::BufWriter::new(std::fs::File::create(path)?);
        bincode::serialize_into(file, self)?;
        log::debug!(
            "saved search result ({} blocks) to {}",
            self.completed_blocks,
            path.display()
        );
        Ok(())
    }

    /// Writes [`SEARCH_RESULT_FILE`] into `dir`.
    pub fn save_to_dir(&self, dir: impl AsRef<Path>) -> AwqResult<PathBuf> {
        let path = dir.as_ref().join(SEARCH_RESULT_FILE);
        self.save(&path)?;
        Ok(path)
    }

    pub fn load(path: impl AsRef<Path>) -> AwqResult<Self> {
        let file = std::io::BufReader::new(std::fs::File::open(path.as_ref())?);
        Ok(bincode::deserialize_from(file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn sample_block() -> (Vec<ScaleRecord>, Vec<ClipRecord>) {
        (
            vec![ScaleRecord {
                prev_op_name: "input_layernorm".to_string(),
                linear_names: vec!["self_attn.q_proj".to_string(), "self_attn.k_proj".to_string()],
                scales: arr1(&[1.0, 2.0]),
            }],
            vec![ClipRecord {
                linear_name: "mlp.down_proj".to_string(),
                max_val: arr2(&[[0.5], [0.25]]),
            }],
        )
    }

    #[test]
    fn test_prefixing_and_lookup() {
        let (scale, clip) = sample_block();
        let mut result = SearchResult::default();
        result.push_block("model.layers.1.", &scale, &clip);
        result.push_block("model.layers.10.", &scale, &[]);
        assert_eq!(result.completed_blocks, 2);
        assert_eq!(result.scale[0].linear_names[1], "model.layers.1.self_attn.k_proj");

        let (s1, c1) = result.for_block("model.layers.1.");
        assert_eq!(s1, scale);
        assert_eq!(c1, clip);
        let (s10, c10) = result.for_block("model.layers.10.");
        assert_eq!(s10.len(), 1);
        assert!(c10.is_empty());
        let (s2, _) = result.for_block("model.layers.2.");
        assert!(s2.is_empty());
    }

    #[test]
    fn test_persisted_form_reloads() {
        let (scale, clip) = sample_block();
        let mut result = SearchResult::default();
        result.push_block("transformer.blocks.0.", &scale, &clip);

        let dir = tempfile::tempdir().unwrap();
        let path = result.save_to_dir(dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), SEARCH_RESULT_FILE);
        assert_eq!(SearchResult::load(&path).unwrap(), result);
    }
}
