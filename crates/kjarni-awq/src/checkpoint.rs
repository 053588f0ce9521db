//! Sharded safetensors checkpoints.
//!
//! Tensors are written in the order given, cut into shards no larger than
//! `max_shard_size` bytes (a single tensor larger than the cap gets a shard of
//! its own). One shard is written as `model.safetensors`; more are written as
//! `model-00001-of-0000N.safetensors` with a `model.safetensors.index.json`
//! mapping every tensor name to its shard.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use half::f16;
use ndarray::{Array, ArrayD, Dimension};
use safetensors::tensor::{Dtype, TensorView};
use serde::{Deserialize, Serialize};

use crate::error::AwqResult;

pub const SAFE_WEIGHTS_NAME: &str = "model.safetensors";
pub const SAFE_WEIGHTS_INDEX_NAME: &str = "model.safetensors.index.json";

/// Default shard cap, 10 GB.
pub const DEFAULT_SHARD_SIZE: u64 = 10_000_000_000;

/// An owned tensor ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(ArrayD<f32>),
    F16(ArrayD<f16>),
    I32(ArrayD<i32>),
}

impl<D: Dimension> From<Array<f32, D>> for TensorData {
    fn from(a: Array<f32, D>) -> Self {
        TensorData::F32(a.into_dyn())
    }
}

impl<D: Dimension> From<Array<f16, D>> for TensorData {
    fn from(a: Array<f16, D>) -> Self {
        TensorData::F16(a.into_dyn())
    }
}

impl<D: Dimension> From<Array<i32, D>> for TensorData {
    fn from(a: Array<i32, D>) -> Self {
        TensorData::I32(a.into_dyn())
    }
}

impl TensorData {
    pub fn dtype(&self) -> Dtype {
        match self {
            TensorData::F32(_) => Dtype::F32,
            TensorData::F16(_) => Dtype::F16,
            TensorData::I32(_) => Dtype::I32,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            TensorData::F32(a) => a.shape().to_vec(),
            TensorData::F16(a) => a.shape().to_vec(),
            TensorData::I32(a) => a.shape().to_vec(),
        }
    }

    pub fn byte_len(&self) -> u64 {
        match self {
            TensorData::F32(a) => a.len() as u64 * 4,
            TensorData::F16(a) => a.len() as u64 * 2,
            TensorData::I32(a) => a.len() as u64 * 4,
        }
    }

    /// Row-major little-endian bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TensorData::F32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::F16(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::I32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub total_size: u64,
}

/// Contents of `model.safetensors.index.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardIndex {
    pub metadata: IndexMetadata,
    pub weight_map: BTreeMap<String, String>,
}

/// Splits tensors into consecutive shards by byte size.
pub fn plan_shards(sizes: &[u64], max_shard_size: u64) -> Vec<std::ops::Range<usize>> {
    let mut shards = Vec::new();
    let mut start = 0;
    let mut current = 0u64;
    for (i, &size) in sizes.iter().enumerate() {
        if i > start && current + size > max_shard_size {
            shards.push(start..i);
            start = i;
            current = 0;
        }
        current += size;
    }
    if start < sizes.len() {
        shards.push(start..sizes.len());
    }
    shards
}

fn shard_file_name(index: usize, total: usize) -> String {
    if total == 1 {
        SAFE_WEIGHTS_NAME.to_string()
    } else {
        format!("model-{:05}-of-{:05}.safetensors", index + 1, total)
    }
}

/// Writes `tensors` into `dir` as one or more safetensors shards.
///
/// Returns the paths of the written shard files.
pub fn save_checkpoint(
    dir: impl AsRef<Path>,
    tensors: &[(String, TensorData)],
    max_shard_size: u64,
) -> AwqResult<Vec<PathBuf>> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let sizes: Vec<u64> = tensors.iter().map(|(_, t)| t.byte_len()).collect();
    let plan = plan_shards(&sizes, max_shard_size);
    let total = plan.len();
    let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));

    let mut written = Vec::with_capacity(total);
    let mut weight_map = BTreeMap::new();
    for (idx, range) in plan.into_iter().enumerate() {
        let file_name = shard_file_name(idx, total);
        let bytes: Vec<(String, Dtype, Vec<usize>, Vec<u8>)> = tensors[range]
            .iter()
            .map(|(name, t)| (name.clone(), t.dtype(), t.shape(), t.to_le_bytes()))
            .collect();
        let mut views = Vec::with_capacity(bytes.len());
        for (name, dtype, shape, data) in &bytes {
            views.push((name.clone(), TensorView::new(*dtype, shape.clone(), data)?));
            weight_map.insert(name.clone(), file_name.clone());
        }

        let path = dir.join(&file_name);
        safetensors::serialize_to_file(views, &metadata, &path)?;
        log::debug!("wrote shard {}/{}: {} ({} tensors)", idx + 1, total, file_name, bytes.len());
        written.push(path);
    }

    if total > 1 {
        let index = ShardIndex {
            metadata: IndexMetadata {
                total_size: sizes.iter().sum(),
            },
            weight_map,
        };
        std::fs::write(
            dir.join(SAFE_WEIGHTS_INDEX_NAME),
            serde_json::to_string_pretty(&index)?,
        )?;
    }

    log::info!(
        "saved {} tensors in {} shard(s) to {}",
        tensors.len(),
        total,
        dir.display()
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_plan_shards() {
        assert_eq!(plan_shards(&[4, 4, 4], 100), vec![0..3]);
        assert_eq!(plan_shards(&[4, 4, 4], 8), vec![0..2, 2..3]);
        // oversized tensors still get a shard
        assert_eq!(plan_shards(&[20, 4, 30], 8), vec![0..1, 1..2, 2..3]);
        assert!(plan_shards(&[], 8).is_empty());
    }

    #[test]
    fn test_tensor_bytes_little_endian() {
        let t = TensorData::from(arr1(&[1i32, -1]));
        assert_eq!(t.dtype(), Dtype::I32);
        assert_eq!(t.to_le_bytes(), vec![1, 0, 0, 0, 255, 255, 255, 255]);
        let h = TensorData::from(arr2(&[[f16::ONE]]));
        assert_eq!(h.byte_len(), 2);
        assert_eq!(h.shape(), vec![1, 1]);
    }

    #[test]
    fn test_single_shard_has_no_index() {
        let dir = tempfile::tempdir().unwrap();
        let tensors = vec![("a.weight".to_string(), TensorData::from(arr1(&[1.0f32, 2.0])))];
        let files = save_checkpoint(dir.path(), &tensors, DEFAULT_SHARD_SIZE).unwrap();
        assert_eq!(files, vec![dir.path().join(SAFE_WEIGHTS_NAME)]);
        assert!(!dir.path().join(SAFE_WEIGHTS_INDEX_NAME).exists());
    }

    #[test]
    fn test_sharded_checkpoint_index() {
        let dir = tempfile::tempdir().unwrap();
        let tensors: Vec<(String, TensorData)> = (0..3)
            .map(|i| (format!("layer{}.weight", i), TensorData::from(arr1(&[i as f32; 4]))))
            .collect();
        let files = save_checkpoint(dir.path(), &tensors, 20).unwrap();
        assert_eq!(files.len(), 3);
        assert!(dir.path().join("model-00002-of-00003.safetensors").exists());

        let text = std::fs::read_to_string(dir.path().join(SAFE_WEIGHTS_INDEX_NAME)).unwrap();
        let index: ShardIndex = serde_json::from_str(&text).unwrap();
        assert_eq!(index.metadata.total_size, 48);
        assert_eq!(index.weight_map["layer2.weight"], "model-00003-of-00003.safetensors");
    }
}
