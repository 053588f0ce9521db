//! SafeTensors weight loading.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context};
use half::{bf16, f16};
use memmap2::Mmap;
use ndarray::{Array1, Array2, ArrayD, IxDyn};
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;

use crate::checkpoint::{TensorData, SAFE_WEIGHTS_INDEX_NAME, SAFE_WEIGHTS_NAME};
use crate::error::AwqResult;

/// Named tensor lookup used by the model loaders.
pub trait WeightSource {
    fn contains(&self, name: &str) -> bool;

    fn get(&self, name: &str) -> AwqResult<TensorData>;

    /// Reads a float tensor, upcasting f16.
    fn get_f32(&self, name: &str) -> AwqResult<ArrayD<f32>> {
        match self.get(name)? {
            TensorData::F32(a) => Ok(a),
            TensorData::F16(a) => Ok(a.mapv(f16::to_f32)),
            TensorData::I32(_) => Err(anyhow!("tensor '{}' is integer, expected float", name).into()),
        }
    }

    fn get_array1(&self, name: &str) -> AwqResult<Array1<f32>> {
        Ok(self.get_f32(name)?.into_dimensionality()?)
    }

    fn get_array2(&self, name: &str) -> AwqResult<Array2<f32>> {
        Ok(self.get_f32(name)?.into_dimensionality()?)
    }

    fn get_optional_array1(&self, name: &str) -> AwqResult<Option<Array1<f32>>> {
        if self.contains(name) {
            self.get_array1(name).map(Some)
        } else {
            Ok(None)
        }
    }

    fn get_optional_array2(&self, name: &str) -> AwqResult<Option<Array2<f32>>> {
        if self.contains(name) {
            self.get_array2(name).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// A loader for `.safetensors` files.
///
/// Accepts a single file, or a directory containing either
/// `model.safetensors` or `model.safetensors.index.json` plus its shards.
pub struct SafeTensorsLoader {
    shards: Vec<Mmap>,
    tensor_to_shard: HashMap<String, usize>,
}

impl std::fmt::Debug for SafeTensorsLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeTensorsLoader")
            .field("shards", &self.shards.len())
            .field("tensors", &self.tensor_to_shard.len())
            .finish()
    }
}

impl SafeTensorsLoader {
    pub fn new(path: &Path) -> AwqResult<Self> {
        if path.is_file() {
            return Self::load_files(&[path.to_path_buf()]);
        }
        if !path.is_dir() {
            return Err(anyhow!("path {:?} is neither a file nor a directory", path).into());
        }

        let index_path = path.join(SAFE_WEIGHTS_INDEX_NAME);
        if !index_path.exists() {
            return Self::load_files(&[path.join(SAFE_WEIGHTS_NAME)]);
        }

        let index_content = fs::read_to_string(&index_path)
            .with_context(|| format!("failed to read index file: {:?}", index_path))?;
        let index: serde_json::Value =
            serde_json::from_str(&index_content).context("failed to parse index.json")?;
        let weight_map = index["weight_map"]
            .as_object()
            .ok_or_else(|| anyhow!("invalid index.json: missing 'weight_map' object"))?;

        let mut files: Vec<String> = weight_map
            .values()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();
        files.sort();
        files.dedup();
        log::info!(
            "loading sharded weights: {} shards, {} tensors",
            files.len(),
            weight_map.len()
        );
        let paths: Vec<_> = files.iter().map(|f| path.join(f)).collect();
        Self::load_files(&paths)
    }

    fn load_files(paths: &[std::path::PathBuf]) -> AwqResult<Self> {
        let mut shards = Vec::with_capacity(paths.len());
        let mut tensor_to_shard = HashMap::new();
        for (idx, path) in paths.iter().enumerate() {
            let file = fs::File::open(path).with_context(|| format!("failed to open {:?}", path))?;
            // SAFETY: the file is opened read-only and not modified while mapped
            let mmap = unsafe { Mmap::map(&file) }
                .with_context(|| format!("failed to mmap {:?}", path))?;
            let tensors = SafeTensors::deserialize(&mmap)
                .with_context(|| format!("failed to parse safetensors: {:?}", path))?;
            for name in tensors.names() {
                tensor_to_shard.insert(name.to_string(), idx);
            }
            log::debug!("loaded shard {}/{}: {:?}", idx + 1, paths.len(), path);
            drop(tensors);
            shards.push(mmap);
        }
        Ok(Self {
            shards,
            tensor_to_shard,
        })
    }

    pub fn tensor_names(&self) -> Vec<&str> {
        self.tensor_to_shard.keys().map(|s| s.as_str()).collect()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl WeightSource for SafeTensorsLoader {
    fn contains(&self, name: &str) -> bool {
        self.tensor_to_shard.contains_key(name)
    }

    /// Reads a tensor, keeping f32, f16 and i32 data as stored and upcasting
    /// bf16 to f32.
    fn get(&self, name: &str) -> AwqResult<TensorData> {
        let shard = self
            .tensor_to_shard
            .get(name)
            .ok_or_else(|| anyhow!("tensor '{}' not found in model", name))?;
        let tensors = SafeTensors::deserialize(&self.shards[*shard])?;
        let view = tensors
            .tensor(name)
            .with_context(|| format!("failed to read tensor '{}'", name))?;
        let shape = IxDyn(view.shape());
        let bytes = view.data();
        let data = match view.dtype() {
            Dtype::F32 => TensorData::F32(ArrayD::from_shape_vec(
                shape,
                bytemuck::pod_collect_to_vec::<u8, f32>(bytes),
            )?),
            Dtype::F16 => TensorData::F16(ArrayD::from_shape_vec(
                shape,
                bytemuck::pod_collect_to_vec::<u8, f16>(bytes),
            )?),
            Dtype::BF16 => {
                let values: Vec<f32> = bytemuck::pod_collect_to_vec::<u8, bf16>(bytes)
                    .into_iter()
                    .map(bf16::to_f32)
                    .collect();
                TensorData::F32(ArrayD::from_shape_vec(shape, values)?)
            }
            Dtype::I32 => TensorData::I32(ArrayD::from_shape_vec(
                shape,
                bytemuck::pod_collect_to_vec::<u8, i32>(bytes),
            )?),
            other => return Err(anyhow!("unsupported dtype {:?} for '{}'", other, name).into()),
        };
        Ok(data)
    }
}

/// In-memory tensors, keyed by name.
impl WeightSource for HashMap<String, TensorData> {
    fn contains(&self, name: &str) -> bool {
        self.contains_key(name)
    }

    fn get(&self, name: &str) -> AwqResult<TensorData> {
        HashMap::get(self, name)
            .cloned()
            .ok_or_else(|| anyhow!("tensor '{}' not found in model", name).into())
    }
}
