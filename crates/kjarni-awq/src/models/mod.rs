//! Concrete model families.
//!
//! Each family implements [`crate::adapter::ModelAdapter`] and
//! [`crate::block::TransformerBlock`]. [`AnyModel::load`] picks the family
//! from the `model_type` field of a Hugging Face style `config.json`.

pub mod attention;
pub mod llama;
pub mod mpt;

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::error::{AwqError, AwqResult};
use crate::linear::LinearLayer;
use crate::weights::{SafeTensorsLoader, WeightSource};

pub use llama::{LlamaBlock, LlamaConfig, LlamaModel};
pub use mpt::{MptBlock, MptConfig, MptModel};

/// Name of the model configuration file inside a model directory.
pub const CONFIG_FILE: &str = "config.json";

/// A loaded model of any supported family.
pub enum AnyModel {
    Llama(LlamaModel),
    Mpt(MptModel),
}

#[derive(Deserialize)]
struct ModelTypeProbe {
    model_type: String,
}

impl AnyModel {
    /// Loads `config.json` and the safetensors weights from `dir`.
    pub fn load(dir: impl AsRef<Path>) -> AwqResult<Self> {
        let dir = dir.as_ref();
        let config_path = dir.join(CONFIG_FILE);
        let text = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {:?}", config_path))?;
        let probe: ModelTypeProbe = serde_json::from_str(&text)
            .map_err(|e| AwqError::config(format!("cannot read model_type: {}", e)))?;
        let weights = SafeTensorsLoader::new(dir)?;

        let model = match probe.model_type.as_str() {
            "llama" | "mistral" => {
                AnyModel::Llama(LlamaModel::load(LlamaConfig::from_json(&text)?, &weights)?)
            }
            "mpt" => AnyModel::Mpt(MptModel::load(MptConfig::from_json(&text)?, &weights)?),
            other => {
                return Err(AwqError::config(format!(
                    "unsupported model_type '{}'",
                    other
                )))
            }
        };
        log::info!("loaded {} model from {}", probe.model_type, dir.display());
        Ok(model)
    }

    pub fn model_type(&self) -> &'static str {
        match self {
            AnyModel::Llama(_) => "llama",
            AnyModel::Mpt(_) => "mpt",
        }
    }
}

/// Loads `<name>.weight` and the optional `<name>.bias`.
pub(crate) fn load_linear<W: WeightSource + ?Sized>(weights: &W, name: &str) -> AwqResult<LinearLayer> {
    let weight = weights.get_array2(&format!("{}.weight", name))?;
    let bias = weights.get_optional_array1(&format!("{}.bias", name))?;
    Ok(LinearLayer::new_f32(weight, bias))
}

fn expect_shape(name: &str, got: (usize, usize), want: (usize, usize)) -> AwqResult<()> {
    if got != want {
        return Err(AwqError::config(format!(
            "{} has shape {:?}, expected {:?}",
            name, got, want
        )));
    }
    Ok(())
}

pub(crate) fn load_linear_checked<W: WeightSource + ?Sized>(
    weights: &W,
    name: &str,
    out_features: usize,
    in_features: usize,
) -> AwqResult<LinearLayer> {
    let layer = load_linear(weights, name)?;
    expect_shape(
        name,
        (layer.out_features(), layer.in_features()),
        (out_features, in_features),
    )?;
    Ok(layer)
}

#[cfg(test)]
pub(crate) mod tests;
