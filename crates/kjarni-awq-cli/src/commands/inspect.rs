use std::path::Path;

use anyhow::{Context, Result};
use kjarni_awq::QuantConfig;

pub fn run(file: &Path) -> Result<()> {
    let config = QuantConfig::from_file(file)
        .with_context(|| format!("invalid quant config {}", file.display()))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!("codes per 32-bit word: {}", match config.pack_num() {
        Ok(n) => n.to_string(),
        Err(_) => "not packable".to_string(),
    });
    Ok(())
}
