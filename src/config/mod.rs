// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Loads configuration from a YAML or JSON file, picked by extension.
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let config: Config = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&contents).context("failed to parse YAML config")?
        }
        _ => serde_json::from_str(&contents).context("failed to parse JSON config")?,
    };

    config.validate()?;
    Ok(config)
}
