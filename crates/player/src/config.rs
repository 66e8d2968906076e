//! Config file loading.

use std::path::Path;

use anyhow::{Context, Result};

use pj_common::PlayerConfig;

/// Read and validate a JSON config file. Missing fields take defaults.
pub fn load(path: impl AsRef<Path>) -> Result<PlayerConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: PlayerConfig = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Config loaded");
    Ok(config)
}
