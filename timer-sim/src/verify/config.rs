use anyhow::{Context, Result};
use shared::{ConfigError, SyncConfig};
use std::path::Path;

pub fn load_config(path: &Path) -> Result<SyncConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = SyncConfig::parse_checked(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}
