use std::path::PathBuf;

use anyhow::{Context, Result};
use chatfront_common::AppConfig;
use tracing::info;

/// Parsed configuration together with the file it came from.
pub struct GatewayConfig {
    pub config: AppConfig,
    pub config_path: PathBuf,
}

impl GatewayConfig {
    pub fn load(path: &str) -> Result<Self> {
        info!(path = path, "loading configuration");
        let config = AppConfig::load(path)
            .with_context(|| format!("failed to load configuration from {path}"))?;
        Ok(Self {
            config,
            config_path: PathBuf::from(path),
        })
    }
}
