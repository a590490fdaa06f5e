use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::{models::GatewayConfig, validation::GatewayConfigValidator};

/// Prefix for environment overrides, e.g. `RAMPART__LISTEN_ADDR=0.0.0.0:9999`.
pub const ENV_PREFIX: &str = "RAMPART";

/// Load and validate configuration from a file using the config crate.
/// Supports YAML, JSON and TOML, picked by extension.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    let config = load_config_sync(config_path)?;
    GatewayConfigValidator::validate(&config)
        .wrap_err_with(|| format!("Invalid configuration in {config_path}"))?;
    Ok(config)
}

/// Load configuration without validation (used by the validate command so it can
/// report parse and validation problems separately).
pub async fn load_config_unchecked(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    let config_path = Path::new(config_path);

    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Toml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let gateway_config: GatewayConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(gateway_config)
}
