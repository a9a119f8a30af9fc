use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ServerConfig;

/// Prefix for environment overrides, e.g. `GANTRY_LOGGING__LEVEL=debug`
const ENV_PREFIX: &str = "GANTRY";

/// Load configuration from a file using the config crate
/// Supports YAML, JSON and TOML, picked by file extension.
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<ServerConfig> {
    let config_path = Path::new(config_path);

    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
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
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let server_config: ServerConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    tracing::debug!(
        "Loaded {} proxies from {}",
        server_config.proxies.len(),
        config_path.display()
    );
    Ok(server_config)
}
