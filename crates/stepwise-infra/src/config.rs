//! Configuration loader for Stepwise.
//!
//! Reads `config.toml` from the data directory (`~/.stepwise/` by default)
//! and deserializes it into [`GlobalConfig`]. Falls back to defaults when
//! the file is missing or malformed.

use std::path::Path;

use stepwise_types::config::{EngineConfig, GlobalConfig};

/// Load the whole configuration document from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`GlobalConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
    };

    match toml::from_str::<GlobalConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GlobalConfig::default()
        }
    }
}

/// Load the `[engine]` table, clamping values that would stall the engine.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let mut engine = load_global_config(data_dir).await.engine;
    engine.worker_concurrency = engine.worker_concurrency.max(1);
    engine.max_deliveries = engine.max_deliveries.max(1);
    engine.poll_interval_ms = engine.poll_interval_ms.max(1);
    engine
}
