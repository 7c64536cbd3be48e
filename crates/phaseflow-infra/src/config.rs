//! Configuration loader for Phaseflow.
//!
//! Reads `config.toml` from the data directory (`~/.phaseflow/` in production)
//! and deserializes it into [`PhaseflowConfig`]. Falls back to defaults when
//! the file is missing or malformed.

use std::path::Path;

use phaseflow_types::config::PhaseflowConfig;

use crate::filesystem::config_path;

/// Load configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`PhaseflowConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_config(data_dir: &Path) -> PhaseflowConfig {
    let path = config_path(data_dir);

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", path.display());
            return PhaseflowConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return PhaseflowConfig::default();
        }
    };

    match toml::from_str::<PhaseflowConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            PhaseflowConfig::default()
        }
    }
}
