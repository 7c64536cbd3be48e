//! Data directory layout for Phaseflow.
//!
//! ```text
//! {data_dir}/config.toml
//! {data_dir}/templates/*.yaml|*.yml|*.json
//! {data_dir}/instances/{active,completed,failed,archived}/<id>/
//! ```

use std::path::{Path, PathBuf};

use phaseflow_types::config::PhaseflowConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "PHASEFLOW_DATA_DIR";

/// Path of the configuration file inside the data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Directory scanned for template files.
pub fn templates_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("templates")
}

/// Root of the instance storage tree.
///
/// Uses `storage_root` from the config when set (relative paths are resolved
/// against the data directory), otherwise `{data_dir}/instances`.
pub fn storage_root(config: &PhaseflowConfig, data_dir: &Path) -> PathBuf {
    match &config.storage_root {
        Some(root) if root.is_absolute() => root.clone(),
        Some(root) => data_dir.join(root),
        None => data_dir.join("instances"),
    }
}

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `PHASEFLOW_DATA_DIR` environment variable
/// 2. `~/.phaseflow`
/// 3. `.phaseflow` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".phaseflow");
    }

    PathBuf::from(".phaseflow")
}
