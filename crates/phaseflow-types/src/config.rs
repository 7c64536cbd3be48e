//! Global configuration types for Phaseflow.
//!
//! `PhaseflowConfig` represents the top-level `config.toml` that controls
//! storage location, instance manager limits and the engine's queue sizes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
///
/// Loaded from `~/.phaseflow/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseflowConfig {
    /// Root of the instance storage tree. Defaults to `{data_dir}/instances`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_root: Option<PathBuf>,

    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

/// Instance manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Maximum number of live instances before registration is rejected.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Backups retained per instance.
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    /// Seconds between monitor ticks.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// Seconds a phase may stay in flight before it is reported as stalled.
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,

    /// Rebuild instances from the active storage area on initialization.
    #[serde(default = "default_true")]
    pub recover_on_start: bool,
}

fn default_max_instances() -> usize {
    100
}

fn default_max_backups() -> usize {
    5
}

fn default_monitor_interval_secs() -> u64 {
    30
}

fn default_stall_threshold_secs() -> u64 {
    2 * 60 * 60
}

fn default_true() -> bool {
    true
}

impl ManagerConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            max_backups: default_max_backups(),
            monitor_interval_secs: default_monitor_interval_secs(),
            stall_threshold_secs: default_stall_threshold_secs(),
            recover_on_start: default_true(),
        }
    }
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the dispatcher's submission channel.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Capacity of each instance's lifecycle event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_values() {
        let config = PhaseflowConfig::default();
        assert!(config.storage_root.is_none());
        assert_eq!(config.manager.max_instances, 100);
        assert_eq!(config.manager.max_backups, 5);
        assert_eq!(config.manager.monitor_interval(), Duration::from_secs(30));
        assert_eq!(config.manager.stall_threshold(), Duration::from_secs(7200));
        assert!(config.manager.recover_on_start);
        assert_eq!(config.engine.queue_capacity, 256);
    }

    #[test]
    fn test_config_deserialize_with_defaults() {
        let config: PhaseflowConfig = toml::from_str("").unwrap();
        assert_eq!(config.manager.max_backups, 5);
        assert_eq!(config.engine.event_capacity, 256);
    }

    #[test]
    fn test_config_deserialize_with_values() {
        let toml_str = r#"
storage_root = "/var/lib/phaseflow"

[manager]
max_instances = 10
stall_threshold_secs = 60
recover_on_start = false

[engine]
queue_capacity = 8
"#;
        let config: PhaseflowConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.storage_root, Some(PathBuf::from("/var/lib/phaseflow")));
        assert_eq!(config.manager.max_instances, 10);
        assert_eq!(config.manager.max_backups, 5);
        assert_eq!(config.manager.stall_threshold(), Duration::from_secs(60));
        assert!(!config.manager.recover_on_start);
        assert_eq!(config.engine.queue_capacity, 8);
        assert_eq!(config.engine.event_capacity, 256);
    }

    #[test]
    fn test_monitor_interval_never_zero() {
        let config = ManagerConfig {
            monitor_interval_secs: 0,
            ..ManagerConfig::default()
        };
        assert_eq!(config.monitor_interval(), Duration::from_secs(1));
    }
}
