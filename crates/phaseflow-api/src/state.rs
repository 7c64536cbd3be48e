//! Application state wiring the engine, the instance manager and storage.
//!
//! The manager is generic over its store; AppState pins it to the filesystem
//! implementation from `phaseflow-infra`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use phaseflow_core::action::{ActionRegistry, EchoActionHandler};
use phaseflow_core::engine::WorkflowEngine;
use phaseflow_core::manager::{InstanceManager, RecoveryReport};
use phaseflow_infra::config::load_config;
use phaseflow_infra::filesystem::{resolve_data_dir, storage_root, templates_dir};
use phaseflow_infra::storage::FsInstanceStore;
use phaseflow_infra::template::discover_templates;
use phaseflow_types::config::PhaseflowConfig;

pub type ConcreteInstanceManager = InstanceManager<FsInstanceStore>;

/// Shared application state used by every CLI command.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub manager: ConcreteInstanceManager,
    pub config: PhaseflowConfig,
    pub data_dir: PathBuf,
    pub storage_root: PathBuf,
    pub recovery: RecoveryReport,
}

impl AppState {
    /// Load config, register templates, recover persisted instances.
    pub async fn init(data_dir: Option<PathBuf>, templates: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_config(&data_dir).await;
        let storage_root = storage_root(&config, &data_dir);
        let store = FsInstanceStore::new(&storage_root);
        store.ensure_layout().await?;

        // No action integrations are configured; phases run through echo.
        let actions = ActionRegistry::with_default(EchoActionHandler);
        let engine = Arc::new(WorkflowEngine::with_config(actions, config.engine.clone()));

        let templates = templates.unwrap_or_else(|| templates_dir(&data_dir));
        let registered = register_templates(&engine, &templates)?;
        tracing::debug!(registered, dir = %templates.display(), "templates loaded");

        let manager = InstanceManager::new(Arc::clone(&engine), store, config.manager.clone());
        let recovery = manager.initialize().await?;

        Ok(Self {
            engine,
            manager,
            config,
            data_dir,
            storage_root,
            recovery,
        })
    }

    /// Persist every live instance and stop background tasks.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

fn register_templates(engine: &WorkflowEngine, dir: &Path) -> anyhow::Result<usize> {
    let found = discover_templates(dir)?;
    for (path, template) in &found {
        tracing::debug!(path = %path.display(), template_id = template.id.as_str(), "template registered");
        engine.register_template(template.clone())?;
    }
    Ok(found.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn init_creates_layout_and_loads_templates() {
        let tmp = TempDir::new().unwrap();
        let templates = tmp.path().join("templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(
            templates.join("t1.yaml"),
            "id: t1\nsteps:\n  - name: A\n  - name: B\n",
        )
        .unwrap();

        let state = AppState::init(Some(tmp.path().to_path_buf()), None)
            .await
            .unwrap();
        assert_eq!(state.storage_root, tmp.path().join("instances"));
        assert!(state.storage_root.join("active").is_dir());
        assert!(state.storage_root.join("archived").is_dir());
        assert!(state.engine.get_workflow_template("t1").is_some());
        assert_eq!(state.recovery, RecoveryReport::default());
        state.shutdown().await;
    }
}
