//! In-memory `InstanceStore`.
//!
//! Keeps snapshots and backups in a map keyed by `(area, instance id)`.
//! Nothing survives the process; used by tests and by embedders that only
//! want the manager's bookkeeping.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use phaseflow_types::error::RepositoryError;
use phaseflow_types::instance::InstanceSnapshot;
use tokio::sync::Mutex;

use super::instance::{InstanceStore, StorageArea, backup_file_name};

#[derive(Debug, Default, Clone)]
struct Folder {
    state: Option<InstanceSnapshot>,
    backups: BTreeMap<i64, InstanceSnapshot>,
}

#[derive(Debug, Default)]
pub struct MemoryInstanceStore {
    folders: Mutex<HashMap<(StorageArea, String), Folder>>,
    fail_writes: AtomicBool,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), RepositoryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(RepositoryError::Io("writes disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

impl InstanceStore for MemoryInstanceStore {
    async fn save_snapshot(
        &self,
        area: StorageArea,
        snapshot: &InstanceSnapshot,
    ) -> Result<(), RepositoryError> {
        self.check_writable()?;
        let mut folders = self.folders.lock().await;
        let folder = folders
            .entry((area, snapshot.instance_id.clone()))
            .or_default();

        let mut millis = snapshot.persisted_at.timestamp_millis();
        if let Some((&last, _)) = folder.backups.last_key_value() {
            millis = millis.max(last + 1);
        }
        folder.backups.insert(millis, snapshot.clone());
        folder.state = Some(snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(
        &self,
        area: StorageArea,
        instance_id: &str,
    ) -> Result<Option<InstanceSnapshot>, RepositoryError> {
        let folders = self.folders.lock().await;
        Ok(folders
            .get(&(area, instance_id.to_string()))
            .and_then(|folder| folder.state.clone()))
    }

    async fn list_instance_ids(&self, area: StorageArea) -> Result<Vec<String>, RepositoryError> {
        let folders = self.folders.lock().await;
        let mut ids: Vec<String> = folders
            .keys()
            .filter(|(a, _)| *a == area)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn relocate(
        &self,
        instance_id: &str,
        from: StorageArea,
        to: StorageArea,
    ) -> Result<(), RepositoryError> {
        self.check_writable()?;
        let mut folders = self.folders.lock().await;
        if folders.contains_key(&(to, instance_id.to_string())) {
            return Err(RepositoryError::Conflict(format!(
                "instance {instance_id} already exists in {to}"
            )));
        }
        let folder = folders
            .remove(&(from, instance_id.to_string()))
            .ok_or(RepositoryError::NotFound)?;
        folders.insert((to, instance_id.to_string()), folder);
        Ok(())
    }

    async fn delete(&self, area: StorageArea, instance_id: &str) -> Result<bool, RepositoryError> {
        self.check_writable()?;
        let mut folders = self.folders.lock().await;
        Ok(folders.remove(&(area, instance_id.to_string())).is_some())
    }

    async fn list_backups(
        &self,
        area: StorageArea,
        instance_id: &str,
    ) -> Result<Vec<String>, RepositoryError> {
        let folders = self.folders.lock().await;
        Ok(folders
            .get(&(area, instance_id.to_string()))
            .map(|folder| folder.backups.keys().map(|millis| backup_file_name(*millis)).collect())
            .unwrap_or_default())
    }

    async fn prune_backups(
        &self,
        area: StorageArea,
        instance_id: &str,
        keep: usize,
    ) -> Result<usize, RepositoryError> {
        self.check_writable()?;
        let mut folders = self.folders.lock().await;
        let Some(folder) = folders.get_mut(&(area, instance_id.to_string())) else {
            return Ok(0);
        };

        let mut removed = 0;
        while folder.backups.len() > keep {
            folder.backups.pop_first();
            removed += 1;
        }
        Ok(removed)
    }
}
