//! Local filesystem instance store.
//!
//! Implements the `InstanceStore` trait from `phaseflow-core` with one folder
//! per instance under the area it currently lives in.

use std::path::{Path, PathBuf};

use phaseflow_core::repository::instance::{
    InstanceStore, STATE_FILE, StorageArea, backup_file_name, parse_backup_millis,
};
use phaseflow_types::error::RepositoryError;
use phaseflow_types::instance::InstanceSnapshot;

/// Filesystem-backed instance store.
///
/// Directory layout:
/// ```text
/// {root}/active/{id}/
///   state.json
///   state-backup-1700000000000.json
///   state-backup-1700000000500.json
/// {root}/completed/{id}/...
/// {root}/failed/{id}/...
/// {root}/archived/{id}/...
/// ```
///
/// `state.json` is replaced atomically (write to a temp file, then rename).
/// Moving a folder between areas tries a rename first and falls back to a
/// recursive copy followed by deletion of the source.
#[derive(Debug, Clone)]
pub struct FsInstanceStore {
    root: PathBuf,
    rename_moves: bool,
}

impl FsInstanceStore {
    /// Create a store rooted at `root`. Area directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            rename_moves: true,
        }
    }

    /// Always relocate by copy+delete, skipping the rename attempt. Used for
    /// storage roots spanning filesystems where rename cannot succeed.
    pub fn with_copy_fallback_only(mut self) -> Self {
        self.rename_moves = false;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn area_dir(&self, area: StorageArea) -> PathBuf {
        self.root.join(area.dir_name())
    }

    pub fn instance_dir(&self, area: StorageArea, instance_id: &str) -> PathBuf {
        self.area_dir(area).join(instance_id)
    }

    /// Create every area directory.
    pub async fn ensure_layout(&self) -> Result<(), RepositoryError> {
        for area in StorageArea::ALL {
            tokio::fs::create_dir_all(self.area_dir(area)).await?;
        }
        Ok(())
    }

    fn checked_dir(&self, area: StorageArea, instance_id: &str) -> Result<PathBuf, RepositoryError> {
        let valid = !instance_id.is_empty()
            && instance_id != "."
            && instance_id != ".."
            && !instance_id.contains(['/', '\\']);
        if !valid {
            return Err(RepositoryError::Io(format!(
                "invalid instance id '{instance_id}'"
            )));
        }
        Ok(self.instance_dir(area, instance_id))
    }

    /// Backup files in `dir` as `(millis, path)`, oldest first.
    async fn backups_in(dir: &Path) -> Result<Vec<(i64, PathBuf)>, RepositoryError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(millis) = name.to_str().and_then(parse_backup_millis) {
                backups.push((millis, entry.path()));
            }
        }
        backups.sort_by_key(|(millis, _)| *millis);
        Ok(backups)
    }

    async fn move_by_copy(src: &Path, dst: &Path) -> Result<(), RepositoryError> {
        if let Err(err) = copy_dir(src, dst).await {
            // The source is untouched; drop the partial copy.
            if let Err(cleanup) = tokio::fs::remove_dir_all(dst).await {
                tracing::warn!(
                    path = %dst.display(),
                    error = %cleanup,
                    "failed to remove partial copy"
                );
            }
            return Err(err);
        }

        if let Err(err) = tokio::fs::remove_dir_all(src).await {
            tracing::warn!(
                path = %src.display(),
                error = %err,
                "copied instance folder but could not remove the source"
            );
        }
        Ok(())
    }
}

/// Copy a directory tree file by file.
async fn copy_dir(src: &Path, dst: &Path) -> Result<(), RepositoryError> {
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

impl InstanceStore for FsInstanceStore {
    async fn save_snapshot(
        &self,
        area: StorageArea,
        snapshot: &InstanceSnapshot,
    ) -> Result<(), RepositoryError> {
        let dir = self.checked_dir(area, &snapshot.instance_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec_pretty(snapshot)?;

        let tmp = dir.join(format!("{STATE_FILE}.tmp"));
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, dir.join(STATE_FILE)).await?;

        let mut millis = snapshot.persisted_at.timestamp_millis();
        if let Some((last, _)) = Self::backups_in(&dir).await?.last() {
            millis = millis.max(last + 1);
        }
        tokio::fs::write(dir.join(backup_file_name(millis)), &json).await?;

        tracing::trace!(
            instance_id = snapshot.instance_id.as_str(),
            area = area.dir_name(),
            backup_millis = millis,
            "snapshot written"
        );
        Ok(())
    }

    async fn load_snapshot(
        &self,
        area: StorageArea,
        instance_id: &str,
    ) -> Result<Option<InstanceSnapshot>, RepositoryError> {
        let path = self.checked_dir(area, instance_id)?.join(STATE_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn list_instance_ids(&self, area: StorageArea) -> Result<Vec<String>, RepositoryError> {
        let mut entries = match tokio::fs::read_dir(self.area_dir(area)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn relocate(
        &self,
        instance_id: &str,
        from: StorageArea,
        to: StorageArea,
    ) -> Result<(), RepositoryError> {
        let src = self.checked_dir(from, instance_id)?;
        let dst = self.checked_dir(to, instance_id)?;
        if !tokio::fs::try_exists(&src).await? {
            return Err(RepositoryError::NotFound);
        }
        if tokio::fs::try_exists(&dst).await? {
            return Err(RepositoryError::Conflict(format!(
                "instance '{instance_id}' already exists in {to}"
            )));
        }
        tokio::fs::create_dir_all(self.area_dir(to)).await?;

        if self.rename_moves {
            match tokio::fs::rename(&src, &dst).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        instance_id,
                        from = from.dir_name(),
                        to = to.dir_name(),
                        error = %err,
                        "rename failed, falling back to copy"
                    );
                }
            }
        }

        Self::move_by_copy(&src, &dst).await
    }

    async fn delete(&self, area: StorageArea, instance_id: &str) -> Result<bool, RepositoryError> {
        let dir = self.checked_dir(area, instance_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_backups(
        &self,
        area: StorageArea,
        instance_id: &str,
    ) -> Result<Vec<String>, RepositoryError> {
        let dir = self.checked_dir(area, instance_id)?;
        Ok(Self::backups_in(&dir)
            .await?
            .into_iter()
            .map(|(millis, _)| backup_file_name(millis))
            .collect())
    }

    async fn prune_backups(
        &self,
        area: StorageArea,
        instance_id: &str,
        keep: usize,
    ) -> Result<usize, RepositoryError> {
        let dir = self.checked_dir(area, instance_id)?;
        let backups = Self::backups_in(&dir).await?;
        let excess = backups.len().saturating_sub(keep);

        for (_, path) in &backups[..excess] {
            tokio::fs::remove_file(path).await?;
        }
        if excess > 0 {
            tracing::debug!(instance_id, removed = excess, "pruned backups");
        }
        Ok(excess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use phaseflow_core::instance::WorkflowInstance;
    use phaseflow_types::instance::InstanceOptions;
    use phaseflow_types::template::{StepDefinition, WorkflowTemplate};
    use tempfile::TempDir;

    fn snapshot() -> InstanceSnapshot {
        let mut instance = WorkflowInstance::new(
            WorkflowTemplate::new("t1", vec![StepDefinition::named("A")]),
            InstanceOptions::default(),
        );
        instance.initialize().unwrap();
        instance.snapshot()
    }

    #[tokio::test]
    async fn test_save_and_load_snapshot() {
        let tmp = TempDir::new().unwrap();
        let store = FsInstanceStore::new(tmp.path());
        let snap = snapshot();

        store.save_snapshot(StorageArea::Active, &snap).await.unwrap();

        let dir = store.instance_dir(StorageArea::Active, &snap.instance_id);
        assert!(dir.join(STATE_FILE).exists());
        assert!(!dir.join("state.json.tmp").exists());

        let loaded = store
            .load_snapshot(StorageArea::Active, &snap.instance_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, snap);

        let json = std::fs::read_to_string(dir.join(STATE_FILE)).unwrap();
        assert!(json.contains("\"instanceId\""));
        assert!(json.contains("\"persistedAt\""));
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let tmp = TempDir::new().unwrap();
        let store = FsInstanceStore::new(tmp.path());
        let loaded = store.load_snapshot(StorageArea::Active, "nope").await.unwrap();
        assert!(loaded.is_none());
        assert!(store.list_instance_ids(StorageArea::Failed).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_serialization_error() {
        let tmp = TempDir::new().unwrap();
        let store = FsInstanceStore::new(tmp.path());
        let dir = store.instance_dir(StorageArea::Active, "broken");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(STATE_FILE), "{not json").unwrap();

        let err = store
            .load_snapshot(StorageArea::Active, "broken")
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_backups_strictly_increase_and_prune_oldest() {
        let tmp = TempDir::new().unwrap();
        let store = FsInstanceStore::new(tmp.path());
        let snap = snapshot();

        for _ in 0..7 {
            store.save_snapshot(StorageArea::Active, &snap).await.unwrap();
        }
        let backups = store
            .list_backups(StorageArea::Active, &snap.instance_id)
            .await
            .unwrap();
        assert_eq!(backups.len(), 7);

        let removed = store
            .prune_backups(StorageArea::Active, &snap.instance_id, 5)
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let remaining = store
            .list_backups(StorageArea::Active, &snap.instance_id)
            .await
            .unwrap();
        assert_eq!(remaining, backups[2..].to_vec());
    }

    #[tokio::test]
    async fn test_list_ids_ignores_stray_files() {
        let tmp = TempDir::new().unwrap();
        let store = FsInstanceStore::new(tmp.path());
        store.ensure_layout().await.unwrap();
        std::fs::write(store.area_dir(StorageArea::Active).join("README"), "x").unwrap();

        let mut b = snapshot();
        b.instance_id = "b".to_string();
        let mut a = snapshot();
        a.instance_id = "a".to_string();
        store.save_snapshot(StorageArea::Active, &b).await.unwrap();
        store.save_snapshot(StorageArea::Active, &a).await.unwrap();

        let ids = store.list_instance_ids(StorageArea::Active).await.unwrap();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_relocate_by_rename() {
        let tmp = TempDir::new().unwrap();
        let store = FsInstanceStore::new(tmp.path());
        let snap = snapshot();
        store.save_snapshot(StorageArea::Active, &snap).await.unwrap();

        store
            .relocate(&snap.instance_id, StorageArea::Active, StorageArea::Completed)
            .await
            .unwrap();

        assert!(!store.instance_dir(StorageArea::Active, &snap.instance_id).exists());
        let moved = store
            .load_snapshot(StorageArea::Completed, &snap.instance_id)
            .await
            .unwrap();
        assert_eq!(moved, Some(snap.clone()));
        let backups = store
            .list_backups(StorageArea::Completed, &snap.instance_id)
            .await
            .unwrap();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn test_relocate_by_copy_fallback() {
        let tmp = TempDir::new().unwrap();
        let store = FsInstanceStore::new(tmp.path()).with_copy_fallback_only();
        let snap = snapshot();
        store.save_snapshot(StorageArea::Active, &snap).await.unwrap();
        store.save_snapshot(StorageArea::Active, &snap).await.unwrap();

        store
            .relocate(&snap.instance_id, StorageArea::Active, StorageArea::Failed)
            .await
            .unwrap();

        assert!(!store.instance_dir(StorageArea::Active, &snap.instance_id).exists());
        let moved = store
            .load_snapshot(StorageArea::Failed, &snap.instance_id)
            .await
            .unwrap();
        assert_eq!(moved, Some(snap.clone()));
        let backups = store
            .list_backups(StorageArea::Failed, &snap.instance_id)
            .await
            .unwrap();
        assert_eq!(backups.len(), 2);
    }

    #[tokio::test]
    async fn test_relocate_missing_and_conflict() {
        let tmp = TempDir::new().unwrap();
        let store = FsInstanceStore::new(tmp.path());
        let err = store
            .relocate("ghost", StorageArea::Active, StorageArea::Archived)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));

        let snap = snapshot();
        store.save_snapshot(StorageArea::Active, &snap).await.unwrap();
        store.save_snapshot(StorageArea::Archived, &snap).await.unwrap();
        let err = store
            .relocate(&snap.instance_id, StorageArea::Active, StorageArea::Archived)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert!(store.instance_dir(StorageArea::Active, &snap.instance_id).exists());
    }

    #[tokio::test]
    async fn test_delete() {
        let tmp = TempDir::new().unwrap();
        let store = FsInstanceStore::new(tmp.path());
        let snap = snapshot();
        store.save_snapshot(StorageArea::Active, &snap).await.unwrap();

        assert!(store.delete(StorageArea::Active, &snap.instance_id).await.unwrap());
        assert!(!store.delete(StorageArea::Active, &snap.instance_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let tmp = TempDir::new().unwrap();
        let store = FsInstanceStore::new(tmp.path());
        assert!(store.load_snapshot(StorageArea::Active, "../x").await.is_err());
        assert!(store.delete(StorageArea::Active, "..").await.is_err());
    }

    #[tokio::test]
    async fn test_backup_name_uses_persisted_at() {
        let tmp = TempDir::new().unwrap();
        let store = FsInstanceStore::new(tmp.path());
        let mut snap = snapshot();
        snap.persisted_at = Utc::now();
        store.save_snapshot(StorageArea::Active, &snap).await.unwrap();

        let backups = store
            .list_backups(StorageArea::Active, &snap.instance_id)
            .await
            .unwrap();
        assert_eq!(
            backups,
            vec![backup_file_name(snap.persisted_at.timestamp_millis())]
        );
    }
}
