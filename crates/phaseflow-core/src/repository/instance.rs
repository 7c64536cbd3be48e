//! Instance snapshot store trait definition.
//!
//! Defines the storage interface the instance manager persists through. The
//! infrastructure layer (phaseflow-infra) implements it on the filesystem;
//! `MemoryInstanceStore` implements it in memory for tests and embedding.
//!
//! Storage is partitioned into four areas. An instance's snapshot lives in
//! exactly one of them at a time:
//!
//! ```text
//! <root>/active/<id>/state.json
//! <root>/active/<id>/state-backup-<epochMillis>.json
//! <root>/completed/<id>/...
//! <root>/failed/<id>/...
//! <root>/archived/<id>/...
//! ```

use std::fmt;
use std::future::Future;

use phaseflow_types::error::RepositoryError;
use phaseflow_types::instance::{InstanceSnapshot, InstanceStatus};

/// Name of the current snapshot inside an instance folder.
pub const STATE_FILE: &str = "state.json";

const BACKUP_PREFIX: &str = "state-backup-";
const BACKUP_SUFFIX: &str = ".json";

// ---------------------------------------------------------------------------
// StorageArea
// ---------------------------------------------------------------------------

/// Storage partition an instance folder lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageArea {
    Active,
    Completed,
    Failed,
    Archived,
}

impl StorageArea {
    pub const ALL: [StorageArea; 4] = [
        StorageArea::Active,
        StorageArea::Completed,
        StorageArea::Failed,
        StorageArea::Archived,
    ];

    /// Directory name of the area under the storage root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            StorageArea::Active => "active",
            StorageArea::Completed => "completed",
            StorageArea::Failed => "failed",
            StorageArea::Archived => "archived",
        }
    }

    /// Area a snapshot with `status` settles in. Cancelled instances stay
    /// active until they are removed.
    pub fn for_status(status: InstanceStatus) -> StorageArea {
        match status {
            InstanceStatus::Completed => StorageArea::Completed,
            InstanceStatus::Failed => StorageArea::Failed,
            _ => StorageArea::Active,
        }
    }
}

impl fmt::Display for StorageArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

// ---------------------------------------------------------------------------
// Backup naming
// ---------------------------------------------------------------------------

/// `state-backup-<millis>.json`
pub fn backup_file_name(epoch_millis: i64) -> String {
    format!("{BACKUP_PREFIX}{epoch_millis}{BACKUP_SUFFIX}")
}

/// The timestamp of a backup file name, or `None` for any other file.
pub fn parse_backup_millis(file_name: &str) -> Option<i64> {
    file_name
        .strip_prefix(BACKUP_PREFIX)?
        .strip_suffix(BACKUP_SUFFIX)?
        .parse()
        .ok()
}

// ---------------------------------------------------------------------------
// InstanceStore
// ---------------------------------------------------------------------------

/// Durable storage for instance snapshots.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait InstanceStore: Send + Sync {
    /// Write `snapshot` as the instance's current state in `area`, plus a
    /// timestamped backup copy. Backup timestamps are strictly increasing
    /// per instance.
    fn save_snapshot(
        &self,
        area: StorageArea,
        snapshot: &InstanceSnapshot,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Read the current snapshot, `None` if the instance has no folder in
    /// `area`.
    fn load_snapshot(
        &self,
        area: StorageArea,
        instance_id: &str,
    ) -> impl Future<Output = Result<Option<InstanceSnapshot>, RepositoryError>> + Send;

    /// Ids of all instances with a folder in `area`, sorted.
    fn list_instance_ids(
        &self,
        area: StorageArea,
    ) -> impl Future<Output = Result<Vec<String>, RepositoryError>> + Send;

    /// Move an instance folder, with everything in it, between areas.
    fn relocate(
        &self,
        instance_id: &str,
        from: StorageArea,
        to: StorageArea,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete an instance folder. Returns `true` if it existed.
    fn delete(
        &self,
        area: StorageArea,
        instance_id: &str,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Backup file names, oldest first.
    fn list_backups(
        &self,
        area: StorageArea,
        instance_id: &str,
    ) -> impl Future<Output = Result<Vec<String>, RepositoryError>> + Send;

    /// Delete all but the `keep` most recent backups. Returns how many were
    /// removed.
    fn prune_backups(
        &self,
        area: StorageArea,
        instance_id: &str,
        keep: usize,
    ) -> impl Future<Output = Result<usize, RepositoryError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_names_round_trip() {
        let name = backup_file_name(1_700_000_000_123);
        assert_eq!(name, "state-backup-1700000000123.json");
        assert_eq!(parse_backup_millis(&name), Some(1_700_000_000_123));
        assert_eq!(parse_backup_millis(STATE_FILE), None);
        assert_eq!(parse_backup_millis("state-backup-x.json"), None);
    }

    #[test]
    fn terminal_statuses_map_to_areas() {
        assert_eq!(StorageArea::for_status(InstanceStatus::Completed), StorageArea::Completed);
        assert_eq!(StorageArea::for_status(InstanceStatus::Failed), StorageArea::Failed);
        assert_eq!(StorageArea::for_status(InstanceStatus::Cancelled), StorageArea::Active);
        assert_eq!(StorageArea::for_status(InstanceStatus::Running), StorageArea::Active);
        assert_eq!(StorageArea::Archived.to_string(), "archived");
    }
}
