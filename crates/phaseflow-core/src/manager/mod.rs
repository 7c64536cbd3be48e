//! Workflow instance manager: persistence, recovery and monitoring.
//!
//! The manager wraps instances created by the engine and makes them durable
//! without the instance or the engine knowing about storage:
//!
//! - every lifecycle event an instance publishes triggers a full snapshot
//!   write (plus a timestamped backup) into the instance's storage area,
//! - a completed or failed instance has its folder moved out of `active`,
//! - on initialization, snapshots found under `active` are rebuilt into live
//!   instances and re-attached,
//! - a periodic monitor flags stalled phases, re-persists every instance and
//!   prunes old backups (see [`monitor`]).
//!
//! Persistence and monitoring failures are logged and published as
//! `manager:error` events; they never fail the in-memory instance.
//!
//! Each managed instance carries its own storage lock, always taken before
//! the instance lock. Snapshot writes for one instance are therefore
//! serialized; writes for different instances are not.

pub mod monitor;
pub mod stats;

use std::sync::Arc;

use dashmap::DashMap;
use phaseflow_types::config::ManagerConfig;
use phaseflow_types::error::RepositoryError;
use phaseflow_types::event::InstanceEvent;
use phaseflow_types::instance::{InstanceOptions, InstanceStatistics, InstanceStatus};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{EngineError, SharedInstance, WorkflowEngine};
use crate::event::EventBus;
use crate::instance::{InstanceError, WorkflowInstance};
use crate::repository::{InstanceStore, StorageArea};

use monitor::StallMarker;
use stats::{InstanceSummary, compute_statistics};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("instance limit reached ({max} live instances)")]
    CapacityReached { max: usize },

    #[error("instance {0} is already registered")]
    AlreadyRegistered(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error(transparent)]
    Storage(#[from] RepositoryError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Instance(#[from] InstanceError),
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome of scanning the active storage area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub skipped: usize,
    /// Leftover `active` copies of instances already stored in their
    /// terminal area, removed instead of recovered.
    pub stale: usize,
}

/// Outcome of one snapshot write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistOutcome {
    pub area: StorageArea,
    pub pruned: usize,
    pub relocated: bool,
}

// ---------------------------------------------------------------------------
// InstanceManager
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct ManagedInstance {
    instance: SharedInstance,
    template_id: String,
    /// Current storage area; also the per-instance storage lock.
    area: Arc<Mutex<StorageArea>>,
    /// Cancels the event listener task.
    subscription: CancellationToken,
}

struct ManagerInner<S> {
    engine: Arc<WorkflowEngine>,
    store: S,
    config: ManagerConfig,
    entries: DashMap<String, ManagedInstance>,
    /// Last stall reported per instance.
    stalls: DashMap<String, StallMarker>,
    registration: Mutex<()>,
    events: EventBus,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Durable registry of live workflow instances.
///
/// Generic over `S: InstanceStore` so it works with any storage backend.
/// Cloning is cheap and yields a handle to the same manager.
pub struct InstanceManager<S: InstanceStore> {
    inner: Arc<ManagerInner<S>>,
}

impl<S: InstanceStore> Clone for InstanceManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: InstanceStore + 'static> InstanceManager<S> {
    pub fn new(engine: Arc<WorkflowEngine>, store: S, config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                engine,
                store,
                config,
                entries: DashMap::new(),
                stalls: DashMap::new(),
                registration: Mutex::new(()),
                events: EventBus::default(),
                shutdown: CancellationToken::new(),
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.inner.engine
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Receive manager events: forwarded instance events plus the manager's
    /// own (`instance:registered`, `instance:stalled`, `manager:*`).
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.inner.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    // -- lifecycle ----------------------------------------------------------

    /// Recover persisted instances (if enabled) and start the monitor.
    pub async fn initialize(&self) -> Result<RecoveryReport, ManagerError> {
        let report = if self.inner.config.recover_on_start {
            self.recover().await?
        } else {
            RecoveryReport::default()
        };

        {
            let mut monitor = self.inner.monitor.lock().await;
            if monitor.is_none() {
                *monitor = Some(self.spawn_monitor());
            }
        }

        tracing::info!(
            recovered = report.recovered,
            skipped = report.skipped,
            stale = report.stale,
            "instance manager initialized"
        );
        self.inner.events.publish(InstanceEvent::ManagerInitialized {
            recovered: report.recovered,
            skipped: report.skipped,
        });
        Ok(report)
    }

    /// Rebuild every instance persisted under the active area.
    ///
    /// Instances come back in the status they were saved in; nothing is
    /// resumed. A phase that was executing is returned to `active`. Corrupt
    /// or unreadable snapshots are skipped.
    pub async fn recover(&self) -> Result<RecoveryReport, ManagerError> {
        let ids = self.inner.store.list_instance_ids(StorageArea::Active).await?;
        let mut report = RecoveryReport::default();

        for instance_id in ids {
            if self.inner.entries.contains_key(&instance_id) {
                continue;
            }
            match self.recover_one(&instance_id).await {
                Ok(true) => report.recovered += 1,
                Ok(false) => report.stale += 1,
                Err(err) => {
                    tracing::warn!(
                        instance_id = instance_id.as_str(),
                        error = %err,
                        "skipping unrecoverable instance"
                    );
                    self.inner
                        .report_error(Some(&instance_id), "recover", &err.to_string());
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }

    /// Returns `false` when the active folder was a stale copy and has been
    /// removed.
    async fn recover_one(&self, instance_id: &str) -> Result<bool, ManagerError> {
        let store = &self.inner.store;
        let snapshot = store
            .load_snapshot(StorageArea::Active, instance_id)
            .await?
            .ok_or(RepositoryError::NotFound)?;

        // A move that copied the folder but could not delete the source.
        let target = StorageArea::for_status(snapshot.status);
        if target != StorageArea::Active
            && store.load_snapshot(target, instance_id).await?.is_some()
        {
            store.delete(StorageArea::Active, instance_id).await?;
            tracing::warn!(
                instance_id,
                area = target.dir_name(),
                "removed stale active copy of relocated instance"
            );
            return Ok(false);
        }

        let mut instance = WorkflowInstance::from_snapshot(
            snapshot,
            self.inner.engine.config().event_capacity,
        )?;
        let interrupted = instance.reset_interrupted_phase();
        let unsettled = StorageArea::for_status(instance.status()) != StorageArea::Active;
        if interrupted {
            tracing::info!(instance_id, "interrupted phase returned to active");
        }

        let shared = self.inner.engine.adopt_instance(instance);
        if let Err(err) = self.track(shared, StorageArea::Active, false).await {
            self.inner.engine.remove_instance(instance_id);
            return Err(err);
        }

        if interrupted || unsettled {
            self.inner.persist_reported(instance_id).await;
        }
        Ok(true)
    }

    /// Stop the monitor, persist every instance and detach all listeners.
    /// Returns the number of instances persisted.
    pub async fn shutdown(&self) -> usize {
        self.inner.shutdown.cancel();
        if let Some(handle) = self.inner.monitor.lock().await.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "monitor task ended abnormally");
            }
        }

        let mut persisted = 0;
        for instance_id in self.instance_ids() {
            if self.inner.persist_reported(&instance_id).await.is_some() {
                persisted += 1;
            }
            if let Some(entry) = self.inner.entries.get(&instance_id) {
                entry.subscription.cancel();
            }
        }

        tracing::info!(persisted, "instance manager shut down");
        self.inner
            .events
            .publish(InstanceEvent::ManagerShutdown { persisted });
        persisted
    }

    // -- registration -------------------------------------------------------

    /// Take an engine instance under management and persist it.
    pub async fn register_instance(&self, instance: SharedInstance) -> Result<String, ManagerError> {
        self.track(instance, StorageArea::Active, true).await
    }

    /// Create an instance through the engine and register it.
    pub async fn create_instance(
        &self,
        template_id: &str,
        options: InstanceOptions,
    ) -> Result<String, ManagerError> {
        let created = self.inner.engine.create_instance(template_id, options)?;
        match self.register_instance(created.instance).await {
            Ok(instance_id) => Ok(instance_id),
            Err(err) => {
                self.inner.engine.remove_instance(&created.instance_id);
                Err(err)
            }
        }
    }

    async fn track(
        &self,
        instance: SharedInstance,
        area: StorageArea,
        announce: bool,
    ) -> Result<String, ManagerError> {
        let (instance_id, template_id, rx) = {
            let guard = instance.lock().await;
            (
                guard.id().to_string(),
                guard.template_id().to_string(),
                guard.subscribe(),
            )
        };

        {
            let _registration = self.inner.registration.lock().await;
            if self.inner.entries.contains_key(&instance_id) {
                return Err(ManagerError::AlreadyRegistered(instance_id));
            }
            let max = self.inner.config.max_instances;
            if self.inner.entries.len() >= max {
                tracing::warn!(instance_id = instance_id.as_str(), max, "instance limit reached");
                return Err(ManagerError::CapacityReached { max });
            }

            let managed = ManagedInstance {
                instance,
                template_id: template_id.clone(),
                area: Arc::new(Mutex::new(area)),
                subscription: self.inner.shutdown.child_token(),
            };
            self.spawn_listener(instance_id.clone(), managed.subscription.clone(), rx);
            self.inner.entries.insert(instance_id.clone(), managed);
        }

        if announce {
            self.inner.persist_reported(&instance_id).await;
            tracing::info!(
                instance_id = instance_id.as_str(),
                template_id = template_id.as_str(),
                "instance registered"
            );
            self.inner.events.publish(InstanceEvent::Registered {
                instance_id: instance_id.clone(),
                template_id,
            });
        }
        Ok(instance_id)
    }

    /// Forward the instance's events and persist after each one.
    fn spawn_listener(
        &self,
        instance_id: String,
        token: CancellationToken,
        mut rx: broadcast::Receiver<InstanceEvent>,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => {
                            inner.persist_reported(&instance_id).await;
                            inner.events.publish(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                instance_id = instance_id.as_str(),
                                skipped,
                                "event listener lagged; persisting current state"
                            );
                            inner.persist_reported(&instance_id).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::trace!(instance_id = instance_id.as_str(), "event listener stopped");
        });
    }

    // -- queries ------------------------------------------------------------

    pub fn get_instance(&self, instance_id: &str) -> Option<SharedInstance> {
        self.inner
            .entries
            .get(instance_id)
            .map(|entry| Arc::clone(&entry.instance))
    }

    pub fn get_all_instances(&self) -> Vec<SharedInstance> {
        self.inner
            .entries
            .iter()
            .map(|entry| Arc::clone(&entry.instance))
            .collect()
    }

    pub async fn get_instances_by_status(&self, status: InstanceStatus) -> Vec<SharedInstance> {
        let mut matching = Vec::new();
        for shared in self.get_all_instances() {
            if shared.lock().await.status() == status {
                matching.push(shared);
            }
        }
        matching
    }

    pub fn get_instances_by_template(&self, template_id: &str) -> Vec<SharedInstance> {
        self.inner
            .entries
            .iter()
            .filter(|entry| entry.template_id == template_id)
            .map(|entry| Arc::clone(&entry.instance))
            .collect()
    }

    pub async fn get_statistics(&self) -> InstanceStatistics {
        let mut summaries = Vec::new();
        for shared in self.get_all_instances() {
            summaries.push(InstanceSummary::of(&*shared.lock().await));
        }
        compute_statistics(&summaries)
    }

    /// Storage area the instance's folder currently lives in.
    pub async fn instance_area(&self, instance_id: &str) -> Option<StorageArea> {
        let area = self
            .inner
            .entries
            .get(instance_id)
            .map(|entry| Arc::clone(&entry.area))?;
        let area = *area.lock().await;
        Some(area)
    }

    fn instance_ids(&self) -> Vec<String> {
        self.inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    // -- operator actions ---------------------------------------------------

    pub async fn pause_instance(&self, instance_id: &str) -> Result<(), ManagerError> {
        self.operate(instance_id, WorkflowInstance::pause).await
    }

    pub async fn resume_instance(&self, instance_id: &str) -> Result<(), ManagerError> {
        self.operate(instance_id, WorkflowInstance::resume).await
    }

    /// Terminate the instance. An in-flight phase is not interrupted; its
    /// result is discarded when it arrives.
    pub async fn cancel_instance(
        &self,
        instance_id: &str,
        reason: Option<String>,
    ) -> Result<(), ManagerError> {
        self.operate(instance_id, move |instance| instance.cancel(reason))
            .await
    }

    async fn operate<F>(&self, instance_id: &str, op: F) -> Result<(), ManagerError>
    where
        F: FnOnce(&mut WorkflowInstance) -> Result<(), InstanceError>,
    {
        let shared = self
            .get_instance(instance_id)
            .ok_or_else(|| ManagerError::InstanceNotFound(instance_id.to_string()))?;
        op(&mut *shared.lock().await)?;
        self.inner.persist_reported(instance_id).await;
        Ok(())
    }

    /// Stop managing an instance. With `archive`, its final snapshot is moved
    /// to the archived area; otherwise its folder is deleted.
    pub async fn remove_instance(&self, instance_id: &str, archive: bool) -> Result<(), ManagerError> {
        let (_, managed) = self
            .inner
            .entries
            .remove(instance_id)
            .ok_or_else(|| ManagerError::InstanceNotFound(instance_id.to_string()))?;
        managed.subscription.cancel();
        self.inner.stalls.remove(instance_id);
        self.inner.engine.remove_instance(instance_id);

        let mut area = managed.area.lock().await;
        if archive {
            let snapshot = managed.instance.lock().await.snapshot();
            self.inner.store.save_snapshot(*area, &snapshot).await?;
            if *area != StorageArea::Archived {
                self.inner
                    .store
                    .relocate(instance_id, *area, StorageArea::Archived)
                    .await?;
                *area = StorageArea::Archived;
            }
            self.inner
                .store
                .prune_backups(*area, instance_id, self.inner.config.max_backups)
                .await?;
        } else {
            self.inner.store.delete(*area, instance_id).await?;
        }
        drop(area);

        tracing::info!(instance_id, archive, "instance removed");
        self.inner.events.publish(InstanceEvent::Removed {
            instance_id: instance_id.to_string(),
            archived: archive,
        });
        Ok(())
    }

    /// Write the instance's snapshot now.
    pub async fn persist_instance(&self, instance_id: &str) -> Result<PersistOutcome, ManagerError> {
        self.inner
            .persist(instance_id)
            .await?
            .ok_or_else(|| ManagerError::InstanceNotFound(instance_id.to_string()))
    }
}

impl<S: InstanceStore + 'static> ManagerInner<S> {
    /// Save, prune and (for completed/failed instances) relocate.
    ///
    /// Returns `None` if the instance is no longer managed.
    async fn persist(&self, instance_id: &str) -> Result<Option<PersistOutcome>, ManagerError> {
        let Some(managed) = self.entries.get(instance_id).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };

        let mut area = managed.area.lock().await;
        // Removal takes the entry out before it takes the storage lock.
        if !self.entries.contains_key(instance_id) {
            return Ok(None);
        }

        let snapshot = managed.instance.lock().await.snapshot();
        self.store.save_snapshot(*area, &snapshot).await?;
        let pruned = self
            .store
            .prune_backups(*area, instance_id, self.config.max_backups)
            .await?;

        let target = StorageArea::for_status(snapshot.status);
        let relocated = *area == StorageArea::Active && target != StorageArea::Active;
        if relocated {
            self.store.relocate(instance_id, *area, target).await?;
            tracing::info!(
                instance_id,
                from = area.dir_name(),
                to = target.dir_name(),
                "instance storage relocated"
            );
            *area = target;
        }

        Ok(Some(PersistOutcome {
            area: *area,
            pruned,
            relocated,
        }))
    }

    /// `persist`, with failures logged and published instead of returned.
    async fn persist_reported(&self, instance_id: &str) -> Option<PersistOutcome> {
        match self.persist(instance_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(instance_id, error = %err, "failed to persist instance");
                self.report_error(Some(instance_id), "persist", &err.to_string());
                None
            }
        }
    }

    fn report_error(&self, instance_id: Option<&str>, operation: &str, error: &str) {
        self.events.publish(InstanceEvent::ManagerError {
            instance_id: instance_id.map(str::to_string),
            operation: operation.to_string(),
            error: error.to_string(),
        });
    }
}
