//! Periodic instance monitor.
//!
//! Runs on its own ticker, independent of the engine's dispatcher, so it is
//! eventually consistent with in-flight mutations: a tick may snapshot an
//! instance halfway through a dispatcher operation. Snapshot writes for one
//! instance are still serialized by the instance's storage lock, and the
//! last write wins.
//!
//! Each tick, for every managed instance:
//! 1. report a stalled phase (once per phase start),
//! 2. re-persist the snapshot,
//! 3. prune backups beyond the configured limit.
//!
//! A failure on one instance is reported and the scan continues.

use chrono::{DateTime, Utc};
use phaseflow_types::event::InstanceEvent;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::repository::InstanceStore;

use super::InstanceManager;

/// Identity of a reported stall: the phase and when it started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StallMarker {
    phase_index: usize,
    started_at: Option<DateTime<Utc>>,
}

/// What one monitor tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub scanned: usize,
    /// Instances newly reported as stalled.
    pub stalled: Vec<String>,
    pub persisted: usize,
    pub pruned: usize,
    pub errors: usize,
}

impl<S: InstanceStore + 'static> InstanceManager<S> {
    pub(super) fn spawn_monitor(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.inner.config.monitor_interval();
        let token = self.inner.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::debug!(period_secs = period.as_secs(), "instance monitor started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = manager.run_monitor_tick().await;
                        tracing::debug!(
                            scanned = report.scanned,
                            stalled = report.stalled.len(),
                            persisted = report.persisted,
                            pruned = report.pruned,
                            errors = report.errors,
                            "monitor tick"
                        );
                    }
                }
            }
            tracing::debug!("instance monitor stopped");
        })
    }

    /// Run one monitor pass over every managed instance.
    pub async fn run_monitor_tick(&self) -> MonitorReport {
        let threshold_secs = self.inner.config.stall_threshold_secs;
        let threshold = chrono::Duration::from_std(self.inner.config.stall_threshold())
            .unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut report = MonitorReport::default();

        for instance_id in self.instance_ids() {
            let Some(shared) = self.get_instance(&instance_id) else {
                continue;
            };
            report.scanned += 1;

            let stalled = {
                let instance = shared.lock().await;
                instance
                    .stalled_phase(now, threshold)
                    .map(|(phase, elapsed)| (phase.index, phase.id.clone(), phase.started_at, elapsed))
            };

            match stalled {
                Some((phase_index, phase_id, started_at, elapsed)) => {
                    let marker = StallMarker {
                        phase_index,
                        started_at,
                    };
                    let previous = self.inner.stalls.insert(instance_id.clone(), marker);
                    if previous != Some(marker) {
                        tracing::warn!(
                            instance_id = instance_id.as_str(),
                            phase = phase_id.as_str(),
                            elapsed_secs = elapsed.num_seconds(),
                            threshold_secs,
                            "phase stalled"
                        );
                        self.inner.events.publish(InstanceEvent::Stalled {
                            instance_id: instance_id.clone(),
                            phase_index,
                            phase_id,
                            elapsed_secs: elapsed.num_seconds(),
                            threshold_secs,
                        });
                        report.stalled.push(instance_id.clone());
                    }
                }
                None => {
                    self.inner.stalls.remove(&instance_id);
                }
            }

            match self.inner.persist(&instance_id).await {
                Ok(Some(outcome)) => {
                    report.persisted += 1;
                    report.pruned += outcome.pruned;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(
                        instance_id = instance_id.as_str(),
                        error = %err,
                        "monitor failed to persist instance"
                    );
                    self.inner
                        .report_error(Some(&instance_id), "monitor", &err.to_string());
                    report.errors += 1;
                }
            }
        }

        report
    }
}
