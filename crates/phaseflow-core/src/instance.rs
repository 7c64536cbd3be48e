//! Workflow instance state machine.
//!
//! One `WorkflowInstance` is one execution of a `WorkflowTemplate`:
//!
//! ```text
//! initializing -> initialized -> running <-> paused -> completed | failed | cancelled
//! ```
//!
//! Every transition publishes an `InstanceEvent` on the instance's own
//! `EventBus`; the instance manager subscribes to it to persist snapshots.
//! The instance knows nothing about storage.
//!
//! Phase execution is split into `begin_execution` / `complete_execution` /
//! `fail_execution` so that the dispatcher can release the instance lock
//! while the action handler runs. `execute_current_phase` composes the three
//! for callers that own the instance outright.

use chrono::{DateTime, Utc};
use phaseflow_types::event::InstanceEvent;
use phaseflow_types::instance::{
    Artifact, Blocker, InstanceOptions, InstanceSnapshot, InstanceStatus, Metrics, Phase,
    PhaseStatus, Progress, QualityGateRecord, ValidationRecord,
};
use phaseflow_types::template::WorkflowTemplate;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::action::{ActionRegistry, PhaseInvocation, PhaseResult};
use crate::event::EventBus;
use crate::event::bus::DEFAULT_EVENT_CAPACITY;
use crate::gate::GateReport;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by instance transitions.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("instance {instance_id} is already started")]
    AlreadyStarted { instance_id: String },

    #[error("instance {instance_id} is not initialized (status: {status})")]
    NotInitialized {
        instance_id: String,
        status: InstanceStatus,
    },

    #[error("cannot {operation} instance {instance_id} while it is {status}")]
    InvalidTransition {
        instance_id: String,
        operation: &'static str,
        status: InstanceStatus,
    },

    #[error("instance {instance_id} has no current phase")]
    NoCurrentPhase { instance_id: String },

    #[error("phase '{phase_id}' of instance {instance_id} is {actual:?}, expected {expected:?}")]
    UnexpectedPhaseStatus {
        instance_id: String,
        phase_id: String,
        actual: PhaseStatus,
        expected: PhaseStatus,
    },

    #[error("instance {instance_id} still has {remaining} incomplete phase(s)")]
    IncompletePhases {
        instance_id: String,
        remaining: usize,
    },

    #[error("no action handler for phase '{phase_id}'")]
    NoActionHandler { phase_id: String },

    #[error("phase '{phase_id}' of instance {instance_id} failed: {error}")]
    PhaseFailed {
        instance_id: String,
        phase_id: String,
        error: String,
    },

    #[error("corrupt snapshot for instance {instance_id}: {reason}")]
    CorruptSnapshot { instance_id: String, reason: String },
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of a successful phase execution.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub success: bool,
    /// The phase as it stands after completion.
    pub phase: Phase,
    pub result: Value,
    /// The phase that follows, if any. Not yet active.
    pub next_phase: Option<Phase>,
}

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

/// State machine for one execution of a template.
#[derive(Debug)]
pub struct WorkflowInstance {
    id: String,
    template: WorkflowTemplate,
    options: InstanceOptions,
    status: InstanceStatus,
    current_phase_index: usize,
    phases: Vec<Phase>,
    artifacts: Vec<Artifact>,
    progress: Progress,
    metrics: Metrics,
    validation_results: Vec<ValidationRecord>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    events: EventBus,
}

impl WorkflowInstance {
    /// A new, uninitialized instance of `template`.
    pub fn new(template: WorkflowTemplate, options: InstanceOptions) -> Self {
        Self::with_event_capacity(template, options, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(
        template: WorkflowTemplate,
        options: InstanceOptions,
        event_capacity: usize,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            template,
            options,
            status: InstanceStatus::Initializing,
            current_phase_index: 0,
            phases: Vec::new(),
            artifacts: Vec::new(),
            progress: Progress::default(),
            metrics: Metrics::default(),
            validation_results: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            events: EventBus::new(event_capacity),
        }
    }

    /// Rebuild an instance verbatim from a persisted snapshot.
    ///
    /// Phases and history are restored as-is rather than re-materialized
    /// from the template.
    pub fn from_snapshot(
        snapshot: InstanceSnapshot,
        event_capacity: usize,
    ) -> Result<Self, InstanceError> {
        let corrupt = |reason: String| InstanceError::CorruptSnapshot {
            instance_id: snapshot.instance_id.clone(),
            reason,
        };

        if snapshot.current_phase_index > snapshot.phases.len() {
            return Err(corrupt(format!(
                "current phase index {} exceeds {} phase(s)",
                snapshot.current_phase_index,
                snapshot.phases.len()
            )));
        }
        let in_flight = snapshot
            .phases
            .iter()
            .filter(|p| p.status.is_in_flight())
            .count();
        if in_flight > 1 {
            return Err(corrupt(format!("{in_flight} phases are in flight")));
        }
        if snapshot.progress.total_phases != snapshot.phases.len() {
            return Err(corrupt(format!(
                "progress counts {} phase(s) but {} are present",
                snapshot.progress.total_phases,
                snapshot.phases.len()
            )));
        }

        Ok(Self {
            id: snapshot.instance_id,
            template: snapshot.template,
            options: snapshot.options,
            status: snapshot.status,
            current_phase_index: snapshot.current_phase_index,
            phases: snapshot.phases,
            artifacts: snapshot.artifacts,
            progress: snapshot.progress,
            metrics: snapshot.metrics,
            validation_results: snapshot.validation_results,
            created_at: snapshot.created_at,
            started_at: snapshot.started_at,
            completed_at: snapshot.completed_at,
            events: EventBus::new(event_capacity),
        })
    }

    /// Full serializable state, stamped with the current time.
    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            instance_id: self.id.clone(),
            template: self.template.clone(),
            options: self.options.clone(),
            status: self.status,
            current_phase_index: self.current_phase_index,
            phases: self.phases.clone(),
            artifacts: self.artifacts.clone(),
            progress: self.progress,
            metrics: self.metrics.clone(),
            validation_results: self.validation_results.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            persisted_at: Utc::now(),
        }
    }

    /// Receive every event this instance publishes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    // -- accessors ----------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn template(&self) -> &WorkflowTemplate {
        &self.template
    }

    pub fn template_id(&self) -> &str {
        &self.template.id
    }

    pub fn options(&self) -> &InstanceOptions {
        &self.options
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn current_phase_index(&self) -> usize {
        self.current_phase_index
    }

    pub fn current_phase(&self) -> Option<&Phase> {
        self.phases.get(self.current_phase_index)
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn has_artifact(&self, name: &str) -> bool {
        self.artifacts.iter().any(|a| a.name == name)
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn validation_results(&self) -> &[ValidationRecord] {
        &self.validation_results
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn is_last_phase(&self) -> bool {
        self.current_phase_index + 1 >= self.phases.len()
    }

    // -- transitions --------------------------------------------------------

    /// Materialize one pending phase per template step.
    pub fn initialize(&mut self) -> Result<(), InstanceError> {
        if self.status != InstanceStatus::Initializing {
            return Err(self.invalid("initialize"));
        }

        self.phases = self
            .template
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| Phase::from_step(index, step))
            .collect();
        self.current_phase_index = 0;
        self.progress = Progress::new(self.phases.len());
        self.artifacts.clear();
        self.metrics = Metrics::default();
        self.validation_results.clear();
        self.status = InstanceStatus::Initialized;

        tracing::debug!(
            instance_id = self.id.as_str(),
            template_id = self.template.id.as_str(),
            phases = self.phases.len(),
            "instance initialized"
        );
        Ok(())
    }

    /// Move to `running` and activate the first phase.
    pub fn start(&mut self, options: InstanceOptions) -> Result<(), InstanceError> {
        match self.status {
            InstanceStatus::Initialized => {}
            InstanceStatus::Initializing => {
                return Err(InstanceError::NotInitialized {
                    instance_id: self.id.clone(),
                    status: self.status,
                });
            }
            _ => {
                return Err(InstanceError::AlreadyStarted {
                    instance_id: self.id.clone(),
                });
            }
        }

        merge_options(&mut self.options, options);
        let now = Utc::now();
        self.status = InstanceStatus::Running;
        self.started_at = Some(now);
        self.current_phase_index = 0;
        self.progress.current_phase = 0;

        let first = self.phases.first_mut().map(|phase| {
            phase.status = PhaseStatus::Active;
            phase.started_at = Some(now);
            phase.clone()
        });

        tracing::info!(
            instance_id = self.id.as_str(),
            template_id = self.template.id.as_str(),
            "instance started"
        );
        self.events.publish(InstanceEvent::Started {
            instance_id: self.id.clone(),
            template_id: self.template.id.clone(),
            phase: first.clone(),
        });
        if let Some(phase) = first {
            self.publish_phase_started(phase);
        }
        Ok(())
    }

    /// Mark the current phase `executing` and build the handler invocation.
    pub fn begin_execution(
        &mut self,
        options: &InstanceOptions,
    ) -> Result<PhaseInvocation, InstanceError> {
        if self.status != InstanceStatus::Running {
            return Err(self.invalid("execute a phase of"));
        }
        let index = self.current_phase_index;
        let instance_id = self.id.clone();
        let phase = self.current_phase_mut()?;
        if phase.status != PhaseStatus::Active {
            return Err(InstanceError::UnexpectedPhaseStatus {
                instance_id,
                phase_id: phase.id.clone(),
                actual: phase.status,
                expected: PhaseStatus::Active,
            });
        }
        phase.status = PhaseStatus::Executing;
        if phase.started_at.is_none() {
            phase.started_at = Some(Utc::now());
        }
        let phase = phase.clone();

        let mut merged = self.options.clone();
        merge_options(&mut merged, options.clone());

        tracing::debug!(
            instance_id = self.id.as_str(),
            phase = phase.id.as_str(),
            index,
            "phase executing"
        );
        self.publish_phase_started(phase.clone());

        Ok(PhaseInvocation {
            instance_id: self.id.clone(),
            template_id: self.template.id.clone(),
            phase,
            options: merged,
            available_artifacts: self.artifacts.iter().map(|a| a.name.clone()).collect(),
        })
    }

    /// Apply a successful handler result to the executing phase.
    pub fn complete_execution(&mut self, result: PhaseResult) -> Result<Phase, InstanceError> {
        if self.status.is_terminal() {
            return Err(self.invalid("complete a phase of"));
        }
        let index = self.current_phase_index;
        let now = Utc::now();

        let phase = self.expect_executing()?;
        phase.status = PhaseStatus::Completed;
        phase.completed_at = Some(now);
        let duration_ms = elapsed_ms(phase.started_at, now);
        phase.duration_ms = Some(duration_ms);
        phase.result = Some(result.output);

        let mut produced: Vec<String> = Vec::new();
        for name in phase.definition.creates.iter().cloned().chain(result.artifacts) {
            if !produced.contains(&name) {
                produced.push(name);
            }
        }
        phase.artifacts.extend(produced.iter().cloned());
        let phase = phase.clone();

        for name in produced {
            self.artifacts.push(Artifact::new(name, index, phase.id.clone()));
        }
        self.metrics
            .phase_timings
            .insert(phase.id.clone(), duration_ms);
        self.progress.completed_phases += 1;
        self.progress.recompute();

        tracing::info!(
            instance_id = self.id.as_str(),
            phase = phase.id.as_str(),
            duration_ms,
            progress = self.progress.overall,
            "phase completed"
        );
        self.events.publish(InstanceEvent::PhaseCompleted {
            instance_id: self.id.clone(),
            phase_index: index,
            phase: phase.clone(),
            progress: self.progress,
        });
        Ok(phase)
    }

    /// Record a handler failure: the phase and the instance become `failed`.
    pub fn fail_execution(&mut self, error: impl Into<String>) -> Result<Phase, InstanceError> {
        if self.status.is_terminal() {
            return Err(self.invalid("fail a phase of"));
        }
        let error = error.into();
        let index = self.current_phase_index;
        let now = Utc::now();

        let phase = self.current_phase_mut()?;
        phase.status = PhaseStatus::Failed;
        phase.completed_at = Some(now);
        phase.duration_ms = Some(elapsed_ms(phase.started_at, now));
        phase.error = Some(error.clone());
        let phase = phase.clone();

        self.metrics.blockers.push(Blocker {
            phase_index: index,
            phase_id: phase.id.clone(),
            reason: error.clone(),
            recorded_at: now,
        });
        self.status = InstanceStatus::Failed;
        self.completed_at = Some(now);

        tracing::warn!(
            instance_id = self.id.as_str(),
            phase = phase.id.as_str(),
            error = error.as_str(),
            "phase failed"
        );
        self.events.publish(InstanceEvent::PhaseFailed {
            instance_id: self.id.clone(),
            phase_index: index,
            phase: phase.clone(),
            error: error.clone(),
        });
        self.events.publish(InstanceEvent::Failed {
            instance_id: self.id.clone(),
            template_id: self.template.id.clone(),
            phase_index: index,
            error,
        });
        Ok(phase)
    }

    /// Run the current phase through the resolved action handler.
    ///
    /// Gates are not evaluated here; callers run them first. A handler error
    /// fails the phase and the instance and is returned as
    /// `InstanceError::PhaseFailed`.
    pub async fn execute_current_phase(
        &mut self,
        actions: &ActionRegistry,
        options: &InstanceOptions,
    ) -> Result<PhaseOutcome, InstanceError> {
        let current = self
            .current_phase()
            .ok_or_else(|| InstanceError::NoCurrentPhase {
                instance_id: self.id.clone(),
            })?;
        let handler =
            actions
                .resolve(&current.definition)
                .ok_or_else(|| InstanceError::NoActionHandler {
                    phase_id: current.id.clone(),
                })?;

        let invocation = self.begin_execution(options)?;
        match handler.execute(&invocation).await {
            Ok(result) => {
                let output = result.output.clone();
                let phase = self.complete_execution(result)?;
                Ok(PhaseOutcome {
                    success: true,
                    next_phase: self.phases.get(phase.index + 1).cloned(),
                    phase,
                    result: output,
                })
            }
            Err(err) => {
                let phase = self.fail_execution(err.to_string())?;
                Err(InstanceError::PhaseFailed {
                    instance_id: self.id.clone(),
                    phase_id: phase.id,
                    error: err.to_string(),
                })
            }
        }
    }

    /// Activate the next phase. Returns `None` when the current phase is the
    /// last one; the caller should then `complete()`.
    pub fn move_to_next_phase(&mut self) -> Result<Option<Phase>, InstanceError> {
        if self.status.is_terminal() {
            return Err(self.invalid("advance"));
        }
        let Some(current) = self.current_phase() else {
            return Ok(None);
        };
        if current.status != PhaseStatus::Completed {
            return Err(InstanceError::UnexpectedPhaseStatus {
                instance_id: self.id.clone(),
                phase_id: current.id.clone(),
                actual: current.status,
                expected: PhaseStatus::Completed,
            });
        }
        if self.is_last_phase() {
            return Ok(None);
        }

        self.current_phase_index += 1;
        self.progress.current_phase = self.current_phase_index;
        let phase = &mut self.phases[self.current_phase_index];
        phase.status = PhaseStatus::Active;
        phase.started_at = Some(Utc::now());
        let phase = phase.clone();

        self.publish_phase_started(phase.clone());
        Ok(Some(phase))
    }

    /// Mark the instance `completed`. Every phase must be completed.
    pub fn complete(&mut self) -> Result<(), InstanceError> {
        if self.status.is_terminal() {
            return Err(self.invalid("complete"));
        }
        let remaining = self
            .phases
            .iter()
            .filter(|p| p.status != PhaseStatus::Completed)
            .count();
        if remaining > 0 {
            return Err(InstanceError::IncompletePhases {
                instance_id: self.id.clone(),
                remaining,
            });
        }

        self.status = InstanceStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.progress.recompute();

        tracing::info!(
            instance_id = self.id.as_str(),
            template_id = self.template.id.as_str(),
            "instance completed"
        );
        self.events.publish(InstanceEvent::Completed {
            instance_id: self.id.clone(),
            template_id: self.template.id.clone(),
            progress: self.progress,
        });
        Ok(())
    }

    /// `running` -> `paused`. Phase timers keep running.
    pub fn pause(&mut self) -> Result<(), InstanceError> {
        if self.status != InstanceStatus::Running {
            return Err(self.invalid("pause"));
        }
        self.status = InstanceStatus::Paused;
        self.events.publish(InstanceEvent::Paused {
            instance_id: self.id.clone(),
            phase_index: self.current_phase_index,
        });
        Ok(())
    }

    /// `paused` -> `running`.
    pub fn resume(&mut self) -> Result<(), InstanceError> {
        if self.status != InstanceStatus::Paused {
            return Err(self.invalid("resume"));
        }
        self.status = InstanceStatus::Running;
        self.events.publish(InstanceEvent::Resumed {
            instance_id: self.id.clone(),
            phase_index: self.current_phase_index,
        });
        Ok(())
    }

    /// Terminate the instance from any non-terminal status. Phases are left
    /// as they are.
    pub fn cancel(&mut self, reason: Option<String>) -> Result<(), InstanceError> {
        if self.status.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        self.status = InstanceStatus::Cancelled;
        self.completed_at = Some(Utc::now());

        tracing::info!(
            instance_id = self.id.as_str(),
            reason = reason.as_deref().unwrap_or(""),
            "instance cancelled"
        );
        self.events.publish(InstanceEvent::Cancelled {
            instance_id: self.id.clone(),
            reason,
        });
        Ok(())
    }

    // -- bookkeeping --------------------------------------------------------

    /// Append a gate report to the validation history and quality-gate
    /// metrics. A failed report also records a blocker. Publishes
    /// `instance:phase:validated` so the outcome is persisted.
    pub fn record_validation(&mut self, phase_index: usize, report: &GateReport) {
        let now = Utc::now();
        let phase_id = self
            .phases
            .get(phase_index)
            .map(|p| p.id.clone())
            .unwrap_or_default();

        self.validation_results.push(ValidationRecord {
            phase_index,
            phase_id: phase_id.clone(),
            passed: report.passed,
            errors: report.errors.clone(),
            warnings: report.warnings.clone(),
            checks: report.checks.clone(),
            checked_at: now,
        });
        self.metrics
            .quality_gates
            .extend(report.checks.iter().map(|check| QualityGateRecord {
                gate: check.gate.clone(),
                phase_index,
                passed: check.passed,
                checked_at: now,
            }));
        if !report.passed {
            self.metrics.blockers.push(Blocker {
                phase_index,
                phase_id,
                reason: report.errors.join("; "),
                recorded_at: now,
            });
        }
        self.events.publish(InstanceEvent::PhaseValidated {
            instance_id: self.id.clone(),
            phase_index,
            passed: report.passed,
            errors: report.errors.clone(),
        });
    }

    /// The current phase if the instance is running and the phase has been in
    /// flight for longer than `threshold`, with its elapsed time.
    pub fn stalled_phase(
        &self,
        now: DateTime<Utc>,
        threshold: chrono::Duration,
    ) -> Option<(&Phase, chrono::Duration)> {
        if self.status != InstanceStatus::Running {
            return None;
        }
        let phase = self.current_phase()?;
        if !phase.status.is_in_flight() {
            return None;
        }
        let elapsed = phase.elapsed(now)?;
        (elapsed > threshold).then_some((phase, elapsed))
    }

    /// Return an `executing` current phase to `active`.
    ///
    /// Used after recovery: the handler call that was in flight when the
    /// snapshot was written is gone.
    pub fn reset_interrupted_phase(&mut self) -> bool {
        match self.phases.get_mut(self.current_phase_index) {
            Some(phase) if phase.status == PhaseStatus::Executing => {
                phase.status = PhaseStatus::Active;
                true
            }
            _ => false,
        }
    }

    // -- helpers ------------------------------------------------------------

    fn current_phase_mut(&mut self) -> Result<&mut Phase, InstanceError> {
        let instance_id = &self.id;
        self.phases
            .get_mut(self.current_phase_index)
            .ok_or_else(|| InstanceError::NoCurrentPhase {
                instance_id: instance_id.clone(),
            })
    }

    fn expect_executing(&mut self) -> Result<&mut Phase, InstanceError> {
        let instance_id = self.id.clone();
        let phase = self.current_phase_mut()?;
        if phase.status != PhaseStatus::Executing {
            return Err(InstanceError::UnexpectedPhaseStatus {
                instance_id,
                phase_id: phase.id.clone(),
                actual: phase.status,
                expected: PhaseStatus::Executing,
            });
        }
        Ok(phase)
    }

    fn invalid(&self, operation: &'static str) -> InstanceError {
        InstanceError::InvalidTransition {
            instance_id: self.id.clone(),
            operation,
            status: self.status,
        }
    }

    fn publish_phase_started(&self, phase: Phase) {
        self.events.publish(InstanceEvent::PhaseStarted {
            instance_id: self.id.clone(),
            phase_index: phase.index,
            phase,
        });
    }
}

/// Overlay `incoming` onto `base`: set fields win, extra keys are merged.
pub fn merge_options(base: &mut InstanceOptions, incoming: InstanceOptions) {
    if incoming.label.is_some() {
        base.label = incoming.label;
    }
    if incoming.initiated_by.is_some() {
        base.initiated_by = incoming.initiated_by;
    }
    base.extra.extend(incoming.extra);
}

fn elapsed_ms(started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u64 {
    started_at
        .map(|started| (now - started).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}
