//! Workflow instance domain types.
//!
//! These are the plain data pieces of one execution of a template: phases,
//! artifacts, progress counters, metrics, validation history and the
//! serialized snapshot written to durable storage. The state machine that
//! mutates them lives in `phaseflow-core::instance`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::template::{StepDefinition, WorkflowTemplate};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Initializing,
    Initialized,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    /// Terminal statuses accept no further operations.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Initializing => "initializing",
            InstanceStatus::Initialized => "initialized",
            InstanceStatus::Running => "running",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "initializing" => Ok(InstanceStatus::Initializing),
            "initialized" => Ok(InstanceStatus::Initialized),
            "running" => Ok(InstanceStatus::Running),
            "paused" => Ok(InstanceStatus::Paused),
            "completed" => Ok(InstanceStatus::Completed),
            "failed" => Ok(InstanceStatus::Failed),
            "cancelled" | "canceled" => Ok(InstanceStatus::Cancelled),
            other => Err(format!("invalid instance status: '{other}'")),
        }
    }
}

/// Status of a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Active,
    Executing,
    Completed,
    Failed,
}

impl PhaseStatus {
    /// Active or executing: the phase holds the instance's "current" slot.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, PhaseStatus::Active | PhaseStatus::Executing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Active => "active",
            PhaseStatus::Executing => "executing",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Materialized, mutable copy of a `StepDefinition` for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub id: String,
    /// Position of the phase in the instance (0-based).
    pub index: usize,
    pub definition: StepDefinition,
    pub status: PhaseStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    /// Names of the artifacts this phase produced.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Output returned by the action handler.
    #[serde(default)]
    pub result: Option<Value>,
}

impl Phase {
    /// A fresh `pending` phase for the step at `index`.
    pub fn from_step(index: usize, step: &StepDefinition) -> Self {
        Self {
            id: step.phase_id(index),
            index,
            definition: step.clone(),
            status: PhaseStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error: None,
            artifacts: Vec::new(),
            result: None,
        }
    }

    /// Time since the phase started, if it has.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.started_at.map(|started| now - started)
    }
}

// ---------------------------------------------------------------------------
// Artifacts, progress, metrics, validation history
// ---------------------------------------------------------------------------

/// A named output produced by a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    /// Artifact type, derived from the file extension when there is one.
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub phase_index: usize,
    pub phase_id: String,
}

impl Artifact {
    pub fn new(name: impl Into<String>, phase_index: usize, phase_id: impl Into<String>) -> Self {
        let name = name.into();
        let kind = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .unwrap_or_else(|| "artifact".to_string());
        Self {
            name,
            kind,
            created_at: Utc::now(),
            phase_index,
            phase_id: phase_id.into(),
        }
    }
}

/// Progress counters for an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Overall completion percentage (0-100).
    pub overall: u32,
    /// Index of the current phase.
    pub current_phase: usize,
    pub completed_phases: usize,
    pub total_phases: usize,
}

impl Progress {
    pub fn new(total_phases: usize) -> Self {
        Self {
            overall: percentage(0, total_phases),
            current_phase: 0,
            completed_phases: 0,
            total_phases,
        }
    }

    /// Recompute `overall` from the phase counters.
    pub fn recompute(&mut self) {
        self.overall = percentage(self.completed_phases, self.total_phases);
    }
}

/// `round(completed / total * 100)`; an empty workflow counts as 100%.
pub fn percentage(completed: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    ((completed as f64 / total as f64) * 100.0).round() as u32
}

/// A recorded obstacle on a phase (failed gate check or execution error).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blocker {
    pub phase_index: usize,
    pub phase_id: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of one gate for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityGateRecord {
    pub gate: String,
    pub phase_index: usize,
    pub passed: bool,
    pub checked_at: DateTime<Utc>,
}

/// Execution metrics for an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    /// Phase id -> execution duration in milliseconds.
    #[serde(default)]
    pub phase_timings: BTreeMap<String, u64>,
    #[serde(default)]
    pub blockers: Vec<Blocker>,
    #[serde(default, rename = "quality_gates")]
    pub quality_gates: Vec<QualityGateRecord>,
}

/// Pass/fail of a single gate within a validation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateCheck {
    pub gate: String,
    pub passed: bool,
}

/// One entry of an instance's validation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRecord {
    pub phase_index: usize,
    pub phase_id: String,
    pub passed: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub checks: Vec<GateCheck>,
    pub checked_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Caller-supplied options for an instance. Unknown keys are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiated_by: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Full serialized state of one instance, as written to `state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub template: WorkflowTemplate,
    #[serde(default)]
    pub options: InstanceOptions,
    pub status: InstanceStatus,
    pub current_phase_index: usize,
    pub phases: Vec<Phase>,
    pub artifacts: Vec<Artifact>,
    pub progress: Progress,
    pub metrics: Metrics,
    pub validation_results: Vec<ValidationRecord>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub persisted_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Reference to an instance by its start time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceAge {
    pub instance_id: String,
    pub started_at: DateTime<Utc>,
}

/// Aggregate view over all live instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatistics {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_template: BTreeMap<String, usize>,
    pub average_progress: f64,
    pub oldest: Option<InstanceAge>,
    pub newest: Option<InstanceAge>,
}
