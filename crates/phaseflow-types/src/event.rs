//! Lifecycle notifications for workflow instances and the instance manager.
//!
//! `InstanceEvent` is the unified event type broadcast by instances (and
//! re-broadcast by the manager). All variants are Clone + Send + Sync for use
//! with tokio broadcast channels. Each variant serializes with a `type` tag
//! equal to its public notification name (e.g. `instance:phase:completed`).

use serde::{Deserialize, Serialize};

use crate::instance::{Phase, Progress};

/// Events emitted over the lifetime of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum InstanceEvent {
    /// The manager accepted the instance into its registry.
    #[serde(rename = "instance:registered")]
    Registered {
        instance_id: String,
        template_id: String,
    },

    /// The instance began running; `phase` is the first active phase.
    #[serde(rename = "instance:started")]
    Started {
        instance_id: String,
        template_id: String,
        phase: Option<Phase>,
    },

    /// A phase became active (or began executing).
    #[serde(rename = "instance:phase:started")]
    PhaseStarted {
        instance_id: String,
        phase_index: usize,
        phase: Phase,
    },

    /// Gates were evaluated for a phase and the outcome recorded.
    #[serde(rename = "instance:phase:validated")]
    PhaseValidated {
        instance_id: String,
        phase_index: usize,
        passed: bool,
        errors: Vec<String>,
    },

    #[serde(rename = "instance:phase:completed")]
    PhaseCompleted {
        instance_id: String,
        phase_index: usize,
        phase: Phase,
        progress: Progress,
    },

    #[serde(rename = "instance:phase:failed")]
    PhaseFailed {
        instance_id: String,
        phase_index: usize,
        phase: Phase,
        error: String,
    },

    #[serde(rename = "instance:completed")]
    Completed {
        instance_id: String,
        template_id: String,
        progress: Progress,
    },

    #[serde(rename = "instance:failed")]
    Failed {
        instance_id: String,
        template_id: String,
        phase_index: usize,
        error: String,
    },

    #[serde(rename = "instance:paused")]
    Paused {
        instance_id: String,
        phase_index: usize,
    },

    #[serde(rename = "instance:resumed")]
    Resumed {
        instance_id: String,
        phase_index: usize,
    },

    #[serde(rename = "instance:cancelled")]
    Cancelled {
        instance_id: String,
        reason: Option<String>,
    },

    /// The current phase has been in flight longer than the stall threshold.
    #[serde(rename = "instance:stalled")]
    Stalled {
        instance_id: String,
        phase_index: usize,
        phase_id: String,
        elapsed_secs: i64,
        threshold_secs: u64,
    },

    #[serde(rename = "instance:removed")]
    Removed {
        instance_id: String,
        archived: bool,
    },

    /// Recovery finished; the manager is accepting work.
    #[serde(rename = "manager:initialized")]
    ManagerInitialized { recovered: usize, skipped: usize },

    /// A non-fatal persistence, recovery or monitoring failure.
    #[serde(rename = "manager:error")]
    ManagerError {
        instance_id: Option<String>,
        operation: String,
        error: String,
    },

    #[serde(rename = "manager:shutdown")]
    ManagerShutdown { persisted: usize },
}

impl InstanceEvent {
    /// Public notification name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            InstanceEvent::Registered { .. } => "instance:registered",
            InstanceEvent::Started { .. } => "instance:started",
            InstanceEvent::PhaseStarted { .. } => "instance:phase:started",
            InstanceEvent::PhaseValidated { .. } => "instance:phase:validated",
            InstanceEvent::PhaseCompleted { .. } => "instance:phase:completed",
            InstanceEvent::PhaseFailed { .. } => "instance:phase:failed",
            InstanceEvent::Completed { .. } => "instance:completed",
            InstanceEvent::Failed { .. } => "instance:failed",
            InstanceEvent::Paused { .. } => "instance:paused",
            InstanceEvent::Resumed { .. } => "instance:resumed",
            InstanceEvent::Cancelled { .. } => "instance:cancelled",
            InstanceEvent::Stalled { .. } => "instance:stalled",
            InstanceEvent::Removed { .. } => "instance:removed",
            InstanceEvent::ManagerInitialized { .. } => "manager:initialized",
            InstanceEvent::ManagerError { .. } => "manager:error",
            InstanceEvent::ManagerShutdown { .. } => "manager:shutdown",
        }
    }

    /// The instance this event concerns, if any.
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            InstanceEvent::Registered { instance_id, .. }
            | InstanceEvent::Started { instance_id, .. }
            | InstanceEvent::PhaseStarted { instance_id, .. }
            | InstanceEvent::PhaseValidated { instance_id, .. }
            | InstanceEvent::PhaseCompleted { instance_id, .. }
            | InstanceEvent::PhaseFailed { instance_id, .. }
            | InstanceEvent::Completed { instance_id, .. }
            | InstanceEvent::Failed { instance_id, .. }
            | InstanceEvent::Paused { instance_id, .. }
            | InstanceEvent::Resumed { instance_id, .. }
            | InstanceEvent::Cancelled { instance_id, .. }
            | InstanceEvent::Stalled { instance_id, .. }
            | InstanceEvent::Removed { instance_id, .. } => Some(instance_id),
            InstanceEvent::ManagerError { instance_id, .. } => instance_id.as_deref(),
            InstanceEvent::ManagerInitialized { .. } | InstanceEvent::ManagerShutdown { .. } => {
                None
            }
        }
    }
}
