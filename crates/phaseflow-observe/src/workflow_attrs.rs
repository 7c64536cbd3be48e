//! Span attribute names for workflow instrumentation.
//!
//! Usable as constant field names in `tracing` macros:
//!
//! ```
//! use phaseflow_observe::workflow_attrs::{INSTANCE_ID, OPERATION};
//!
//! let span = tracing::info_span!(
//!     "workflow",
//!     { OPERATION } = "execute_phase",
//!     { INSTANCE_ID } = "0190f3b6-demo",
//! );
//! let _guard = span.enter();
//! ```

// --- Identity ---

/// Instance identifier.
pub const INSTANCE_ID: &str = "workflow.instance.id";

/// Template the instance was created from.
pub const TEMPLATE_ID: &str = "workflow.template.id";

// --- Phase ---

/// Phase identifier (step name, agent or action).
pub const PHASE_ID: &str = "workflow.phase.id";

/// Zero-based phase index.
pub const PHASE_INDEX: &str = "workflow.phase.index";

/// Phase status after the operation.
pub const PHASE_STATUS: &str = "workflow.phase.status";

// --- Instance ---

/// Instance status after the operation.
pub const INSTANCE_STATUS: &str = "workflow.instance.status";

/// Overall progress percentage.
pub const PROGRESS: &str = "workflow.progress";

/// Operation being performed (see the `OP_*` values).
pub const OPERATION: &str = "workflow.operation";

// --- Operation values ---

pub const OP_CREATE: &str = "create";
pub const OP_START: &str = "start";
pub const OP_EXECUTE_PHASE: &str = "execute_phase";
pub const OP_PAUSE: &str = "pause";
pub const OP_RESUME: &str = "resume";
pub const OP_CANCEL: &str = "cancel";
pub const OP_REMOVE: &str = "remove";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_names_share_namespace() {
        for name in [INSTANCE_ID, TEMPLATE_ID, PHASE_ID, PHASE_INDEX, PHASE_STATUS, INSTANCE_STATUS, PROGRESS, OPERATION] {
            assert!(name.starts_with("workflow."), "{name}");
        }
    }
}
