//! Observability for Phaseflow: tracing subscriber setup and span attribute
//! names.

pub mod tracing_setup;
pub mod workflow_attrs;
