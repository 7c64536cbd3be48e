//! Validation gates: named predicates that must pass before a phase executes.

pub mod builtin;
pub mod registry;

pub use builtin::register_builtin_gates;
pub use registry::{GateError, GateFn, GateRegistry, GateReport, GateVerdict, ValidationGate};
