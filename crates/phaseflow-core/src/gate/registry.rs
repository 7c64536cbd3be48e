//! Named validation gates and the registry that runs them.
//!
//! A gate is a pure predicate over `(instance, phase)`. The registry looks up
//! every gate named on a phase's `validation_gates` list and aggregates the
//! verdicts into a single `GateReport`:
//!
//! - failing verdicts do not stop evaluation; all errors and warnings are
//!   collected,
//! - a predicate that returns `Err` is recorded as an error entry and stops
//!   evaluation of the remaining gates,
//! - unknown gate names become warnings so templates can reference gates that
//!   are not implemented yet.

use std::sync::Arc;

use dashmap::DashMap;
use phaseflow_types::instance::{GateCheck, Phase};
use serde::Serialize;

use crate::instance::WorkflowInstance;

// ---------------------------------------------------------------------------
// Verdicts and reports
// ---------------------------------------------------------------------------

/// Result of a single gate predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateVerdict {
    pub passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl GateVerdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            ..Self::default()
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            passed: false,
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }

    /// A passing verdict carrying a warning.
    pub fn warn(warning: impl Into<String>) -> Self {
        Self {
            passed: true,
            errors: Vec::new(),
            warnings: vec![warning.into()],
        }
    }
}

/// Aggregated outcome of every gate on a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateReport {
    pub passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// One entry per gate that was actually evaluated.
    pub checks: Vec<GateCheck>,
}

impl Default for GateReport {
    fn default() -> Self {
        Self {
            passed: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            checks: Vec::new(),
        }
    }
}

/// Error raised from inside a gate predicate.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("{0}")]
    Predicate(String),
}

/// Gate predicate signature.
pub type GateFn =
    Arc<dyn Fn(&WorkflowInstance, &Phase) -> Result<GateVerdict, GateError> + Send + Sync>;

/// A registered gate.
#[derive(Clone)]
pub struct ValidationGate {
    pub name: String,
    pub description: String,
    validator: GateFn,
}

impl ValidationGate {
    pub fn check(&self, instance: &WorkflowInstance, phase: &Phase) -> Result<GateVerdict, GateError> {
        (self.validator)(instance, phase)
    }
}

impl std::fmt::Debug for ValidationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationGate")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// GateRegistry
// ---------------------------------------------------------------------------

/// Registry of named validation gates.
#[derive(Debug, Default)]
pub struct GateRegistry {
    gates: DashMap<String, ValidationGate>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a gate under `name`.
    pub fn register<F>(&self, name: impl Into<String>, description: impl Into<String>, validator: F)
    where
        F: Fn(&WorkflowInstance, &Phase) -> Result<GateVerdict, GateError> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(gate = name.as_str(), "registering validation gate");
        self.gates.insert(
            name.clone(),
            ValidationGate {
                name,
                description: description.into(),
                validator: Arc::new(validator),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.gates.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<ValidationGate> {
        self.gates.get(name).map(|g| g.value().clone())
    }

    /// `(name, description)` pairs sorted by name.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut gates: Vec<(String, String)> = self
            .gates
            .iter()
            .map(|g| (g.name.clone(), g.description.clone()))
            .collect();
        gates.sort();
        gates
    }

    /// Run every gate named on `phase` against `instance`.
    pub fn run(&self, instance: &WorkflowInstance, phase: &Phase) -> GateReport {
        let mut report = GateReport::default();

        for name in &phase.definition.validation_gates {
            // Clone out of the map so no shard lock is held while the
            // predicate runs.
            let Some(gate) = self.get(name) else {
                report
                    .warnings
                    .push(format!("unknown validation gate '{name}' was skipped"));
                continue;
            };

            match gate.check(instance, phase) {
                Ok(verdict) => {
                    report.checks.push(GateCheck {
                        gate: name.clone(),
                        passed: verdict.passed,
                    });
                    if !verdict.passed {
                        report.passed = false;
                        if verdict.errors.is_empty() {
                            report.errors.push(format!("gate '{name}' failed"));
                        }
                    }
                    report.errors.extend(verdict.errors);
                    report.warnings.extend(verdict.warnings);
                }
                Err(err) => {
                    tracing::warn!(gate = name.as_str(), error = %err, "validation gate raised an error");
                    report.passed = false;
                    report.checks.push(GateCheck {
                        gate: name.clone(),
                        passed: false,
                    });
                    report.errors.push(format!("gate '{name}' raised an error: {err}"));
                    break;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaseflow_types::instance::InstanceOptions;
    use phaseflow_types::template::{StepDefinition, WorkflowTemplate};

    fn instance_with_gates(gates: &[&str]) -> WorkflowInstance {
        let template = WorkflowTemplate::new(
            "gated",
            vec![StepDefinition::named("A").with_gates(gates.iter().copied())],
        );
        let mut instance = WorkflowInstance::new(template, InstanceOptions::default());
        instance.initialize().unwrap();
        instance
    }

    #[test]
    fn all_passing_gates_pass() {
        let registry = GateRegistry::new();
        registry.register("ok", "always passes", |_, _| Ok(GateVerdict::pass()));
        registry.register("noisy", "passes with a warning", |_, _| {
            Ok(GateVerdict::warn("heads up"))
        });

        let instance = instance_with_gates(&["ok", "noisy"]);
        let report = registry.run(&instance, &instance.phases()[0]);

        assert!(report.passed);
        assert!(report.errors.is_empty());
        assert_eq!(report.warnings, vec!["heads up"]);
        assert_eq!(report.checks.len(), 2);
    }

    #[test]
    fn failures_are_aggregated_not_short_circuited() {
        let registry = GateRegistry::new();
        registry.register("first", "fails", |_, _| Ok(GateVerdict::fail("first broke")));
        registry.register("second", "fails", |_, _| Ok(GateVerdict::fail("second broke")));

        let instance = instance_with_gates(&["first", "second"]);
        let report = registry.run(&instance, &instance.phases()[0]);

        assert!(!report.passed);
        assert_eq!(report.errors, vec!["first broke", "second broke"]);
        assert_eq!(report.checks.len(), 2);
    }

    #[test]
    fn failing_verdict_without_message_gets_generic_error() {
        let registry = GateRegistry::new();
        registry.register("quiet", "fails silently", |_, _| {
            Ok(GateVerdict {
                passed: false,
                ..GateVerdict::default()
            })
        });

        let instance = instance_with_gates(&["quiet"]);
        let report = registry.run(&instance, &instance.phases()[0]);
        assert_eq!(report.errors, vec!["gate 'quiet' failed"]);
    }

    #[test]
    fn predicate_error_becomes_entry_and_stops_evaluation() {
        let registry = GateRegistry::new();
        registry.register("explodes", "errors", |_, _| {
            Err(GateError::Predicate("boom".to_string()))
        });
        registry.register("after", "never evaluated", |_, _| {
            Ok(GateVerdict::fail("should not appear"))
        });

        let instance = instance_with_gates(&["explodes", "after"]);
        let report = registry.run(&instance, &instance.phases()[0]);

        assert!(!report.passed);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("boom"));
        assert_eq!(report.checks.len(), 1);
    }

    #[test]
    fn unknown_gates_are_warnings() {
        let registry = GateRegistry::new();
        let instance = instance_with_gates(&["not-implemented"]);
        let report = registry.run(&instance, &instance.phases()[0]);

        assert!(report.passed);
        assert!(report.checks.is_empty());
        assert!(report.warnings[0].contains("not-implemented"));
    }

    #[test]
    fn list_is_sorted() {
        let registry = GateRegistry::new();
        registry.register("b", "second", |_, _| Ok(GateVerdict::pass()));
        registry.register("a", "first", |_, _| Ok(GateVerdict::pass()));
        let names: Vec<String> = registry.list().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(registry.contains("a"));
    }
}
