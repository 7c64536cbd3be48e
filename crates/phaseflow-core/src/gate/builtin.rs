//! Gates registered on every engine.

use phaseflow_types::instance::PhaseStatus;

use super::registry::{GateRegistry, GateVerdict};

pub const REQUIRED_ARTIFACTS: &str = "required-artifacts";
pub const PREVIOUS_PHASES_COMPLETE: &str = "previous-phases-complete";
pub const HAS_ACTION: &str = "has-action";

/// Register the built-in gates on `registry`.
pub fn register_builtin_gates(registry: &GateRegistry) {
    registry.register(
        REQUIRED_ARTIFACTS,
        "Every artifact listed in the step's `uses` has been produced",
        |instance, phase| {
            let missing: Vec<&String> = phase
                .definition
                .uses
                .iter()
                .filter(|name| !instance.has_artifact(name))
                .collect();
            if missing.is_empty() {
                Ok(GateVerdict::pass())
            } else {
                Ok(GateVerdict {
                    passed: false,
                    errors: missing
                        .into_iter()
                        .map(|name| format!("required artifact '{name}' has not been produced"))
                        .collect(),
                    warnings: Vec::new(),
                })
            }
        },
    );

    registry.register(
        PREVIOUS_PHASES_COMPLETE,
        "All phases before the current one are completed",
        |instance, phase| {
            let incomplete: Vec<&str> = instance.phases()[..phase.index.min(instance.phases().len())]
                .iter()
                .filter(|p| p.status != PhaseStatus::Completed)
                .map(|p| p.id.as_str())
                .collect();
            if incomplete.is_empty() {
                Ok(GateVerdict::pass())
            } else {
                Ok(GateVerdict::fail(format!(
                    "earlier phases are not completed: {}",
                    incomplete.join(", ")
                )))
            }
        },
    );

    registry.register(
        HAS_ACTION,
        "The step names an agent or an action",
        |_, phase| {
            if phase.definition.agent.is_some() || phase.definition.action.is_some() {
                Ok(GateVerdict::pass())
            } else {
                Ok(GateVerdict::warn(format!(
                    "phase '{}' names neither an agent nor an action",
                    phase.id
                )))
            }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::WorkflowInstance;
    use phaseflow_types::instance::InstanceOptions;
    use phaseflow_types::template::{StepDefinition, WorkflowTemplate};

    fn registry() -> GateRegistry {
        let registry = GateRegistry::new();
        register_builtin_gates(&registry);
        registry
    }

    #[test]
    fn required_artifacts_reports_each_missing_name() {
        let template = WorkflowTemplate::new(
            "t",
            vec![StepDefinition::named("dev")
                .with_uses(["prd.md", "architecture.md"])
                .with_gates([REQUIRED_ARTIFACTS])],
        );
        let mut instance = WorkflowInstance::new(template, InstanceOptions::default());
        instance.initialize().unwrap();

        let report = registry().run(&instance, &instance.phases()[0]);
        assert!(!report.passed);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors[0].contains("prd.md"));
    }

    #[test]
    fn previous_phases_complete_checks_earlier_phases() {
        let template = WorkflowTemplate::new(
            "t",
            vec![
                StepDefinition::named("A"),
                StepDefinition::named("B").with_gates([PREVIOUS_PHASES_COMPLETE]),
            ],
        );
        let mut instance = WorkflowInstance::new(template, InstanceOptions::default());
        instance.initialize().unwrap();

        let phase_b = instance.phases()[1].clone();
        let report = registry().run(&instance, &phase_b);
        assert!(!report.passed);
        assert!(report.errors[0].contains('A'));
    }

    #[test]
    fn has_action_only_warns() {
        let template = WorkflowTemplate::new(
            "t",
            vec![StepDefinition::named("A").with_gates([HAS_ACTION])],
        );
        let mut instance = WorkflowInstance::new(template, InstanceOptions::default());
        instance.initialize().unwrap();

        let report = registry().run(&instance, &instance.phases()[0]);
        assert!(report.passed);
        assert_eq!(report.warnings.len(), 1);
    }
}
