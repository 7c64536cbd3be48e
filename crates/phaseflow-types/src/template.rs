//! Workflow template types.
//!
//! A `WorkflowTemplate` is the static, already-parsed recipe for a workflow:
//! an id plus an ordered list of `StepDefinition`s. Templates are loaded by an
//! external collaborator (see `phaseflow-infra::template`) and are read-only
//! for the lifetime of the engine.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// WorkflowTemplate
// ---------------------------------------------------------------------------

/// Static recipe for a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    /// Unique template identifier (e.g. "greenfield-service").
    pub id: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered step list. Each step becomes one phase of an instance.
    #[serde(default, alias = "sequence")]
    pub steps: Vec<StepDefinition>,
}

impl WorkflowTemplate {
    /// Create a template from an id and its ordered steps.
    pub fn new(id: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            steps,
        }
    }

    /// The first phase id shared by two steps, if any.
    pub fn duplicate_phase_id(&self) -> Option<String> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .enumerate()
            .map(|(index, step)| step.phase_id(index))
            .find(|phase_id| !seen.insert(phase_id.clone()))
    }

    /// Name for display, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

// ---------------------------------------------------------------------------
// StepDefinition
// ---------------------------------------------------------------------------

/// Blueprint for one phase of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Step name. Used as the phase id when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Agent responsible for the step (e.g. "architect").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Action the agent performs (e.g. "create-doc").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Artifact names this step consumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uses: Vec<String>,
    /// Artifact name this step produces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creates: Option<String>,
    /// Free-form condition label, passed through to the action handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Names of validation gates that must pass before the step executes.
    #[serde(default, alias = "validation_gates", skip_serializing_if = "Vec::is_empty")]
    pub validation_gates: Vec<String>,
    /// Free-text notes for the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl StepDefinition {
    /// A step identified only by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_uses<I, S>(mut self, uses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.uses = uses.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_creates(mut self, artifact: impl Into<String>) -> Self {
        self.creates = Some(artifact.into());
        self
    }

    pub fn with_gates<I, S>(mut self, gates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.validation_gates = gates.into_iter().map(Into::into).collect();
        self
    }

    /// Identifier of the phase materialized from this step at `index`.
    ///
    /// Priority: `name`, then `agent`, then `action`, then `phase-{n}` (1-based).
    pub fn phase_id(&self, index: usize) -> String {
        self.name
            .as_deref()
            .or(self.agent.as_deref())
            .or(self.action.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| format!("phase-{}", index + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_id_prefers_name_then_agent_then_action() {
        let step = StepDefinition::named("A").with_agent("pm");
        assert_eq!(step.phase_id(0), "A");

        let step = StepDefinition::default().with_agent("pm").with_action("write");
        assert_eq!(step.phase_id(0), "pm");

        let step = StepDefinition::default().with_action("write");
        assert_eq!(step.phase_id(3), "write");

        assert_eq!(StepDefinition::default().phase_id(2), "phase-3");
    }

    #[test]
    fn duplicate_phase_ids_are_found() {
        let template = WorkflowTemplate::new(
            "dup",
            vec![
                StepDefinition::named("A"),
                StepDefinition::default().with_agent("pm"),
                StepDefinition::named("A"),
            ],
        );
        assert_eq!(template.duplicate_phase_id().as_deref(), Some("A"));

        let template = WorkflowTemplate::new(
            "ok",
            vec![StepDefinition::default(), StepDefinition::default()],
        );
        assert!(template.duplicate_phase_id().is_none());
    }

    #[test]
    fn template_deserializes_camel_case_gates_and_sequence_alias() {
        let json = r#"{
            "id": "t1",
            "sequence": [
                {"agent": "analyst", "creates": "brief.md", "validationGates": ["has-action"]},
                {"agent": "pm", "uses": ["brief.md"], "creates": "prd.md"}
            ]
        }"#;
        let template: WorkflowTemplate = serde_json::from_str(json).unwrap();
        assert_eq!(template.id, "t1");
        assert_eq!(template.steps.len(), 2);
        assert_eq!(template.steps[0].validation_gates, vec!["has-action"]);
        assert_eq!(template.steps[1].uses, vec!["brief.md"]);
        assert_eq!(template.display_name(), "t1");
    }

    #[test]
    fn empty_fields_are_omitted_when_serialized() {
        let template = WorkflowTemplate::new("t1", vec![StepDefinition::named("A")]);
        let json = serde_json::to_string(&template).unwrap();
        assert!(!json.contains("validationGates"));
        assert!(!json.contains("uses"));
        assert!(json.contains("\"name\":\"A\""));
    }
}
