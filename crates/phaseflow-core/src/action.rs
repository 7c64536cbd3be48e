//! Phase action handlers.
//!
//! The work performed inside a phase is opaque to the engine: it resolves an
//! `ActionHandler` for the phase by action name (then agent name, then the
//! registry default) and awaits it. Handlers either return a `PhaseResult` or
//! an `ActionError`; the engine never retries.
//!
//! `ActionHandler` uses native async fn in traits (RPITIT) and is therefore not
//! object-safe. `ActionHandlerDyn` plus `BoxActionHandler` provide the
//! type-erased form the registry stores.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use phaseflow_types::instance::{InstanceOptions, Phase};
use phaseflow_types::template::StepDefinition;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Invocation / result types
// ---------------------------------------------------------------------------

/// Everything a handler needs to run one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseInvocation {
    pub instance_id: String,
    pub template_id: String,
    /// Snapshot of the phase as it began executing.
    pub phase: Phase,
    /// Instance options merged with the per-call options.
    pub options: InstanceOptions,
    /// Names of artifacts produced so far by earlier phases.
    pub available_artifacts: Vec<String>,
}

/// Output of a successful handler call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseResult {
    #[serde(default)]
    pub output: Value,
    /// Artifacts produced in addition to the step's `creates` entry.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl PhaseResult {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, name: impl Into<String>) -> Self {
        self.artifacts.push(name.into());
        self
    }
}

/// Errors raised by action handlers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    #[error("action failed: {0}")]
    Failed(String),

    #[error("action '{action}' is not supported by handler '{handler}'")]
    Unsupported { handler: String, action: String },
}

// ---------------------------------------------------------------------------
// ActionHandler trait
// ---------------------------------------------------------------------------

/// Executes the work of one phase.
pub trait ActionHandler: Send + Sync {
    /// Handler name used in logs.
    fn name(&self) -> &str;

    fn execute(
        &self,
        invocation: &PhaseInvocation,
    ) -> impl Future<Output = Result<PhaseResult, ActionError>> + Send;
}

/// Object-safe version of [`ActionHandler`] with boxed futures.
pub trait ActionHandlerDyn: Send + Sync {
    fn name_dyn(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        invocation: &'a PhaseInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<PhaseResult, ActionError>> + Send + 'a>>;
}

impl<T: ActionHandler> ActionHandlerDyn for T {
    fn name_dyn(&self) -> &str {
        self.name()
    }

    fn execute_boxed<'a>(
        &'a self,
        invocation: &'a PhaseInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<PhaseResult, ActionError>> + Send + 'a>> {
        Box::pin(self.execute(invocation))
    }
}

/// Type-erased, cheaply cloneable action handler.
#[derive(Clone)]
pub struct BoxActionHandler {
    inner: Arc<dyn ActionHandlerDyn>,
}

impl BoxActionHandler {
    pub fn new<T: ActionHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name_dyn()
    }

    pub async fn execute(&self, invocation: &PhaseInvocation) -> Result<PhaseResult, ActionError> {
        self.inner.execute_boxed(invocation).await
    }
}

impl std::fmt::Debug for BoxActionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxActionHandler")
            .field("name", &self.name())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

/// Lookup table from action (or agent) name to handler.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, BoxActionHandler>,
    default: Option<BoxActionHandler>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose default handler is `handler`.
    pub fn with_default<T: ActionHandler + 'static>(handler: T) -> Self {
        Self {
            handlers: HashMap::new(),
            default: Some(BoxActionHandler::new(handler)),
        }
    }

    /// Register a handler for an action or agent name.
    pub fn register<T: ActionHandler + 'static>(&mut self, key: impl Into<String>, handler: T) {
        self.handlers.insert(key.into(), BoxActionHandler::new(handler));
    }

    pub fn set_default<T: ActionHandler + 'static>(&mut self, handler: T) {
        self.default = Some(BoxActionHandler::new(handler));
    }

    /// Handler for `step`: by action name, then agent name, then the default.
    pub fn resolve(&self, step: &StepDefinition) -> Option<BoxActionHandler> {
        step.action
            .as_deref()
            .and_then(|action| self.handlers.get(action))
            .or_else(|| step.agent.as_deref().and_then(|agent| self.handlers.get(agent)))
            .or(self.default.as_ref())
            .cloned()
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

// ---------------------------------------------------------------------------
// EchoActionHandler
// ---------------------------------------------------------------------------

/// Handler that succeeds immediately and echoes the step back as its output.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoActionHandler;

impl ActionHandler for EchoActionHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, invocation: &PhaseInvocation) -> Result<PhaseResult, ActionError> {
        let step = &invocation.phase.definition;
        Ok(PhaseResult::new(serde_json::json!({
            "phase": invocation.phase.id,
            "agent": step.agent,
            "action": step.action,
            "uses": step.uses,
            "creates": step.creates,
            "condition": step.condition,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl ActionHandler for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _invocation: &PhaseInvocation) -> Result<PhaseResult, ActionError> {
            Ok(PhaseResult::new(Value::String(self.0.to_string())))
        }
    }

    fn invocation(step: StepDefinition) -> PhaseInvocation {
        PhaseInvocation {
            instance_id: "i-1".to_string(),
            template_id: "t".to_string(),
            phase: Phase::from_step(0, &step),
            options: InstanceOptions::default(),
            available_artifacts: Vec::new(),
        }
    }

    #[test]
    fn resolve_prefers_action_then_agent_then_default() {
        let mut registry = ActionRegistry::with_default(Named("default"));
        registry.register("create-doc", Named("by-action"));
        registry.register("architect", Named("by-agent"));

        let step = StepDefinition::default()
            .with_agent("architect")
            .with_action("create-doc");
        assert_eq!(registry.resolve(&step).unwrap().name(), "by-action");

        let step = StepDefinition::default()
            .with_agent("architect")
            .with_action("unknown");
        assert_eq!(registry.resolve(&step).unwrap().name(), "by-agent");

        let step = StepDefinition::named("plain");
        assert_eq!(registry.resolve(&step).unwrap().name(), "default");

        assert_eq!(registry.keys(), vec!["architect", "create-doc"]);
    }

    #[test]
    fn resolve_without_default_can_miss() {
        let registry = ActionRegistry::new();
        assert!(registry.resolve(&StepDefinition::named("A")).is_none());
    }

    #[tokio::test]
    async fn echo_handler_reports_step() {
        let step = StepDefinition::named("A")
            .with_agent("pm")
            .with_creates("prd.md");
        let handler = BoxActionHandler::new(EchoActionHandler);
        let result = handler.execute(&invocation(step)).await.unwrap();

        assert_eq!(result.output["phase"], "A");
        assert_eq!(result.output["agent"], "pm");
        assert_eq!(result.output["creates"], "prd.md");
        assert!(result.artifacts.is_empty());
    }
}
