//! Workflow engine: template registry, gate registry and the dispatcher.
//!
//! `WorkflowEngine` is the composition root of the in-memory side. It creates
//! instances from registered templates and submits every mutating operation
//! to the serialized dispatcher (see [`dispatcher`]). Callers await the
//! operation's result; the engine itself never blocks the queue on a caller.
//!
//! Constructing an engine spawns the dispatcher task, so it must happen
//! inside a tokio runtime.

pub mod dispatcher;

use std::sync::Arc;

use dashmap::DashMap;
use phaseflow_types::config::EngineConfig;
use phaseflow_types::instance::{InstanceOptions, InstanceStatus, Phase};
use phaseflow_types::template::WorkflowTemplate;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::action::ActionRegistry;
use crate::gate::{GateError, GateRegistry, GateReport, GateVerdict, register_builtin_gates};
use crate::instance::{InstanceError, WorkflowInstance};

use dispatcher::{Dispatcher, NextPhaseReply, Operation, QueueTask};

/// An instance shared between the engine, the dispatcher and the manager.
pub type SharedInstance = Arc<Mutex<WorkflowInstance>>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("invalid template '{template_id}': {reason}")]
    InvalidTemplate { template_id: String, reason: String },

    #[error("instance {instance_id} is not running (status: {status})")]
    NotRunning {
        instance_id: String,
        status: InstanceStatus,
    },

    #[error("instance {0} has no current phase")]
    NoCurrentPhase(String),

    #[error("validation gate failed for phase '{phase_id}': {}", .errors.join("; "))]
    ValidationFailed {
        instance_id: String,
        phase_id: String,
        errors: Vec<String>,
    },

    #[error("phase '{phase_id}' of instance {instance_id} failed: {error}")]
    PhaseFailed {
        instance_id: String,
        phase_id: String,
        error: String,
    },

    #[error("phase result discarded: instance {instance_id} is {status}")]
    ResultDiscarded {
        instance_id: String,
        status: InstanceStatus,
    },

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error("dispatcher is not running")]
    DispatcherClosed,
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Returned by [`WorkflowEngine::create_instance`].
#[derive(Debug, Clone)]
pub struct CreatedInstance {
    pub instance_id: String,
    pub instance: SharedInstance,
}

/// Outcome of one `execute_next_phase` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseExecution {
    pub success: bool,
    /// The phase that was executed.
    pub phase: Phase,
    pub result: Value,
    /// The phase that became active afterwards, if any.
    pub next_phase: Option<Phase>,
    /// Instance status after the follow-up progression.
    pub status: InstanceStatus,
}

/// Outcome of a progression step.
#[derive(Debug, Clone, PartialEq)]
pub enum Progression {
    Advanced(Phase),
    Completed,
    /// The instance was already terminal.
    Halted(InstanceStatus),
}

/// Listing entry for [`WorkflowEngine::get_available_workflows`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSummary {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub phase_count: usize,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine {
    templates: DashMap<String, Arc<WorkflowTemplate>>,
    gates: Arc<GateRegistry>,
    instances: Arc<DashMap<String, SharedInstance>>,
    queue: mpsc::Sender<QueueTask>,
    config: EngineConfig,
}

impl WorkflowEngine {
    /// Engine with default settings and the built-in gates.
    pub fn new(actions: ActionRegistry) -> Self {
        Self::with_config(actions, EngineConfig::default())
    }

    pub fn with_config(actions: ActionRegistry, config: EngineConfig) -> Self {
        let gates = Arc::new(GateRegistry::new());
        register_builtin_gates(&gates);

        let instances = Arc::new(DashMap::new());
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let dispatcher = Dispatcher::new(rx, Arc::clone(&instances), Arc::clone(&gates), Arc::new(actions));
        tokio::spawn(dispatcher.run());

        Self {
            templates: DashMap::new(),
            gates,
            instances,
            queue,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -- templates ----------------------------------------------------------

    /// Register (or replace) a template. Its id must be non-empty and its
    /// steps must map to distinct phase ids.
    pub fn register_template(&self, template: WorkflowTemplate) -> Result<(), EngineError> {
        let invalid = |reason: String| EngineError::InvalidTemplate {
            template_id: template.id.clone(),
            reason,
        };
        if template.id.trim().is_empty() {
            return Err(invalid("template id is empty".to_string()));
        }
        if let Some(phase_id) = template.duplicate_phase_id() {
            return Err(invalid(format!("duplicate phase id '{phase_id}'")));
        }

        tracing::debug!(
            template_id = template.id.as_str(),
            steps = template.steps.len(),
            "registering template"
        );
        self.templates
            .insert(template.id.clone(), Arc::new(template));
        Ok(())
    }

    pub fn get_workflow_template(&self, template_id: &str) -> Option<Arc<WorkflowTemplate>> {
        self.templates
            .get(template_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Summaries of all registered templates, sorted by id.
    pub fn get_available_workflows(&self) -> Vec<TemplateSummary> {
        let mut summaries: Vec<TemplateSummary> = self
            .templates
            .iter()
            .map(|entry| {
                let template = entry.value();
                TemplateSummary {
                    id: template.id.clone(),
                    name: template.display_name().to_string(),
                    description: template.description.clone(),
                    phase_count: template.steps.len(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    // -- gates --------------------------------------------------------------

    pub fn register_gate<F>(&self, name: impl Into<String>, description: impl Into<String>, validator: F)
    where
        F: Fn(&WorkflowInstance, &Phase) -> Result<GateVerdict, GateError> + Send + Sync + 'static,
    {
        self.gates.register(name, description, validator);
    }

    pub fn gates(&self) -> &GateRegistry {
        &self.gates
    }

    // -- instances ----------------------------------------------------------

    /// Create and initialize an instance of `template_id`.
    pub fn create_instance(
        &self,
        template_id: &str,
        options: InstanceOptions,
    ) -> Result<CreatedInstance, EngineError> {
        let template = self
            .get_workflow_template(template_id)
            .ok_or_else(|| EngineError::TemplateNotFound(template_id.to_string()))?;

        let mut instance = WorkflowInstance::with_event_capacity(
            template.as_ref().clone(),
            options,
            self.config.event_capacity,
        );
        instance.initialize()?;

        let instance_id = instance.id().to_string();
        let shared: SharedInstance = Arc::new(Mutex::new(instance));
        self.instances
            .insert(instance_id.clone(), Arc::clone(&shared));

        tracing::info!(
            instance_id = instance_id.as_str(),
            template_id,
            "instance created"
        );
        Ok(CreatedInstance {
            instance_id,
            instance: shared,
        })
    }

    /// Take ownership of an instance built elsewhere (e.g. recovered from a
    /// snapshot). Its template is registered if no template with that id is.
    pub fn adopt_instance(&self, instance: WorkflowInstance) -> SharedInstance {
        let template = instance.template();
        if !self.templates.contains_key(&template.id) {
            if let Err(err) = self.register_template(template.clone()) {
                tracing::warn!(
                    instance_id = instance.id(),
                    error = %err,
                    "recovered template not registered"
                );
            }
        }

        let instance_id = instance.id().to_string();
        let shared: SharedInstance = Arc::new(Mutex::new(instance));
        self.instances.insert(instance_id, Arc::clone(&shared));
        shared
    }

    pub fn get_workflow_instance(&self, instance_id: &str) -> Option<SharedInstance> {
        self.instances
            .get(instance_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All instances not yet in a terminal status.
    pub async fn get_active_instances(&self) -> Vec<SharedInstance> {
        let all: Vec<SharedInstance> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut active = Vec::with_capacity(all.len());
        for shared in all {
            if !shared.lock().await.status().is_terminal() {
                active.push(shared);
            }
        }
        active
    }

    /// Forget an instance. Queued tasks for it fail with `InstanceNotFound`.
    pub fn remove_instance(&self, instance_id: &str) -> Option<SharedInstance> {
        self.instances.remove(instance_id).map(|(_, shared)| shared)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    // -- dispatched operations ----------------------------------------------

    /// Start an instance. Returns the first active phase; an instance with no
    /// phases completes immediately and returns `None`.
    pub async fn start_workflow(
        &self,
        instance_id: &str,
        options: InstanceOptions,
    ) -> Result<Option<Phase>, EngineError> {
        self.ensure_exists(instance_id)?;
        self.submit(instance_id, options, Operation::Start).await
    }

    /// Run the gates of the current phase, execute it, then advance (or
    /// complete the instance after the last phase).
    pub async fn execute_next_phase(
        &self,
        instance_id: &str,
        options: InstanceOptions,
    ) -> Result<PhaseExecution, EngineError> {
        self.ensure_exists(instance_id)?;
        self.submit(instance_id, options, Operation::ExecutePhase)
            .await
    }

    /// Move a running instance past its completed current phase.
    pub async fn advance_phase(&self, instance_id: &str) -> Result<Progression, EngineError> {
        self.ensure_exists(instance_id)?;
        self.submit(instance_id, InstanceOptions::default(), |reply| {
            Operation::NextPhase(NextPhaseReply::Advance(reply))
        })
        .await
    }

    /// Run the current phase's gates without executing it.
    pub async fn validate(&self, instance_id: &str) -> Result<GateReport, EngineError> {
        self.ensure_exists(instance_id)?;
        self.submit(instance_id, InstanceOptions::default(), Operation::Validate)
            .await
    }

    fn ensure_exists(&self, instance_id: &str) -> Result<(), EngineError> {
        if self.instances.contains_key(instance_id) {
            Ok(())
        } else {
            Err(EngineError::InstanceNotFound(instance_id.to_string()))
        }
    }

    async fn submit<T>(
        &self,
        instance_id: &str,
        options: InstanceOptions,
        operation: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> Operation,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(QueueTask::new(instance_id, options, operation(tx)))
            .await
            .map_err(|_| EngineError::DispatcherClosed)?;
        rx.await.map_err(|_| EngineError::DispatcherClosed)?
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("templates", &self.templates.len())
            .field("instances", &self.instances.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::action::{
        ActionError, ActionHandler, EchoActionHandler, PhaseInvocation, PhaseResult,
    };
    use phaseflow_types::instance::PhaseStatus;
    use phaseflow_types::template::StepDefinition;

    fn t1() -> WorkflowTemplate {
        WorkflowTemplate::new(
            "t1",
            vec![StepDefinition::named("A"), StepDefinition::named("B")],
        )
    }

    fn engine() -> WorkflowEngine {
        let engine = WorkflowEngine::new(ActionRegistry::with_default(EchoActionHandler));
        engine.register_template(t1()).unwrap();
        engine
    }

    struct Slow(Duration);

    impl ActionHandler for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _invocation: &PhaseInvocation) -> Result<PhaseResult, ActionError> {
            tokio::time::sleep(self.0).await;
            Ok(PhaseResult::default())
        }
    }

    /// Records how many invocations overlap.
    struct Overlap {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl ActionHandler for Overlap {
        fn name(&self) -> &str {
            "overlap"
        }

        async fn execute(&self, _invocation: &PhaseInvocation) -> Result<PhaseResult, ActionError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(PhaseResult::default())
        }
    }

    #[tokio::test]
    async fn create_instance_requires_known_template() {
        let engine = engine();
        let err = engine
            .create_instance("missing", InstanceOptions::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::TemplateNotFound(ref id) if id == "missing"));

        let created = engine
            .create_instance("t1", InstanceOptions::default())
            .unwrap();
        let instance = created.instance.lock().await;
        assert_eq!(instance.status(), InstanceStatus::Initialized);
        assert_eq!(instance.phases().len(), 2);
    }

    #[tokio::test]
    async fn unknown_instance_is_reported() {
        let engine = engine();
        assert!(matches!(
            engine.start_workflow("nope", InstanceOptions::default()).await,
            Err(EngineError::InstanceNotFound(_))
        ));
        assert!(matches!(
            engine.execute_next_phase("nope", InstanceOptions::default()).await,
            Err(EngineError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn two_phase_workflow_runs_to_completion() {
        let engine = engine();
        let id = engine
            .create_instance("t1", InstanceOptions::default())
            .unwrap()
            .instance_id;

        let first = engine
            .start_workflow(&id, InstanceOptions::default())
            .await
            .unwrap();
        assert_eq!(first.unwrap().id, "A");

        let step = engine
            .execute_next_phase(&id, InstanceOptions::default())
            .await
            .unwrap();
        assert!(step.success);
        assert_eq!(step.phase.id, "A");
        assert_eq!(step.next_phase.as_ref().unwrap().id, "B");
        assert_eq!(step.status, InstanceStatus::Running);
        {
            let shared = engine.get_workflow_instance(&id).unwrap();
            let instance = shared.lock().await;
            assert_eq!(instance.progress().overall, 50);
            assert_eq!(instance.phases()[1].status, PhaseStatus::Active);
        }

        let step = engine
            .execute_next_phase(&id, InstanceOptions::default())
            .await
            .unwrap();
        assert_eq!(step.phase.id, "B");
        assert!(step.next_phase.is_none());
        assert_eq!(step.status, InstanceStatus::Completed);

        let shared = engine.get_workflow_instance(&id).unwrap();
        let instance = shared.lock().await;
        assert_eq!(instance.progress().overall, 100);
        assert!(instance.completed_at().is_some());
        drop(instance);
        assert!(engine.get_active_instances().await.is_empty());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let engine = engine();
        let id = engine
            .create_instance("t1", InstanceOptions::default())
            .unwrap()
            .instance_id;
        engine
            .start_workflow(&id, InstanceOptions::default())
            .await
            .unwrap();
        let err = engine
            .start_workflow(&id, InstanceOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Instance(InstanceError::AlreadyStarted { .. })
        ));
    }

    #[tokio::test]
    async fn empty_template_completes_on_start() {
        let engine = engine();
        engine.register_template(WorkflowTemplate::new("empty", Vec::new())).unwrap();
        let created = engine
            .create_instance("empty", InstanceOptions::default())
            .unwrap();

        let first = engine
            .start_workflow(&created.instance_id, InstanceOptions::default())
            .await
            .unwrap();
        assert!(first.is_none());

        let instance = created.instance.lock().await;
        assert_eq!(instance.status(), InstanceStatus::Completed);
        assert_eq!(instance.progress().overall, 100);
    }

    #[tokio::test]
    async fn failing_gate_blocks_execution_without_touching_phase() {
        let engine = engine();
        engine.register_gate("never", "always fails", |_, _| {
            Ok(GateVerdict::fail("not ready"))
        });
        engine
            .register_template(WorkflowTemplate::new(
                "gated",
                vec![StepDefinition::named("A").with_gates(["never"])],
            ))
            .unwrap();
        let created = engine
            .create_instance("gated", InstanceOptions::default())
            .unwrap();
        let id = created.instance_id.clone();
        engine
            .start_workflow(&id, InstanceOptions::default())
            .await
            .unwrap();

        let err = engine
            .execute_next_phase(&id, InstanceOptions::default())
            .await
            .unwrap_err();
        match err {
            EngineError::ValidationFailed { errors, phase_id, .. } => {
                assert_eq!(phase_id, "A");
                assert_eq!(errors, vec!["not ready"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let instance = created.instance.lock().await;
        assert_eq!(instance.phases()[0].status, PhaseStatus::Active);
        assert_eq!(instance.status(), InstanceStatus::Running);
        assert_eq!(instance.validation_results().len(), 1);
    }

    #[tokio::test]
    async fn required_artifacts_gate_uses_earlier_outputs() {
        let engine = engine();
        engine
            .register_template(WorkflowTemplate::new(
                "docs",
                vec![
                    StepDefinition::named("pm").with_creates("prd.md"),
                    StepDefinition::named("dev")
                        .with_uses(["prd.md"])
                        .with_gates(["required-artifacts"]),
                ],
            ))
            .unwrap();
        let id = engine
            .create_instance("docs", InstanceOptions::default())
            .unwrap()
            .instance_id;
        engine
            .start_workflow(&id, InstanceOptions::default())
            .await
            .unwrap();

        engine
            .execute_next_phase(&id, InstanceOptions::default())
            .await
            .unwrap();
        let last = engine
            .execute_next_phase(&id, InstanceOptions::default())
            .await
            .unwrap();
        assert_eq!(last.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn validate_reports_without_executing() {
        let engine = engine();
        let created = engine
            .create_instance("t1", InstanceOptions::default())
            .unwrap();
        engine
            .start_workflow(&created.instance_id, InstanceOptions::default())
            .await
            .unwrap();

        let report = engine.validate(&created.instance_id).await.unwrap();
        assert!(report.passed);
        let instance = created.instance.lock().await;
        assert_eq!(instance.phases()[0].status, PhaseStatus::Active);
    }

    #[tokio::test]
    async fn advance_requires_completed_phase() {
        let engine = engine();
        let id = engine
            .create_instance("t1", InstanceOptions::default())
            .unwrap()
            .instance_id;
        assert!(matches!(
            engine.advance_phase(&id).await,
            Err(EngineError::NotRunning { .. })
        ));

        engine
            .start_workflow(&id, InstanceOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            engine.advance_phase(&id).await,
            Err(EngineError::Instance(InstanceError::UnexpectedPhaseStatus { .. }))
        ));
    }

    #[tokio::test]
    async fn paused_instance_rejects_execution() {
        let engine = engine();
        let created = engine
            .create_instance("t1", InstanceOptions::default())
            .unwrap();
        engine
            .start_workflow(&created.instance_id, InstanceOptions::default())
            .await
            .unwrap();
        created.instance.lock().await.pause().unwrap();

        assert!(matches!(
            engine
                .execute_next_phase(&created.instance_id, InstanceOptions::default())
                .await,
            Err(EngineError::NotRunning {
                status: InstanceStatus::Paused,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn missing_handler_is_an_error() {
        let engine = WorkflowEngine::new(ActionRegistry::new());
        engine.register_template(t1()).unwrap();
        let created = engine
            .create_instance("t1", InstanceOptions::default())
            .unwrap();
        engine
            .start_workflow(&created.instance_id, InstanceOptions::default())
            .await
            .unwrap();

        let err = engine
            .execute_next_phase(&created.instance_id, InstanceOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Instance(InstanceError::NoActionHandler { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_during_execution_discards_result() {
        let engine = WorkflowEngine::new(ActionRegistry::with_default(Slow(
            Duration::from_millis(100),
        )));
        engine.register_template(t1()).unwrap();
        let created = engine
            .create_instance("t1", InstanceOptions::default())
            .unwrap();
        let id = created.instance_id.clone();
        engine
            .start_workflow(&id, InstanceOptions::default())
            .await
            .unwrap();

        let engine = Arc::new(engine);
        let runner = {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            tokio::spawn(async move {
                engine
                    .execute_next_phase(&id, InstanceOptions::default())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        created
            .instance
            .lock()
            .await
            .cancel(Some("operator".to_string()))
            .unwrap();

        let result = runner.await.unwrap();
        assert!(matches!(
            result,
            Err(EngineError::ResultDiscarded {
                status: InstanceStatus::Cancelled,
                ..
            })
        ));

        let instance = created.instance.lock().await;
        assert_eq!(instance.progress().completed_phases, 0);
        assert_eq!(instance.phases()[0].status, PhaseStatus::Executing);
    }

    #[tokio::test]
    async fn dispatcher_never_overlaps_handlers() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let engine = Arc::new(WorkflowEngine::new(ActionRegistry::with_default(Overlap {
            running: Arc::clone(&running),
            peak: Arc::clone(&peak),
        })));
        engine.register_template(t1()).unwrap();

        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = engine
                .create_instance("t1", InstanceOptions::default())
                .unwrap()
                .instance_id;
            engine
                .start_workflow(&id, InstanceOptions::default())
                .await
                .unwrap();
            ids.push(id);
        }

        let mut handles = Vec::new();
        for id in ids {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine
                    .execute_next_phase(&id, InstanceOptions::default())
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queued_execution_waits_for_progression() {
        let engine = Arc::new(WorkflowEngine::new(ActionRegistry::with_default(Slow(
            Duration::from_millis(50),
        ))));
        engine.register_template(t1()).unwrap();
        let created = engine
            .create_instance("t1", InstanceOptions::default())
            .unwrap();
        let id = created.instance_id.clone();
        engine
            .start_workflow(&id, InstanceOptions::default())
            .await
            .unwrap();

        let first = {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            tokio::spawn(async move {
                engine
                    .execute_next_phase(&id, InstanceOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            tokio::spawn(async move {
                engine
                    .execute_next_phase(&id, InstanceOptions::default())
                    .await
            })
        };

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.phase.id, "A");
        assert_eq!(first.next_phase.map(|p| p.id).as_deref(), Some("B"));
        assert_eq!(second.phase.id, "B");
        assert_eq!(second.status, InstanceStatus::Completed);

        let instance = created.instance.lock().await;
        assert_eq!(instance.validation_results().len(), 2);
        assert!(instance.validation_results().iter().all(|r| r.passed));
        assert_eq!(instance.validation_results()[1].phase_id, "B");
    }

    #[tokio::test]
    async fn templates_with_duplicate_phase_ids_are_rejected() {
        let engine = engine();
        let err = engine
            .register_template(WorkflowTemplate::new(
                "dup",
                vec![StepDefinition::named("A"), StepDefinition::named("A")],
            ))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTemplate { ref template_id, ref reason }
                if template_id == "dup" && reason.contains("'A'")
        ));
        assert!(engine.get_workflow_template("dup").is_none());

        assert!(matches!(
            engine.register_template(WorkflowTemplate::new(" ", Vec::new())),
            Err(EngineError::InvalidTemplate { .. })
        ));
    }

    #[tokio::test]
    async fn every_phase_keeps_its_own_timing() {
        let engine = WorkflowEngine::new(ActionRegistry::with_default(EchoActionHandler));
        engine
            .register_template(WorkflowTemplate::new(
                "pair",
                vec![
                    StepDefinition::default().with_action("write"),
                    StepDefinition::named("write-review"),
                ],
            ))
            .unwrap();
        let created = engine
            .create_instance("pair", InstanceOptions::default())
            .unwrap();
        let id = created.instance_id.clone();
        engine
            .start_workflow(&id, InstanceOptions::default())
            .await
            .unwrap();
        for _ in 0..2 {
            engine
                .execute_next_phase(&id, InstanceOptions::default())
                .await
                .unwrap();
        }

        let instance = created.instance.lock().await;
        assert_eq!(instance.status(), InstanceStatus::Completed);
        assert_eq!(instance.metrics().phase_timings.len(), 2);
    }

    #[tokio::test]
    async fn validate_rejects_terminal_instances() {
        let engine = engine();
        let created = engine
            .create_instance("t1", InstanceOptions::default())
            .unwrap();
        let id = created.instance_id.clone();
        engine
            .start_workflow(&id, InstanceOptions::default())
            .await
            .unwrap();
        for _ in 0..2 {
            engine
                .execute_next_phase(&id, InstanceOptions::default())
                .await
                .unwrap();
        }
        let recorded = created.instance.lock().await.validation_results().len();

        assert!(matches!(
            engine.validate(&id).await,
            Err(EngineError::NotRunning {
                status: InstanceStatus::Completed,
                ..
            })
        ));
        assert_eq!(
            created.instance.lock().await.validation_results().len(),
            recorded
        );
    }

    #[tokio::test]
    async fn available_workflows_are_sorted() {
        let engine = engine();
        engine
            .register_template(WorkflowTemplate::new("a-first", Vec::new()))
            .unwrap();
        let ids: Vec<String> = engine
            .get_available_workflows()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["a-first", "t1"]);
        assert_eq!(engine.get_workflow_template("t1").unwrap().steps.len(), 2);
    }
}
