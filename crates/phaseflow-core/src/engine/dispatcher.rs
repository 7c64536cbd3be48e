//! Serialized execution dispatcher.
//!
//! Every mutating engine operation becomes a `QueueTask` sent over a bounded
//! mpsc channel. A single consumer task drains the channel into a local FIFO
//! and fully processes one task before looking at the next, so two operations
//! never interleave their writes, whether they target the same instance or
//! different ones. The `next_phase` follow-up of a successful execution is
//! put at the front of the FIFO, so an execution and its progression are
//! never split by another task.
//!
//! The instance lock is released while an action handler runs. Operator
//! actions that bypass the queue (pause, cancel) can therefore land while a
//! phase is executing; the handler's result is discarded if the instance has
//! become terminal in the meantime.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use phaseflow_types::instance::{InstanceOptions, InstanceStatus, Phase};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::action::ActionRegistry;
use crate::gate::{GateRegistry, GateReport};
use crate::instance::InstanceError;

use super::{EngineError, PhaseExecution, Progression, SharedInstance};

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

// ---------------------------------------------------------------------------
// QueueTask
// ---------------------------------------------------------------------------

/// Kind of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Start,
    ExecutePhase,
    NextPhase,
    Validate,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Start => "start",
            TaskKind::ExecutePhase => "execute_phase",
            TaskKind::NextPhase => "next_phase",
            TaskKind::Validate => "validate",
        }
    }
}

/// Operation payload, carrying the channel the result is delivered on.
pub(crate) enum Operation {
    Start(Reply<Option<Phase>>),
    ExecutePhase(Reply<PhaseExecution>),
    NextPhase(NextPhaseReply),
    Validate(Reply<GateReport>),
}

/// Who is waiting on a `next_phase` task.
pub(crate) enum NextPhaseReply {
    /// A standalone `advance_phase` call.
    Advance(Reply<Progression>),
    /// The follow-up of an `execute_phase` task; the caller is still waiting
    /// for the combined result.
    FollowUp {
        executed: Phase,
        result: Value,
        reply: Reply<PhaseExecution>,
    },
}

/// One pending mutating operation.
pub(crate) struct QueueTask {
    pub id: Uuid,
    pub instance_id: String,
    pub options: InstanceOptions,
    pub enqueued_at: DateTime<Utc>,
    pub operation: Operation,
}

impl QueueTask {
    pub fn new(instance_id: impl Into<String>, options: InstanceOptions, operation: Operation) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id: instance_id.into(),
            options,
            enqueued_at: Utc::now(),
            operation,
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self.operation {
            Operation::Start(_) => TaskKind::Start,
            Operation::ExecutePhase(_) => TaskKind::ExecutePhase,
            Operation::NextPhase(_) => TaskKind::NextPhase,
            Operation::Validate(_) => TaskKind::Validate,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Single consumer of the engine's task channel.
pub(crate) struct Dispatcher {
    rx: mpsc::Receiver<QueueTask>,
    pending: VecDeque<QueueTask>,
    instances: Arc<DashMap<String, SharedInstance>>,
    gates: Arc<GateRegistry>,
    actions: Arc<ActionRegistry>,
}

impl Dispatcher {
    pub fn new(
        rx: mpsc::Receiver<QueueTask>,
        instances: Arc<DashMap<String, SharedInstance>>,
        gates: Arc<GateRegistry>,
        actions: Arc<ActionRegistry>,
    ) -> Self {
        Self {
            rx,
            pending: VecDeque::new(),
            instances,
            gates,
            actions,
        }
    }

    /// Process tasks until every sender is dropped and the queue is empty.
    pub async fn run(mut self) {
        tracing::debug!("dispatcher started");
        loop {
            if self.pending.is_empty() {
                match self.rx.recv().await {
                    Some(task) => self.pending.push_back(task),
                    None => break,
                }
            }
            self.drain_channel();

            if let Some(task) = self.pending.pop_front() {
                self.process(task).await;
            }
        }
        tracing::debug!("dispatcher stopped");
    }

    fn drain_channel(&mut self) {
        while let Ok(task) = self.rx.try_recv() {
            self.pending.push_back(task);
        }
    }

    async fn process(&mut self, task: QueueTask) {
        let kind = task.kind();
        let waited_ms = (Utc::now() - task.enqueued_at).num_milliseconds();
        tracing::debug!(
            task_id = %task.id,
            instance_id = task.instance_id.as_str(),
            kind = kind.as_str(),
            waited_ms,
            "processing task"
        );

        let QueueTask {
            instance_id,
            options,
            operation,
            ..
        } = task;

        match operation {
            Operation::Start(reply) => {
                let _ = reply.send(self.start(&instance_id, options).await);
            }
            Operation::ExecutePhase(reply) => match self.execute_phase(&instance_id, &options).await {
                Ok((executed, result)) => {
                    // The progression runs before anything else queued.
                    self.pending.push_front(QueueTask::new(
                        instance_id,
                        options,
                        Operation::NextPhase(NextPhaseReply::FollowUp {
                            executed,
                            result,
                            reply,
                        }),
                    ));
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Operation::NextPhase(NextPhaseReply::Advance(reply)) => {
                let _ = reply.send(self.advance(&instance_id).await);
            }
            Operation::NextPhase(NextPhaseReply::FollowUp {
                executed,
                result,
                reply,
            }) => {
                let outcome = self
                    .next_phase(&instance_id)
                    .await
                    .map(|(progression, status)| PhaseExecution {
                        success: true,
                        phase: executed,
                        result,
                        next_phase: match progression {
                            Progression::Advanced(phase) => Some(phase),
                            _ => None,
                        },
                        status,
                    });
                let _ = reply.send(outcome);
            }
            Operation::Validate(reply) => {
                let _ = reply.send(self.validate(&instance_id).await);
            }
        }
    }

    fn lookup(&self, instance_id: &str) -> Result<SharedInstance, EngineError> {
        self.instances
            .get(instance_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))
    }

    // -- operations ---------------------------------------------------------

    async fn start(
        &self,
        instance_id: &str,
        options: InstanceOptions,
    ) -> Result<Option<Phase>, EngineError> {
        let shared = self.lookup(instance_id)?;
        let mut instance = shared.lock().await;
        instance.start(options)?;

        if instance.phases().is_empty() {
            instance.complete()?;
        }
        Ok(instance.current_phase().cloned())
    }

    /// Gate check, then run the handler with the instance unlocked.
    async fn execute_phase(
        &self,
        instance_id: &str,
        options: &InstanceOptions,
    ) -> Result<(Phase, Value), EngineError> {
        let shared = self.lookup(instance_id)?;

        let (handler, invocation) = {
            let mut instance = shared.lock().await;
            if instance.status() != InstanceStatus::Running {
                return Err(EngineError::NotRunning {
                    instance_id: instance_id.to_string(),
                    status: instance.status(),
                });
            }
            let phase = instance
                .current_phase()
                .cloned()
                .ok_or_else(|| EngineError::NoCurrentPhase(instance_id.to_string()))?;

            let report = self.gates.run(&instance, &phase);
            instance.record_validation(phase.index, &report);
            if !report.passed {
                tracing::info!(
                    instance_id,
                    phase = phase.id.as_str(),
                    errors = report.errors.len(),
                    "validation gates failed"
                );
                return Err(EngineError::ValidationFailed {
                    instance_id: instance_id.to_string(),
                    phase_id: phase.id,
                    errors: report.errors,
                });
            }
            for warning in &report.warnings {
                tracing::warn!(instance_id, phase = phase.id.as_str(), warning = warning.as_str(), "gate warning");
            }

            let handler = self.actions.resolve(&phase.definition).ok_or_else(|| {
                InstanceError::NoActionHandler {
                    phase_id: phase.id.clone(),
                }
            })?;
            (handler, instance.begin_execution(options)?)
        };

        tracing::debug!(
            instance_id,
            phase = invocation.phase.id.as_str(),
            handler = handler.name(),
            "invoking action handler"
        );
        let outcome = handler.execute(&invocation).await;

        let mut instance = shared.lock().await;
        if instance.status().is_terminal() {
            tracing::warn!(
                instance_id,
                phase = invocation.phase.id.as_str(),
                status = %instance.status(),
                "discarding phase result for terminal instance"
            );
            return Err(EngineError::ResultDiscarded {
                instance_id: instance_id.to_string(),
                status: instance.status(),
            });
        }

        match outcome {
            Ok(result) => {
                let output = result.output.clone();
                let phase = instance.complete_execution(result)?;
                Ok((phase, output))
            }
            Err(err) => {
                let error = err.to_string();
                let phase = instance.fail_execution(error.clone())?;
                Err(EngineError::PhaseFailed {
                    instance_id: instance_id.to_string(),
                    phase_id: phase.id,
                    error,
                })
            }
        }
    }

    /// Standalone progression request. Requires a running instance.
    async fn advance(&self, instance_id: &str) -> Result<Progression, EngineError> {
        {
            let shared = self.lookup(instance_id)?;
            let instance = shared.lock().await;
            if instance.status() != InstanceStatus::Running {
                return Err(EngineError::NotRunning {
                    instance_id: instance_id.to_string(),
                    status: instance.status(),
                });
            }
        }
        self.next_phase(instance_id)
            .await
            .map(|(progression, _)| progression)
    }

    /// Move to the next phase, or complete the instance after the last one.
    async fn next_phase(
        &self,
        instance_id: &str,
    ) -> Result<(Progression, InstanceStatus), EngineError> {
        let shared = self.lookup(instance_id)?;
        let mut instance = shared.lock().await;

        if instance.status().is_terminal() {
            return Ok((Progression::Halted(instance.status()), instance.status()));
        }

        let progression = if instance.current_phase_index() + 1 < instance.phases().len() {
            match instance.move_to_next_phase()? {
                Some(phase) => Progression::Advanced(phase),
                None => Progression::Halted(instance.status()),
            }
        } else {
            instance.complete()?;
            Progression::Completed
        };
        Ok((progression, instance.status()))
    }

    /// Gate check only. Terminal instances have nothing left to validate.
    async fn validate(&self, instance_id: &str) -> Result<GateReport, EngineError> {
        let shared = self.lookup(instance_id)?;
        let mut instance = shared.lock().await;
        if instance.status().is_terminal() {
            return Err(EngineError::NotRunning {
                instance_id: instance_id.to_string(),
                status: instance.status(),
            });
        }
        let phase = instance
            .current_phase()
            .cloned()
            .ok_or_else(|| EngineError::NoCurrentPhase(instance_id.to_string()))?;

        let report = self.gates.run(&instance, &phase);
        instance.record_validation(phase.index, &report);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_kind_follows_operation() {
        let (tx, _rx) = oneshot::channel();
        let task = QueueTask::new("i-1", InstanceOptions::default(), Operation::Validate(tx));
        assert_eq!(task.kind(), TaskKind::Validate);
        assert_eq!(task.kind().as_str(), "validate");
        assert_eq!(task.instance_id, "i-1");
        assert!(task.enqueued_at <= Utc::now());
    }
}
