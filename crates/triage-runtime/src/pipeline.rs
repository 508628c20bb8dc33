//! Pipeline executor: drives a session's workflow through its stages.
//!
//! Stage execution for one session is serialized by the registry's
//! per-session gate, so a stage never starts before its predecessor is
//! committed. Every committed transition produces exactly one event:
//!
//! | Transition | Event |
//! |---|---|
//! | workflow created | `workflow_started` |
//! | stage completed (not last) or skipped | `workflow_progress` |
//! | last stage completed | `workflow_completed` |
//! | stage failed | `error` |
//! | stage asked the client for input | `user_input_required` |
//! | client answers accepted | `user_input_received` |
//!
//! A stage declared with `collects_input` pauses the workflow when its result
//! carries `"requires_user_input": true`. The workflow resumes once the client
//! submits answers; the stage then runs again with them in
//! [`StageInput::responses`].
//!
//! Stage failures are recorded in the snapshot and returned as `Ok`. `Err`
//! means the request itself was invalid.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use triage_core::{
    Event, RoutingPolicy, SessionId, StageDecision, StageFailure, StageId, StageInput, StageSet,
    TransitionError, WorkflowId, WorkflowState, WorkflowTemplate,
};
use triage_telemetry::metrics::{
    STAGE_DURATION_SECONDS, STAGE_FAILURES_TOTAL, STAGE_RUNS_TOTAL, STAGE_SKIPS_TOTAL,
    WORKFLOWS_ACTIVE, WORKFLOWS_STARTED_TOTAL,
};

use crate::notifier::Notifier;
use crate::registry::SessionRegistry;

/// A pipeline request could not be carried out.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The session has no workflow.
    #[error("session has no workflow")]
    NoWorkflow,
    /// A non-terminal workflow already exists.
    #[error("workflow {0} is still running")]
    WorkflowInProgress(WorkflowId),
    /// The workflow refused the transition.
    #[error(transparent)]
    Transition(#[from] TransitionError),
    /// No collaborator is registered for the stage.
    #[error("no collaborator registered for stage {0}")]
    MissingCollaborator(StageId),
    /// The workflow was replaced or removed while it was being driven.
    #[error("workflow was replaced or removed while running")]
    WorkflowReplaced,
    /// The executor is shutting down.
    #[error("pipeline is shutting down")]
    ShuttingDown,
}

impl PipelineError {
    /// Short classification string for logs and API errors.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NoWorkflow => "no_workflow",
            Self::WorkflowInProgress(_) => "workflow_in_progress",
            Self::Transition(e) => e.error_kind(),
            Self::MissingCollaborator(_) => "missing_collaborator",
            Self::WorkflowReplaced => "workflow_replaced",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Drives workflows for any number of sessions.
pub struct PipelineExecutor {
    registry: Arc<SessionRegistry>,
    notifier: Notifier,
    template: WorkflowTemplate,
    stages: StageSet,
    routing: RoutingPolicy,
    tracker: TaskTracker,
}

impl PipelineExecutor {
    /// Build an executor. Every template stage must have a collaborator.
    pub fn new(
        registry: Arc<SessionRegistry>,
        notifier: Notifier,
        template: WorkflowTemplate,
        stages: StageSet,
        routing: RoutingPolicy,
    ) -> Result<Self, PipelineError> {
        if let Some(missing) = template.stages().iter().find(|s| !stages.contains(&s.id)) {
            return Err(PipelineError::MissingCollaborator(missing.id.clone()));
        }
        Ok(Self {
            registry,
            notifier,
            template,
            stages,
            routing,
            tracker: TaskTracker::new(),
        })
    }

    /// The workflow template in use.
    pub fn template(&self) -> &WorkflowTemplate {
        &self.template
    }

    /// Whether new work is still accepted.
    pub fn is_accepting(&self) -> bool {
        !self.tracker.is_closed()
    }

    /// Background workflows and stage runs still in flight.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Create a fresh running workflow and emit `workflow_started`.
    ///
    /// Rejected while a non-terminal workflow exists for the session. Commit
    /// and emission happen under the session gate, so no stage event of the
    /// new workflow can overtake `workflow_started`.
    #[instrument(skip(self, intake), fields(session_id = %session_id))]
    pub async fn start_workflow(
        &self,
        session_id: &SessionId,
        intake: Value,
    ) -> Result<Arc<WorkflowState>, PipelineError> {
        let gate = self.registry.ensure_pipeline_gate(session_id);
        let _guard = gate.lock().await;
        if !self.is_accepting() {
            return Err(PipelineError::ShuttingDown);
        }
        let state = self.registry.update_workflow_state(session_id, |current| {
            if let Some(existing) = current.filter(|w| !w.is_terminal()) {
                return Err(PipelineError::WorkflowInProgress(existing.workflow_id.clone()));
            }
            Ok(WorkflowState::new(&self.template, intake))
        })?;
        counter!(WORKFLOWS_STARTED_TOTAL).increment(1);
        info!(workflow_id = %state.workflow_id, stages = state.stages.len(), "workflow started");
        let _ = self
            .notifier
            .notify(session_id, &Event::workflow_started(&state));
        Ok(state)
    }

    /// Start a workflow and drive it on a tracked background task.
    ///
    /// Either both happen or neither: once the workflow is committed the
    /// driver is spawned even if shutdown begins in between, and shutdown
    /// waits for it.
    pub async fn launch_workflow(
        self: &Arc<Self>,
        session_id: &SessionId,
        intake: Value,
    ) -> Result<Arc<WorkflowState>, PipelineError> {
        let reservation = self.tracker.token();
        let state = self.start_workflow(session_id, intake).await?;
        self.spawn_tracked(session_id.clone());
        drop(reservation);
        Ok(state)
    }

    /// Run one stage and commit its outcome.
    ///
    /// A collaborator failure marks the workflow failed and is returned as
    /// the committed snapshot.
    #[instrument(skip(self, input), fields(session_id = %session_id, stage = %stage))]
    pub async fn run_stage(
        &self,
        session_id: &SessionId,
        stage: &StageId,
        input: Value,
    ) -> Result<Arc<WorkflowState>, PipelineError> {
        if !self.is_accepting() {
            return Err(PipelineError::ShuttingDown);
        }
        let gate = self
            .registry
            .pipeline_gate(session_id)
            .ok_or(PipelineError::NoWorkflow)?;
        self.tracker
            .track_future(async {
                let _guard = gate.lock().await;
                self.run_stage_locked(session_id, stage, input, None).await
            })
            .await
    }

    /// Record a skip for the next stage and advance.
    #[instrument(skip(self, reason), fields(session_id = %session_id, stage = %stage))]
    pub async fn skip_stage(
        &self,
        session_id: &SessionId,
        stage: &StageId,
        reason: impl Into<String>,
    ) -> Result<Arc<WorkflowState>, PipelineError> {
        let gate = self
            .registry
            .pipeline_gate(session_id)
            .ok_or(PipelineError::NoWorkflow)?;
        let _guard = gate.lock().await;
        self.skip_stage_locked(session_id, stage, reason.into(), None)
    }

    /// Accept the client's answers for a paused stage and resume the workflow.
    ///
    /// Emits `user_input_received`, then drives the remaining stages on a
    /// tracked background task.
    #[instrument(skip(self, responses), fields(session_id = %session_id, stage = %stage))]
    pub async fn submit_stage_input(
        self: &Arc<Self>,
        session_id: &SessionId,
        stage: &StageId,
        responses: Value,
    ) -> Result<Arc<WorkflowState>, PipelineError> {
        let reservation = self.tracker.token();
        let gate = self
            .registry
            .pipeline_gate(session_id)
            .ok_or(PipelineError::NoWorkflow)?;
        let committed = {
            let _guard = gate.lock().await;
            if !self.is_accepting() {
                return Err(PipelineError::ShuttingDown);
            }
            let committed = self.registry.update_workflow_state(session_id, |current| {
                let mut next = current.ok_or(PipelineError::NoWorkflow)?.clone();
                next.record_input(stage, responses)?;
                Ok::<_, PipelineError>(next)
            })?;
            info!(workflow_id = %committed.workflow_id, "client input accepted, resuming");
            let _ = self.notifier.notify(
                session_id,
                &Event::user_input_received(json!({
                    "workflowId": committed.workflow_id,
                    "stage": stage,
                    "currentStage": committed.current_stage,
                    "status": committed.status,
                    "responses": committed.pending_input(),
                })),
            );
            committed
        };
        self.spawn_tracked(session_id.clone());
        drop(reservation);
        Ok(committed)
    }

    /// Run the remaining stages in order, applying the routing policy.
    ///
    /// Stops early when a stage pauses for client input. Drives only the
    /// workflow current when called; returns
    /// [`PipelineError::WorkflowReplaced`] if it is replaced midway.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn run_workflow(&self, session_id: &SessionId) -> Result<Arc<WorkflowState>, PipelineError> {
        let workflow_id = self
            .registry
            .workflow_state(session_id)
            .ok_or(PipelineError::NoWorkflow)?
            .workflow_id
            .clone();

        loop {
            let gate = self
                .registry
                .pipeline_gate(session_id)
                .ok_or(PipelineError::NoWorkflow)?;
            let _guard = gate.lock().await;

            let snapshot = self
                .registry
                .workflow_state(session_id)
                .ok_or(PipelineError::NoWorkflow)?;
            if snapshot.workflow_id != workflow_id {
                return Err(PipelineError::WorkflowReplaced);
            }
            if snapshot.is_awaiting_input() {
                return Ok(snapshot);
            }
            let Some(stage) = snapshot.next_stage().cloned() else {
                return Ok(snapshot);
            };

            let decision = if snapshot.pending_input().is_some() {
                StageDecision::Run
            } else {
                self.template
                    .spec(&stage)
                    .map_or(StageDecision::Run, |spec| self.routing.decide(spec, &snapshot))
            };
            let committed = match decision {
                StageDecision::Run => {
                    self.run_stage_locked(session_id, &stage, snapshot.intake.clone(), Some(&workflow_id))
                        .await?
                }
                StageDecision::Skip(reason) => {
                    self.skip_stage_locked(session_id, &stage, reason, Some(&workflow_id))?
                }
            };
            if committed.is_terminal() || committed.is_awaiting_input() {
                return Ok(committed);
            }
        }
    }

    /// Run [`run_workflow`](Self::run_workflow) on a tracked background task.
    pub fn spawn_workflow(self: &Arc<Self>, session_id: SessionId) -> Result<(), PipelineError> {
        if !self.is_accepting() {
            return Err(PipelineError::ShuttingDown);
        }
        self.spawn_tracked(session_id);
        Ok(())
    }

    fn spawn_tracked(self: &Arc<Self>, session_id: SessionId) {
        let executor = Arc::clone(self);
        gauge!(WORKFLOWS_ACTIVE).increment(1.0);
        let _ = self.tracker.spawn(async move {
            match executor.run_workflow(&session_id).await {
                Ok(state) => info!(
                    session_id = %session_id,
                    workflow_id = %state.workflow_id,
                    status = %state.status,
                    "workflow finished"
                ),
                Err(e) => warn!(session_id = %session_id, error = %e, "workflow aborted"),
            }
            gauge!(WORKFLOWS_ACTIVE).decrement(1.0);
        });
    }

    /// Stop accepting work and wait up to `timeout` for in-flight stages.
    ///
    /// Returns `true` if everything finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let _ = self.tracker.close();
        info!(
            in_flight = self.tracker.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for in-flight workflows"
        );
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            true
        } else {
            warn!(
                remaining = self.tracker.len(),
                "pipeline shutdown timed out after {timeout:?}"
            );
            false
        }
    }

    // ── internals; callers hold the session gate ─────────────────────────

    async fn run_stage_locked(
        &self,
        session_id: &SessionId,
        stage: &StageId,
        input: Value,
        expected: Option<&WorkflowId>,
    ) -> Result<Arc<WorkflowState>, PipelineError> {
        let snapshot = self
            .registry
            .workflow_state(session_id)
            .ok_or(PipelineError::NoWorkflow)?;
        if expected.is_some_and(|id| *id != snapshot.workflow_id) {
            return Err(PipelineError::WorkflowReplaced);
        }
        snapshot.ensure_next(stage)?;
        let collaborator = self
            .stages
            .get(stage)
            .ok_or_else(|| PipelineError::MissingCollaborator(stage.clone()))?;

        let workflow_id = snapshot.workflow_id.clone();
        let stage_input = StageInput {
            session_id: session_id.clone(),
            workflow_id: workflow_id.clone(),
            stage: stage.clone(),
            input,
            prior_results: snapshot.completed_results(),
            responses: snapshot.pending_input().cloned(),
        };

        counter!(STAGE_RUNS_TOTAL, "stage" => stage.to_string()).increment(1);
        let started = Instant::now();
        let outcome = collaborator.invoke(stage_input).await;
        histogram!(STAGE_DURATION_SECONDS, "stage" => stage.to_string())
            .record(started.elapsed().as_secs_f64());

        let pauses = outcome.as_ref().is_ok_and(|result| {
            self.template
                .spec(stage)
                .is_some_and(|spec| spec.requests_input(result))
        });
        let committed = self.registry.update_workflow_state(session_id, |current| {
            let current = current.ok_or(PipelineError::WorkflowReplaced)?;
            if current.workflow_id != workflow_id {
                return Err(PipelineError::WorkflowReplaced);
            }
            let mut next = current.clone();
            match &outcome {
                Ok(result) if pauses => next.record_input_request(stage, result.clone())?,
                Ok(result) => next.record_success(stage, result.clone())?,
                Err(failure) => next.record_failure(stage, failure)?,
            }
            Ok(next)
        })?;

        let event = match &outcome {
            Ok(result) if pauses => {
                info!("stage paused for client input");
                Event::user_input_required(self.stage_summary(&committed, stage, Some(result), None))
            }
            Ok(result) => {
                debug!(elapsed_ms = started.elapsed().as_millis(), "stage completed");
                let data = self.stage_summary(&committed, stage, Some(result), None);
                if committed.is_terminal() {
                    Event::workflow_completed(data)
                } else {
                    Event::workflow_progress(data)
                }
            }
            Err(failure) => {
                counter!(STAGE_FAILURES_TOTAL, "stage" => stage.to_string()).increment(1);
                warn!(error = %failure, retryable = failure.retryable, "stage failed");
                failure_event(&committed, stage, failure)
            }
        };
        let _ = self.notifier.notify(session_id, &event);
        Ok(committed)
    }

    fn skip_stage_locked(
        &self,
        session_id: &SessionId,
        stage: &StageId,
        reason: String,
        expected: Option<&WorkflowId>,
    ) -> Result<Arc<WorkflowState>, PipelineError> {
        let committed = self.registry.update_workflow_state(session_id, |current| {
            let current = current.ok_or(PipelineError::NoWorkflow)?;
            if expected.is_some_and(|id| *id != current.workflow_id) {
                return Err(PipelineError::WorkflowReplaced);
            }
            let mut next = current.clone();
            next.record_skip(stage, reason.clone())?;
            Ok(next)
        })?;
        counter!(STAGE_SKIPS_TOTAL, "stage" => stage.to_string()).increment(1);
        debug!(reason = %reason, "stage skipped");

        let data = self.stage_summary(&committed, stage, None, Some(&reason));
        let event = if committed.is_terminal() {
            Event::workflow_completed(data)
        } else {
            Event::workflow_progress(data)
        };
        let _ = self.notifier.notify(session_id, &event);
        Ok(committed)
    }

    fn stage_summary(
        &self,
        state: &WorkflowState,
        stage: &StageId,
        result: Option<&Value>,
        skip_reason: Option<&str>,
    ) -> Value {
        let spec = self.template.spec(stage);
        let mut data = json!({
            "workflowId": state.workflow_id,
            "stage": stage,
            "description": spec.map(|s| s.description.as_str()),
            "progress": spec.map(|s| s.progress),
            "currentStage": state.current_stage,
            "totalStages": state.stages.len(),
            "status": state.status,
            "result": result,
            "skipped": skip_reason.is_some(),
        });
        if let (Some(reason), Some(obj)) = (skip_reason, data.as_object_mut()) {
            let _ = obj.insert("reason".into(), Value::String(reason.to_owned()));
        }
        if state.is_terminal() {
            if let Some(obj) = data.as_object_mut() {
                let _ = obj.insert("results".into(), json!(state.completed_results()));
            }
        }
        data
    }
}

fn failure_event(state: &WorkflowState, stage: &StageId, failure: &StageFailure) -> Event {
    Event::error(
        format!("Stage {stage} failed: {failure}"),
        Some(json!({
            "workflowId": state.workflow_id,
            "stage": stage,
            "retryable": failure.retryable,
            "currentStage": state.current_stage,
            "status": state.status,
        })),
    )
}
