//! Workflow templates and per-session workflow snapshots.
//!
//! A [`WorkflowTemplate`] declares the ordered stages of a diagnostic
//! encounter. A [`WorkflowState`] is the progress record of one workflow
//! instance. Snapshots are plain values: the registry stores them behind an
//! `Arc` and replaces them whole, so a reader never sees a stage index paired
//! with stale results.
//!
//! Transition rules enforced here:
//! - stages settle strictly in declared order
//! - `current_stage` never decreases
//! - `completed` and `failed` are terminal
//! - `awaiting_input` accepts only the client's answers for the paused stage

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{StageFailure, TemplateError, TransitionError};
use crate::ids::{StageId, WorkflowId};

/// Overall status of a workflow instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Stages remain to be settled.
    Running,
    /// Paused until the client answers the current stage.
    AwaitingInput,
    /// Every stage completed or was skipped.
    Completed,
    /// A stage failed; the workflow is frozen.
    Failed,
}

impl WorkflowStatus {
    /// Whether no further transitions are accepted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::AwaitingInput => "awaiting_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded for one settled stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageRecord {
    /// The collaborator returned a result.
    #[serde(rename_all = "camelCase")]
    Completed {
        /// Opaque collaborator result.
        result: Value,
        /// When the result was committed.
        completed_at: DateTime<Utc>,
    },
    /// The collaborator failed; the workflow is now `failed`.
    #[serde(rename_all = "camelCase")]
    Failed {
        /// Failure description.
        error: String,
        /// Whether the collaborator marked the failure as transient.
        retryable: bool,
        /// When the failure was committed.
        failed_at: DateTime<Utc>,
    },
    /// The stage asked the client for input; the workflow is paused.
    #[serde(rename_all = "camelCase")]
    AwaitingInput {
        /// What the collaborator asked (questions, instructions).
        prompt: Value,
        /// When the pause was committed.
        requested_at: DateTime<Utc>,
    },
    /// The client answered; the stage runs again with the answers.
    #[serde(rename_all = "camelCase")]
    InputReceived {
        /// What the collaborator asked.
        prompt: Value,
        /// The client's answers.
        responses: Value,
        /// When the answers were committed.
        received_at: DateTime<Utc>,
    },
    /// The routing policy decided the stage was not needed.
    #[serde(rename_all = "camelCase")]
    Skipped {
        /// Why the stage was skipped.
        reason: String,
        /// When the skip was committed.
        skipped_at: DateTime<Utc>,
    },
}

/// Condition under which a template stage runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageGate {
    /// Always runs.
    #[default]
    Always,
    /// Runs only when the diagnosis confidence is below threshold.
    LowConfidence,
    /// Runs only when an image is available or requested.
    ImageAvailable,
}

/// One declared stage of a workflow template.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage identifier.
    pub id: StageId,
    /// Human description shown to clients while the stage runs.
    pub description: String,
    /// Progress percentage reached once the stage settles.
    pub progress: u8,
    /// Routing gate.
    #[serde(default)]
    pub gate: StageGate,
    /// Whether the stage may pause the workflow to ask the client questions.
    #[serde(default)]
    pub collects_input: bool,
}

impl StageSpec {
    /// A stage that always runs.
    pub fn new(id: impl Into<String>, description: impl Into<String>, progress: u8) -> Self {
        Self {
            id: StageId::new(id),
            description: description.into(),
            progress: progress.min(100),
            gate: StageGate::Always,
            collects_input: false,
        }
    }

    /// Attach a routing gate.
    #[must_use]
    pub fn with_gate(mut self, gate: StageGate) -> Self {
        self.gate = gate;
        self
    }

    /// Allow the stage to pause the workflow for client input.
    #[must_use]
    pub fn with_user_input(mut self) -> Self {
        self.collects_input = true;
        self
    }

    /// Whether `result` asks the client for input.
    ///
    /// Only stages declared with [`with_user_input`](Self::with_user_input)
    /// can pause; they do so when the result carries
    /// `"requires_user_input": true`.
    pub fn requests_input(&self, result: &Value) -> bool {
        self.collects_input
            && result
                .get("requires_user_input")
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }
}

/// Ordered stage declaration for a workflow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    stages: Vec<StageSpec>,
}

impl WorkflowTemplate {
    /// Build a template, rejecting empty or duplicated stage lists.
    pub fn new(stages: Vec<StageSpec>) -> Result<Self, TemplateError> {
        if stages.is_empty() {
            return Err(TemplateError::Empty);
        }
        let mut seen = HashSet::new();
        for spec in &stages {
            if !seen.insert(spec.id.clone()) {
                return Err(TemplateError::DuplicateStage(spec.id.clone()));
            }
        }
        Ok(Self { stages })
    }

    /// The full diagnostic pipeline.
    pub fn diagnostic() -> Self {
        Self {
            stages: vec![
                StageSpec::new(StageId::LLM_DIAGNOSIS, "Analyzing symptoms", 20),
                StageSpec::new(
                    StageId::FOLLOW_UP_INTERACTION,
                    "Generating follow-up questions",
                    40,
                )
                .with_gate(StageGate::LowConfidence)
                .with_user_input(),
                StageSpec::new(
                    StageId::IMAGE_CLASSIFICATION,
                    "Processing medical images",
                    60,
                )
                .with_gate(StageGate::ImageAvailable),
                StageSpec::new(
                    StageId::OVERALL_ANALYSIS,
                    "Comprehensive medical analysis",
                    80,
                ),
                StageSpec::new(
                    StageId::TREATMENT_RECOMMENDATION,
                    "Finding healthcare recommendations",
                    90,
                ),
                StageSpec::new(StageId::REPORT_GENERATION, "Generating medical report", 100),
            ],
        }
    }

    /// Ungated template over the given ids with evenly spread progress.
    pub fn linear(ids: &[&str]) -> Result<Self, TemplateError> {
        let total = ids.len().max(1);
        let specs = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                #[allow(clippy::cast_possible_truncation)]
                let progress = ((i + 1) * 100 / total) as u8;
                StageSpec::new(*id, *id, progress)
            })
            .collect();
        Self::new(specs)
    }

    /// Declared stages in order.
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Stage ids in order.
    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id.clone()).collect()
    }

    /// Look up a stage declaration.
    pub fn spec(&self, stage: &StageId) -> Option<&StageSpec> {
        self.stages.iter().find(|s| &s.id == stage)
    }
}

/// Progress record of one workflow instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    /// Instance identifier.
    pub workflow_id: WorkflowId,
    /// Declared stages in execution order.
    pub stages: Vec<StageId>,
    /// Number of settled stages; index of the next stage to run.
    pub current_stage: usize,
    /// Overall status.
    pub status: WorkflowStatus,
    /// Per-stage outcomes.
    pub results: BTreeMap<StageId, StageRecord>,
    /// Intake payload the workflow was started with.
    pub intake: Value,
    /// When the workflow started.
    pub started_at: DateTime<Utc>,
    /// When the snapshot last changed.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Fresh running workflow for a template.
    pub fn new(template: &WorkflowTemplate, intake: Value) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: WorkflowId::new(),
            stages: template.stage_ids(),
            current_stage: 0,
            status: WorkflowStatus::Running,
            results: BTreeMap::new(),
            intake,
            started_at: now,
            updated_at: now,
        }
    }

    /// Whether the workflow reached `completed` or `failed`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The next stage to run, if the workflow is still running.
    pub fn next_stage(&self) -> Option<&StageId> {
        if self.is_terminal() {
            return None;
        }
        self.stages.get(self.current_stage)
    }

    /// Whether `stage` is the last declared stage.
    pub fn is_final_stage(&self, stage: &StageId) -> bool {
        self.stages.last() == Some(stage)
    }

    /// Whether the workflow is paused for client input.
    pub fn is_awaiting_input(&self) -> bool {
        self.status == WorkflowStatus::AwaitingInput
    }

    /// Answers submitted for the current stage, if it is being resumed.
    pub fn pending_input(&self) -> Option<&Value> {
        let stage = self.stages.get(self.current_stage)?;
        match self.results.get(stage) {
            Some(StageRecord::InputReceived { responses, .. }) => Some(responses),
            _ => None,
        }
    }

    /// Check that `stage` may settle next.
    pub fn ensure_next(&self, stage: &StageId) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal {
                status: self.status,
            });
        }
        let Some(expected) = self.stages.get(self.current_stage) else {
            return Err(TransitionError::Exhausted);
        };
        if self.is_awaiting_input() {
            return Err(TransitionError::AwaitingInput {
                stage: expected.clone(),
            });
        }
        if expected != stage {
            return Err(TransitionError::OutOfOrder {
                expected: expected.clone(),
                actual: stage.clone(),
            });
        }
        Ok(())
    }

    /// Commit a successful stage and advance.
    pub fn record_success(&mut self, stage: &StageId, result: Value) -> Result<(), TransitionError> {
        self.ensure_next(stage)?;
        let now = Utc::now();
        let _ = self.results.insert(
            stage.clone(),
            StageRecord::Completed {
                result,
                completed_at: now,
            },
        );
        self.advance(now);
        Ok(())
    }

    /// Commit a skipped stage and advance.
    pub fn record_skip(
        &mut self,
        stage: &StageId,
        reason: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.ensure_next(stage)?;
        let now = Utc::now();
        let _ = self.results.insert(
            stage.clone(),
            StageRecord::Skipped {
                reason: reason.into(),
                skipped_at: now,
            },
        );
        self.advance(now);
        Ok(())
    }

    /// Pause on `stage` until the client answers `prompt`. Does not advance.
    pub fn record_input_request(
        &mut self,
        stage: &StageId,
        prompt: Value,
    ) -> Result<(), TransitionError> {
        self.ensure_next(stage)?;
        let now = Utc::now();
        let _ = self.results.insert(
            stage.clone(),
            StageRecord::AwaitingInput {
                prompt,
                requested_at: now,
            },
        );
        self.status = WorkflowStatus::AwaitingInput;
        self.updated_at = now;
        Ok(())
    }

    /// Store the client's answers for the paused stage and resume.
    ///
    /// The stage stays current; it settles when it runs again.
    pub fn record_input(&mut self, stage: &StageId, responses: Value) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal {
                status: self.status,
            });
        }
        if !self.is_awaiting_input() {
            return Err(TransitionError::NotAwaitingInput);
        }
        let expected = self
            .stages
            .get(self.current_stage)
            .ok_or(TransitionError::Exhausted)?;
        if expected != stage {
            return Err(TransitionError::OutOfOrder {
                expected: expected.clone(),
                actual: stage.clone(),
            });
        }
        let prompt = match self.results.remove(stage) {
            Some(StageRecord::AwaitingInput { prompt, .. }) => prompt,
            _ => Value::Null,
        };
        let now = Utc::now();
        let _ = self.results.insert(
            stage.clone(),
            StageRecord::InputReceived {
                prompt,
                responses,
                received_at: now,
            },
        );
        self.status = WorkflowStatus::Running;
        self.updated_at = now;
        Ok(())
    }

    /// Commit a failed stage. The workflow becomes terminal without advancing.
    pub fn record_failure(
        &mut self,
        stage: &StageId,
        failure: &StageFailure,
    ) -> Result<(), TransitionError> {
        self.ensure_next(stage)?;
        let now = Utc::now();
        let _ = self.results.insert(
            stage.clone(),
            StageRecord::Failed {
                error: failure.message.clone(),
                retryable: failure.retryable,
                failed_at: now,
            },
        );
        self.status = WorkflowStatus::Failed;
        self.updated_at = now;
        Ok(())
    }

    /// Result of a completed stage.
    pub fn result(&self, stage: &str) -> Option<&Value> {
        match self.results.get(&StageId::from(stage)) {
            Some(StageRecord::Completed { result, .. }) => Some(result),
            _ => None,
        }
    }

    /// Results of all completed stages, for handing to later stages.
    pub fn completed_results(&self) -> BTreeMap<StageId, Value> {
        self.results
            .iter()
            .filter_map(|(stage, record)| match record {
                StageRecord::Completed { result, .. } => Some((stage.clone(), result.clone())),
                _ => None,
            })
            .collect()
    }

    fn advance(&mut self, now: DateTime<Utc>) {
        self.current_stage += 1;
        if self.current_stage >= self.stages.len() {
            self.status = WorkflowStatus::Completed;
        }
        self.updated_at = now;
    }
}
