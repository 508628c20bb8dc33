//! Error types shared across the orchestrator.
//!
//! - [`TransitionError`]: a workflow refused a stage transition
//! - [`StageFailure`]: an external stage collaborator reported failure
//! - [`TemplateError`]: a workflow template was declared inconsistently

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::StageId;
use crate::workflow::WorkflowStatus;

/// A workflow snapshot rejected a requested transition.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// The workflow already reached `completed` or `failed`.
    #[error("workflow is {status} and accepts no further transitions")]
    Terminal {
        /// Terminal status the workflow is in.
        status: WorkflowStatus,
    },

    /// The requested stage is not the next stage in declared order.
    #[error("stage {actual} is out of order (expected {expected})")]
    OutOfOrder {
        /// The next stage the workflow expects.
        expected: StageId,
        /// The stage that was requested.
        actual: StageId,
    },

    /// Every declared stage has already been settled.
    #[error("no stages remain")]
    Exhausted,

    /// The workflow is paused until the client answers `stage`.
    #[error("workflow is waiting for input on stage {stage}")]
    AwaitingInput {
        /// The stage that asked for input.
        stage: StageId,
    },

    /// Input was submitted while the workflow was not asking for any.
    #[error("workflow is not waiting for input")]
    NotAwaitingInput,
}

impl TransitionError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Terminal { .. } => "terminal",
            Self::OutOfOrder { .. } => "out_of_order",
            Self::Exhausted => "exhausted",
            Self::AwaitingInput { .. } => "awaiting_input",
            Self::NotAwaitingInput => "not_awaiting_input",
        }
    }
}

/// A workflow template declaration was rejected.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// Templates must declare at least one stage.
    #[error("workflow template declares no stages")]
    Empty,

    /// A stage id appears more than once.
    #[error("stage {0} is declared more than once")]
    DuplicateStage(StageId),
}

/// Failure reported by a stage collaborator.
///
/// Recorded verbatim in the workflow's per-stage results. The core never
/// retries; `retryable` is informational for the caller.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct StageFailure {
    /// Human-readable failure description.
    pub message: String,
    /// Whether the collaborator considers the failure transient.
    pub retryable: bool,
}

impl StageFailure {
    /// A non-retryable failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// A transient failure (rate limits, network, upstream 5xx).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}
