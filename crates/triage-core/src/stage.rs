//! Contract between the executor and external stage collaborators.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::errors::StageFailure;
use crate::ids::{SessionId, StageId, WorkflowId};

/// Payload handed to a collaborator for one stage invocation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageInput {
    /// Session the workflow belongs to.
    pub session_id: SessionId,
    /// Workflow instance being advanced.
    pub workflow_id: WorkflowId,
    /// Stage being invoked.
    pub stage: StageId,
    /// Stage-specific input (the intake when driven automatically).
    pub input: Value,
    /// Results of the stages completed so far.
    pub prior_results: BTreeMap<StageId, Value>,
    /// Client answers when a paused stage is resumed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responses: Option<Value>,
}

/// An external component that performs the work of one stage.
///
/// The core imposes no timeout; collaborators own their own deadlines.
#[async_trait]
pub trait StageCollaborator: Send + Sync {
    /// Run the stage.
    async fn invoke(&self, input: StageInput) -> Result<Value, StageFailure>;
}

/// Collaborators keyed by stage, injected into the executor.
#[derive(Clone, Default)]
pub struct StageSet {
    collaborators: HashMap<StageId, Arc<dyn StageCollaborator>>,
}

impl StageSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the collaborator for `stage`, replacing any previous one.
    #[must_use]
    pub fn with(mut self, stage: impl Into<String>, collaborator: Arc<dyn StageCollaborator>) -> Self {
        let _ = self
            .collaborators
            .insert(StageId::new(stage), collaborator);
        self
    }

    /// Collaborator for `stage`.
    pub fn get(&self, stage: &StageId) -> Option<Arc<dyn StageCollaborator>> {
        self.collaborators.get(stage).cloned()
    }

    /// Whether `stage` has a collaborator.
    pub fn contains(&self, stage: &StageId) -> bool {
        self.collaborators.contains_key(stage)
    }

    /// Number of registered collaborators.
    pub fn len(&self) -> usize {
        self.collaborators.len()
    }

    /// Whether no collaborators are registered.
    pub fn is_empty(&self) -> bool {
        self.collaborators.is_empty()
    }
}

impl fmt::Debug for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stages: Vec<&str> = self.collaborators.keys().map(StageId::as_str).collect();
        stages.sort_unstable();
        f.debug_struct("StageSet").field("stages", &stages).finish()
    }
}
