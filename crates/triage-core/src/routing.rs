//! Run-or-skip decisions for gated stages.

use serde_json::Value;

use crate::ids::StageId;
use crate::workflow::{StageGate, StageSpec, WorkflowState};

/// Default confidence below which follow-up questions are generated.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.6;

/// Whether a stage should run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageDecision {
    /// Invoke the collaborator.
    Run,
    /// Record a skip with the given reason.
    Skip(String),
}

/// Evaluates stage gates against a workflow snapshot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RoutingPolicy {
    /// Diagnosis confidence below which `low_confidence` stages run.
    pub confidence_threshold: f64,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

impl RoutingPolicy {
    /// Policy with a custom threshold.
    pub fn new(confidence_threshold: f64) -> Self {
        Self {
            confidence_threshold,
        }
    }

    /// Decide whether `spec` runs given what the workflow has produced so far.
    pub fn decide(&self, spec: &StageSpec, state: &WorkflowState) -> StageDecision {
        match spec.gate {
            StageGate::Always => StageDecision::Run,
            StageGate::LowConfidence => {
                let confidence = average_confidence(state.result(StageId::LLM_DIAGNOSIS));
                if confidence < self.confidence_threshold {
                    StageDecision::Run
                } else {
                    StageDecision::Skip(format!(
                        "diagnosis confidence {confidence:.2} meets threshold {:.2}",
                        self.confidence_threshold
                    ))
                }
            }
            StageGate::ImageAvailable => {
                if image_available(state) {
                    StageDecision::Run
                } else {
                    StageDecision::Skip("no image provided or requested".into())
                }
            }
        }
    }
}

/// Mean `diagnosis_confidence` across the diagnosis entries.
///
/// Accepts either `{"textual_analysis": [...]}` or a bare array of entries.
/// Missing or empty input yields `0.0`.
pub fn average_confidence(diagnosis: Option<&Value>) -> f64 {
    let entries: &[Value] = match diagnosis {
        Some(Value::Array(items)) => items.as_slice(),
        Some(Value::Object(map)) => match map.get("textual_analysis") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    let scores: Vec<f64> = entries
        .iter()
        .filter_map(|e| e.get("diagnosis_confidence").and_then(Value::as_f64))
        .collect();
    if scores.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = scores.len() as f64;
    scores.iter().sum::<f64>() / n
}

fn image_available(state: &WorkflowState) -> bool {
    let in_intake = state.intake.get("image").is_some_and(|v| !v.is_null());
    let requested = state
        .result(StageId::LLM_DIAGNOSIS)
        .and_then(|r| r.get("image_required"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    in_intake || requested
}
