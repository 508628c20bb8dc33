//! REST handlers. Each one is a thin translation onto the runtime.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use triage_core::{Event, SessionId, StageId, WorkflowState};
use triage_runtime::SessionSummary;

use crate::error::ApiError;
use crate::health::{self, HealthResponse};
use crate::server::AppState;

/// Body of `POST /sessions/{session_id}/workflow`.
#[derive(Debug, Default, Deserialize)]
pub struct StartWorkflowRequest {
    /// Intake payload: symptoms, optional image reference, patient context.
    #[serde(default)]
    pub intake: Value,
}

/// Body of `POST /sessions/{session_id}/stages/{stage_id}`.
#[derive(Debug, Default, Deserialize)]
pub struct RunStageRequest {
    /// Stage input handed to the collaborator.
    #[serde(default)]
    pub input: Value,
}

/// Body of `POST /sessions/{session_id}/stages/{stage_id}/responses`.
#[derive(Debug, Default, Deserialize)]
pub struct SubmitResponsesRequest {
    /// The client's answers to the stage's questions.
    #[serde(default)]
    pub responses: Value,
}

/// Response of `GET /sessions/{session_id}/status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// The workflow snapshot.
    #[serde(flatten)]
    pub workflow: WorkflowState,
    /// Whether a live channel is attached.
    pub channel_attached: bool,
}

/// Response of `GET /admin/connections`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsResponse {
    /// Open WebSocket connections, including ones not yet attached.
    pub connections: usize,
    /// Sessions with an attached channel.
    pub attached: usize,
    /// Every known session.
    pub sessions: Vec<SessionSummary>,
}

/// POST /sessions/{session_id}/workflow
pub async fn start_workflow(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<StartWorkflowRequest>,
) -> Result<(StatusCode, Json<WorkflowState>), ApiError> {
    let session_id = SessionId::from_raw(session_id);
    let snapshot = state
        .executor
        .launch_workflow(&session_id, body.intake)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(WorkflowState::clone(&snapshot))))
}

/// POST /sessions/{session_id}/stages/{stage_id}
pub async fn run_stage(
    State(state): State<AppState>,
    Path((session_id, stage_id)): Path<(String, String)>,
    Json(body): Json<RunStageRequest>,
) -> Result<Json<WorkflowState>, ApiError> {
    let session_id = SessionId::from_raw(session_id);
    let snapshot = state
        .executor
        .run_stage(&session_id, &StageId::new(stage_id), body.input)
        .await?;
    Ok(Json(WorkflowState::clone(&snapshot)))
}

/// POST /sessions/{session_id}/stages/{stage_id}/responses
///
/// Resumes a workflow paused for client input.
pub async fn submit_responses(
    State(state): State<AppState>,
    Path((session_id, stage_id)): Path<(String, String)>,
    Json(body): Json<SubmitResponsesRequest>,
) -> Result<(StatusCode, Json<WorkflowState>), ApiError> {
    let session_id = SessionId::from_raw(session_id);
    let snapshot = state
        .executor
        .submit_stage_input(&session_id, &StageId::new(stage_id), body.responses)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(WorkflowState::clone(&snapshot))))
}

/// GET /sessions/{session_id}/status
pub async fn workflow_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let session_id = SessionId::from_raw(session_id);
    let snapshot = state
        .registry
        .workflow_state(&session_id)
        .ok_or(triage_runtime::PipelineError::NoWorkflow)?;
    Ok(Json(StatusResponse {
        workflow: WorkflowState::clone(&snapshot),
        channel_attached: state.registry.channel(&session_id).is_some(),
    }))
}

/// DELETE /sessions/{session_id}
///
/// Notifies the client, closes its channel and drops the session.
pub async fn terminate_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session_id = SessionId::from_raw(session_id);
    if !state.registry.contains(&session_id) {
        return Err(ApiError::SessionNotFound(session_id.to_string()));
    }
    let delivery = state
        .notifier
        .notify(&session_id, &Event::session_terminated("terminated by server"));
    let _ = state.registry.remove(&session_id);
    info!(session_id = %session_id, delivery = delivery.as_str(), "session terminated");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /admin/connections
pub async fn connections(State(state): State<AppState>) -> Json<ConnectionsResponse> {
    Json(ConnectionsResponse {
        connections: state.connection_count(),
        attached: state.registry.channel_count(),
        sessions: state.registry.sessions(),
    })
}

/// GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let resp = health::health_check(
        state.start_time,
        state.connection_count(),
        state.registry.session_count(),
        state.executor.in_flight(),
    );
    if state.shutdown.is_shutting_down() {
        Json(resp.shutting_down())
    } else {
        Json(resp)
    }
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            triage_telemetry::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
