//! HTTP error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use triage_runtime::PipelineError;

/// Error returned by a REST handler, rendered as `{error: {code, message}}`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The pipeline rejected the request.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    /// The session does not exist.
    #[error("session {0} not found")]
    SessionNotFound(String),
    /// The server is draining.
    #[error("server is shutting down")]
    ShuttingDown,
    /// `server.max_connections` channels are already open.
    #[error("connection limit of {0} reached")]
    TooManyConnections(usize),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Pipeline(e) => match e {
                PipelineError::NoWorkflow => StatusCode::NOT_FOUND,
                PipelineError::WorkflowInProgress(_)
                | PipelineError::Transition(_)
                | PipelineError::WorkflowReplaced => StatusCode::CONFLICT,
                PipelineError::MissingCollaborator(_) => StatusCode::BAD_REQUEST,
                PipelineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::ShuttingDown | Self::TooManyConnections(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Pipeline(e) => e.error_kind(),
            Self::SessionNotFound(_) => "session_not_found",
            Self::ShuttingDown => "shutting_down",
            Self::TooManyConnections(_) => "too_many_connections",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triage_core::{TransitionError, WorkflowId, WorkflowStatus};

    #[test]
    fn pipeline_errors_map_to_statuses() {
        let cases = [
            (PipelineError::NoWorkflow, StatusCode::NOT_FOUND, "no_workflow"),
            (
                PipelineError::WorkflowInProgress(WorkflowId::from_raw("wf_1")),
                StatusCode::CONFLICT,
                "workflow_in_progress",
            ),
            (
                PipelineError::Transition(TransitionError::Terminal {
                    status: WorkflowStatus::Failed,
                }),
                StatusCode::CONFLICT,
                "terminal",
            ),
            (PipelineError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
        ];
        for (err, status, code) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status(), status);
            assert_eq!(api.code(), code);
        }
    }

    #[tokio::test]
    async fn renders_error_envelope() {
        let resp = ApiError::SessionNotFound("s9".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"]["code"], "session_not_found");
        assert_eq!(parsed["error"]["message"], "session s9 not found");
    }
}
