//! Stage collaborator backed by an HTTP service.
//!
//! Each stage is a `POST {base_url}/stages/{stage_id}` carrying the
//! [`StageInput`] as JSON. A 2xx JSON body is the stage result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;
use triage_core::{StageCollaborator, StageFailure, StageId, StageInput, StageSet, WorkflowTemplate};

/// Longest error body echoed into a failure message.
const MAX_ERROR_BODY: usize = 512;

/// Calls a remote model service for every stage.
pub struct HttpStageCollaborator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStageCollaborator {
    /// Client for `base_url`. Without `timeout` requests wait indefinitely.
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder().user_agent("triage/0.1");
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    /// Endpoint for `stage`.
    pub fn endpoint(&self, stage: &StageId) -> String {
        format!("{}/stages/{stage}", self.base_url)
    }

    /// Register this collaborator for every stage of `template`.
    pub fn stage_set(self: &Arc<Self>, template: &WorkflowTemplate) -> StageSet {
        template.stages().iter().fold(StageSet::new(), |set, spec| {
            set.with(spec.id.as_str(), Arc::clone(self) as Arc<dyn StageCollaborator>)
        })
    }
}

#[async_trait]
impl StageCollaborator for HttpStageCollaborator {
    async fn invoke(&self, input: StageInput) -> Result<Value, StageFailure> {
        let url = self.endpoint(&input.stage);
        debug!(url = %url, "invoking stage collaborator");

        let response = self
            .client
            .post(&url)
            .json(&input)
            .send()
            .await
            .map_err(|e| StageFailure::transient(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("{url} returned {status}: {}", truncate(&body));
            return Err(if is_retryable(status) {
                StageFailure::transient(message)
            } else {
                StageFailure::fatal(message)
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| StageFailure::fatal(format!("invalid response from {url}: {e}")))
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn truncate(body: &str) -> &str {
    if body.len() <= MAX_ERROR_BODY {
        return body;
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use triage_core::{SessionId, WorkflowId};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn input(stage: &str) -> StageInput {
        StageInput {
            session_id: SessionId::from_raw("s1"),
            workflow_id: WorkflowId::from_raw("wf_1"),
            stage: stage.into(),
            input: json!({"symptoms": "itchy rash"}),
            prior_results: BTreeMap::from([("llm_diagnosis".into(), json!({"dx": "eczema"}))]),
            responses: None,
        }
    }

    #[tokio::test]
    async fn posts_input_and_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stages/overall_analysis"))
            .and(body_partial_json(json!({
                "sessionId": "s1",
                "stage": "overall_analysis",
                "priorResults": {"llm_diagnosis": {"dx": "eczema"}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"summary": "mild"})))
            .expect(1)
            .mount(&server)
            .await;

        let collab = HttpStageCollaborator::new(format!("{}/", server.uri()), None).unwrap();
        let result = collab.invoke(input("overall_analysis")).await.unwrap();
        assert_eq!(result["summary"], "mild");
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("model loading"))
            .mount(&server)
            .await;

        let collab = HttpStageCollaborator::new(server.uri(), None).unwrap();
        let failure = collab.invoke(input("llm_diagnosis")).await.unwrap_err();
        assert!(failure.retryable);
        assert!(failure.message.contains("503"));
        assert!(failure.message.contains("model loading"));
    }

    #[tokio::test]
    async fn rate_limit_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let collab = HttpStageCollaborator::new(server.uri(), None).unwrap();
        assert!(collab.invoke(input("llm_diagnosis")).await.unwrap_err().retryable);
    }

    #[tokio::test]
    async fn client_error_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("missing symptoms"))
            .mount(&server)
            .await;

        let collab = HttpStageCollaborator::new(server.uri(), None).unwrap();
        let failure = collab.invoke(input("llm_diagnosis")).await.unwrap_err();
        assert!(!failure.retryable);
    }

    #[tokio::test]
    async fn non_json_body_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let collab = HttpStageCollaborator::new(server.uri(), None).unwrap();
        let failure = collab.invoke(input("llm_diagnosis")).await.unwrap_err();
        assert!(!failure.retryable);
        assert!(failure.message.contains("invalid response"));
    }

    #[tokio::test]
    async fn unreachable_service_is_retryable() {
        let collab = HttpStageCollaborator::new("http://127.0.0.1:1", Some(Duration::from_secs(2))).unwrap();
        let failure = collab.invoke(input("llm_diagnosis")).await.unwrap_err();
        assert!(failure.retryable);
    }

    #[test]
    fn endpoint_and_stage_set() {
        let collab = Arc::new(HttpStageCollaborator::new("http://models:8000/", None).unwrap());
        assert_eq!(
            collab.endpoint(&"report_generation".into()),
            "http://models:8000/stages/report_generation"
        );
        let set = collab.stage_set(&WorkflowTemplate::diagnostic());
        assert_eq!(set.len(), 6);
        assert!(set.contains(&StageId::from(StageId::IMAGE_CLASSIFICATION)));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_BODY);
        let cut = truncate(&long);
        assert!(cut.len() <= MAX_ERROR_BODY);
        assert!(long.starts_with(cut));
    }
}
