//! `TriageServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use triage_core::SessionId;
use triage_runtime::{ControlRouter, DisconnectReason, Notifier, PipelineExecutor, SessionRegistry};
use triage_settings::{ServerSettings, Settings};

use crate::error::ApiError;
use crate::routes;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::{ChannelConfig, run_channel_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session registry.
    pub registry: Arc<SessionRegistry>,
    /// Pipeline executor.
    pub executor: Arc<PipelineExecutor>,
    /// Event push for server-initiated notices.
    pub notifier: Notifier,
    /// Inbound control-message dispatch.
    pub router: ControlRouter,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Listener and channel settings.
    pub settings: Arc<ServerSettings>,
    /// Open WebSocket connections.
    pub connections: Arc<AtomicUsize>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Number of open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

/// Holds one unit of the connection budget until dropped.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(counter: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| Self(Arc::clone(counter)))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The orchestrator server.
pub struct TriageServer {
    settings: Settings,
    state: AppState,
}

impl TriageServer {
    /// Create a server over an existing registry and executor.
    pub fn new(
        settings: Settings,
        registry: Arc<SessionRegistry>,
        executor: Arc<PipelineExecutor>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let state = AppState {
            notifier: Notifier::new(Arc::clone(&registry)),
            router: ControlRouter::new(Arc::clone(&registry)),
            registry,
            executor,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            settings: Arc::new(settings.server.clone()),
            connections: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
            metrics,
        };
        Self { settings, state }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws/{session_id}", get(ws_handler))
            .route("/sessions/{session_id}/workflow", post(routes::start_workflow))
            .route(
                "/sessions/{session_id}/stages/{stage_id}",
                post(routes::run_stage),
            )
            .route(
                "/sessions/{session_id}/stages/{stage_id}/responses",
                post(routes::submit_responses),
            )
            .route("/sessions/{session_id}/status", get(routes::workflow_status))
            .route("/sessions/{session_id}", delete(routes::terminate_session))
            .route("/admin/connections", get(routes::connections))
            .route("/health", get(routes::health_handler))
            .route("/metrics", get(routes::metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind the listener, start the idle-session sweeper and serve until
    /// shutdown. Returns the bound address and the server task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;

        let sessions = &self.settings.sessions;
        self.state.shutdown.track(self.state.registry.spawn_sweeper(
            Duration::from_secs(sessions.sweep_interval_secs),
            Duration::from_secs(sessions.idle_ttl_secs),
            self.state.shutdown.token(),
        ));

        let app = self.router();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }
        });

        info!(addr = %local, "listening");
        Ok((local, handle))
    }

    /// Drain the server.
    ///
    /// 1. Refuse new upgrades, close open channels, stop the sweeper
    /// 2. Stop the executor and wait up to `pipeline.shutdown_timeout_secs`
    /// 3. Wait for the HTTP server and background tasks to finish
    pub async fn graceful_shutdown(&self, server: JoinHandle<()>) {
        let timeout = Duration::from_secs(self.settings.pipeline.shutdown_timeout_secs);
        self.state.shutdown.shutdown();
        let closed = self.state.registry.close_all(&DisconnectReason::Shutdown);
        info!(closed, "closed open channels");

        if !self.state.executor.shutdown(timeout).await {
            warn!(
                in_flight = self.state.executor.in_flight(),
                "in-flight workflows abandoned"
            );
        }
        self.state
            .shutdown
            .graceful_shutdown(vec![server], Some(timeout))
            .await;
        info!("shutdown complete");
    }

    /// Shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.state.registry
    }

    /// Get the pipeline executor.
    pub fn executor(&self) -> &Arc<PipelineExecutor> {
        &self.state.executor
    }

    /// Get the settings the server was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

/// GET /ws/{session_id}
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return ApiError::ShuttingDown.into_response();
    }
    let limit = state.settings.max_connections;
    let Some(slot) = ConnectionSlot::acquire(&state.connections, limit) else {
        warn!(limit, "connection limit reached, refusing upgrade");
        return ApiError::TooManyConnections(limit).into_response();
    };

    let session_id = SessionId::from_raw(session_id);
    let config = ChannelConfig::from(state.settings.as_ref());
    ws.max_message_size(state.settings.max_message_size)
        .on_upgrade(move |socket| async move {
            let _slot = slot;
            run_channel_session(
                socket,
                session_id,
                state.registry,
                state.router,
                config,
                state.shutdown.token(),
            )
            .await;
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use triage_core::{RoutingPolicy, StageSet, StageSpec, WorkflowStatus, WorkflowTemplate};

    fn make_server() -> TriageServer {
        make_server_with(
            WorkflowTemplate::linear(&["only"]).unwrap(),
            StageSet::new().with("only", Arc::new(Echo)),
        )
    }

    fn make_server_with(template: WorkflowTemplate, stages: StageSet) -> TriageServer {
        let registry = Arc::new(SessionRegistry::new());
        let executor = PipelineExecutor::new(
            Arc::clone(&registry),
            Notifier::new(Arc::clone(&registry)),
            template,
            stages,
            RoutingPolicy::default(),
        )
        .unwrap();
        TriageServer::new(Settings::default(), registry, Arc::new(executor), None)
    }

    /// Asks for input until answers arrive, then returns them.
    struct Asker;

    #[async_trait::async_trait]
    impl triage_core::StageCollaborator for Asker {
        async fn invoke(
            &self,
            input: triage_core::StageInput,
        ) -> Result<Value, triage_core::StageFailure> {
            Ok(match input.responses {
                None => json!({"requires_user_input": true, "followup_questions": ["Fever?"]}),
                Some(answers) => json!({"answers": answers}),
            })
        }
    }

    fn asking_server() -> TriageServer {
        let template = WorkflowTemplate::new(vec![
            StageSpec::new("ask", "Asking questions", 50).with_user_input(),
            StageSpec::new("only", "Wrapping up", 100),
        ])
        .unwrap();
        make_server_with(
            template,
            StageSet::new()
                .with("ask", Arc::new(Asker))
                .with("only", Arc::new(Echo)),
        )
    }

    struct Echo;

    #[async_trait::async_trait]
    impl triage_core::StageCollaborator for Echo {
        async fn invoke(
            &self,
            input: triage_core::StageInput,
        ) -> Result<Value, triage_core::StageFailure> {
            Ok(input.input)
        }
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn connection_slots_respect_limit() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = ConnectionSlot::acquire(&counter, 2).unwrap();
        let _b = ConnectionSlot::acquire(&counter, 2).unwrap();
        assert!(ConnectionSlot::acquire(&counter, 2).is_none());
        drop(a);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert!(ConnectionSlot::acquire(&counter, 2).is_some());
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let (status, body) = send(server.router(), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert!(body["in_flight_workflows"].is_number());
    }

    #[tokio::test]
    async fn health_reports_draining() {
        let server = make_server();
        server.shutdown().shutdown();
        let (_, body) = send(server.router(), get("/health")).await;
        assert_eq!(body["status"], "shutting_down");
    }

    #[tokio::test]
    async fn ws_without_upgrade_is_rejected() {
        let server = make_server();
        let (status, _) = send(server.router(), get("/ws/s1")).await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let resp = server.router().oneshot(get("/nonexistent")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_without_workflow_is_404() {
        let server = make_server();
        let (status, body) = send(server.router(), get("/sessions/s1/status")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "no_workflow");
    }

    #[tokio::test]
    async fn manual_stage_run_and_status() {
        let server = make_server();
        let _ = server
            .executor()
            .start_workflow(&SessionId::from_raw("s1"), json!({}))
            .await
            .unwrap();

        let (status, body) = send(
            server.router(),
            post_json("/sessions/s1/stages/only", &json!({"input": {"x": 1}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["currentStage"], 1);
        assert_eq!(body["status"], "completed");

        let (status, body) = send(server.router(), get("/sessions/s1/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"]["only"]["result"]["x"], 1);
        assert_eq!(body["channelAttached"], false);

        let (status, body) = send(
            server.router(),
            post_json("/sessions/s1/stages/only", &json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "terminal");
    }

    #[tokio::test]
    async fn start_workflow_twice_conflicts() {
        let server = make_server();
        // keep the first workflow running by starting it directly
        let _ = server
            .executor()
            .start_workflow(&SessionId::from_raw("s1"), json!({}))
            .await
            .unwrap();
        let (status, body) = send(
            server.router(),
            post_json("/sessions/s1/workflow", &json!({"intake": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "workflow_in_progress");
    }

    #[tokio::test]
    async fn start_workflow_accepts_and_runs() {
        let server = make_server();
        let (status, body) = send(
            server.router(),
            post_json("/sessions/s2/workflow", &json!({"intake": {"symptoms": "rash"}})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "running");
        assert_eq!(body["intake"]["symptoms"], "rash");

        assert!(server.executor().shutdown(Duration::from_secs(5)).await);
        let state = server.registry().workflow_state(&SessionId::from_raw("s2")).unwrap();
        assert!(state.is_terminal());
    }

    #[tokio::test]
    async fn responses_resume_paused_workflow() {
        let server = asking_server();
        let sid = SessionId::from_raw("s1");

        let (status, body) = send(
            server.router(),
            post_json("/sessions/s1/stages/ask/responses", &json!({"responses": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "no_workflow");

        let (status, _) = send(
            server.router(),
            post_json("/sessions/s1/workflow", &json!({"intake": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        for _ in 0..200 {
            if server
                .registry()
                .workflow_state(&sid)
                .is_some_and(|w| w.is_awaiting_input())
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let paused = server.registry().workflow_state(&sid).unwrap();
        assert_eq!(paused.status, WorkflowStatus::AwaitingInput);

        let (status, body) = send(
            server.router(),
            post_json("/sessions/s1/stages/only/responses", &json!({"responses": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "out_of_order");

        let (status, body) = send(
            server.router(),
            post_json(
                "/sessions/s1/stages/ask/responses",
                &json!({"responses": {"fever": "no"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "running");

        assert!(server.executor().shutdown(Duration::from_secs(5)).await);
        let done = server.registry().workflow_state(&sid).unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.result("ask").unwrap()["answers"]["fever"], "no");

        let (status, body) = send(
            server.router(),
            post_json("/sessions/s1/stages/ask/responses", &json!({"responses": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "shutting_down");
    }

    #[tokio::test]
    async fn start_during_shutdown_leaves_no_workflow() {
        let server = make_server();
        assert!(server.executor().shutdown(Duration::from_secs(1)).await);
        let (status, body) = send(
            server.router(),
            post_json("/sessions/s1/workflow", &json!({"intake": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "shutting_down");
        assert!(server
            .registry()
            .workflow_state(&SessionId::from_raw("s1"))
            .is_none());
    }

    #[tokio::test]
    async fn terminate_unknown_session_is_404() {
        let server = make_server();
        let req = Request::builder()
            .method("DELETE")
            .uri("/sessions/ghost")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(server.router(), req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "session_not_found");
    }

    #[tokio::test]
    async fn metrics_without_handle_is_404() {
        let server = make_server();
        let resp = server.router().oneshot(get("/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_connections_lists_sessions() {
        let server = make_server();
        let _ = server
            .executor()
            .start_workflow(&SessionId::from_raw("s1"), json!({}))
            .await
            .unwrap();
        let (status, body) = send(server.router(), get("/admin/connections")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connections"], 0);
        assert_eq!(body["sessions"][0]["sessionId"], "s1");
    }
}
