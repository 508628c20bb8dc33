//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once shutdown has begun.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open WebSocket connections.
    pub connections: usize,
    /// Sessions known to the registry.
    pub active_sessions: usize,
    /// Workflows and stage runs still executing.
    pub in_flight_workflows: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    sessions: usize,
    in_flight: usize,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        active_sessions: sessions,
        in_flight_workflows: in_flight,
    }
}

impl HealthResponse {
    /// Mark the response as draining.
    #[must_use]
    pub fn shutting_down(mut self) -> Self {
        self.status = "shutting_down".into();
        self
    }
}
