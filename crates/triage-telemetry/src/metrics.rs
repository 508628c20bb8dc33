//! Prometheus metrics recorder and shared metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Returns the handle used to render `/metrics`. Call once at startup before
/// any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across crates.

/// WebSocket channels opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Open WebSocket channels (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket channels closed (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Channels closed because a newer channel attached to the same session (counter).
pub const WS_CHANNELS_RETIRED_TOTAL: &str = "ws_channels_retired_total";
/// Channel lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Events enqueued to a live channel (counter, labels: kind).
pub const EVENTS_DELIVERED_TOTAL: &str = "events_delivered_total";
/// Events dropped: no channel, queue full, or channel closed (counter, labels: reason).
pub const EVENTS_DROPPED_TOTAL: &str = "events_dropped_total";
/// Stage invocations (counter, labels: stage).
pub const STAGE_RUNS_TOTAL: &str = "stage_runs_total";
/// Stage invocations that failed (counter, labels: stage).
pub const STAGE_FAILURES_TOTAL: &str = "stage_failures_total";
/// Stages skipped by routing (counter, labels: stage).
pub const STAGE_SKIPS_TOTAL: &str = "stage_skips_total";
/// Stage invocation duration in seconds (histogram, labels: stage).
pub const STAGE_DURATION_SECONDS: &str = "stage_duration_seconds";
/// Workflows started (counter).
pub const WORKFLOWS_STARTED_TOTAL: &str = "workflows_started_total";
/// Workflows currently driven by a background task (gauge).
pub const WORKFLOWS_ACTIVE: &str = "workflows_active";
/// Idle sessions removed by the sweeper (counter).
pub const SESSIONS_SWEPT_TOTAL: &str = "sessions_swept_total";
