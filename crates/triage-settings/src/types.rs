//! Settings type definitions.
//!
//! Every section uses `#[serde(default)]` so partial JSON is accepted and
//! missing fields take their compiled default.

use serde::{Deserialize, Serialize};

/// Root settings for the orchestrator.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "pipeline": { "collaborator_url": "http://models:8000" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// HTTP and WebSocket listener.
    pub server: ServerSettings,
    /// Stage execution.
    pub pipeline: PipelineSettings,
    /// Session lifetime.
    pub sessions: SessionSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// HTTP/WebSocket listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Upgrades beyond this many open channels are refused.
    pub max_connections: usize,
    /// Seconds between server Ping frames.
    pub heartbeat_interval_secs: u64,
    /// Seconds without inbound activity before a channel is closed.
    pub heartbeat_timeout_secs: u64,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
    /// Outbound queue depth per channel; overflow is dropped.
    pub send_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 1024,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 1024 * 1024,
            send_queue_capacity: 256,
        }
    }
}

/// Stage execution settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Base URL of the model service that performs stage work.
    pub collaborator_url: String,
    /// Per-request timeout for the HTTP collaborator. `None` waits indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
    /// Diagnosis confidence below which follow-up questions are generated.
    pub confidence_threshold: f64,
    /// Seconds to wait for in-flight stages during shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            collaborator_url: "http://127.0.0.1:8000".to_string(),
            request_timeout_secs: None,
            confidence_threshold: 0.6,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Session lifetime settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Seconds between idle-session sweeps.
    pub sweep_interval_secs: u64,
    /// Seconds a detached, idle session is retained.
    pub idle_ttl_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            idle_ttl_secs: 3600,
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single line.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
