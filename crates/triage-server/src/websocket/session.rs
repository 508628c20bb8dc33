//! WebSocket channel lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use triage_core::{Event, SessionId};
use triage_runtime::{Channel, ControlRouter, DisconnectReason, SessionRegistry};
use triage_settings::ServerSettings;
use triage_telemetry::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

use super::heartbeat::{HeartbeatResult, run_heartbeat};
use super::reader::ChannelReader;

/// How long the writer gets to flush queued frames and the close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-channel tunables.
#[derive(Clone, Copy, Debug)]
pub struct ChannelConfig {
    /// Interval between server Ping frames and liveness checks.
    pub heartbeat_interval: Duration,
    /// Close the channel after this long without inbound activity.
    pub heartbeat_timeout: Duration,
    /// Outbound queue capacity.
    pub send_queue_capacity: usize,
}

impl From<&ServerSettings> for ChannelConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(settings.heartbeat_timeout_secs),
            send_queue_capacity: settings.send_queue_capacity.max(1),
        }
    }
}

/// Run one WebSocket channel bound to `session_id`.
///
/// 1. Attaches the channel, retiring any previous one for the session
/// 2. Sends `connection_established`
/// 3. Forwards queued events and periodic Pings on a writer task
/// 4. Closes the channel on heartbeat timeout or server shutdown
/// 5. Routes inbound frames until disconnect, then detaches
#[instrument(skip_all, fields(session_id = %session_id))]
pub async fn run_channel_session(
    ws: WebSocket,
    session_id: SessionId,
    registry: Arc<SessionRegistry>,
    router: ControlRouter,
    config: ChannelConfig,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(config.send_queue_capacity);
    let channel = Arc::new(Channel::new(session_id.clone(), send_tx));

    let started = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    if let Some(retired) = registry.attach(Arc::clone(&channel)) {
        info!(channel_id = %channel.id(), retired = %retired.id(), "channel attached, previous channel retired");
    } else {
        info!(channel_id = %channel.id(), "channel attached");
    }

    // Written directly so it precedes anything the notifier queues
    match Event::connection_established(&session_id, channel.id()).to_json() {
        Ok(json) => {
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                debug!("client went away before connection_established");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize connection_established"),
    }

    let writer_channel = Arc::clone(&channel);
    let ping_interval = config.heartbeat_interval;
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        // Skip the immediate first tick
        let _ = ping.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = writer_channel.closed() => {
                    while let Ok(text) = send_rx.try_recv() {
                        if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        writer_channel.close(DisconnectReason::ClientClosed);
    });

    let monitor_channel = Arc::clone(&channel);
    let monitor = tokio::spawn(async move {
        let stop = monitor_channel.closed_token();
        tokio::select! {
            result = run_heartbeat(&monitor_channel, config.heartbeat_interval, config.heartbeat_timeout, stop.clone()) => {
                if result == HeartbeatResult::TimedOut {
                    warn!(
                        channel_id = %monitor_channel.id(),
                        idle_secs = monitor_channel.last_pong_elapsed().as_secs(),
                        "channel unresponsive, closing"
                    );
                    monitor_channel.close(DisconnectReason::TimedOut);
                }
            }
            () = shutdown.cancelled() => monitor_channel.close(DisconnectReason::Shutdown),
        }
    });

    let mut reader = ChannelReader::new(ws_rx, Arc::clone(&channel));
    let reason = router.serve(&channel, &mut reader).await;

    // Clean up
    channel.close(reason.clone());
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    monitor.abort();

    info!(channel_id = %channel.id(), reason = %reason, dropped = channel.drop_count(), "channel closed");
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_settings() {
        let settings = ServerSettings {
            heartbeat_interval_secs: 5,
            heartbeat_timeout_secs: 15,
            send_queue_capacity: 0,
            ..ServerSettings::default()
        };
        let config = ChannelConfig::from(&settings);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(config.send_queue_capacity, 1);
    }

    // Full channel lifecycles are covered by tests/integration.rs.
}
