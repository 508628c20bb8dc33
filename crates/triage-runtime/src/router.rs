//! Per-channel dispatch of inbound control messages.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, instrument, warn};
use triage_core::{ControlMessage, Event};

use crate::channel::{Channel, ChannelReceiver, DisconnectReason, Inbound};
use crate::registry::SessionRegistry;

/// What the reading loop should do after a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// The channel is gone.
    Stop(DisconnectReason),
}

/// Classifies inbound frames and answers them on the same channel.
#[derive(Clone)]
pub struct ControlRouter {
    registry: Arc<SessionRegistry>,
}

impl ControlRouter {
    /// Router over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Handle one receive result.
    pub fn handle(&self, channel: &Channel, inbound: Inbound) -> Flow {
        match inbound {
            Inbound::Text(raw) => {
                self.route(channel, &raw);
                Flow::Continue
            }
            Inbound::Disconnected(reason) => {
                self.disconnect(channel, &reason);
                Flow::Stop(reason)
            }
        }
    }

    /// Dispatch one text frame.
    pub fn route(&self, channel: &Channel, raw: &str) {
        channel.mark_alive();
        let reply = match ControlMessage::parse(raw) {
            Ok(ControlMessage::Ping) => Some(Event::pong()),
            Ok(ControlMessage::WorkflowStatusRequest) => self
                .registry
                .workflow_state(channel.session_id())
                .map(|state| Event::workflow_status(&state)),
            Ok(ControlMessage::Unknown(kind)) => {
                debug!(channel_id = %channel.id(), kind = ?kind, "ignoring unknown message type");
                None
            }
            Err(e) => {
                debug!(channel_id = %channel.id(), error = %e, "malformed inbound message");
                Some(Event::error(
                    "Invalid message format",
                    Some(json!({ "detail": e.to_string() })),
                ))
            }
        };
        if let Some(event) = reply {
            if let Err(e) = channel.send_event(&event) {
                warn!(
                    channel_id = %channel.id(),
                    kind = event.kind.as_str(),
                    error = %e,
                    "failed to enqueue reply"
                );
            }
        }
    }

    /// The channel ended: detach it if it is still the attached one.
    ///
    /// Workflow state is kept.
    pub fn disconnect(&self, channel: &Channel, reason: &DisconnectReason) {
        let detached = self
            .registry
            .detach_channel(channel.session_id(), channel.id());
        debug!(
            session_id = %channel.session_id(),
            channel_id = %channel.id(),
            reason = %reason,
            detached,
            "channel disconnected"
        );
    }

    /// Drive `receiver` until the channel disconnects.
    #[instrument(skip_all, fields(session_id = %channel.session_id(), channel_id = %channel.id()))]
    pub async fn serve<R: ChannelReceiver + ?Sized>(
        &self,
        channel: &Channel,
        receiver: &mut R,
    ) -> DisconnectReason {
        loop {
            let inbound = receiver.recv().await;
            if let Flow::Stop(reason) = self.handle(channel, inbound) {
                return reason;
            }
        }
    }
}
