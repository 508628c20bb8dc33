//! Best-effort push of events to a session's live channel.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};
use triage_core::{Event, SessionId};
use triage_telemetry::metrics::{EVENTS_DELIVERED_TOTAL, EVENTS_DROPPED_TOTAL};

use crate::channel::SendError;
use crate::registry::SessionRegistry;

/// Outcome of one notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Enqueued on the live channel.
    Delivered,
    /// The session has no channel; the event was dropped.
    NoChannel,
    /// The channel's queue was full; the event was dropped.
    Dropped,
    /// The channel had closed; it was detached and the event dropped.
    Disconnected,
}

impl Delivery {
    /// Short label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::NoChannel => "no_channel",
            Self::Dropped => "queue_full",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Delivers events through the registry. Never fails.
#[derive(Clone)]
pub struct Notifier {
    registry: Arc<SessionRegistry>,
}

impl Notifier {
    /// Notifier over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Send `event` to the session's live channel, if any.
    pub fn notify(&self, session_id: &SessionId, event: &Event) -> Delivery {
        let kind = event.kind.as_str();
        let Some(channel) = self.registry.channel(session_id) else {
            debug!(session_id = %session_id, kind, "no channel attached, event dropped");
            return dropped(Delivery::NoChannel);
        };

        match channel.send_event(event) {
            Ok(()) => {
                counter!(EVENTS_DELIVERED_TOTAL, "kind" => kind).increment(1);
                Delivery::Delivered
            }
            Err(SendError::Full) => {
                warn!(
                    session_id = %session_id,
                    channel_id = %channel.id(),
                    kind,
                    dropped = channel.drop_count(),
                    "outbound queue full, event dropped"
                );
                dropped(Delivery::Dropped)
            }
            Err(SendError::Closed) => {
                let _ = self.registry.detach_channel(session_id, channel.id());
                debug!(
                    session_id = %session_id,
                    channel_id = %channel.id(),
                    kind,
                    "channel closed, detached"
                );
                dropped(Delivery::Disconnected)
            }
            Err(SendError::Serialize(e)) => {
                warn!(session_id = %session_id, kind, error = %e, "failed to serialize event");
                dropped(Delivery::Dropped)
            }
        }
    }
}

fn dropped(delivery: Delivery) -> Delivery {
    counter!(EVENTS_DROPPED_TOTAL, "reason" => delivery.as_str()).increment(1);
    delivery
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, DisconnectReason};
    use tokio::sync::mpsc;

    fn setup(capacity: usize) -> (Notifier, Arc<SessionRegistry>, Arc<Channel>, mpsc::Receiver<Arc<String>>) {
        let registry = Arc::new(SessionRegistry::new());
        let (tx, rx) = mpsc::channel(capacity);
        let channel = Arc::new(Channel::new(SessionId::from_raw("s1"), tx));
        let _ = registry.attach(Arc::clone(&channel));
        (Notifier::new(Arc::clone(&registry)), registry, channel, rx)
    }

    #[tokio::test]
    async fn delivers_to_attached_channel() {
        let (notifier, _registry, _channel, mut rx) = setup(8);
        let sid = SessionId::from_raw("s1");
        assert_eq!(notifier.notify(&sid, &Event::pong()), Delivery::Delivered);
        let msg = rx.recv().await.unwrap();
        assert!(msg.contains("\"pong\""));
    }

    #[test]
    fn no_channel_is_silent() {
        let notifier = Notifier::new(Arc::new(SessionRegistry::new()));
        assert_eq!(
            notifier.notify(&SessionId::from_raw("nobody"), &Event::pong()),
            Delivery::NoChannel
        );
    }

    #[test]
    fn full_queue_keeps_channel_attached() {
        let (notifier, registry, channel, _rx) = setup(1);
        let sid = SessionId::from_raw("s1");
        assert_eq!(notifier.notify(&sid, &Event::pong()), Delivery::Delivered);
        assert_eq!(notifier.notify(&sid, &Event::pong()), Delivery::Dropped);
        assert_eq!(channel.drop_count(), 1);
        assert!(registry.channel(&sid).is_some());
    }

    #[test]
    fn closed_channel_is_detached() {
        let (notifier, registry, channel, rx) = setup(8);
        let sid = SessionId::from_raw("s1");
        drop(rx);
        assert_eq!(notifier.notify(&sid, &Event::pong()), Delivery::Disconnected);
        assert!(registry.channel(&sid).is_none());
        assert!(!channel.is_open());
    }

    #[test]
    fn cancelled_channel_is_detached() {
        let (notifier, registry, channel, _rx) = setup(8);
        let sid = SessionId::from_raw("s1");
        channel.close(DisconnectReason::TimedOut);
        assert_eq!(notifier.notify(&sid, &Event::pong()), Delivery::Disconnected);
        assert!(registry.channel(&sid).is_none());
    }
}
