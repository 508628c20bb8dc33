//! One client connection, independent of the transport carrying it.
//!
//! A [`Channel`] is the send half: an ordered outbound queue drained by the
//! transport's writer task, plus liveness and close state. The receive half
//! is a [`ChannelReceiver`] owned by the channel's reading task.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use triage_core::{ChannelId, Event, SessionId};

/// Why a channel stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client sent a close frame or the stream ended.
    ClientClosed,
    /// A newer channel attached to the same session.
    Retired,
    /// No inbound activity within the heartbeat timeout.
    TimedOut,
    /// The server is shutting down.
    Shutdown,
    /// The session was terminated server-side.
    Terminated,
    /// The transport failed.
    Transport(String),
}

impl DisconnectReason {
    /// Short label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::Retired => "retired",
            Self::TimedOut => "timed_out",
            Self::Shutdown => "shutdown",
            Self::Terminated => "terminated",
            Self::Transport(_) => "transport_error",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(detail) => write!(f, "transport error: {detail}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Result of one receive on a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame from the client.
    Text(String),
    /// The channel is gone; no further frames will arrive.
    Disconnected(DisconnectReason),
}

/// Receive half of a channel.
#[async_trait]
pub trait ChannelReceiver: Send {
    /// Wait for the next inbound frame. After `Disconnected`, callers stop.
    async fn recv(&mut self) -> Inbound;
}

/// Failure to enqueue an outbound frame.
#[derive(Debug, Error)]
pub enum SendError {
    /// The outbound queue is full; the frame was dropped.
    #[error("outbound queue full")]
    Full,
    /// The channel was closed or its writer has exited.
    #[error("channel closed")]
    Closed,
    /// The event could not be serialized.
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Send half of one client connection.
pub struct Channel {
    id: ChannelId,
    session_id: SessionId,
    /// Ordered queue drained by the transport writer.
    tx: mpsc::Sender<Arc<String>>,
    /// When this channel was opened.
    pub connected_at: Instant,
    /// Whether any inbound activity was seen since the last heartbeat check.
    pub is_alive: AtomicBool,
    /// When the last inbound activity was seen.
    last_pong: Mutex<Instant>,
    /// Frames dropped because the queue was full.
    pub dropped_messages: AtomicU64,
    closed: CancellationToken,
    close_reason: Mutex<Option<DisconnectReason>>,
}

impl Channel {
    /// Open a channel for `session_id` with a fresh id.
    pub fn new(session_id: SessionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self::with_id(ChannelId::new(), session_id, tx)
    }

    /// Open a channel with a specific id.
    pub fn with_id(id: ChannelId, session_id: SessionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            session_id,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
        }
    }

    /// Channel identifier.
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Session this channel is bound to.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Enqueue a text frame without waiting.
    pub fn send(&self, message: Arc<String>) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(SendError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Serialize an event and enqueue it.
    pub fn send_event(&self, event: &Event) -> Result<(), SendError> {
        let json = event.to_json()?;
        self.send(Arc::new(json))
    }

    /// Close the channel. The first reason recorded wins.
    pub fn close(&self, reason: DisconnectReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.closed.cancel();
    }

    /// Why the channel was closed, if it was.
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.close_reason.lock().clone()
    }

    /// Whether the channel can still carry frames.
    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    /// Token cancelled when the channel closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Resolve once the channel is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Record inbound activity.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last inbound activity (or open).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for the heartbeat.
    ///
    /// Returns `true` if there was activity since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Channel age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Total frames dropped for this channel.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_channel(capacity: usize) -> (Channel, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let channel = Channel::with_id(
            ChannelId::from_raw("chan_1"),
            SessionId::from_raw("s1"),
            tx,
        );
        (channel, rx)
    }

    #[test]
    fn new_channel_is_open_and_alive() {
        let (channel, _rx) = make_channel(8);
        assert_eq!(channel.id().as_str(), "chan_1");
        assert_eq!(channel.session_id().as_str(), "s1");
        assert!(channel.is_open());
        assert!(channel.close_reason().is_none());
        assert!(channel.is_alive.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn send_preserves_order() {
        let (channel, mut rx) = make_channel(8);
        for i in 0..5 {
            channel.send(Arc::new(format!("msg_{i}"))).unwrap();
        }
        for i in 0..5 {
            assert_eq!(&*rx.recv().await.unwrap(), &format!("msg_{i}"));
        }
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (channel, _rx) = make_channel(1);
        channel.send(Arc::new("one".into())).unwrap();
        assert_matches!(channel.send(Arc::new("two".into())), Err(SendError::Full));
        assert_eq!(channel.drop_count(), 1);
        assert!(channel.is_open());
    }

    #[test]
    fn dropped_receiver_is_closed() {
        let (channel, rx) = make_channel(4);
        drop(rx);
        assert!(!channel.is_open());
        assert_matches!(channel.send(Arc::new("x".into())), Err(SendError::Closed));
        assert_eq!(channel.drop_count(), 0);
    }

    #[tokio::test]
    async fn close_rejects_sends_and_resolves_waiters() {
        let (channel, _rx) = make_channel(4);
        let token = channel.closed_token();
        channel.close(DisconnectReason::Retired);
        channel.close(DisconnectReason::Shutdown);
        assert!(token.is_cancelled());
        channel.closed().await;
        assert!(!channel.is_open());
        assert_eq!(channel.close_reason(), Some(DisconnectReason::Retired));
        assert_matches!(channel.send(Arc::new("late".into())), Err(SendError::Closed));
    }

    #[tokio::test]
    async fn send_event_serializes() {
        let (channel, mut rx) = make_channel(4);
        channel.send_event(&Event::pong()).unwrap();
        let msg = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["type"], "pong");
    }

    #[test]
    fn mark_alive_and_check() {
        let (channel, _rx) = make_channel(4);
        assert!(channel.check_alive());
        assert!(!channel.check_alive());
        channel.mark_alive();
        assert!(channel.check_alive());
        assert!(channel.last_pong_elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn disconnect_reason_labels() {
        assert_eq!(DisconnectReason::Retired.as_str(), "retired");
        assert_eq!(
            DisconnectReason::Transport("reset".into()).to_string(),
            "transport error: reset"
        );
        assert_eq!(DisconnectReason::TimedOut.to_string(), "timed_out");
    }
}
