//! WebSocket receive half as a [`ChannelReceiver`].

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use triage_runtime::{Channel, ChannelReceiver, DisconnectReason, Inbound};

/// Turns WebSocket frames into [`Inbound`] results.
///
/// Control frames mark the channel alive and are not surfaced. Closing the
/// channel from the server side ends the stream with the recorded reason.
pub struct ChannelReader<S> {
    stream: S,
    channel: Arc<Channel>,
    closed: CancellationToken,
}

impl<S> ChannelReader<S> {
    /// Read `stream` on behalf of `channel`.
    pub fn new(stream: S, channel: Arc<Channel>) -> Self {
        let closed = channel.closed_token();
        Self {
            stream,
            channel,
            closed,
        }
    }

    fn closed_reason(&self) -> DisconnectReason {
        self.channel
            .close_reason()
            .unwrap_or(DisconnectReason::Shutdown)
    }
}

#[async_trait]
impl<S> ChannelReceiver for ChannelReader<S>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
{
    async fn recv(&mut self) -> Inbound {
        loop {
            let next = tokio::select! {
                biased;
                () = self.closed.cancelled() => None,
                frame = self.stream.next() => Some(frame),
            };
            let Some(frame) = next else {
                return Inbound::Disconnected(self.closed_reason());
            };

            match frame {
                None | Some(Ok(Message::Close(_))) => {
                    return Inbound::Disconnected(DisconnectReason::ClientClosed);
                }
                Some(Err(e)) => return Inbound::Disconnected(DisconnectReason::Transport(e.to_string())),
                Some(Ok(Message::Text(text))) => return Inbound::Text(text.to_string()),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Inbound::Text(text),
                    Err(_) => {
                        debug!(channel_id = %self.channel.id(), len = data.len(), "ignoring non-UTF8 binary frame");
                        self.channel.mark_alive();
                    }
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => self.channel.mark_alive(),
            }
        }
    }
}
