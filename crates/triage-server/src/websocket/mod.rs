//! WebSocket channels: frame reading, heartbeat and session lifecycle.

pub mod heartbeat;
pub mod reader;
pub mod session;

pub use session::{ChannelConfig, run_channel_session};
