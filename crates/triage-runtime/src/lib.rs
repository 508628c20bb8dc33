//! # triage-runtime
//!
//! Live state of the orchestrator:
//!
//! - [`channel`]: transport-neutral client channel with bounded outbound queue
//! - [`registry`]: session id → (channel, workflow snapshot), idle sweeper
//! - [`notifier`]: best-effort event push to a session's channel
//! - [`router`]: inbound control-message dispatch
//! - [`pipeline`]: ordered stage execution with routing gates

#![deny(unsafe_code)]

pub mod channel;
pub mod notifier;
pub mod pipeline;
pub mod registry;
pub mod router;

pub use channel::{Channel, ChannelReceiver, DisconnectReason, Inbound, SendError};
pub use notifier::{Delivery, Notifier};
pub use pipeline::{PipelineError, PipelineExecutor};
pub use registry::{SessionRegistry, SessionSummary};
pub use router::{ControlRouter, Flow};
