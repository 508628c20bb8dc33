//! # triage-server
//!
//! Axum surface of the diagnostic orchestrator:
//!
//! - [`websocket`]: per-session WebSocket channels with heartbeat
//! - [`routes`]: REST endpoints for workflows, status and termination
//! - [`adapters`]: HTTP-backed stage collaborator
//! - [`server`]: router assembly, listener, graceful shutdown
//! - [`health`] and [`shutdown`]: liveness and shutdown coordination

#![deny(unsafe_code)]

pub mod adapters;
pub mod error;
pub mod health;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use adapters::HttpStageCollaborator;
pub use error::ApiError;
pub use server::{AppState, TriageServer};
pub use shutdown::ShutdownCoordinator;
