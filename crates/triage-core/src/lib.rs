//! # triage-core
//!
//! Foundation types for the diagnostic session orchestrator.
//!
//! - **Branded IDs**: `SessionId`, `ChannelId`, `WorkflowId`, plus `StageId`
//! - **Workflow**: templates, per-session snapshots and their transition rules
//! - **Routing**: gate evaluation deciding whether optional stages run
//! - **Stages**: the `StageCollaborator` contract and the injected `StageSet`
//! - **Events**: outbound envelopes and inbound control messages
//! - **Errors**: `TransitionError`, `TemplateError`, `StageFailure`

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod routing;
pub mod stage;
pub mod workflow;

pub use errors::{StageFailure, TemplateError, TransitionError};
pub use events::{ControlMessage, Event, EventKind, now_timestamp};
pub use ids::{ChannelId, SessionId, StageId, WorkflowId};
pub use routing::{RoutingPolicy, StageDecision};
pub use stage::{StageCollaborator, StageInput, StageSet};
pub use workflow::{StageGate, StageRecord, StageSpec, WorkflowState, WorkflowStatus, WorkflowTemplate};
