//! # triage-telemetry
//!
//! Observability plumbing shared by every crate:
//!
//! - [`init_logging`]: `tracing-subscriber` on stderr, compact or JSON
//! - [`metrics`]: Prometheus recorder and the metric name constants

#![deny(unsafe_code)]

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{install_recorder, render};
