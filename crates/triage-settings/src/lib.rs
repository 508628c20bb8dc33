//! # triage-settings
//!
//! Configuration for the diagnostic orchestrator, loaded from three layers
//! (in priority order):
//! 1. **Compiled defaults**: [`Settings::default()`]
//! 2. **Settings file**: `--config <path>` or `~/.triage/settings.json`
//! 3. **Environment**: `TRIAGE_<SECTION>__<KEY>`, e.g. `TRIAGE_SERVER__PORT=9000`

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from, settings_path, validate};
pub use types::*;
