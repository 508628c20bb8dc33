//! Layered settings loading.
//!
//! Loading flow (later layers win):
//! 1. Compiled [`Settings::default()`]
//! 2. JSON file: an explicit path, or `~/.triage/settings.json` if present
//! 3. `TRIAGE_<SECTION>__<KEY>` environment variables
//!
//! Objects merge per key; scalars and arrays are replaced.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::Settings;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TRIAGE_";

/// Resolve the default settings file (`~/.triage/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".triage").join("settings.json")
}

/// Load settings from the default path with env overrides.
///
/// A missing default file is not an error.
pub fn load_settings() -> Result<Settings> {
    load_settings_from(None)
}

/// Load settings, optionally from an explicit file.
///
/// An explicit path that does not exist is an error; the default path is
/// only read when present.
pub fn load_settings_from(explicit: Option<&Path>) -> Result<Settings> {
    let path = match explicit {
        Some(path) if !path.exists() => return Err(SettingsError::NotFound(path.to_path_buf())),
        Some(path) => Some(path.to_path_buf()),
        None => {
            let default = settings_path();
            default.exists().then_some(default)
        }
    };
    let settings: Settings = figment(path.as_deref()).extract()?;
    validate(&settings)?;
    Ok(settings)
}

/// Build the provider stack without extracting.
pub fn figment(path: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(Settings::default()));
    if let Some(path) = path {
        debug!(?path, "loading settings from file");
        figment = figment.merge(Json::file(path));
    } else {
        debug!("no settings file, using defaults");
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Reject values that deserialize but cannot work.
///
/// `server.port = 0` is valid and binds an ephemeral port.
pub fn validate(settings: &Settings) -> Result<()> {
    if settings.server.host.trim().is_empty() {
        return Err(SettingsError::InvalidValue("server.host must not be empty".into()));
    }
    if settings.server.heartbeat_interval_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "server.heartbeat_interval_secs must be non-zero".into(),
        ));
    }
    if settings.server.heartbeat_timeout_secs < settings.server.heartbeat_interval_secs {
        return Err(SettingsError::InvalidValue(
            "server.heartbeat_timeout_secs must be at least the heartbeat interval".into(),
        ));
    }
    if settings.server.send_queue_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "server.send_queue_capacity must be non-zero".into(),
        ));
    }
    if settings.sessions.sweep_interval_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "sessions.sweep_interval_secs must be non-zero".into(),
        ));
    }
    let threshold = settings.pipeline.confidence_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(SettingsError::InvalidValue(format!(
            "pipeline.confidence_threshold {threshold} is outside 0.0..=1.0"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
