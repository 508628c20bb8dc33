//! `tracing` subscriber setup.

use tracing_subscriber::EnvFilter;
use triage_settings::{LogFormat, LoggingSettings};

/// Initialize the global tracing subscriber on stderr.
///
/// `RUST_LOG` overrides `settings.level` when set. Subsequent calls are
/// no-ops.
pub fn init_logging(settings: &LoggingSettings) {
    let filter = build_filter(&settings.level);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init is a no-op if a global subscriber is already set
    let _ = match settings.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    };
}

/// Filter from `RUST_LOG`, falling back to `level`, then to `info`.
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_does_not_panic() {
        init_logging(&LoggingSettings::default());
        init_logging(&LoggingSettings {
            level: "debug".into(),
            format: LogFormat::Json,
        });
    }

    #[test]
    fn invalid_level_falls_back() {
        // Must not panic on garbage directives.
        let _ = build_filter("[[[not a directive");
    }
}
