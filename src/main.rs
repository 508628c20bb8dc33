//! # triage
//!
//! Diagnostic session orchestrator binary: loads settings, wires the stage
//! collaborators into the pipeline and serves HTTP/WebSocket until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use triage_core::{RoutingPolicy, WorkflowTemplate};
use triage_runtime::{Notifier, PipelineExecutor, SessionRegistry};
use triage_server::{HttpStageCollaborator, TriageServer};
use triage_settings::Settings;

/// Diagnostic session orchestrator.
#[derive(Parser, Debug)]
#[command(name = "triage", about = "Diagnostic session orchestrator")]
struct Cli {
    /// Settings file (defaults to `~/.triage/settings.json` if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Base URL of the stage model service (overrides settings).
    #[arg(long)]
    collaborator_url: Option<String>,

    /// Log level or filter directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Load the settings file, layer the flags over it and validate the result.
    fn resolve_settings(self) -> Result<Settings> {
        let mut settings = triage_settings::load_settings_from(self.config.as_deref())
            .context("Failed to load settings")?;
        self.apply(&mut settings);
        triage_settings::validate(&settings).context("Invalid settings")?;
        Ok(settings)
    }

    fn apply(self, settings: &mut Settings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(url) = self.collaborator_url {
            settings.pipeline.collaborator_url = url;
        }
        if let Some(level) = self.log_level {
            settings.logging.level = level;
        }
    }
}

/// Construct collaborators, then the executor over them.
fn build_executor(
    settings: &Settings,
    registry: &Arc<SessionRegistry>,
) -> Result<PipelineExecutor> {
    let template = WorkflowTemplate::diagnostic();
    let collaborator = Arc::new(
        HttpStageCollaborator::new(
            settings.pipeline.collaborator_url.clone(),
            settings.pipeline.request_timeout_secs.map(Duration::from_secs),
        )
        .context("Failed to build HTTP client")?,
    );
    let stages = collaborator.stage_set(&template);
    tracing::debug!(stages = stages.len(), url = %settings.pipeline.collaborator_url, "stage collaborators ready");

    PipelineExecutor::new(
        Arc::clone(registry),
        Notifier::new(Arc::clone(registry)),
        template,
        stages,
        RoutingPolicy::new(settings.pipeline.confidence_threshold),
    )
    .context("Failed to build pipeline")
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Cli::parse().resolve_settings()?;

    triage_telemetry::init_logging(&settings.logging);
    let metrics = match triage_telemetry::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder unavailable, /metrics disabled");
            None
        }
    };

    let registry = Arc::new(SessionRegistry::new());
    let executor = Arc::new(build_executor(&settings, &registry)?);
    let server = TriageServer::new(settings, registry, executor, metrics);

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("triage listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.graceful_shutdown(handle).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let mut settings = Settings::default();
        Cli::parse_from(["triage"]).apply(&mut settings);
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn cli_overrides() {
        let cli = Cli::parse_from([
            "triage",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--collaborator-url",
            "http://models:8000",
            "--log-level",
            "debug",
        ]);
        let mut settings = Settings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.pipeline.collaborator_url, "http://models:8000");
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn overrides_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{}").unwrap();
        let config = path.to_str().unwrap();

        let settings = Cli::parse_from(["triage", "--config", config, "--port", "0"])
            .resolve_settings()
            .unwrap();
        assert_eq!(settings.server.port, 0);

        let err = Cli::parse_from(["triage", "--config", config, "--host", ""])
            .resolve_settings()
            .unwrap_err();
        assert!(format!("{err:#}").contains("server.host"));
    }

    #[test]
    fn cli_config_path() {
        let cli = Cli::parse_from(["triage", "--config", "/etc/triage.json"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/triage.json")));
    }

    #[test]
    fn executor_covers_every_diagnostic_stage() {
        let registry = Arc::new(SessionRegistry::new());
        let executor = build_executor(&Settings::default(), &registry).unwrap();
        assert_eq!(executor.template().stages().len(), 6);
    }
}
