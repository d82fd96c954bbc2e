//! # duel-node
//!
//! Duel server binary: loads settings, wires the sticks engine into the
//! matchmaking core, and serves HTTP/WebSocket until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use duel_server::config::{BrokerConfig, ServerConfig};
use duel_server::server::DuelServer;
use duel_settings::DuelSettings;
use duel_sticks::SticksFactory;

/// Upper bound on draining sessions and connections after Ctrl-C.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Duel matchmaking server.
#[derive(Parser, Debug)]
#[command(name = "duel-node", about = "Two-player matchmaking server")]
struct Cli {
    /// Host to bind (overrides settings if specified).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings if specified).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the settings file (default `~/.duel/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Maximum concurrent sessions (overrides settings if specified).
    #[arg(long)]
    max_sessions: Option<usize>,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.settings
            .clone()
            .unwrap_or_else(duel_settings::settings_path)
    }

    /// CLI flags win over the settings file and environment.
    fn apply(&self, settings: &mut DuelSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(max) = self.max_sessions.filter(|m| *m > 0) {
            settings.matchmaking.max_concurrent_sessions = max;
        }
    }
}

fn init_logging(settings: &DuelSettings) {
    if settings.logging.json {
        duel_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        duel_core::logging::init_subscriber(&settings.logging.level);
    }
}

fn build_server(settings: &DuelSettings) -> DuelServer {
    let metrics = match duel_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder unavailable, /metrics disabled");
            None
        }
    };
    DuelServer::new(
        ServerConfig::from(settings),
        BrokerConfig::from(settings),
        Arc::new(SticksFactory),
        metrics,
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args.settings_path();
    let mut settings = duel_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply(&mut settings);
    init_logging(&settings);

    let server = build_server(&settings);
    let registry = server.start();
    let (addr, serve) = server
        .listen()
        .await
        .context("Failed to bind server")?;

    tracing::info!(
        max_sessions = settings.matchmaking.max_concurrent_sessions,
        "duel node listening on http://{addr}"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .graceful_shutdown(vec![registry, serve], Some(SHUTDOWN_TIMEOUT))
        .await;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["duel-node"]);
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
        assert!(cli.max_sessions.is_none());

        let mut settings = DuelSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, DuelSettings::default().server.port);
    }

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::parse_from([
            "duel-node",
            "--host",
            "127.0.0.1",
            "--port",
            "9100",
            "--max-sessions",
            "4",
        ]);
        let mut settings = DuelSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.matchmaking.max_concurrent_sessions, 4);
    }

    #[test]
    fn cli_ignores_zero_max_sessions() {
        let cli = Cli::parse_from(["duel-node", "--max-sessions", "0"]);
        let mut settings = DuelSettings::default();
        cli.apply(&mut settings);
        assert_eq!(
            settings.matchmaking.max_concurrent_sessions,
            DuelSettings::default().matchmaking.max_concurrent_sessions
        );
    }

    #[test]
    fn cli_rejects_bad_port() {
        assert!(Cli::try_parse_from(["duel-node", "--port", "70000"]).is_err());
    }

    #[test]
    fn settings_flag_picks_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            serde_json::json!({"matchmaking": {"maxConcurrentSessions": 9}}).to_string(),
        )
        .unwrap();

        let cli = Cli::parse_from(["duel-node", "--settings", path.to_str().unwrap()]);
        assert_eq!(cli.settings_path(), path);
        let settings = duel_settings::load_settings_from_path(&cli.settings_path()).unwrap();
        assert_eq!(settings.matchmaking.max_concurrent_sessions, 9);
    }

    #[tokio::test]
    async fn server_boots_and_shuts_down() {
        let mut settings = DuelSettings::default();
        settings.server.host = "127.0.0.1".into();
        settings.server.port = 0;
        settings.matchmaking.max_concurrent_sessions = 2;

        let server = DuelServer::new(
            ServerConfig::from(&settings),
            BrokerConfig::from(&settings),
            Arc::new(SticksFactory),
            None,
        );
        let registry = server.start();
        let (addr, serve) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.broker().stats().max_sessions, 2);

        tokio::time::timeout(
            Duration::from_secs(5),
            server.graceful_shutdown(vec![registry, serve], Some(Duration::from_secs(2))),
        )
        .await
        .expect("shutdown timed out");
        assert!(server.shutdown().is_shutting_down());
    }
}
