//! # fanout
//!
//! Fan-out server binary: loads settings, starts the WebSocket endpoint and
//! the publish service, and shuts both down on SIGINT/SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use fanout_server::{DEFAULT_SHUTDOWN_TIMEOUT, FanoutServer};
use fanout_settings::FanoutSettings;
use tracing::{info, warn};

/// Real-time WebSocket fan-out server.
#[derive(Parser, Debug)]
#[command(name = "fanout", about = "Real-time WebSocket fan-out server")]
struct Cli {
    /// Config file or directory containing `config.json`.
    /// Falls back to `FANOUT_CONFIG`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (overrides settings; `RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn load(&self) -> Result<FanoutSettings> {
        let mut settings = fanout_settings::load_settings(self.config.as_deref())
            .context("Failed to load settings")?;
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load()?;

    fanout_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics = match fanout_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics recorder unavailable, /metrics disabled");
            None
        }
    };

    let server = FanoutServer::new(settings, metrics);
    let handle = server.listen().await.context("Failed to start server")?;
    info!(
        socket = %handle.socket_addr,
        service = %handle.service_addr,
        shards = server.registry().shard_count(),
        "fanout server running"
    );

    wait_for_signal().await?;
    info!("shutdown signal received");
    server.stop(DEFAULT_SHUTDOWN_TIMEOUT).await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_settings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"logging": {"level": "warn"}, "socket": {"port": 9000}}"#,
        )
        .unwrap();

        let cli = Cli::parse_from([
            "fanout",
            "--config",
            dir.path().to_str().unwrap(),
            "--log-level",
            "debug",
            "--json-logs",
        ]);
        let settings = cli.load().unwrap();
        assert_eq!(settings.socket.port, 9000);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn invalid_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ nope").unwrap();

        let cli = Cli::parse_from(["fanout", "--config", path.to_str().unwrap()]);
        assert!(cli.load().is_err());
    }
}
