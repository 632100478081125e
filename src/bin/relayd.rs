//! Relay Daemon - WebSocket connection registry and event router
//!
//! Accepts WebSocket connections tagged with a correlation id and routes
//! stamp notifications to the connections whose id matches each event.
//!
//! # Usage
//!
//! ```bash
//! # Plaintext on the default port (3010)
//! relayd
//!
//! # TLS
//! relayd --mode tls --tls-cert cert.pem --tls-key key.pem
//!
//! # Base configuration from a file, port overridden from the environment
//! RELAY_PORT=8443 relayd --config /etc/relay/relay.toml
//!
//! # Enable debug logging
//! RUST_LOG=relayd=debug relayd
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown

use std::net::IpAddr;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relayd::config::{RelayConfig, ServeMode};
use relayd::server::RelayServer;

/// Stamp relay daemon
#[derive(Parser, Debug)]
#[command(name = "relayd", version, about)]
struct Args {
    /// TOML configuration file providing base values
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "RELAY_HOST")]
    host: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long, env = "RELAY_PORT")]
    port: Option<u16>,

    /// Serve mode: plain or tls
    #[arg(short, long, env = "RELAY_MODE")]
    mode: Option<ServeMode>,

    /// PEM certificate chain (tls mode)
    #[arg(long, env = "RELAY_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// PEM private key (tls mode)
    #[arg(long, env = "RELAY_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Capacity of the event channel
    #[arg(long, env = "RELAY_EVENT_BUFFER")]
    event_buffer: Option<usize>,

    /// Milliseconds an ingress loop waits for room in a full event channel
    #[arg(long, env = "RELAY_SUBMIT_TIMEOUT_MS")]
    submit_timeout_ms: Option<u64>,

    /// Milliseconds the router waits on a single connection write
    #[arg(long, env = "RELAY_WRITE_TIMEOUT_MS")]
    write_timeout_ms: Option<u64>,

    /// Largest accepted inbound frame in bytes
    #[arg(long, env = "RELAY_MAX_FRAME_SIZE")]
    max_frame_size: Option<usize>,
}

impl Args {
    /// Builds the effective configuration: defaults, then the config file,
    /// then flags and environment.
    fn into_config(self) -> Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => RelayConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if self.tls_cert.is_some() {
            config.tls_cert = self.tls_cert;
        }
        if self.tls_key.is_some() {
            config.tls_key = self.tls_key;
        }
        if let Some(event_buffer) = self.event_buffer {
            config.event_buffer = event_buffer;
        }
        if let Some(ms) = self.submit_timeout_ms {
            config.submit_timeout_ms = ms;
        }
        if let Some(ms) = self.write_timeout_ms {
            config.write_timeout_ms = ms;
        }
        if let Some(max) = self.max_frame_size {
            config.max_frame_size = max;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.into_config()?;
    run_daemon(config)
}

#[tokio::main]
async fn run_daemon(config: RelayConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("relayd=info".parse()?)
                .add_directive("relay_core=info".parse()?)
                .add_directive("relay_protocol=info".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        addr = %config.listen_addr(),
        mode = %config.mode,
        "Relay daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            // Without a handler the daemon runs until killed
            error!(error = %e, "Failed to install shutdown signal handler");
            return;
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let server = RelayServer::new(config, cancel_token);

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e).context("Relay server failed");
    }

    info!("Relay daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
