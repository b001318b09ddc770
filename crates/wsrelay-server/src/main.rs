//! wsrelay
//!
//! WebSocket relay: fans upstream producers out to downstream subscribers,
//! reconnecting to upstreams that drop.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use wsrelay_core::config::{RelayConfig, load_config};
use wsrelay_core::tracing_init::{LogFormat, init_tracing};
use wsrelay_server::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "wsrelay")]
#[command(version, about = "wsrelay - WebSocket fan-out hub and reconnecting bridge")]
struct Args {
    /// Path to a JSON configuration file.
    #[arg(long, env = "WSRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// IP address to listen on.
    #[arg(long)]
    bind_address: Option<String>,

    /// Port to listen on.
    #[arg(long)]
    bind_port: Option<u16>,

    /// Upstream WebSocket URL (repeatable).
    #[arg(long = "upstream")]
    upstreams: Vec<String>,

    /// Minimum reconnect delay in milliseconds.
    #[arg(long)]
    reconnect_min_delay_ms: Option<u64>,

    /// Maximum reconnect delay in milliseconds.
    #[arg(long)]
    reconnect_max_delay_ms: Option<u64>,

    /// Relay role.
    #[arg(long, value_parser = ["hub", "bridge"])]
    role: Option<String>,

    /// Per-subscriber send timeout in milliseconds.
    #[arg(long)]
    send_timeout_ms: Option<u64>,

    /// WebSocket handshake timeout in milliseconds.
    #[arg(long)]
    handshake_timeout_ms: Option<u64>,

    /// Queue depth for each subscriber's writer.
    #[arg(long)]
    subscriber_queue: Option<usize>,

    /// Queue depth for payloads bound for an upstream (bridge role).
    #[arg(long)]
    upstream_queue: Option<usize>,

    /// Text message sent to every subscriber after it connects.
    #[arg(long)]
    greeting: Option<String>,

    /// Hub only: republish each subscriber's messages to all subscribers.
    #[arg(long)]
    rebroadcast_inbound: bool,

    /// Treat loopback peers as publishers that never receive broadcasts.
    #[arg(long)]
    loopback_publishers: bool,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

impl Args {
    /// Layer command-line flags over the file/environment configuration.
    fn apply(self, config: &mut RelayConfig) -> anyhow::Result<()> {
        if let Some(address) = self.bind_address {
            config.bind_address = address;
        }
        if let Some(port) = self.bind_port {
            config.bind_port = port;
        }
        if !self.upstreams.is_empty() {
            config.upstream_addresses = self.upstreams;
        }
        if let Some(ms) = self.reconnect_min_delay_ms {
            config.reconnect_min_delay_ms = ms;
        }
        if let Some(ms) = self.reconnect_max_delay_ms {
            config.reconnect_max_delay_ms = ms;
        }
        if let Some(role) = self.role {
            config.role = role.parse()?;
        }
        if let Some(ms) = self.send_timeout_ms {
            config.send_timeout_ms = ms;
        }
        if let Some(ms) = self.handshake_timeout_ms {
            config.handshake_timeout_ms = ms;
        }
        if let Some(depth) = self.subscriber_queue {
            config.subscriber_queue = depth;
        }
        if let Some(depth) = self.upstream_queue {
            config.upstream_queue = depth;
        }
        if self.greeting.is_some() {
            config.greeting = self.greeting;
        }
        config.rebroadcast_inbound |= self.rebroadcast_inbound;
        config.loopback_publishers |= self.loopback_publishers;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("wsrelay_server=info", LogFormat::from_json_flag(args.log_json))?;

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config)?;
    let server = Arc::new(RelayServer::from_config(&config)?);

    let settings = server.settings();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %settings.bind,
        role = %settings.role,
        upstreams = ?settings.upstreams,
        "Starting wsrelay"
    );

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let signals = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            #[cfg(unix)]
            let sigterm_future = sigterm.recv();
            #[cfg(not(unix))]
            let sigterm_future = std::future::pending::<Option<()>>();

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C shutdown signal");
                }
                _ = sigterm_future => {
                    info!("Received SIGTERM shutdown signal");
                }
            }
            server.shutdown();
        })
    };

    server.start().await?;
    signals.abort();

    info!("wsrelay stopped");
    Ok(())
}
