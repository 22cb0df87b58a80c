//! Relay Tunnel CLI
//!
//! A command-line tool that exposes a local service through the relay.
//!
//! # Usage
//!
//! ```bash
//! relay-tunnel --key API_KEY --port 8080
//! ```
//!
//! This proxies public HTTP requests for the tunnel to `localhost:8080`.
//!
//! # Options
//!
//! - `--key` or `-k`: Your API key (can also be set via `TUNNEL_API_KEY` env var)
//! - `--server`: Custom relay URL (or `TUNNEL_SERVER_URL`)
//! - `--protocol`: `http` (default), `tcp` or `udp`
//! - `--port` or `-p`: The local port to forward to
//! - `--remote-port`: Public port to ask the relay for (tcp/udp)
//! - `-v` or `--verbose`: Enable verbose logging
//!
//! # Example
//!
//! ```bash
//! # HTTP service on port 3000
//! relay-tunnel -k my-api-key -p 3000
//!
//! # SSH, asking for public port 2222
//! export TUNNEL_API_KEY=my-api-key
//! relay-tunnel --protocol tcp -p 22 --remote-port 2222
//!
//! # DNS over UDP with verbose logging
//! relay-tunnel --protocol udp -p 53 -v
//! ```

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use relay_tunnel::{Protocol, TunnelClient, TunnelConfig, DEFAULT_SERVER_URL};
use std::path::PathBuf;
use tracing::{info, Level};

/// Relay Tunnel CLI - Expose local services through a relay
#[derive(Parser, Debug)]
#[command(name = "relay-tunnel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The API key presented to the relay when the tunnel opens.
    #[arg(short, long, env = "TUNNEL_API_KEY", hide_env_values = true)]
    key: String,

    /// Relay WebSocket URL.
    ///
    /// Override the default relay for development or testing.
    #[arg(long, env = "TUNNEL_SERVER_URL", default_value = DEFAULT_SERVER_URL)]
    server: String,

    /// Kind of traffic to tunnel: http, tcp or udp.
    #[arg(long, default_value = "http")]
    protocol: Protocol,

    /// The local port to forward traffic to.
    ///
    /// Required for tcp and udp. Without it, an http tunnel answers every
    /// request with 501.
    #[arg(short, long)]
    port: Option<u16>,

    /// Host the local service listens on.
    #[arg(long, default_value = "127.0.0.1")]
    local_host: String,

    /// Public port to request from the relay. The relay picks one if omitted.
    #[arg(long)]
    remote_port: Option<u16>,

    /// Path to a PEM file containing a root CA certificate to trust.
    ///
    /// When specified, this CA will be trusted in addition to the default
    /// root certificates. Useful for development or testing against relays
    /// using self-signed certificates.
    #[arg(long)]
    trust_ca: Option<PathBuf>,

    /// Enable verbose logging.
    ///
    /// Shows detailed debug information about frames and local connections.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install crypto provider"))?;

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let mut config = TunnelConfig::new(args.key)
        .with_server_url(args.server)
        .with_protocol(args.protocol)
        .with_local_host(args.local_host);
    if let Some(port) = args.port {
        config = config.with_local_port(port);
    }
    if let Some(port) = args.remote_port {
        config = config.with_remote_port(port);
    }
    if let Some(ca_path) = args.trust_ca {
        config = config.with_trust_ca(ca_path);
    }

    info!(
        protocol = %args.protocol,
        local = ?config.local_target(),
        relay = %config.server_url,
        "Starting tunnel"
    );

    let client = TunnelClient::new(config).context("Invalid tunnel configuration")?;
    let handle = client.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Interrupted, shutting down");
    client.close();

    handle.await.context("Tunnel task failed")??;
    Ok(())
}
