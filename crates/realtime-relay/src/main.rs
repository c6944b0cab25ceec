//! Realtime Relay Server
//!
//! Accepts browser WebSocket connections on `/api/ws` and relays each one to
//! its own upstream realtime session.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use realtime_relay::{RealtimeConnector, RelayServer, serve};
use realtime_relay_core::RelayConfig;
use realtime_relay_core::config::{
    DEFAULT_MODEL, DEFAULT_UPSTREAM_URL, RELAY_PATH, credential_prefix, http_to_ws_scheme,
};
use realtime_relay_core::tracing_init::{LogFormat, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "realtime-relay")]
#[command(
    version,
    about = "Realtime relay - bridges browser WebSockets to an upstream realtime API"
)]
struct Args {
    /// Hostname to listen on.
    #[arg(long, env = "HOST", default_value = "localhost")]
    host: String,

    /// Port to listen on (0 picks a free port).
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Upstream API key.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Upstream realtime endpoint.
    #[arg(long, env = "RELAY_UPSTREAM_URL", default_value = DEFAULT_UPSTREAM_URL)]
    upstream_url: String,

    /// Realtime model requested from the upstream.
    #[arg(long, env = "RELAY_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// Upstream connect timeout in seconds (0 or unset waits indefinitely).
    #[arg(long, env = "RELAY_CONNECT_TIMEOUT_SECS")]
    connect_timeout_secs: Option<u64>,

    /// Capacity of each session's client channels.
    #[arg(long, env = "RELAY_CLIENT_BUFFER", default_value_t = 256)]
    client_buffer: usize,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            host: self.host,
            port: self.port,
            api_key: self.api_key,
            upstream_url: http_to_ws_scheme(&self.upstream_url),
            model: self.model,
            connect_timeout: self
                .connect_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            client_buffer: self.client_buffer,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(
        "realtime_relay=info,tower_http=info",
        LogFormat::from_json_flag(args.log_json),
    )?;

    let config = args.into_config();
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.bind_addr(),
        upstream = %config.upstream_url,
        model = %config.model,
        "Starting realtime-relay"
    );
    match (config.credential_warning(), config.api_key.as_deref()) {
        (Some(warning), _) => warn!("{warning}"),
        (None, Some(key)) => info!(key = %credential_prefix(key), "Upstream credential loaded"),
        (None, None) => {}
    }

    let listener = TcpListener::bind(config.bind_addr()).await?;
    let port = listener.local_addr()?.port();

    let connector = Arc::new(RealtimeConnector::from_config(&config));
    let server = Arc::new(RelayServer::from_config(&config, connector, port));
    info!(
        url = %format!("ws://{}:{port}{RELAY_PATH}", config.host),
        "Relay server ready"
    );

    serve(listener, server, shutdown_signal()).await?;

    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
