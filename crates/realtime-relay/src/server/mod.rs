//! HTTP front of the relay.
//!
//! One path carries both the status query and the relay WebSocket. Plain
//! requests to it get the status JSON whatever their method; upgrade
//! requests become relay sessions. Everything else is refused.

mod ws_bridge;


use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use realtime_relay_core::RelayConfig;
use realtime_relay_core::config::RELAY_PATH;

use crate::registry::ConnectionRegistry;
use crate::session::{ClientChannel, ClientEndpoint, RelaySession, SessionOptions};
use crate::status::{RelayStatus, StatusReporter};
use crate::upstream::UpstreamConnector;

/// Errors from running the HTTP listener.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state behind every route: the registry, the upstream connector
/// and the per-session settings.
pub struct RelayServer {
    registry: ConnectionRegistry,
    connector: Arc<dyn UpstreamConnector>,
    options: SessionOptions,
    client_buffer: usize,
    status: StatusReporter,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .field("client_buffer", &self.client_buffer)
            .finish_non_exhaustive()
    }
}

impl RelayServer {
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        options: SessionOptions,
        client_buffer: usize,
        port: u16,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        Self {
            status: StatusReporter::new(registry.clone(), port),
            registry,
            connector,
            options,
            client_buffer: client_buffer.max(1),
        }
    }

    /// Build from validated configuration. `port` is the port actually bound.
    pub fn from_config(
        config: &RelayConfig,
        connector: Arc<dyn UpstreamConnector>,
        port: u16,
    ) -> Self {
        let options = SessionOptions {
            connect_timeout: config.connect_timeout,
        };
        Self::new(connector, options, config.client_buffer, port)
    }

    /// Register a new client and create its session.
    ///
    /// The session counts toward the status from this call until its
    /// teardown completes.
    pub fn accept(&self) -> (RelaySession, ClientEndpoint) {
        let (channel, endpoint) = ClientChannel::pair(self.client_buffer);
        let session = RelaySession::new(
            self.registry.register(),
            Arc::clone(&self.connector),
            channel,
            self.options,
        );
        (session, endpoint)
    }

    pub fn status(&self) -> RelayStatus {
        self.status.status()
    }

    pub const fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }
}

/// Build the axum router for the relay.
pub fn build_router(server: Arc<RelayServer>) -> Router {
    Router::new()
        .route(RELAY_PATH, any(relay_endpoint))
        .fallback(not_relay_path)
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    server: Arc<RelayServer>,
    shutdown: F,
) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, path = RELAY_PATH, "Relay listening");
    axum::serve(listener, build_router(server))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Relay listener stopped");
    Ok(())
}

async fn relay_endpoint(
    State(server): State<Arc<RelayServer>>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(upgrade) => upgrade.on_upgrade(move |socket| ws_bridge::bridge(server, socket)),
        // A broken handshake is refused; anything else is a status query.
        Err(rejection) if is_upgrade_request(&headers) => {
            debug!(error = %rejection, "Rejected relay upgrade");
            rejection.into_response()
        }
        Err(_) => Json(server.status()).into_response(),
    }
}

async fn not_relay_path(headers: HeaderMap) -> Response {
    if is_upgrade_request(&headers) {
        // hyper drops the connection after a `Connection: close` response, so
        // the client sees its socket closed with a 400 instead of a bare reset.
        debug!("Refused upgrade outside the relay path");
        (StatusCode::BAD_REQUEST, [(header::CONNECTION, "close")]).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}
