//! Production upstream: one WebSocket session to the realtime service per client.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use realtime_relay_core::RelayConfig;
use realtime_relay_core::config::{credential_prefix, http_to_ws_scheme};

use super::transport::{self, WsMessage, WsReader, WsWriter};
use super::{
    ConnectError, ConnectionState, OpenedUpstream, SendError, SharedConnectionState,
    UpstreamConnector, UpstreamEvent, UpstreamEvents, UpstreamSession, UpstreamUnavailable,
};

/// Capacity of the upstream -> relay event channel.
const EVENT_BUFFER: usize = 256;

/// Length of the random part of a generated event id.
const EVENT_ID_LEN: usize = 21;

/// Builds [`RealtimeUpstream`] handles from the process-wide configuration.
#[derive(Clone)]
pub struct RealtimeConnector {
    api_key: Option<String>,
    endpoint: String,
}

impl std::fmt::Debug for RealtimeConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeConnector")
            .field("endpoint", &self.endpoint)
            .field("has_key", &self.api_key.is_some())
            .finish()
    }
}

impl RealtimeConnector {
    pub fn new(api_key: Option<String>, upstream_url: &str, model: &str) -> Self {
        // wss:// handshakes need a process-wide rustls provider.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            endpoint: session_endpoint(upstream_url, model),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.api_key.clone(), &config.upstream_url, &config.model)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl UpstreamConnector for RealtimeConnector {
    fn open(&self) -> Result<OpenedUpstream, UpstreamUnavailable> {
        let api_key = self
            .api_key
            .clone()
            .ok_or(UpstreamUnavailable::MissingCredential)?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Ok(OpenedUpstream {
            session: Box::new(RealtimeUpstream::new(
                api_key,
                self.endpoint.clone(),
                events_tx,
            )),
            events: UpstreamEvents::new(events_rx),
        })
    }
}

/// WebSocket session to the realtime service.
pub struct RealtimeUpstream {
    api_key: String,
    endpoint: String,
    state: SharedConnectionState,
    writer: Option<WsWriter>,
    /// Handed to the reader task on connect.
    events_tx: Option<mpsc::Sender<UpstreamEvent>>,
    reader: Option<JoinHandle<()>>,
}

impl RealtimeUpstream {
    fn new(api_key: String, endpoint: String, events_tx: mpsc::Sender<UpstreamEvent>) -> Self {
        Self {
            api_key,
            endpoint,
            state: SharedConnectionState::new(),
            writer: None,
            events_tx: Some(events_tx),
            reader: None,
        }
    }
}

#[async_trait]
impl UpstreamSession for RealtimeUpstream {
    async fn connect(&mut self) -> Result<(), ConnectError> {
        let current = self.state.get();
        if current != ConnectionState::Unconnected {
            return Err(ConnectError::InvalidState(current));
        }
        self.state.advance(ConnectionState::Connecting);

        info!(
            endpoint = %self.endpoint,
            key = %credential_prefix(&self.api_key),
            "Connecting to realtime service"
        );
        let authorization = format!("Bearer {}", self.api_key);
        let headers = [
            ("Authorization", authorization.as_str()),
            ("OpenAI-Beta", "realtime=v1"),
        ];
        let (writer, reader) = match transport::connect(&self.endpoint, &headers).await {
            Ok(halves) => halves,
            Err(e) => {
                self.state.close();
                return Err(e);
            }
        };

        let Some(events_tx) = self.events_tx.take() else {
            self.state.close();
            return Err(ConnectError::InvalidState(ConnectionState::Closed));
        };
        self.writer = Some(writer);
        self.reader = Some(tokio::spawn(pump_events(
            reader,
            events_tx,
            self.state.clone(),
        )));
        self.state.advance(ConnectionState::Connected);
        info!(endpoint = %self.endpoint, "Connected to realtime service");
        Ok(())
    }

    async fn send(&mut self, event_type: &str, payload: Value) -> Result<(), SendError> {
        if !self.is_ready() {
            return Err(SendError::NotConnected);
        }
        let event = outgoing_event(event_type, payload)?;
        let text = serde_json::to_string(&event)?;
        let writer = self.writer.as_mut().ok_or(SendError::NotConnected)?;
        if let Err(e) = writer.send_text(text).await {
            self.state.close();
            return Err(SendError::Transport(e.to_string()));
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.state.get() == ConnectionState::Connected
    }

    async fn disconnect(&mut self) {
        let was = self.state.get();
        self.state.close();
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.close().await {
                debug!(error = %e, "Upstream close handshake failed");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.events_tx = None;
        if was != ConnectionState::Closed {
            debug!(endpoint = %self.endpoint, previous = %was, "Upstream session disconnected");
        }
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

impl Drop for RealtimeUpstream {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Forward every server event to the subscription, then report closure once.
async fn pump_events(
    mut reader: WsReader,
    events_tx: mpsc::Sender<UpstreamEvent>,
    state: SharedConnectionState,
) {
    while let Some(message) = reader.recv().await {
        match message {
            Ok(WsMessage::Text(text)) => match parse_server_event(&text) {
                Some(event) => {
                    if events_tx.send(UpstreamEvent::Server(event)).await.is_err() {
                        state.close();
                        return;
                    }
                }
                None => warn!(len = text.len(), "Skipping upstream frame that is not a typed event"),
            },
            Ok(WsMessage::Binary(data)) => {
                debug!(len = data.len(), "Ignoring binary upstream frame");
            }
            Ok(WsMessage::Close { code, reason }) => {
                info!(code, reason = %reason, "Upstream closed the session");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Upstream read error");
                break;
            }
        }
    }
    state.close();
    let _ = events_tx.send(UpstreamEvent::Closed).await;
}

/// Accept only JSON objects carrying a string `type`.
pub(super) fn parse_server_event(text: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("type")?.as_str()?;
    Some(value)
}

/// Build the wire event: the client's payload with `type` set and an
/// `event_id` added unless the client supplied one.
pub fn outgoing_event(event_type: &str, payload: Value) -> Result<Value, SendError> {
    let Value::Object(mut event) = payload else {
        return Err(SendError::InvalidPayload);
    };
    event.insert("type".to_string(), Value::String(event_type.to_string()));
    if !event.contains_key("event_id") {
        event.insert("event_id".to_string(), Value::String(generate_event_id()));
    }
    Ok(Value::Object(event))
}

/// `evt_` followed by 21 alphanumerics.
pub(super) fn generate_event_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("evt_{}", &random[..EVENT_ID_LEN])
}

/// `<url>?model=<model>`, with an http(s) URL converted to ws(s).
pub(super) fn session_endpoint(upstream_url: &str, model: &str) -> String {
    let base = http_to_ws_scheme(upstream_url);
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}model={model}")
}
