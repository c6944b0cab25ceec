//! Relay session: one client connection paired with one upstream session.
//!
//! State flow:
//! ```text
//! Initializing -> ConnectingUpstream -> Relaying -> Closed
//!       \________________\_______________________/^
//! ```
//!
//! The session runs as a single task driven by discrete inputs: client
//! frames, upstream events, the upstream close notification, client close
//! and the connect result. Client frames that arrive before the upstream is
//! ready are queued raw and drained in arrival order, one awaited send at a
//! time, before any later frame is read from the client channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::event::{ClientEvent, ClientFrame, decode_client_frame};
use crate::registry::{SessionId, SessionLease};
use crate::upstream::{
    OpenedUpstream, UpstreamConnector, UpstreamEvent, UpstreamEvents, UpstreamSession,
    connect_with_timeout,
};


/// Longest client frame excerpt written to logs.
const LOG_PREVIEW_CHARS: usize = 120;

/// Per-session tunables.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// Bound on the upstream connect attempt. `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
}

/// Instruction for the task that owns the client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Transmit a text frame.
    Text(String),
    /// Close the client connection.
    Close,
}

/// Session side of the client connection.
///
/// The inbound channel closing means the client went away.
#[derive(Debug)]
pub struct ClientChannel {
    pub inbound: mpsc::Receiver<ClientFrame>,
    pub outbound: mpsc::Sender<ClientCommand>,
}

/// Socket side of the client connection.
#[derive(Debug)]
pub struct ClientEndpoint {
    pub inbound: mpsc::Sender<ClientFrame>,
    pub outbound: mpsc::Receiver<ClientCommand>,
}

impl ClientChannel {
    /// Create a connected channel/endpoint pair with the given capacity.
    pub fn pair(capacity: usize) -> (Self, ClientEndpoint) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        (
            Self {
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
            ClientEndpoint {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    ConnectingUpstream,
    Relaying,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::ConnectingUpstream => "connecting_upstream",
            Self::Relaying => "relaying",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client connection closed.
    ClientClosed,
    /// The upstream reported the remote session ended.
    UpstreamClosed,
    /// No upstream handle could be produced.
    UpstreamUnavailable,
    /// The upstream connect attempt failed or timed out.
    ConnectFailed,
    /// The upstream transport died while forwarding.
    UpstreamSendFailed,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ClientClosed => "client_closed",
            Self::UpstreamClosed => "upstream_closed",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::ConnectFailed => "connect_failed",
            Self::UpstreamSendFailed => "upstream_send_failed",
        };
        f.write_str(name)
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub reason: CloseReason,
    pub final_state: SessionState,
    /// Client events delivered to the upstream.
    pub to_upstream: u64,
    /// Upstream events delivered to the client.
    pub to_client: u64,
    /// Client frames dropped (undecodable or rejected payloads).
    pub dropped: u64,
    /// Queued client frames discarded because the session closed first.
    pub discarded: usize,
}

#[derive(Debug, Default)]
struct RelayStats {
    to_upstream: u64,
    to_client: u64,
    dropped: u64,
    discarded: usize,
}

/// Owns one client connection and its upstream session.
pub struct RelaySession {
    id: SessionId,
    connector: Arc<dyn UpstreamConnector>,
    client: ClientChannel,
    lease: Option<SessionLease>,
    options: SessionOptions,
    pending: VecDeque<ClientFrame>,
    upstream_ready: bool,
    state: SessionState,
    closed: Option<CloseReason>,
    stats: RelayStats,
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("upstream_ready", &self.upstream_ready)
            .finish_non_exhaustive()
    }
}

impl RelaySession {
    /// Create a session. The lease keeps it counted until teardown.
    pub fn new(
        lease: SessionLease,
        connector: Arc<dyn UpstreamConnector>,
        client: ClientChannel,
        options: SessionOptions,
    ) -> Self {
        Self {
            id: lease.id(),
            connector,
            client,
            lease: Some(lease),
            options,
            pending: VecDeque::new(),
            upstream_ready: false,
            state: SessionState::Initializing,
            closed: None,
            stats: RelayStats::default(),
        }
    }

    pub const fn id(&self) -> SessionId {
        self.id
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until either side closes.
    pub async fn run(mut self) -> SessionReport {
        let OpenedUpstream {
            session: mut upstream,
            mut events,
        } = match self.connector.open() {
            Ok(opened) => opened,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Failed to load upstream client");
                return self.teardown(None, CloseReason::UpstreamUnavailable).await;
            }
        };

        let reason = self.relay(upstream.as_mut(), &mut events).await;
        self.teardown(Some(upstream.as_mut()), reason).await
    }

    async fn relay(
        &mut self,
        upstream: &mut dyn UpstreamSession,
        events: &mut UpstreamEvents,
    ) -> CloseReason {
        if let Err(reason) = self.connect_upstream(upstream, events).await {
            return reason;
        }
        if let Err(reason) = self.drain_pending(upstream).await {
            return reason;
        }
        self.upstream_ready = true;
        self.transition(SessionState::Relaying);

        loop {
            tokio::select! {
                frame = self.client.inbound.recv() => {
                    let Some(frame) = frame else {
                        return CloseReason::ClientClosed;
                    };
                    if let Err(reason) = self.forward_to_upstream(upstream, frame).await {
                        return reason;
                    }
                }
                event = events.recv() => match event {
                    Some(UpstreamEvent::Server(event)) => {
                        if let Err(reason) = self.forward_to_client(event).await {
                            return reason;
                        }
                    }
                    Some(UpstreamEvent::Closed) | None => return CloseReason::UpstreamClosed,
                },
            }
        }
    }

    /// Connect while queueing client frames and passing upstream events through.
    async fn connect_upstream(
        &mut self,
        upstream: &mut dyn UpstreamSession,
        events: &mut UpstreamEvents,
    ) -> Result<(), CloseReason> {
        self.transition(SessionState::ConnectingUpstream);
        info!(session_id = %self.id, "Connecting to upstream");

        let connect = connect_with_timeout(upstream, self.options.connect_timeout);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(()) => {
                            info!(
                                session_id = %self.id,
                                queued = self.pending.len(),
                                "Connected to upstream"
                            );
                            Ok(())
                        }
                        Err(e) => {
                            warn!(
                                session_id = %self.id,
                                error = %e,
                                queued = self.pending.len(),
                                "Error connecting to upstream"
                            );
                            Err(CloseReason::ConnectFailed)
                        }
                    };
                }
                frame = self.client.inbound.recv() => match frame {
                    Some(frame) => self.enqueue(frame),
                    None => return Err(CloseReason::ClientClosed),
                },
                event = events.recv() => match event {
                    Some(UpstreamEvent::Server(event)) => self.forward_to_client(event).await?,
                    Some(UpstreamEvent::Closed) | None => return Err(CloseReason::UpstreamClosed),
                },
            }
        }
    }

    fn enqueue(&mut self, frame: ClientFrame) {
        debug!(
            session_id = %self.id,
            len = frame.len(),
            queued = self.pending.len() + 1,
            "Queueing client message until upstream is ready"
        );
        self.pending.push_back(frame);
    }

    /// Forward queued frames in arrival order, awaiting each send.
    async fn drain_pending(&mut self, upstream: &mut dyn UpstreamSession) -> Result<(), CloseReason> {
        if !self.pending.is_empty() {
            info!(
                session_id = %self.id,
                queued = self.pending.len(),
                "Draining queued client messages"
            );
        }
        while let Some(frame) = self.pending.pop_front() {
            self.forward_to_upstream(upstream, frame).await?;
        }
        Ok(())
    }

    /// Decode and send one client frame. Only a dead transport ends the session.
    async fn forward_to_upstream(
        &mut self,
        upstream: &mut dyn UpstreamSession,
        frame: ClientFrame,
    ) -> Result<(), CloseReason> {
        let ClientEvent {
            event_type,
            payload,
        } = match decode_client_frame(&frame) {
            Ok(event) => event,
            Err(e) => {
                self.stats.dropped += 1;
                warn!(
                    session_id = %self.id,
                    error = %e,
                    frame = %frame.preview(LOG_PREVIEW_CHARS),
                    "Error parsing event from client"
                );
                return Ok(());
            }
        };

        debug!(session_id = %self.id, event_type = %event_type, "Relaying event to upstream");
        match upstream.send(&event_type, Value::Object(payload)).await {
            Ok(()) => {
                self.stats.to_upstream += 1;
                Ok(())
            }
            Err(e) if e.is_transport() => {
                error!(
                    session_id = %self.id,
                    event_type = %event_type,
                    error = %e,
                    "Upstream transport failed while relaying"
                );
                Err(CloseReason::UpstreamSendFailed)
            }
            Err(e) => {
                self.stats.dropped += 1;
                warn!(
                    session_id = %self.id,
                    event_type = %event_type,
                    error = %e,
                    "Upstream rejected client event"
                );
                Ok(())
            }
        }
    }

    /// Transmit an upstream event to the client verbatim.
    async fn forward_to_client(&mut self, event: Value) -> Result<(), CloseReason> {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
        debug!(session_id = %self.id, event_type = %event_type, "Relaying event to client");
        self.client
            .outbound
            .send(ClientCommand::Text(event.to_string()))
            .await
            .map_err(|_| CloseReason::ClientClosed)?;
        self.stats.to_client += 1;
        Ok(())
    }

    /// Release both sides. Runs once; later calls only report.
    async fn teardown(
        &mut self,
        upstream: Option<&mut dyn UpstreamSession>,
        reason: CloseReason,
    ) -> SessionReport {
        if self.closed.is_none() {
            self.closed = Some(reason);

            if let Some(upstream) = upstream {
                upstream.disconnect().await;
            }
            if reason != CloseReason::ClientClosed {
                // A full channel is fine: dropping the sender closes the socket too.
                let _ = self.client.outbound.try_send(ClientCommand::Close);
            }
            self.stats.discarded = self.pending.len();
            self.pending.clear();
            self.transition(SessionState::Closed);

            info!(
                session_id = %self.id,
                reason = %reason,
                to_upstream = self.stats.to_upstream,
                to_client = self.stats.to_client,
                dropped = self.stats.dropped,
                discarded = self.stats.discarded,
                "Relay session closed"
            );
            self.lease.take();
        }
        self.report()
    }

    fn report(&self) -> SessionReport {
        SessionReport {
            session_id: self.id,
            reason: self.closed.unwrap_or(CloseReason::ClientClosed),
            final_state: self.state,
            to_upstream: self.stats.to_upstream,
            to_client: self.stats.to_client,
            dropped: self.stats.dropped,
            discarded: self.stats.discarded,
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(session_id = %self.id, from = %self.state, to = %next, "Session state changed");
            self.state = next;
        }
    }
}
