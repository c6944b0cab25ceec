//! Upstream session capability.
//!
//! A relay session talks to the remote streaming service only through
//! [`UpstreamSession`]. Sessions are produced per client by an
//! [`UpstreamConnector`], which is injected into the relay server so the
//! production WebSocket client and test doubles are interchangeable.

pub mod realtime;
mod transport;

#[cfg(test)]
mod realtime_tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

pub use realtime::{RealtimeConnector, RealtimeUpstream};

/// Lifecycle of one upstream session.
///
/// Moves strictly forward; `Closed` is terminal and reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Unconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
}

impl ConnectionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Connection state shared between an upstream handle and its reader task.
#[derive(Debug, Clone)]
pub struct SharedConnectionState(Arc<AtomicU8>);

impl SharedConnectionState {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionState::Unconnected as u8)))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if it is ahead of the current state.
    ///
    /// Returns `false` when the transition would move backwards.
    pub fn advance(&self, next: ConnectionState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (next as u8 > current).then_some(next as u8)
            })
            .is_ok()
    }

    pub fn close(&self) {
        self.0.store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

impl Default for SharedConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Notification delivered by an upstream subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// An event sent by the remote service, verbatim.
    Server(Value),
    /// The remote session ended.
    Closed,
}

/// Receiving side of an upstream subscription.
///
/// Yields `Closed` exactly once, either because the upstream reported it or
/// because the sending side went away, and `None` afterwards.
#[derive(Debug)]
pub struct UpstreamEvents {
    rx: mpsc::Receiver<UpstreamEvent>,
    closed: bool,
}

impl UpstreamEvents {
    pub const fn new(rx: mpsc::Receiver<UpstreamEvent>) -> Self {
        Self { rx, closed: false }
    }

    pub async fn recv(&mut self) -> Option<UpstreamEvent> {
        if self.closed {
            return None;
        }
        match self.rx.recv().await {
            Some(UpstreamEvent::Server(event)) => Some(UpstreamEvent::Server(event)),
            Some(UpstreamEvent::Closed) | None => {
                self.closed = true;
                Some(UpstreamEvent::Closed)
            }
        }
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }
}

/// One outbound session to the streaming service, owned by a single relay session.
#[async_trait]
pub trait UpstreamSession: Send {
    /// Open the session. Called at most once per handle.
    async fn connect(&mut self) -> Result<(), ConnectError>;

    /// Transmit a typed event. Calls are delivered in order, never coalesced.
    async fn send(&mut self, event_type: &str, payload: Value) -> Result<(), SendError>;

    /// `true` while the connection state is `Connected`.
    fn is_ready(&self) -> bool;

    /// Release transport resources. Idempotent, safe before `connect`.
    async fn disconnect(&mut self);

    fn state(&self) -> ConnectionState;
}

/// A freshly produced upstream handle and its single event subscription.
pub struct OpenedUpstream {
    pub session: Box<dyn UpstreamSession>,
    pub events: UpstreamEvents,
}

impl std::fmt::Debug for OpenedUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedUpstream")
            .field("state", &self.session.state())
            .finish_non_exhaustive()
    }
}

/// Produces one upstream session per relay session.
pub trait UpstreamConnector: Send + Sync {
    fn open(&self) -> Result<OpenedUpstream, UpstreamUnavailable>;
}

/// The upstream capability could not be produced for a session.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamUnavailable {
    #[error("No upstream credential configured")]
    MissingCredential,
}

/// The upstream session could not be established.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Upstream rejected the session (HTTP {status})")]
    Rejected { status: u16 },

    #[error("Upstream transport error: {0}")]
    Transport(String),

    #[error("Upstream connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid upstream request: {0}")]
    InvalidRequest(String),

    #[error("Connect called in state {0}")]
    InvalidState(ConnectionState),
}

/// An event could not be forwarded upstream.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Upstream session is not connected")]
    NotConnected,

    #[error("Event payload is not a JSON object")]
    InvalidPayload,

    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Upstream transport error: {0}")]
    Transport(String),
}

/// Wait for `connect`, optionally bounded by `limit`.
///
/// Expiry surfaces as [`ConnectError::Timeout`], the same failure path as a
/// refused connection.
pub async fn connect_with_timeout(
    session: &mut dyn UpstreamSession,
    limit: Option<Duration>,
) -> Result<(), ConnectError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, session.connect())
            .await
            .map_err(|_| ConnectError::Timeout(limit))?,
        None => session.connect().await,
    }
}

impl SendError {
    /// Whether the failure means the connection itself is gone, as opposed
    /// to this one payload being rejected.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Transport(_))
    }
}
