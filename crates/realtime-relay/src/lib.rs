//! Realtime Relay Library
//!
//! Bridges browser WebSocket clients to an upstream realtime service:
//! - Client event decoding
//! - Upstream session capability and the production realtime client
//! - Per-connection relay sessions with connect-time queueing
//! - Connection registry and status reporting
//! - axum HTTP/WebSocket front

pub mod event;
pub mod registry;
pub mod server;
pub mod session;
pub mod status;
pub mod upstream;

#[cfg(test)]
mod test_helpers;

pub use registry::{ConnectionRegistry, SessionId};
pub use server::{RelayServer, ServeError, build_router, serve};
pub use session::{CloseReason, RelaySession, SessionOptions, SessionReport, SessionState};
pub use status::RelayStatus;
pub use upstream::{RealtimeConnector, UpstreamConnector, UpstreamSession};
