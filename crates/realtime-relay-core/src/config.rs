//! Configuration model for the relay.
//!
//! Values arrive from the command line or the environment (see the relay
//! binary's `Args`) and are validated here before anything binds a socket.
//! A missing upstream credential is not an error: the relay
//! still starts and individual sessions fail at the upstream step.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Path that serves both the status query and the relay WebSocket.
pub const RELAY_PATH: &str = "/api/ws";

/// Default realtime service endpoint.
pub const DEFAULT_UPSTREAM_URL: &str = "wss://api.openai.com/v1/realtime";

/// Default realtime model requested from the upstream service.
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";

/// Complete relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Hostname to bind.
    pub host: String,
    /// Port to bind. `0` asks the OS for an ephemeral port.
    pub port: u16,
    /// Process-wide upstream credential. Never serialized.
    #[serde(skip)]
    pub api_key: Option<String>,
    /// Upstream realtime endpoint (`ws://` or `wss://`).
    pub upstream_url: String,
    /// Model passed to the upstream as a query parameter.
    pub model: String,
    /// Bound on the upstream connect attempt. `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
    /// Capacity of the per-session client channels.
    pub client_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
            api_key: None,
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            connect_timeout: None,
            client_buffer: 256,
        }
    }
}

impl RelayConfig {
    /// Check values that would otherwise fail later at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.client_buffer == 0 {
            return Err(Error::Config("client buffer must be greater than 0".into()));
        }
        if !(self.upstream_url.starts_with("ws://") || self.upstream_url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "upstream URL must use ws:// or wss://, got {}",
                self.upstream_url
            )));
        }
        if self.model.trim().is_empty() {
            return Err(Error::Config("model must not be empty".into()));
        }
        Ok(())
    }

    /// Whether a usable credential is configured.
    pub fn has_credential(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    /// Startup diagnostic for a missing credential.
    ///
    /// Returns `None` when a credential is present.
    pub fn credential_warning(&self) -> Option<String> {
        if self.has_credential() {
            None
        } else {
            Some(
                "Environment variable \"OPENAI_API_KEY\" is missing; relay sessions will close \
                 at the upstream connect step"
                    .to_string(),
            )
        }
    }

    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// First three characters of a credential, for log lines.
pub fn credential_prefix(key: &str) -> String {
    let prefix: String = key.chars().take(3).collect();
    format!("{prefix}...")
}
