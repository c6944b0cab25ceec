//! Status query answered on the relay path.

use serde::Serialize;

use crate::registry::ConnectionRegistry;

/// Body of the status response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub status: &'static str,
    pub count: usize,
    pub port: u16,
}

/// Reports the live session count and the port the relay is bound to.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    registry: ConnectionRegistry,
    port: u16,
}

impl StatusReporter {
    pub const fn new(registry: ConnectionRegistry, port: u16) -> Self {
        Self { registry, port }
    }

    /// Current status. Reads the registry at call time.
    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            status: "available",
            count: self.registry.connection_count(),
            port: self.port,
        }
    }
}
