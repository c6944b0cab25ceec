//! In-memory registry of live relay sessions.
//!
//! The live connection count is the size of this registry. A session is
//! entered by [`ConnectionRegistry::register`] and leaves when its
//! [`SessionLease`] is dropped, so the count cannot drift or go negative.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use tracing::{info, warn};
use uuid::Uuid;

/// Identifier of one relay session.
pub type SessionId = Uuid;

/// Bookkeeping for an active session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: SessionId,
    pub opened_at: Instant,
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl RegistryInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Thread-safe registry of active relay sessions.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a new session. The returned lease keeps it counted.
    pub fn register(&self) -> SessionLease {
        let id = Uuid::new_v4();
        let count = {
            let mut sessions = self.inner.write();
            sessions.insert(
                id,
                SessionEntry {
                    id,
                    opened_at: Instant::now(),
                },
            );
            sessions.len()
        };
        info!(session_id = %id, count, "Relay session registered");
        SessionLease {
            id,
            registry: Arc::clone(&self.inner),
        }
    }

    /// Count of active sessions.
    pub fn connection_count(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_active(&self, id: &SessionId) -> bool {
        self.inner.read().contains_key(id)
    }

    /// Snapshot of the active sessions.
    pub fn sessions(&self) -> Vec<SessionEntry> {
        self.inner.read().values().cloned().collect()
    }
}

/// Membership of one session in the registry.
///
/// Dropping the lease removes the session, exactly once.
#[derive(Debug)]
pub struct SessionLease {
    id: SessionId,
    registry: Arc<RegistryInner>,
}

impl SessionLease {
    pub const fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let (removed, count) = {
            let mut sessions = self.registry.write();
            let removed = sessions.remove(&self.id);
            (removed, sessions.len())
        };
        match removed {
            Some(entry) => info!(
                session_id = %self.id,
                count,
                lifetime_ms = entry.opened_at.elapsed().as_millis(),
                "Relay session unregistered"
            ),
            None => warn!(session_id = %self.id, "Tried to unregister unknown session"),
        }
    }
}
