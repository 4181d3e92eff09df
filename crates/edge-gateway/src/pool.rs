//! Connection pool: the device-id → live-session map.
//!
//! Readers share the lock; `put`/`remove` are exclusive. The lock is never
//! held across I/O, and closing a displaced or removed session's adapter is
//! left to the caller.

use std::collections::HashMap;
use std::sync::Arc;

use edge_proto::DeviceId;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::session::DeviceSession;

/// Map of devices to their live sessions.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    sessions: RwLock<HashMap<DeviceId, Arc<DeviceSession>>>,
}

impl ConnectionPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a device's session.
    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.read().get(device_id).cloned()
    }

    /// Insert a session, returning the one it displaced (last writer wins).
    pub fn put(&self, session: Arc<DeviceSession>) -> Option<Arc<DeviceSession>> {
        let device_id = session.device_id().clone();
        self.sessions.write().insert(device_id, session)
    }

    /// Remove a device's session, whichever connection it belongs to.
    pub fn remove(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.write().remove(device_id)
    }

    /// Remove a device's session only if it belongs to `connection_id`.
    pub fn remove_if(&self, device_id: &str, connection_id: Uuid) -> Option<Arc<DeviceSession>> {
        let mut sessions = self.sessions.write();
        match sessions.get(device_id) {
            Some(current) if current.connection_id() == connection_id => sessions.remove(device_id),
            _ => None,
        }
    }

    /// Get the number of pooled sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Check whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Get a point-in-time copy of every pooled session.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<DeviceSession>> {
        self.sessions.read().values().cloned().collect()
    }
}
