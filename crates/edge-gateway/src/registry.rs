//! Device registry contract.
//!
//! The registry owns durable device metadata and lives outside the gateway
//! core. The core asks it whether a device exists and tells it when a
//! device's status changes; status reports are best-effort and never hold
//! up a session transition.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edge_proto::DeviceId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionState;

/// Device status reported to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Connected to a gateway.
    Online,
    /// Disconnected; commands are being queued.
    Offline,
    /// Lost with its node and no backup could take over.
    Failed,
}

impl From<SessionState> for DeviceStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Connecting | SessionState::Online => Self::Online,
            SessionState::Offline => Self::Offline,
            SessionState::Failed => Self::Failed,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Errors returned by a registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry could not be reached.
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// The registry refused the update.
    #[error("registry rejected update: {0}")]
    Rejected(String),
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Device registry capability consumed by the gateway core.
#[async_trait]
pub trait DeviceRegistry: Send + Sync + fmt::Debug {
    /// Check whether a device is registered. Membership is exact.
    async fn exists(&self, device_id: &DeviceId) -> RegistryResult<bool>;

    /// Record a device's latest status.
    async fn record_seen(
        &self,
        device_id: &DeviceId,
        status: DeviceStatus,
        at: DateTime<Utc>,
    ) -> RegistryResult<()>;
}

/// Last status recorded for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenRecord {
    /// Reported status.
    pub status: DeviceStatus,
    /// When it was reported.
    pub at: DateTime<Utc>,
}

/// Registry kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    devices: RwLock<HashMap<DeviceId, Option<SeenRecord>>>,
}

impl InMemoryRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the given devices.
    #[must_use]
    pub fn with_devices<I, D>(devices: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceId>,
    {
        let registry = Self::new();
        for device in devices {
            registry.register(device.into());
        }
        registry
    }

    /// Register a device. Returns `false` if it was already registered.
    pub fn register(&self, device_id: DeviceId) -> bool {
        let mut devices = self.devices.write();
        if devices.contains_key(&device_id) {
            return false;
        }
        devices.insert(device_id, None);
        true
    }

    /// Remove a device.
    pub fn deregister(&self, device_id: &DeviceId) -> bool {
        self.devices.write().remove(device_id).is_some()
    }

    /// Get the last status recorded for a device.
    #[must_use]
    pub fn last_seen(&self, device_id: &DeviceId) -> Option<SeenRecord> {
        self.devices.read().get(device_id).copied().flatten()
    }

    /// Get the number of registered devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Check whether no device is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryRegistry {
    async fn exists(&self, device_id: &DeviceId) -> RegistryResult<bool> {
        Ok(self.devices.read().contains_key(device_id))
    }

    async fn record_seen(
        &self,
        device_id: &DeviceId,
        status: DeviceStatus,
        at: DateTime<Utc>,
    ) -> RegistryResult<()> {
        // A device seen on the wire is registered implicitly.
        self.devices
            .write()
            .insert(device_id.clone(), Some(SeenRecord { status, at }));
        Ok(())
    }
}
