//! Device session state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use edge_proto::{DeviceId, NodeId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::ConnectionAdapter;

/// Lifecycle state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Handshake accepted, not yet registered.
    Connecting,
    /// Registered in the pool with a live adapter.
    Online,
    /// Torn down after a closed transport, write failure or missed heartbeats.
    Offline,
    /// Torn down after a node failure with no usable backup.
    Failed,
}

impl SessionState {
    /// Check whether the session still owns its adapter.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Online)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Externally visible session status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// The device has a live session on this gateway.
    Online,
    /// The device has a suspended session that has not expired.
    Offline,
    /// Nothing is known about the device.
    Unknown,
}

/// Outcome of handing a command to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Written to the device's live connection.
    Delivered,
    /// Persisted in the offline queue for later delivery.
    Queued,
}

/// A command addressed to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Target device.
    pub device_id: DeviceId,
    /// Opaque payload.
    pub payload: Bytes,
    /// When the command was created.
    pub created_at: DateTime<Utc>,
}

impl Command {
    /// Create a command stamped with the current time.
    #[must_use]
    pub fn new(device_id: impl Into<DeviceId>, payload: impl Into<Bytes>) -> Self {
        Self {
            device_id: device_id.into(),
            payload: payload.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct Activity {
    last_seen: Instant,
    last_seen_wall: DateTime<Utc>,
}

/// One device's live session.
///
/// A session is created per accepted connection and never reused: a
/// reconnect creates a new session with a new `connection_id`.
pub struct DeviceSession {
    device_id: DeviceId,
    connection_id: Uuid,
    adapter: Arc<dyn ConnectionAdapter>,
    node: Option<NodeId>,
    keep_alive: Duration,
    heartbeat_interval: Duration,
    connected_at: DateTime<Utc>,
    resumed: bool,
    state: Mutex<SessionState>,
    activity: Mutex<Activity>,
    closed: CancellationToken,
    /// Serialises writes to this device so queued and live commands keep
    /// their order.
    pub(crate) lane: tokio::sync::Mutex<()>,
}

impl DeviceSession {
    /// Create a session in the `Connecting` state.
    #[must_use]
    pub fn new(
        device_id: DeviceId,
        adapter: Arc<dyn ConnectionAdapter>,
        node: Option<NodeId>,
        keep_alive: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            device_id,
            connection_id: Uuid::new_v4(),
            adapter,
            node,
            keep_alive,
            heartbeat_interval,
            connected_at: Utc::now(),
            resumed: false,
            state: Mutex::new(SessionState::Connecting),
            activity: Mutex::new(Activity {
                last_seen: Instant::now(),
                last_seen_wall: Utc::now(),
            }),
            closed: CancellationToken::new(),
            lane: tokio::sync::Mutex::new(()),
        }
    }

    /// Mark the session as resuming a suspended one.
    #[must_use]
    pub fn with_resumed(mut self, resumed: bool) -> Self {
        self.resumed = resumed;
        self
    }

    /// Get the device ID.
    #[must_use]
    pub const fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the per-connection identifier.
    #[must_use]
    pub const fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Get the adapter.
    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn ConnectionAdapter> {
        &self.adapter
    }

    /// Get the node the device is assigned to.
    #[must_use]
    pub const fn node(&self) -> Option<&NodeId> {
        self.node.as_ref()
    }

    /// Get the keep-alive requested by the device.
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Get the heartbeat interval in force when the session started.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Get when the session was created.
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Check whether a suspended session was found when this one connected.
    #[must_use]
    pub const fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move `Connecting` to `Online`. Returns `false` in any other state.
    pub fn mark_online(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Connecting {
            *state = SessionState::Online;
            true
        } else {
            false
        }
    }

    /// Move a live session to `next` and signal its read loop.
    ///
    /// Returns `true` only for the caller that performed the transition;
    /// every later caller gets `false`.
    pub fn end(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if !state.is_live() {
            return false;
        }
        *state = next;
        drop(state);
        self.closed.cancel();
        true
    }

    /// Get a token cancelled when the session ends.
    #[must_use]
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Record activity from the device.
    pub fn touch(&self) {
        let mut activity = self.activity.lock();
        activity.last_seen = Instant::now();
        activity.last_seen_wall = Utc::now();
    }

    /// Get the monotonic time of the last activity.
    #[must_use]
    pub fn last_seen(&self) -> Instant {
        self.activity.lock().last_seen
    }

    /// Get the wall-clock time of the last activity.
    #[must_use]
    pub fn last_seen_wall(&self) -> DateTime<Utc> {
        self.activity.lock().last_seen_wall
    }

    /// Get how long the device has been silent.
    #[must_use]
    pub fn idle(&self) -> Duration {
        self.last_seen().elapsed()
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device_id", &self.device_id)
            .field("connection_id", &self.connection_id)
            .field("node", &self.node)
            .field("state", &self.state())
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}
