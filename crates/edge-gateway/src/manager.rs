//! Session manager.
//!
//! Owns the connection pool, the node ring handle, the offline store and
//! the adaptive heartbeat, and is the only component that moves sessions
//! between states:
//!
//! ```text
//! Connecting ──► Online ──► Offline ──► (reconnect) Online
//!                  │
//!                  └──────► Failed (failover found no backup)
//! ```
//!
//! Teardown happens in one place ([`SessionManager::disconnect`] and the
//! helpers that call into it) and is idempotent. Every write to a device
//! goes through that device's session lane, so queued commands are always
//! flushed before newer ones are written live.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use edge_persist::{OfflineStore, SessionSnapshot};
use edge_proto::{encode_publish, DeviceId, Handshake, NodeId};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{AdapterError, AdapterResult, ConnectionAdapter};
use crate::config::SessionConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::failover::BackupConnector;
use crate::heartbeat::AdaptiveHeartbeat;
use crate::pool::ConnectionPool;
use crate::registry::{DeviceRegistry, DeviceStatus};
use crate::ring::NodeRing;
use crate::session::{Command, Delivery, DeviceSession, SessionState, SessionStatus};

/// Result of registering a connection.
#[derive(Debug)]
pub struct Connected {
    /// The new session.
    pub session: Arc<DeviceSession>,
    /// Whether an older live session for the same device was displaced.
    pub displaced: bool,
    /// Number of queued commands delivered during connect.
    pub replayed: usize,
}

/// Outcome of flushing a device's queue through its adapter.
#[derive(Debug, Default)]
pub(crate) struct FlushOutcome {
    /// Sequence numbers written and acknowledged, in order.
    pub delivered: Vec<u64>,
    /// The write error that stopped the flush, if any.
    pub failed: Option<AdapterError>,
}

/// Coordinates device sessions on one gateway node.
pub struct SessionManager {
    config: SessionConfig,
    local_node: Option<NodeId>,
    ring: Arc<NodeRing>,
    pool: ConnectionPool,
    store: Arc<OfflineStore>,
    heartbeat: AdaptiveHeartbeat,
    registry: Option<Arc<dyn DeviceRegistry>>,
    pub(crate) connector: Option<Arc<dyn BackupConnector>>,
    shutdown: CancellationToken,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("local_node", &self.local_node)
            .field("online", &self.pool.count())
            .field("ring_nodes", &self.ring.len())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager over the given ring and store.
    #[must_use]
    pub fn new(config: SessionConfig, ring: Arc<NodeRing>, store: Arc<OfflineStore>) -> Self {
        let heartbeat = AdaptiveHeartbeat::new(config.heartbeat_policy());
        Self {
            config,
            local_node: None,
            ring,
            pool: ConnectionPool::new(),
            store,
            heartbeat,
            registry: None,
            connector: None,
            shutdown: CancellationToken::new(),
            drivers: Mutex::new(Vec::new()),
        }
    }

    /// Set this gateway's node id.
    #[must_use]
    pub fn with_local_node(mut self, node: NodeId) -> Self {
        self.local_node = Some(node);
        self
    }

    /// Attach a device registry for existence checks and status reports.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn DeviceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Attach the connector used to reach backup nodes during failover.
    #[must_use]
    pub fn with_backup_connector(mut self, connector: Arc<dyn BackupConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Get the session configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get this gateway's node id.
    #[must_use]
    pub const fn local_node(&self) -> Option<&NodeId> {
        self.local_node.as_ref()
    }

    /// Get the node ring.
    #[must_use]
    pub fn ring(&self) -> &Arc<NodeRing> {
        &self.ring
    }

    /// Get the offline store.
    #[must_use]
    pub fn store(&self) -> &Arc<OfflineStore> {
        &self.store
    }

    /// Get the connection pool.
    #[must_use]
    pub const fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Get the heartbeat interval currently in force.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat.current_interval()
    }

    /// Get the token cancelled by [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ==================== Connect ====================

    /// Register a decoded handshake's connection.
    ///
    /// # Errors
    ///
    /// See [`connect`](Self::connect).
    pub async fn connect_handshake(
        &self,
        handshake: &Handshake,
        adapter: Arc<dyn ConnectionAdapter>,
    ) -> GatewayResult<Connected> {
        self.connect(handshake.device_id(), adapter, handshake.keep_alive())
            .await
    }

    /// Register a device's new connection.
    ///
    /// An existing live session for the device is displaced and its adapter
    /// closed. Queued commands are replayed when `replay_on_connect` is set;
    /// a replay write failure takes the new session offline again but does
    /// not fail the connect.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShuttingDown`] during shutdown, or a
    /// persistence error if the store cannot be read.
    pub async fn connect(
        &self,
        device_id: DeviceId,
        adapter: Arc<dyn ConnectionAdapter>,
        keep_alive: Duration,
    ) -> GatewayResult<Connected> {
        let node = self.ring.node_for(device_id.as_str());
        self.connect_on(device_id, adapter, keep_alive, node).await
    }

    pub(crate) async fn connect_on(
        &self,
        device_id: DeviceId,
        adapter: Arc<dyn ConnectionAdapter>,
        keep_alive: Duration,
        node: Option<NodeId>,
    ) -> GatewayResult<Connected> {
        if self.shutdown.is_cancelled() {
            adapter.close().await;
            return Err(GatewayError::ShuttingDown);
        }

        let resumed = self.store.take_session_snapshot(device_id.as_str())?.is_some();
        let session = Arc::new(
            DeviceSession::new(
                device_id.clone(),
                adapter,
                node,
                keep_alive,
                self.heartbeat.current_interval(),
            )
            .with_resumed(resumed),
        );
        session.mark_online();

        let displaced = self.pool.put(Arc::clone(&session));
        let displaced = match displaced {
            Some(old) => {
                info!(
                    device_id = %device_id,
                    old_connection = %old.connection_id(),
                    new_connection = %session.connection_id(),
                    "Displaced existing session"
                );
                old.end(SessionState::Offline);
                old.adapter().close().await;
                true
            }
            None => false,
        };

        info!(
            device_id = %device_id,
            connection_id = %session.connection_id(),
            node = ?session.node(),
            resumed,
            keep_alive_secs = keep_alive.as_secs(),
            "Device online"
        );
        self.report_status(&device_id, DeviceStatus::Online);

        let replayed = if self.config.replay_on_connect {
            match self.replay(&session).await {
                Ok(count) => count,
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "Replay failed");
                    self.end_session(&session, SessionState::Offline, "replay failed")
                        .await;
                    return Err(e);
                }
            }
        } else {
            0
        };

        Ok(Connected {
            session,
            displaced,
            replayed,
        })
    }

    /// Flush a session's queued commands through its adapter.
    ///
    /// Returns the number delivered. A write failure stops the flush and
    /// takes the session offline; the rest stay queued in order.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the queue cannot be read or updated.
    pub async fn replay(&self, session: &Arc<DeviceSession>) -> GatewayResult<usize> {
        let outcome = self.flush_queue(session).await?;
        if !outcome.delivered.is_empty() {
            info!(
                device_id = %session.device_id(),
                count = outcome.delivered.len(),
                "Replayed queued commands"
            );
        }
        Ok(outcome.delivered.len())
    }

    pub(crate) async fn flush_queue(
        &self,
        session: &Arc<DeviceSession>,
    ) -> GatewayResult<FlushOutcome> {
        let device = session.device_id().as_str();
        let lane = session.lane.lock().await;

        let mut outcome = FlushOutcome::default();
        for command in self.store.pending_commands(device)? {
            if !session.state().is_live() {
                break;
            }
            let frame = encode_publish(&command.payload)?;
            match self.write_frame(session, frame).await {
                Ok(()) => {
                    self.store.remove_command(device, command.seq)?;
                    outcome.delivered.push(command.seq);
                }
                Err(e) => {
                    outcome.failed = Some(e);
                    break;
                }
            }
        }
        drop(lane);

        if let Some(e) = &outcome.failed {
            warn!(device_id = %device, error = %e, "Write failed while flushing queue");
            self.end_session(session, SessionState::Offline, "write failed")
                .await;
        }
        Ok(outcome)
    }

    /// Write a frame to a session's adapter, feeding the write time into
    /// the adaptive heartbeat.
    async fn write_frame(&self, session: &DeviceSession, frame: Bytes) -> AdapterResult<()> {
        let started = Instant::now();
        session.adapter().send(frame).await?;
        self.heartbeat.record(started.elapsed());
        Ok(())
    }

    // ==================== Activity ====================

    /// Record activity on a device's connection.
    ///
    /// Returns `false` if `connection_id` is not the device's live session.
    pub fn touch(&self, device_id: &DeviceId, connection_id: Uuid) -> bool {
        match self.pool.get(device_id.as_str()) {
            Some(session) if session.connection_id() == connection_id => {
                session.touch();
                true
            }
            _ => false,
        }
    }

    /// Feed a round-trip latency sample into the adaptive heartbeat.
    pub fn record_latency(&self, sample: Duration) {
        self.heartbeat.record(sample);
        debug!(
            sample_ms = sample.as_millis() as u64,
            interval_ms = self.heartbeat.current_interval().as_millis() as u64,
            "Recorded latency sample"
        );
    }

    // ==================== Teardown ====================

    /// Take one specific connection offline.
    ///
    /// A no-op returning `false` when that connection is no longer the
    /// device's live session.
    pub async fn disconnect(&self, device_id: &DeviceId, connection_id: Uuid, reason: &str) -> bool {
        let Some(session) = self.pool.get(device_id.as_str()) else {
            return false;
        };
        if session.connection_id() != connection_id {
            return false;
        }
        self.end_session(&session, SessionState::Offline, reason).await
    }

    /// Take a device's live session offline, whichever connection it is.
    pub async fn mark_offline(&self, device_id: &DeviceId, reason: &str) -> bool {
        match self.pool.get(device_id.as_str()) {
            Some(session) => self.end_session(&session, SessionState::Offline, reason).await,
            None => false,
        }
    }

    /// End a session: snapshot it, unpool it, close its adapter.
    ///
    /// Only the first caller for a given session does any work.
    pub(crate) async fn end_session(
        &self,
        session: &Arc<DeviceSession>,
        next: SessionState,
        reason: &str,
    ) -> bool {
        if !session.end(next) {
            return false;
        }
        let device_id = session.device_id();

        let snapshot = SessionSnapshot {
            device_id: device_id.to_string(),
            node: session.node().map(ToString::to_string),
            keep_alive_secs: u16::try_from(session.keep_alive().as_secs()).unwrap_or(u16::MAX),
            heartbeat_interval_ms: session.heartbeat_interval().as_millis() as u64,
            last_seen: session.last_seen_wall(),
            disconnected_at: Utc::now(),
            state: next.to_string(),
            reason: reason.to_string(),
        };
        if let Err(e) = self.store.save_session_snapshot(&snapshot) {
            warn!(device_id = %device_id, error = %e, "Failed to save session snapshot");
        }

        self.pool.remove_if(device_id.as_str(), session.connection_id());
        session.adapter().close().await;

        info!(
            device_id = %device_id,
            connection_id = %session.connection_id(),
            state = %next,
            reason,
            "Device offline"
        );
        self.report_status(device_id, DeviceStatus::from(next));
        true
    }

    // ==================== Commands ====================

    /// Deliver a command to a device, or queue it if the device is not
    /// reachable.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the payload cannot be framed, or a
    /// persistence error if it had to be queued and the store failed. In
    /// both cases the command is neither delivered nor queued.
    pub async fn send_command(
        &self,
        device_id: &DeviceId,
        payload: impl Into<Bytes>,
    ) -> GatewayResult<Delivery> {
        let payload = payload.into();
        let frame = encode_publish(&payload)?;
        let device = device_id.as_str();

        if let Some(session) = self.pool.get(device) {
            let lane = session.lane.lock().await;
            if session.state().is_live() && self.store.pending_count(device)? == 0 {
                match self.write_frame(&session, frame).await {
                    Ok(()) => {
                        debug!(device_id = %device_id, bytes = payload.len(), "Command delivered");
                        return Ok(Delivery::Delivered);
                    }
                    Err(e) => {
                        drop(lane);
                        warn!(device_id = %device_id, error = %e, "Command write failed");
                        self.end_session(&session, SessionState::Offline, "write failed")
                            .await;
                    }
                }
            }
        }

        let seq = self.store.enqueue_command(device, &payload)?;
        debug!(device_id = %device_id, seq, "Command queued");

        // The device may have come online while the command was queued.
        if let Some(session) = self.pool.get(device) {
            let outcome = self.flush_queue(&session).await?;
            if outcome.delivered.contains(&seq) {
                return Ok(Delivery::Delivered);
            }
        }
        Ok(Delivery::Queued)
    }

    /// Deliver or queue a [`Command`].
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn dispatch(&self, command: Command) -> GatewayResult<Delivery> {
        self.send_command(&command.device_id, command.payload).await
    }

    /// Remove and return every queued payload for a device, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the store fails.
    pub fn drain_commands(&self, device_id: &DeviceId) -> GatewayResult<Vec<Bytes>> {
        Ok(self
            .store
            .drain_commands(device_id.as_str())?
            .into_iter()
            .map(Bytes::from)
            .collect())
    }

    /// Get the number of commands queued for a device.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the store fails.
    pub fn pending_count(&self, device_id: &DeviceId) -> GatewayResult<usize> {
        Ok(self.store.pending_count(device_id.as_str())?)
    }

    // ==================== Queries ====================

    /// Get the node a device is assigned to.
    #[must_use]
    pub fn route(&self, device_id: &DeviceId) -> Option<NodeId> {
        self.ring.node_for(device_id.as_str())
    }

    /// Get up to `count` distinct nodes for a device, owner first.
    #[must_use]
    pub fn routes(&self, device_id: &DeviceId, count: usize) -> Vec<NodeId> {
        self.ring.nodes_for(device_id.as_str(), count)
    }

    /// Get a device's session status.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the snapshot cannot be read.
    pub fn session_status(&self, device_id: &DeviceId) -> GatewayResult<SessionStatus> {
        if let Some(session) = self.pool.get(device_id.as_str()) {
            if session.state() == SessionState::Online {
                return Ok(SessionStatus::Online);
            }
        }
        if self.store.load_session_snapshot(device_id.as_str())?.is_some() {
            return Ok(SessionStatus::Offline);
        }
        Ok(SessionStatus::Unknown)
    }

    /// Get the number of live sessions.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.pool.count()
    }

    /// Check a device against the registry. Devices are accepted when no
    /// registry is attached.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownDevice`] if the registry fails or
    /// does not answer in time.
    pub async fn device_known(&self, device_id: &DeviceId) -> GatewayResult<bool> {
        let Some(registry) = &self.registry else {
            return Ok(true);
        };
        match tokio::time::timeout(self.config.registry_timeout(), registry.exists(device_id)).await
        {
            Ok(Ok(known)) => Ok(known),
            Ok(Err(e)) => {
                warn!(device_id = %device_id, error = %e, "Registry lookup failed");
                Err(GatewayError::UnknownDevice(device_id.clone()))
            }
            Err(_) => {
                warn!(device_id = %device_id, "Registry lookup timed out");
                Err(GatewayError::UnknownDevice(device_id.clone()))
            }
        }
    }

    // ==================== Background drivers ====================

    /// Take every session silent for longer than the liveness threshold
    /// offline. Returns the devices taken offline.
    pub async fn check_liveness(&self) -> Vec<DeviceId> {
        let threshold = self.config.liveness_threshold();
        let mut evicted = Vec::new();
        for session in self.pool.snapshot() {
            if session.idle() <= threshold {
                continue;
            }
            if self
                .end_session(&session, SessionState::Offline, "liveness timeout")
                .await
            {
                evicted.push(session.device_id().clone());
            }
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Liveness check evicted sessions");
        }
        evicted
    }

    /// Delete expired session snapshots.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the sweep fails.
    pub fn purge_expired_snapshots(&self) -> GatewayResult<usize> {
        Ok(self.store.purge_expired(Utc::now())?)
    }

    /// Start the liveness driver and the snapshot expiry sweep.
    pub fn start(self: &Arc<Self>, purge_interval: Duration) {
        let liveness = tokio::spawn(Arc::clone(self).run_liveness_driver());
        let purge = tokio::spawn(Arc::clone(self).run_purge_sweep(purge_interval));
        self.drivers.lock().extend([liveness, purge]);
    }

    async fn run_liveness_driver(self: Arc<Self>) {
        debug!("Liveness driver started");
        loop {
            let period = self.heartbeat.current_interval();
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(period) => {
                    self.check_liveness().await;
                }
            }
        }
        debug!("Liveness driver stopped");
    }

    async fn run_purge_sweep(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.purge_expired_snapshots() {
                        warn!(error = %e, "Snapshot purge failed");
                    }
                }
            }
        }
        debug!("Snapshot sweep stopped");
    }

    /// Stop the background drivers, take every session offline and flush
    /// the store.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the final flush fails.
    pub async fn shutdown(&self) -> GatewayResult<()> {
        self.shutdown.cancel();

        let drivers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.drivers.lock());
        for driver in drivers {
            if let Err(e) = driver.await {
                warn!(error = %e, "Background driver ended abnormally");
            }
        }

        let sessions = self.pool.snapshot();
        let count = sessions.len();
        for session in sessions {
            self.end_session(&session, SessionState::Offline, "shutdown")
                .await;
        }

        self.store.flush()?;
        info!(sessions = count, "Session manager stopped");
        Ok(())
    }

    // ==================== Registry ====================

    pub(crate) fn report_status(&self, device_id: &DeviceId, status: DeviceStatus) {
        let Some(registry) = self.registry.clone() else {
            return;
        };
        let device_id = device_id.clone();
        let timeout = self.config.registry_timeout();
        let at = Utc::now();

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, registry.record_seen(&device_id, status, at)).await {
                Ok(Ok(())) => debug!(device_id = %device_id, status = %status, "Status reported"),
                Ok(Err(e)) => {
                    warn!(device_id = %device_id, status = %status, error = %e, "Status report failed");
                }
                Err(_) => {
                    warn!(device_id = %device_id, status = %status, "Status report timed out");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::registry::InMemoryRegistry;
    use edge_proto::{ProtocolError, MAX_PUBLISH_PAYLOAD};

    fn manager_with(config: SessionConfig) -> SessionManager {
        SessionManager::new(
            config,
            Arc::new(NodeRing::with_nodes(16, ["gw-a", "gw-b", "gw-c"])),
            Arc::new(OfflineStore::temporary().unwrap()),
        )
    }

    fn manager() -> SessionManager {
        manager_with(SessionConfig::default())
    }

    fn keep_alive() -> Duration {
        Duration::from_secs(60)
    }

    // ==================== Connect Tests ====================

    #[tokio::test]
    async fn test_connect_goes_online() {
        let manager = manager();
        let device = DeviceId::new("sensor-1");
        let adapter = Arc::new(MemoryAdapter::new());

        let connected = manager
            .connect(device.clone(), adapter, keep_alive())
            .await
            .unwrap();

        assert!(!connected.displaced);
        assert_eq!(connected.replayed, 0);
        assert!(!connected.session.is_resumed());
        assert_eq!(connected.session.state(), SessionState::Online);
        assert_eq!(connected.session.node(), manager.route(&device).as_ref());
        assert_eq!(manager.online_count(), 1);
        assert_eq!(
            manager.session_status(&device).unwrap(),
            SessionStatus::Online
        );
    }

    #[tokio::test]
    async fn test_connect_displaces_existing_session() {
        let manager = manager();
        let device = DeviceId::new("sensor-1");
        let first = Arc::new(MemoryAdapter::new());
        let second = Arc::new(MemoryAdapter::new());

        let old = manager
            .connect(device.clone(), first.clone(), keep_alive())
            .await
            .unwrap();
        let new = manager
            .connect(device.clone(), second.clone(), keep_alive())
            .await
            .unwrap();

        assert!(new.displaced);
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(old.session.state(), SessionState::Offline);
        assert!(old.session.closed().is_cancelled());
        assert_eq!(manager.online_count(), 1);

        // The old read loop finishing must not evict the new session.
        assert!(
            !manager
                .disconnect(&device, old.session.connection_id(), "connection closed")
                .await
        );
        assert_eq!(
            manager.pool().get("sensor-1").unwrap().connection_id(),
            new.session.connection_id()
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let manager = manager();
        let device = DeviceId::new("sensor-1");
        let adapter = Arc::new(MemoryAdapter::new());
        let connected = manager
            .connect(device.clone(), adapter.clone(), keep_alive())
            .await
            .unwrap();
        let id = connected.session.connection_id();

        assert!(manager.disconnect(&device, id, "client disconnect").await);
        assert!(!manager.disconnect(&device, id, "client disconnect").await);
        assert!(!manager.mark_offline(&device, "again").await);

        assert!(adapter.is_closed());
        assert_eq!(manager.online_count(), 0);
        assert_eq!(
            manager.session_status(&device).unwrap(),
            SessionStatus::Offline
        );
        let snapshot = manager
            .store()
            .load_session_snapshot("sensor-1")
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.state, "offline");
        assert_eq!(snapshot.reason, "client disconnect");
        assert_eq!(snapshot.keep_alive_secs, 60);
    }

    #[tokio::test]
    async fn test_reconnect_resumes_snapshot() {
        let manager = manager();
        let device = DeviceId::new("sensor-1");
        manager
            .connect(device.clone(), Arc::new(MemoryAdapter::new()), keep_alive())
            .await
            .unwrap();
        manager.mark_offline(&device, "link lost").await;

        let connected = manager
            .connect(device.clone(), Arc::new(MemoryAdapter::new()), keep_alive())
            .await
            .unwrap();

        assert!(connected.session.is_resumed());
        assert_eq!(manager.store().snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_after_shutdown_rejected() {
        let manager = manager();
        manager.shutdown().await.unwrap();

        let adapter = Arc::new(MemoryAdapter::new());
        let result = manager
            .connect(DeviceId::new("sensor-1"), adapter.clone(), keep_alive())
            .await;

        assert!(matches!(result, Err(GatewayError::ShuttingDown)));
        assert!(adapter.is_closed());
        assert_eq!(manager.online_count(), 0);
    }

    #[tokio::test]
    async fn test_touch_requires_current_connection() {
        let manager = manager();
        let device = DeviceId::new("sensor-1");
        let connected = manager
            .connect(device.clone(), Arc::new(MemoryAdapter::new()), keep_alive())
            .await
            .unwrap();

        assert!(manager.touch(&device, connected.session.connection_id()));
        assert!(!manager.touch(&device, Uuid::new_v4()));
        assert!(!manager.touch(&DeviceId::new("other"), Uuid::new_v4()));
    }

    // ==================== Command Tests ====================

    #[tokio::test]
    async fn test_send_command_online_delivers() {
        let manager = manager();
        let device = DeviceId::new("sensor-1");
        let adapter = Arc::new(MemoryAdapter::new());
        manager
            .connect(device.clone(), adapter.clone(), keep_alive())
            .await
            .unwrap();

        let delivery = manager.send_command(&device, &b"reboot"[..]).await.unwrap();

        assert_eq!(delivery, Delivery::Delivered);
        assert_eq!(adapter.sent_payloads(), vec![Bytes::from_static(b"reboot")]);
        assert_eq!(manager.pending_count(&device).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_command_offline_queues() {
        let manager = manager();
        let device = DeviceId::new("sensor-1");

        let delivery = manager.send_command(&device, &b"reboot"[..]).await.unwrap();

        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(manager.pending_count(&device).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_queues_and_takes_offline() {
        let manager = manager();
        let device = DeviceId::new("sensor-1");
        let adapter = Arc::new(MemoryAdapter::new());
        manager
            .connect(device.clone(), adapter.clone(), keep_alive())
            .await
            .unwrap();
        adapter.fail_sends();

        let delivery = manager.send_command(&device, &b"reboot"[..]).await.unwrap();

        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(manager.pending_count(&device).unwrap(), 1);
        assert_eq!(manager.online_count(), 0);
        assert!(adapter.is_closed());
        assert_eq!(
            manager.session_status(&device).unwrap(),
            SessionStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_dispatch_command() {
        let manager = manager();
        let command = Command::new("sensor-1", &b"ping"[..]);

        let delivery = manager.dispatch(command).await.unwrap();

        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(
            manager.drain_commands(&DeviceId::new("sensor-1")).unwrap(),
            vec![Bytes::from_static(b"ping")]
        );
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let manager = manager();
        let device = DeviceId::new("sensor-1");

        let result = manager
            .send_command(&device, vec![0u8; MAX_PUBLISH_PAYLOAD + 1])
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::Protocol(ProtocolError::PayloadTooLarge { .. }))
        ));
        assert_eq!(manager.pending_count(&device).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_commands_in_order() {
        let manager = manager();
        let device = DeviceId::new("sensor-1");
        for payload in ["a", "b", "c"] {
            manager.send_command(&device, payload).await.unwrap();
        }

        let drained = manager.drain_commands(&device).unwrap();

        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(manager.drain_commands(&device).unwrap().is_empty());
    }

    // ==================== Replay Tests ====================

    #[tokio::test]
    async fn test_replay_on_connect_in_order() {
        let manager = manager();
        let device = DeviceId::new("sensor-1");
        for payload in ["first", "second", "third"] {
            manager.send_command(&device, payload).await.unwrap();
        }

        let adapter = Arc::new(MemoryAdapter::new());
        let connected = manager
            .connect(device.clone(), adapter.clone(), keep_alive())
            .await
            .unwrap();

        assert_eq!(connected.replayed, 3);
        assert_eq!(adapter.sent_payloads(), vec!["first", "second", "third"]);
        assert_eq!(manager.pending_count(&device).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replay_stops_at_write_failure() {
        let manager = manager();
        let device = DeviceId::new("sensor-1");
        for payload in ["first", "second", "third"] {
            manager.send_command(&device, payload).await.unwrap();
        }

        let adapter = Arc::new(MemoryAdapter::failing_after(1));
        let connected = manager
            .connect(device.clone(), adapter.clone(), keep_alive())
            .await
            .unwrap();

        assert_eq!(connected.replayed, 1);
        assert_eq!(connected.session.state(), SessionState::Offline);
        assert_eq!(manager.online_count(), 0);
        assert_eq!(
            manager.drain_commands(&device).unwrap(),
            vec!["second", "third"]
        );
    }

    #[tokio::test]
    async fn test_queued_commands_precede_live_ones() {
        let manager = manager_with(SessionConfig::default().with_replay_on_connect(false));
        let device = DeviceId::new("sensor-1");
        manager.send_command(&device, "old").await.unwrap();

        let adapter = Arc::new(MemoryAdapter::new());
        let connected = manager
            .connect(device.clone(), adapter.clone(), keep_alive())
            .await
            .unwrap();
        assert_eq!(connected.replayed, 0);
        assert!(adapter.sent_payloads().is_empty());

        let delivery = manager.send_command(&device, "new").await.unwrap();

        assert_eq!(delivery, Delivery::Delivered);
        assert_eq!(adapter.sent_payloads(), vec!["old", "new"]);
        assert_eq!(manager.pending_count(&device).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replay_store_failure_takes_session_offline() {
        let manager = manager();
        // Too long to form a command key.
        let device = DeviceId::new("x".repeat(70_000));
        let adapter = Arc::new(MemoryAdapter::new());

        let result = manager
            .connect(device.clone(), adapter.clone(), keep_alive())
            .await;

        assert!(matches!(result, Err(GatewayError::Persistence(_))));
        assert_eq!(manager.online_count(), 0);
        assert!(adapter.is_closed());
        let snapshot = manager
            .store()
            .load_session_snapshot(device.as_str())
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.reason, "replay failed");
    }

    #[tokio::test]
    async fn test_send_command_store_failure_propagates() {
        let manager = manager();
        let device = DeviceId::new("y".repeat(70_000));

        let result = manager.send_command(&device, "cmd").await;

        assert!(matches!(result, Err(GatewayError::Persistence(_))));
        assert_eq!(manager.store().total_pending(), 0);
    }

    // ==================== Liveness Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_check_liveness_evicts_silent_sessions() {
        let manager = manager();
        let quiet = DeviceId::new("quiet");
        let chatty = DeviceId::new("chatty");
        let quiet_adapter = Arc::new(MemoryAdapter::new());
        manager
            .connect(quiet.clone(), quiet_adapter.clone(), keep_alive())
            .await
            .unwrap();
        let chatty_session = manager
            .connect(chatty.clone(), Arc::new(MemoryAdapter::new()), keep_alive())
            .await
            .unwrap()
            .session;

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(manager.check_liveness().await.is_empty());
        assert!(manager.touch(&chatty, chatty_session.connection_id()));

        tokio::time::advance(Duration::from_secs(15)).await;
        let evicted = manager.check_liveness().await;

        assert_eq!(evicted, vec![quiet.clone()]);
        assert!(quiet_adapter.is_closed());
        assert_eq!(
            manager.session_status(&quiet).unwrap(),
            SessionStatus::Offline
        );
        assert_eq!(
            manager.session_status(&chatty).unwrap(),
            SessionStatus::Online
        );
        let snapshot = manager.store().load_session_snapshot("quiet").unwrap().unwrap();
        assert_eq!(snapshot.reason, "liveness timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_driver_evicts() {
        let manager = Arc::new(manager());
        manager.start(Duration::from_secs(3600));
        let device = DeviceId::new("sensor-1");
        manager
            .connect(device.clone(), Arc::new(MemoryAdapter::new()), keep_alive())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(manager.online_count(), 0);
        assert_eq!(
            manager.session_status(&device).unwrap(),
            SessionStatus::Offline
        );
        manager.shutdown().await.unwrap();
    }

    #[derive(Debug)]
    struct SlowAdapter {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ConnectionAdapter for SlowAdapter {
        async fn send(&self, _frame: Bytes) -> AdapterResult<()> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_feed_heartbeat() {
        let manager = manager();
        let device = DeviceId::new("sensor-1");
        let adapter = Arc::new(SlowAdapter {
            delay: Duration::from_millis(500),
        });
        manager.connect(device.clone(), adapter, keep_alive()).await.unwrap();
        assert_eq!(manager.heartbeat_interval(), Duration::from_secs(15));

        let delivery = manager.send_command(&device, "reboot").await.unwrap();

        assert_eq!(delivery, Delivery::Delivered);
        assert!(manager.heartbeat_interval() > Duration::from_secs(20));
        assert!(manager.heartbeat_interval() <= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_record_latency_stretches_interval() {
        let manager = manager();
        assert_eq!(manager.heartbeat_interval(), Duration::from_secs(15));

        manager.record_latency(Duration::from_millis(500));

        assert!(manager.heartbeat_interval() > Duration::from_secs(15));
        assert!(manager.heartbeat_interval() <= Duration::from_secs(30));
    }

    // ==================== Query Tests ====================

    #[tokio::test]
    async fn test_session_status_unknown() {
        let manager = manager();
        assert_eq!(
            manager.session_status(&DeviceId::new("never-seen")).unwrap(),
            SessionStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_routes_owner_first() {
        let manager = manager();
        let device = DeviceId::new("sensor-1");

        let routes = manager.routes(&device, 3);

        assert_eq!(routes.len(), 3);
        assert_eq!(Some(routes[0].clone()), manager.route(&device));
    }

    #[tokio::test]
    async fn test_device_known() {
        let device = DeviceId::new("sensor-1");
        assert!(manager().device_known(&device).await.unwrap());

        let registry = Arc::new(InMemoryRegistry::with_devices(["sensor-1"]));
        let manager = manager().with_registry(registry);
        assert!(manager.device_known(&device).await.unwrap());
        assert!(!manager.device_known(&DeviceId::new("rogue")).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_reported_to_registry() {
        let registry = Arc::new(InMemoryRegistry::new());
        let manager = manager().with_registry(registry.clone());
        let device = DeviceId::new("sensor-1");

        manager
            .connect(device.clone(), Arc::new(MemoryAdapter::new()), keep_alive())
            .await
            .unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(record) = registry.last_seen(&device) {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(seen.status, DeviceStatus::Online);
    }

    // ==================== Shutdown Tests ====================

    #[tokio::test]
    async fn test_shutdown_ends_every_session() {
        let manager = Arc::new(manager());
        manager.start(Duration::from_secs(3600));
        let adapters: Vec<Arc<MemoryAdapter>> =
            (0..3).map(|_| Arc::new(MemoryAdapter::new())).collect();
        for (i, adapter) in adapters.iter().enumerate() {
            manager
                .connect(DeviceId::new(format!("sensor-{i}")), adapter.clone(), keep_alive())
                .await
                .unwrap();
        }

        manager.shutdown().await.unwrap();

        assert_eq!(manager.online_count(), 0);
        assert!(adapters.iter().all(|adapter| adapter.is_closed()));
        assert_eq!(manager.store().snapshot_count(), 3);
        assert!(manager.shutdown_token().is_cancelled());
    }
}
