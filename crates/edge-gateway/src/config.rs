//! Gateway configuration.
//!
//! Loaded from TOML. Every section and field has a default, so an empty
//! file is a valid configuration:
//!
//! ```toml
//! [listener]
//! bind_addr = "0.0.0.0:1883"
//!
//! [session]
//! liveness_threshold_secs = 30
//!
//! [store]
//! path = "/var/lib/edge-gateway/offline"
//!
//! [cluster]
//! node_id = "gw-1"
//! nodes = ["gw-1", "gw-2", "gw-3"]
//!
//! [registry]
//! devices = ["meter-1", "meter-2"]
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use edge_persist::{StoreConfig, DEFAULT_SNAPSHOT_TTL};
use edge_proto::{DeviceId, NodeId};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::heartbeat::HeartbeatPolicy;
use crate::ring::DEFAULT_REPLICAS;

/// Default listener port.
pub const DEFAULT_PORT: u16 = 1883;

/// Default maximum body size of an inbound frame: 256KB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024;

/// Transport listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address to accept device connections on.
    pub bind_addr: SocketAddr,
    /// Time allowed for a device to send its handshake.
    pub handshake_timeout_ms: u64,
    /// Maximum number of live sessions.
    pub max_connections: usize,
    /// Maximum body size of any inbound frame, handshake included.
    pub max_frame_size: usize,
    /// Time allowed for a single frame write.
    pub write_timeout_ms: u64,
    /// Reject devices unknown to the registry.
    pub require_registered: bool,
}

impl ListenerConfig {
    /// Create a listener configuration with default values.
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            handshake_timeout_ms: 5_000,
            max_connections: 50_000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            write_timeout_ms: 5_000,
            require_registered: false,
        }
    }

    /// Set the bind address.
    #[must_use]
    pub const fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the maximum number of live sessions.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the maximum inbound frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub const fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Require devices to be registered before they may connect.
    #[must_use]
    pub const fn with_require_registered(mut self, require: bool) -> Self {
        self.require_registered = require;
        self
    }

    /// Get the handshake timeout.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Get the write timeout.
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::new(([0, 0, 0, 0], DEFAULT_PORT).into())
    }
}

/// Session manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Silence after which a session goes offline.
    pub liveness_threshold_secs: u64,
    /// Heartbeat interval with negligible latency.
    pub heartbeat_base_secs: u64,
    /// Lower bound of the adaptive heartbeat interval.
    pub heartbeat_min_secs: u64,
    /// Upper bound of the adaptive heartbeat interval.
    pub heartbeat_max_secs: u64,
    /// EWMA weight of a new latency sample.
    pub latency_smoothing: f64,
    /// Deliver queued commands as soon as a device connects.
    pub replay_on_connect: bool,
    /// Number of backup nodes tried during failover.
    pub failover_candidates: usize,
    /// Bound on each registry call.
    pub registry_timeout_ms: u64,
}

impl SessionConfig {
    /// Create a session configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            liveness_threshold_secs: 30,
            heartbeat_base_secs: 15,
            heartbeat_min_secs: 5,
            heartbeat_max_secs: 30,
            latency_smoothing: 0.2,
            replay_on_connect: true,
            failover_candidates: 2,
            registry_timeout_ms: 2_000,
        }
    }

    /// Set the liveness threshold.
    #[must_use]
    pub const fn with_liveness_threshold(mut self, threshold: Duration) -> Self {
        self.liveness_threshold_secs = threshold.as_secs();
        self
    }

    /// Set the heartbeat base, minimum and maximum, in that order.
    #[must_use]
    pub const fn with_heartbeat(mut self, base: Duration, min: Duration, max: Duration) -> Self {
        self.heartbeat_base_secs = base.as_secs();
        self.heartbeat_min_secs = min.as_secs();
        self.heartbeat_max_secs = max.as_secs();
        self
    }

    /// Set whether queued commands are replayed on connect.
    #[must_use]
    pub const fn with_replay_on_connect(mut self, replay: bool) -> Self {
        self.replay_on_connect = replay;
        self
    }

    /// Set the number of failover candidates.
    #[must_use]
    pub const fn with_failover_candidates(mut self, count: usize) -> Self {
        self.failover_candidates = count;
        self
    }

    /// Set the registry call timeout.
    #[must_use]
    pub const fn with_registry_timeout(mut self, timeout: Duration) -> Self {
        self.registry_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Get the liveness threshold.
    #[must_use]
    pub const fn liveness_threshold(&self) -> Duration {
        Duration::from_secs(self.liveness_threshold_secs)
    }

    /// Get the registry call timeout.
    #[must_use]
    pub const fn registry_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_timeout_ms)
    }

    /// Build the heartbeat policy.
    #[must_use]
    pub const fn heartbeat_policy(&self) -> HeartbeatPolicy {
        HeartbeatPolicy::new(
            Duration::from_secs(self.heartbeat_base_secs),
            Duration::from_secs(self.heartbeat_min_secs),
            Duration::from_secs(self.heartbeat_max_secs),
            self.latency_smoothing,
        )
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Database directory.
    pub path: PathBuf,
    /// Lifetime of a suspended session snapshot.
    pub snapshot_ttl_secs: u64,
    /// Period of the expired-snapshot sweep.
    pub purge_interval_secs: u64,
    /// Page cache size.
    pub cache_capacity_bytes: Option<u64>,
    /// Flush after every write.
    pub sync_writes: bool,
}

impl StoreSection {
    /// Get the purge interval.
    #[must_use]
    pub const fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    /// Build the store configuration.
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        let mut config = StoreConfig::new(&self.path)
            .with_snapshot_ttl(Duration::from_secs(self.snapshot_ttl_secs))
            .with_sync_writes(self.sync_writes);
        if let Some(bytes) = self.cache_capacity_bytes {
            config = config.with_cache_capacity(bytes);
        }
        config
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/edge-gateway/offline"),
            snapshot_ttl_secs: DEFAULT_SNAPSHOT_TTL.as_secs(),
            purge_interval_secs: 3_600,
            cache_capacity_bytes: None,
            sync_writes: false,
        }
    }
}

/// Cluster membership settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// This gateway's node id.
    pub node_id: NodeId,
    /// All gateway nodes, this one included.
    pub nodes: Vec<NodeId>,
    /// Virtual positions per node on the ring.
    pub replicas: usize,
}

impl ClusterConfig {
    /// Get the ring members, adding this node if it is not listed.
    #[must_use]
    pub fn ring_members(&self) -> Vec<NodeId> {
        let mut members = self.nodes.clone();
        if !members.contains(&self.node_id) {
            members.push(self.node_id.clone());
        }
        members
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new("gw-1"),
            nodes: Vec::new(),
            replicas: DEFAULT_REPLICAS,
        }
    }
}

/// Devices known to the gateway's built-in registry.
///
/// Only consulted when no external registry is attached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Device ids accepted when `listener.require_registered` is set.
    pub devices: Vec<DeviceId>,
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener settings.
    pub listener: ListenerConfig,
    /// Session manager settings.
    pub session: SessionConfig,
    /// Durable store settings.
    pub store: StoreSection,
    /// Cluster settings.
    pub cluster: ClusterConfig,
    /// Built-in registry contents.
    pub registry: RegistrySection,
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> GatewayResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> GatewayResult<String> {
        toml::to_string_pretty(self).map_err(|e| GatewayError::Config(e.to_string()))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> GatewayResult<()> {
        let listener = &self.listener;
        if listener.handshake_timeout_ms == 0 {
            return Err(config_error("listener.handshake_timeout_ms must be greater than 0"));
        }
        if listener.write_timeout_ms == 0 {
            return Err(config_error("listener.write_timeout_ms must be greater than 0"));
        }
        if listener.max_connections == 0 {
            return Err(config_error("listener.max_connections must be greater than 0"));
        }
        if listener.max_frame_size == 0 {
            return Err(config_error("listener.max_frame_size must be greater than 0"));
        }

        let session = &self.session;
        if session.liveness_threshold_secs == 0 {
            return Err(config_error("session.liveness_threshold_secs must be greater than 0"));
        }
        if session.heartbeat_min_secs == 0 {
            return Err(config_error("session.heartbeat_min_secs must be greater than 0"));
        }
        if session.heartbeat_min_secs > session.heartbeat_max_secs {
            return Err(config_error(
                "session.heartbeat_min_secs cannot exceed session.heartbeat_max_secs",
            ));
        }
        if session.heartbeat_max_secs > session.liveness_threshold_secs {
            return Err(config_error(
                "session.heartbeat_max_secs cannot exceed session.liveness_threshold_secs",
            ));
        }
        if !(session.latency_smoothing > 0.0 && session.latency_smoothing <= 1.0) {
            return Err(config_error("session.latency_smoothing must be in (0, 1]"));
        }
        if session.failover_candidates == 0 {
            return Err(config_error("session.failover_candidates must be greater than 0"));
        }
        if session.registry_timeout_ms == 0 {
            return Err(config_error("session.registry_timeout_ms must be greater than 0"));
        }

        if self.store.path.as_os_str().is_empty() {
            return Err(config_error("store.path cannot be empty"));
        }
        if self.store.snapshot_ttl_secs == 0 {
            return Err(config_error("store.snapshot_ttl_secs must be greater than 0"));
        }
        if self.store.purge_interval_secs == 0 {
            return Err(config_error("store.purge_interval_secs must be greater than 0"));
        }

        let cluster = &self.cluster;
        if cluster.node_id.as_str().is_empty() {
            return Err(config_error("cluster.node_id cannot be empty"));
        }
        if cluster.nodes.iter().any(|n| n.as_str().is_empty()) {
            return Err(config_error("cluster.nodes cannot contain empty ids"));
        }
        if cluster.replicas == 0 {
            return Err(config_error("cluster.replicas must be greater than 0"));
        }

        if self.listener.require_registered && self.registry.devices.is_empty() {
            return Err(config_error(
                "listener.require_registered needs at least one entry in registry.devices",
            ));
        }
        if self.registry.devices.iter().any(|d| d.as_str().is_empty()) {
            return Err(config_error("registry.devices cannot contain empty ids"));
        }

        Ok(())
    }
}

fn config_error(msg: &str) -> GatewayError {
    GatewayError::Config(msg.to_string())
}
