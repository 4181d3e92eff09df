//! # edge-gateway
//!
//! Session and connection management core of the edgesphere device gateway.
//!
//! The gateway terminates long-lived device connections, keeps one live
//! session per device, and never silently drops a command:
//!
//! - [`ring`]: consistent-hash placement of devices onto gateway nodes
//! - [`pool`]: the device → live session map
//! - [`adapter`]: the send/close capability over one transport connection
//! - [`heartbeat`]: latency-adaptive heartbeat interval
//! - [`manager`]: the session state machine, command delivery, liveness
//! - [`failover`]: moving a device onto a backup node
//! - [`registry`]: the external device registry contract
//! - [`listener`]: the TCP front end
//!
//! ## Delivery
//!
//! [`SessionManager::send_command`] writes straight to the device when it
//! is online and otherwise persists the command in the offline queue
//! (see [`edge_persist`]). Queued commands are replayed in order when the
//! device reconnects or is failed over. Delivery is at-least-once.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod config;
pub mod error;
pub mod failover;
pub mod heartbeat;
pub mod listener;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod ring;
pub mod session;

pub use adapter::{AdapterError, AdapterResult, ConnectionAdapter, MemoryAdapter, StreamAdapter};
pub use config::{
    ClusterConfig, GatewayConfig, ListenerConfig, RegistrySection, SessionConfig, StoreSection,
};
pub use error::{GatewayError, GatewayResult};
pub use failover::{BackupConnector, FailoverReport};
pub use heartbeat::{AdaptiveHeartbeat, HeartbeatPolicy};
pub use listener::GatewayListener;
pub use manager::{Connected, SessionManager};
pub use pool::ConnectionPool;
pub use registry::{DeviceRegistry, DeviceStatus, InMemoryRegistry, RegistryError, RegistryResult};
pub use ring::{NodeRing, DEFAULT_REPLICAS};
pub use session::{Command, Delivery, DeviceSession, SessionState, SessionStatus};

pub use edge_proto::{DeviceId, NodeId};
