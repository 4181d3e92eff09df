//! Error types for the gateway core.

use std::net::SocketAddr;

use edge_persist::PersistError;
use edge_proto::{DeviceId, ProtocolError};
use thiserror::Error;

use crate::adapter::AdapterError;

/// Errors that can occur in the gateway core.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A frame could not be decoded or encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A write or read on an established connection failed.
    #[error("transport error: {0}")]
    Transport(#[from] AdapterError),

    /// No node (or no distinct backup node) is available on the ring.
    #[error("no node available for device {0}")]
    PlacementUnavailable(DeviceId),

    /// The durable store failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to bind the listener.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// The device did not complete its handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The device is not known to the registry.
    #[error("device {0} is not registered")]
    UnknownDevice(DeviceId),

    /// The listener is at its connection limit.
    #[error("connection limit of {0} reached")]
    ConnectionLimit(usize),

    /// The gateway is shutting down.
    #[error("gateway is shutting down")]
    ShuttingDown,
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
