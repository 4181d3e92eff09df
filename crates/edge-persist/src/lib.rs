//! # edge-persist
//!
//! Local durable store for the edgesphere gateway.
//!
//! Two record sets live in one [`sled`] database:
//!
//! - **sessions**: one [`SessionSnapshot`] per device, written when a
//!   session goes offline and expiring after a configurable TTL.
//! - **commands**: a per-device FIFO log of command payloads addressed to
//!   devices that were not reachable when the command was sent.
//!
//! Both survive process restart.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod store;

pub use error::{PersistError, PersistResult};
pub use store::{
    store_exists, OfflineStore, QueuedCommand, SessionSnapshot, StoreConfig, DEFAULT_SNAPSHOT_TTL,
};
