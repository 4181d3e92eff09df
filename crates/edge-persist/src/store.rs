//! Sled-backed session snapshot and command queue store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PersistError, PersistResult};

/// Default snapshot lifetime: 7 days.
pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const SESSIONS_TREE: &str = "sessions";
const COMMANDS_TREE: &str = "commands";

/// Configuration for opening an [`OfflineStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding the database.
    pub path: PathBuf,
    /// How long a session snapshot stays valid.
    pub snapshot_ttl: Duration,
    /// Page cache size in bytes (sled default when `None`).
    pub cache_capacity: Option<u64>,
    /// Flush to disk after every mutation.
    pub sync_writes: bool,
}

impl StoreConfig {
    /// Create a configuration for the given directory.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot_ttl: DEFAULT_SNAPSHOT_TTL,
            cache_capacity: None,
            sync_writes: false,
        }
    }

    /// Set the snapshot TTL.
    #[must_use]
    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.snapshot_ttl = ttl;
        self
    }

    /// Set the page cache size.
    #[must_use]
    pub fn with_cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = Some(bytes);
        self
    }

    /// Flush after every mutation.
    #[must_use]
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }
}

/// Adapter-independent state of a session at the moment it went offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Device identifier.
    pub device_id: String,
    /// Gateway node the device was assigned to.
    pub node: Option<String>,
    /// Keep-alive requested in the handshake.
    pub keep_alive_secs: u16,
    /// Heartbeat interval in force when the session ended.
    pub heartbeat_interval_ms: u64,
    /// Wall-clock time of the last observed activity.
    pub last_seen: DateTime<Utc>,
    /// When the session was torn down.
    pub disconnected_at: DateTime<Utc>,
    /// Final session state label (`offline` or `failed`).
    pub state: String,
    /// Why the session ended.
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSnapshot {
    snapshot: SessionSnapshot,
    expires_at: DateTime<Utc>,
}

/// A command waiting in a device's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    /// Insertion sequence; strictly increasing across the whole store.
    pub seq: u64,
    /// Opaque command payload.
    pub payload: Vec<u8>,
    /// When the command was queued.
    pub created_at: DateTime<Utc>,
}

/// Durable store for session snapshots and per-device command queues.
///
/// Command keys are `u16 BE device length | device bytes | u64 BE seq`, so
/// a prefix scan yields one device's commands in insertion order.
/// Mutations are serialised through an internal lock.
pub struct OfflineStore {
    db: sled::Db,
    sessions: sled::Tree,
    commands: sled::Tree,
    snapshot_ttl: TimeDelta,
    sync_writes: bool,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for OfflineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineStore")
            .field("snapshot_ttl", &self.snapshot_ttl)
            .field("sync_writes", &self.sync_writes)
            .finish_non_exhaustive()
    }
}

impl OfflineStore {
    /// Open (or create) the store described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Open`] if the database cannot be opened.
    pub fn open(config: &StoreConfig) -> PersistResult<Self> {
        let mut sled_config = sled::Config::new().path(&config.path);
        if let Some(capacity) = config.cache_capacity {
            sled_config = sled_config.cache_capacity(capacity);
        }
        let db = sled_config.open().map_err(|source| PersistError::Open {
            path: config.path.clone(),
            source,
        })?;

        let store = Self::from_db(db, config)?;
        info!(
            path = %config.path.display(),
            snapshots = store.snapshot_count(),
            queued = store.commands.len(),
            "Opened offline store"
        );
        Ok(store)
    }

    /// Open an in-memory store that is deleted on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if sled cannot create the temporary database.
    pub fn temporary() -> PersistResult<Self> {
        Self::temporary_with(&StoreConfig::new(PathBuf::new()))
    }

    /// Open a temporary store using the TTL and sync settings of `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if sled cannot create the temporary database.
    pub fn temporary_with(config: &StoreConfig) -> PersistResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|source| PersistError::Open {
                path: config.path.clone(),
                source,
            })?;
        Self::from_db(db, config)
    }

    fn from_db(db: sled::Db, config: &StoreConfig) -> PersistResult<Self> {
        let snapshot_ttl = TimeDelta::from_std(config.snapshot_ttl)
            .map_err(|e| PersistError::Config(format!("snapshot ttl out of range: {e}")))?;
        let sessions = db.open_tree(SESSIONS_TREE)?;
        let commands = db.open_tree(COMMANDS_TREE)?;
        Ok(Self {
            db,
            sessions,
            commands,
            snapshot_ttl,
            sync_writes: config.sync_writes,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the size of the database on disk, in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if sled cannot compute the size.
    pub fn size_on_disk(&self) -> PersistResult<u64> {
        Ok(self.db.size_on_disk()?)
    }

    fn maybe_flush(&self) -> PersistResult<()> {
        if self.sync_writes {
            self.db.flush()?;
        }
        Ok(())
    }

    /// Flush all pending writes to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&self) -> PersistResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // ==================== Session snapshots ====================

    /// Persist a snapshot, replacing any earlier one for the same device.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or written.
    pub fn save_session_snapshot(&self, snapshot: &SessionSnapshot) -> PersistResult<()> {
        let record = StoredSnapshot {
            snapshot: snapshot.clone(),
            expires_at: snapshot.disconnected_at + self.snapshot_ttl,
        };
        let value = serde_json::to_vec(&record).map_err(PersistError::Encode)?;

        let _guard = self.write_lock.lock();
        self.sessions.insert(snapshot.device_id.as_bytes(), value)?;
        self.maybe_flush()?;
        debug!(device_id = %snapshot.device_id, "Saved session snapshot");
        Ok(())
    }

    /// Load a device's snapshot if one exists and has not expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or decoded.
    pub fn load_session_snapshot(&self, device_id: &str) -> PersistResult<Option<SessionSnapshot>> {
        let Some(raw) = self.sessions.get(device_id.as_bytes())? else {
            return Ok(None);
        };
        let record: StoredSnapshot = serde_json::from_slice(&raw).map_err(PersistError::Decode)?;
        if record.expires_at <= Utc::now() {
            return Ok(None);
        }
        Ok(Some(record.snapshot))
    }

    /// Remove and return a device's snapshot if it has not expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be removed or decoded.
    pub fn take_session_snapshot(&self, device_id: &str) -> PersistResult<Option<SessionSnapshot>> {
        let removed = {
            let _guard = self.write_lock.lock();
            let removed = self.sessions.remove(device_id.as_bytes())?;
            self.maybe_flush()?;
            removed
        };
        let Some(raw) = removed else {
            return Ok(None);
        };
        let record: StoredSnapshot = serde_json::from_slice(&raw).map_err(PersistError::Decode)?;
        if record.expires_at <= Utc::now() {
            return Ok(None);
        }
        Ok(Some(record.snapshot))
    }

    /// Get the number of stored snapshots, expired ones included.
    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.sessions.len()
    }

    /// Delete every snapshot whose expiry is at or before `now`.
    ///
    /// Returns the number of snapshots deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan or the delete batch fails.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> PersistResult<usize> {
        let _guard = self.write_lock.lock();
        let mut batch = sled::Batch::default();
        let mut purged = 0usize;

        for entry in self.sessions.iter() {
            let (key, raw) = entry?;
            let expired = match serde_json::from_slice::<StoredSnapshot>(&raw) {
                Ok(record) => record.expires_at <= now,
                // Undecodable snapshots cannot be resumed; drop them too.
                Err(_) => true,
            };
            if expired {
                batch.remove(key);
                purged += 1;
            }
        }

        if purged > 0 {
            self.sessions.apply_batch(batch)?;
            self.maybe_flush()?;
            info!(purged, "Purged expired session snapshots");
        }
        Ok(purged)
    }

    // ==================== Command queue ====================

    /// Append a command to the end of a device's queue.
    ///
    /// Returns the sequence number assigned to the command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be written. The command is
    /// not queued in that case.
    pub fn enqueue_command(&self, device_id: &str, payload: &[u8]) -> PersistResult<u64> {
        let created_at = Utc::now();
        let _guard = self.write_lock.lock();
        let seq = self.db.generate_id()?;
        self.commands
            .insert(command_key(device_id, seq)?, encode_command(created_at, payload))?;
        self.maybe_flush()?;
        Ok(seq)
    }

    /// Get a device's queued commands in FIFO order without removing them.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails or a record is malformed.
    pub fn pending_commands(&self, device_id: &str) -> PersistResult<Vec<QueuedCommand>> {
        let prefix = device_prefix(device_id)?;
        let mut commands = Vec::new();
        for entry in self.commands.scan_prefix(&prefix) {
            let (key, value) = entry?;
            commands.push(decode_command(&key, prefix.len(), &value)?);
        }
        Ok(commands)
    }

    /// Get the number of commands queued for a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device id is too long to form a key.
    pub fn pending_count(&self, device_id: &str) -> PersistResult<usize> {
        let prefix = device_prefix(device_id)?;
        Ok(self.commands.scan_prefix(&prefix).keys().count())
    }

    /// Get the total number of queued commands across all devices.
    #[must_use]
    pub fn total_pending(&self) -> usize {
        self.commands.len()
    }

    /// Remove one command after it has been handed to an adapter.
    ///
    /// Returns whether the command was present.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn remove_command(&self, device_id: &str, seq: u64) -> PersistResult<bool> {
        let key = command_key(device_id, seq)?;
        let _guard = self.write_lock.lock();
        let removed = self.commands.remove(key)?.is_some();
        self.maybe_flush()?;
        Ok(removed)
    }

    /// Read all of a device's queued payloads in FIFO order, then delete
    /// exactly those entries in one batch.
    ///
    /// A crash between the read and the delete leaves the commands queued,
    /// so they are delivered again on the next drain.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan or the delete batch fails; nothing is
    /// deleted in that case.
    pub fn drain_commands(&self, device_id: &str) -> PersistResult<Vec<Vec<u8>>> {
        let prefix = device_prefix(device_id)?;
        let _guard = self.write_lock.lock();

        let mut batch = sled::Batch::default();
        let mut payloads = Vec::new();
        for entry in self.commands.scan_prefix(&prefix) {
            let (key, value) = entry?;
            let command = decode_command(&key, prefix.len(), &value)?;
            payloads.push(command.payload);
            batch.remove(key);
        }

        if !payloads.is_empty() {
            self.commands.apply_batch(batch)?;
            self.maybe_flush()?;
            debug!(device_id, count = payloads.len(), "Drained queued commands");
        }
        Ok(payloads)
    }
}

fn device_prefix(device_id: &str) -> PersistResult<Vec<u8>> {
    let len = u16::try_from(device_id.len())
        .map_err(|_| PersistError::Corrupt(format!("device id of {} bytes", device_id.len())))?;
    let mut prefix = Vec::with_capacity(2 + device_id.len() + 8);
    prefix.extend_from_slice(&len.to_be_bytes());
    prefix.extend_from_slice(device_id.as_bytes());
    Ok(prefix)
}

fn command_key(device_id: &str, seq: u64) -> PersistResult<Vec<u8>> {
    let mut key = device_prefix(device_id)?;
    key.extend_from_slice(&seq.to_be_bytes());
    Ok(key)
}

fn encode_command(created_at: DateTime<Utc>, payload: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(8 + payload.len());
    value.extend_from_slice(&created_at.timestamp_millis().to_be_bytes());
    value.extend_from_slice(payload);
    value
}

fn decode_command(key: &[u8], prefix_len: usize, value: &[u8]) -> PersistResult<QueuedCommand> {
    let seq_bytes: [u8; 8] = key
        .get(prefix_len..)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| PersistError::Corrupt(format!("command key of {} bytes", key.len())))?;
    let (millis, payload) = value
        .split_first_chunk::<8>()
        .ok_or_else(|| PersistError::Corrupt(format!("command value of {} bytes", value.len())))?;
    let created_at = Utc
        .timestamp_millis_opt(i64::from_be_bytes(*millis))
        .single()
        .ok_or_else(|| PersistError::Corrupt("command timestamp out of range".to_string()))?;
    Ok(QueuedCommand {
        seq: u64::from_be_bytes(seq_bytes),
        payload: payload.to_vec(),
        created_at,
    })
}

/// Check whether a directory already holds a store.
#[must_use]
pub fn store_exists(path: &Path) -> bool {
    path.join("conf").exists() || path.join("db").exists()
}
