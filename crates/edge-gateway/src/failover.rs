//! Failover of a device's session to a backup node.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use edge_proto::{DeviceId, NodeId};
use tracing::{info, warn};

use crate::adapter::{AdapterResult, ConnectionAdapter};
use crate::error::{GatewayError, GatewayResult};
use crate::manager::SessionManager;
use crate::registry::DeviceStatus;
use crate::session::{Command, SessionState};

/// Establishes a device connection through a backup node.
#[async_trait]
pub trait BackupConnector: Send + Sync + fmt::Debug {
    /// Open an adapter reaching `device_id` via `node`.
    async fn connect(
        &self,
        device_id: &DeviceId,
        node: &NodeId,
    ) -> AdapterResult<Arc<dyn ConnectionAdapter>>;
}

/// Outcome of a successful failover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverReport {
    /// Device that was failed over.
    pub device_id: DeviceId,
    /// Node now serving the device.
    pub backup_node: NodeId,
    /// Number of queued commands delivered through the backup.
    pub delivered: usize,
    /// Commands that could not be delivered. They remain queued, in order.
    pub undelivered: Vec<Command>,
}

impl FailoverReport {
    /// Check whether every queued command was delivered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.undelivered.is_empty()
    }
}

impl SessionManager {
    /// Move a device off `failed_node` onto a backup.
    ///
    /// Candidates come from the ring in clockwise order, skipping
    /// `failed_node`; at most `failover_candidates` are tried. The first
    /// one that connects becomes the device's live session and its queue
    /// is flushed through it.
    ///
    /// This is called by the control plane, not by the gateway itself:
    /// the `edge-gateway` binary attaches no [`BackupConnector`] and never
    /// detects node failure on its own. Embedders that run a cluster must
    /// supply a connector via
    /// [`SessionManager::with_backup_connector`] and call this when their
    /// membership layer reports `failed_node` down.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PlacementUnavailable`] if the ring has no
    /// other node or no candidate connects; the device is then marked
    /// failed and its commands stay queued. Returns
    /// [`GatewayError::Config`] if no backup connector is attached.
    pub async fn failover(
        &self,
        device_id: &DeviceId,
        failed_node: &NodeId,
    ) -> GatewayResult<FailoverReport> {
        let Some(connector) = self.connector.clone() else {
            return Err(GatewayError::Config(
                "failover requires a backup connector".to_string(),
            ));
        };

        let candidates: Vec<NodeId> = self
            .ring()
            .nodes_for(device_id.as_str(), self.ring().len())
            .into_iter()
            .filter(|node| node != failed_node)
            .take(self.config().failover_candidates)
            .collect();

        // The session on the failed node is gone either way.
        let current = self.pool().get(device_id.as_str());
        let keep_alive = current
            .as_ref()
            .map_or(std::time::Duration::ZERO, |session| session.keep_alive());
        if let Some(session) = &current {
            self.end_session(session, SessionState::Offline, "node failure")
                .await;
        }

        if candidates.is_empty() {
            warn!(device_id = %device_id, failed_node = %failed_node, "No backup node on ring");
            self.mark_failed(device_id);
            return Err(GatewayError::PlacementUnavailable(device_id.clone()));
        }

        for node in candidates {
            let adapter = match connector.connect(device_id, &node).await {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(device_id = %device_id, node = %node, error = %e, "Backup connect failed");
                    continue;
                }
            };

            let connected = self
                .connect_on(device_id.clone(), adapter, keep_alive, Some(node.clone()))
                .await?;
            let delivered = if self.config().replay_on_connect {
                connected.replayed
            } else {
                self.flush_queue(&connected.session).await?.delivered.len()
            };

            let undelivered = self
                .store()
                .pending_commands(device_id.as_str())?
                .into_iter()
                .map(|queued| Command {
                    device_id: device_id.clone(),
                    payload: Bytes::from(queued.payload),
                    created_at: queued.created_at,
                })
                .collect::<Vec<_>>();

            info!(
                device_id = %device_id,
                failed_node = %failed_node,
                backup_node = %node,
                delivered,
                undelivered = undelivered.len(),
                "Failover complete"
            );
            return Ok(FailoverReport {
                device_id: device_id.clone(),
                backup_node: node,
                delivered,
                undelivered,
            });
        }

        warn!(device_id = %device_id, failed_node = %failed_node, "Every backup candidate failed");
        self.mark_failed(device_id);
        Err(GatewayError::PlacementUnavailable(device_id.clone()))
    }

    /// Record that a device could not be failed over.
    fn mark_failed(&self, device_id: &DeviceId) {
        match self.store().load_session_snapshot(device_id.as_str()) {
            Ok(Some(mut snapshot)) => {
                snapshot.state = SessionState::Failed.to_string();
                if let Err(e) = self.store().save_session_snapshot(&snapshot) {
                    warn!(device_id = %device_id, error = %e, "Failed to update session snapshot");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(device_id = %device_id, error = %e, "Failed to read session snapshot"),
        }
        self.report_status(device_id, DeviceStatus::Failed);
    }
}
