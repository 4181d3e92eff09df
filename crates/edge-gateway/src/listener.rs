//! TCP listener terminating device connections.
//!
//! Each accepted connection runs in its own task: decode the handshake
//! under a timeout, acknowledge it, register the session, then read frames
//! until the device disconnects, the session is ended elsewhere, or the
//! gateway shuts down.

use std::net::SocketAddr;
use std::sync::Arc;

use edge_proto::{
    decode_handshake_with_limit, encode_connack, encode_ping_response, ConnackCode, FrameType,
    InboundCodec,
};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::adapter::{ConnectionAdapter, StreamAdapter};
use crate::config::ListenerConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::manager::SessionManager;

/// Accepts device connections and hands them to the session manager.
#[derive(Debug)]
pub struct GatewayListener {
    listener: TcpListener,
    config: Arc<ListenerConfig>,
    manager: Arc<SessionManager>,
}

impl GatewayListener {
    /// Bind to `config.bind_addr`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BindFailed`] if the address cannot be bound.
    pub async fn bind(config: ListenerConfig, manager: Arc<SessionManager>) -> GatewayResult<Self> {
        let addr = config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::BindFailed(addr, e))?;

        Ok(Self {
            listener,
            config: Arc::new(config),
            manager,
        })
    }

    /// Get the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled, then wait for every
    /// connection task to finish.
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; accept errors are logged.
    pub async fn serve(self, shutdown: CancellationToken) -> GatewayResult<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Gateway listening");
        }
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = self.accept(stream, peer, &tracker, &shutdown) {
                                warn!(peer = %peer, error = %e, "Connection rejected");
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to accept connection"),
                    }
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("Gateway listener stopped");
        Ok(())
    }

    fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        tracker: &TaskTracker,
        shutdown: &CancellationToken,
    ) -> GatewayResult<()> {
        if self.manager.online_count() >= self.config.max_connections {
            return Err(GatewayError::ConnectionLimit(self.config.max_connections));
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let config = Arc::clone(&self.config);
        let manager = Arc::clone(&self.manager);
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            match handle_connection(stream, peer, config, manager, shutdown).await {
                Ok(()) => debug!(peer = %peer, "Connection closed"),
                Err(e) => debug!(peer = %peer, error = %e, "Connection ended with error"),
            }
        });
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ListenerConfig>,
    manager: Arc<SessionManager>,
    shutdown: CancellationToken,
) -> GatewayResult<()> {
    let (mut reader, mut writer) = stream.into_split();

    let handshake = tokio::select! {
        () = shutdown.cancelled() => return Err(GatewayError::ShuttingDown),
        decoded = tokio::time::timeout(
            config.handshake_timeout(),
            decode_handshake_with_limit(&mut reader, config.max_frame_size),
        ) => match decoded {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "Handshake rejected");
                return Err(e.into());
            }
            Err(_) => {
                warn!(peer = %peer, timeout = ?config.handshake_timeout(), "Handshake timed out");
                return Err(GatewayError::HandshakeTimeout);
            }
        },
    };
    let device_id = handshake.device_id();

    if config.require_registered && !manager.device_known(&device_id).await.unwrap_or(false) {
        warn!(peer = %peer, device_id = %device_id, "Unknown device rejected");
        // Best effort; the connection is dropped either way.
        let _ = writer.write_all(&encode_connack(ConnackCode::NotAuthorized)).await;
        return Err(GatewayError::UnknownDevice(device_id));
    }

    writer
        .write_all(&encode_connack(ConnackCode::Accepted))
        .await
        .map_err(|e| GatewayError::Transport(e.into()))?;

    let adapter = Arc::new(StreamAdapter::new(
        writer,
        config.write_timeout(),
        peer.to_string(),
    ));
    let connected = manager.connect_handshake(&handshake, adapter.clone()).await?;
    let connection_id = connected.session.connection_id();
    let session_closed = connected.session.closed();
    drop(connected);

    let mut frames = FramedRead::new(reader, InboundCodec::new(config.max_frame_size));
    let reason = loop {
        tokio::select! {
            () = shutdown.cancelled() => break "shutdown",
            () = session_closed.cancelled() => break "session ended",
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    manager.touch(&device_id, connection_id);
                    match frame.header.frame_type {
                        FrameType::PingReq => {
                            let started = Instant::now();
                            if let Err(e) = adapter.send(encode_ping_response()).await {
                                debug!(device_id = %device_id, error = %e, "PINGRESP write failed");
                                break "write failed";
                            }
                            manager.record_latency(started.elapsed());
                        }
                        FrameType::Disconnect => break "client disconnect",
                        other => {
                            debug!(device_id = %device_id, frame = %other, bytes = frame.body.len(), "Frame received");
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(device_id = %device_id, error = %e, "Dropping connection on bad frame");
                    break "decode error";
                }
                None => break "connection closed",
            },
        }
    };

    if !manager.disconnect(&device_id, connection_id, reason).await {
        debug!(device_id = %device_id, reason, "Session already ended");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::ring::NodeRing;
    use edge_persist::OfflineStore;
    use std::time::Duration;

    fn manager() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            SessionConfig::default(),
            Arc::new(NodeRing::with_nodes(8, ["gw-a"])),
            Arc::new(OfflineStore::temporary().unwrap()),
        ))
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let config = ListenerConfig::default().with_bind_addr(([127, 0, 0, 1], 0).into());
        let listener = GatewayListener::bind(config, manager()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let config = ListenerConfig::default().with_bind_addr(([127, 0, 0, 1], 0).into());
        let first = GatewayListener::bind(config.clone(), manager()).await.unwrap();
        let taken = config.with_bind_addr(first.local_addr().unwrap());

        let result = GatewayListener::bind(taken, manager()).await;
        assert!(matches!(result, Err(GatewayError::BindFailed(_, _))));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let config = ListenerConfig::default().with_bind_addr(([127, 0, 0, 1], 0).into());
        let listener = GatewayListener::bind(config, manager()).await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(listener.serve(shutdown.clone()));

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
