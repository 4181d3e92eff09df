//! Connection adapters.
//!
//! A [`ConnectionAdapter`] is everything the session layer knows about a
//! live transport: it can send an encoded frame and it can be closed. The
//! listener wraps the write half of a TCP stream in a [`StreamAdapter`];
//! tests and tooling use [`MemoryAdapter`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use edge_proto::PUBLISH_TAG;

/// Errors returned by adapter writes.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The adapter has been closed.
    #[error("connection closed")]
    Closed,

    /// The underlying write failed.
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    /// The write did not complete in time.
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Send/close capability over one live transport connection.
#[async_trait]
pub trait ConnectionAdapter: Send + Sync + fmt::Debug {
    /// Write one complete frame.
    async fn send(&self, frame: Bytes) -> AdapterResult<()>;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&self);
}

/// Adapter over the write half of a byte stream.
pub struct StreamAdapter<W> {
    writer: tokio::sync::Mutex<Option<W>>,
    write_timeout: Duration,
    peer: String,
}

impl<W> StreamAdapter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap a writer. Each send must finish within `write_timeout`.
    pub fn new(writer: W, write_timeout: Duration, peer: impl Into<String>) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
            write_timeout,
            peer: peer.into(),
        }
    }
}

impl<W> fmt::Debug for StreamAdapter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamAdapter")
            .field("peer", &self.peer)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<W> ConnectionAdapter for StreamAdapter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, frame: Bytes) -> AdapterResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(AdapterError::Closed)?;

        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        let result = match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => AdapterError::Io(e),
            Err(_) => AdapterError::Timeout(self.write_timeout),
        };

        // A failed writer is never reused.
        *guard = None;
        Err(result)
    }

    async fn close(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(peer = %self.peer, error = %e, "Error shutting down writer");
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    frames: Vec<Bytes>,
    closed: bool,
    fail_after: Option<usize>,
}

/// In-memory adapter that records every frame it is given.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    state: Mutex<MemoryState>,
}

impl MemoryAdapter {
    /// Create an open adapter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an adapter that accepts `n` frames and then fails every send.
    #[must_use]
    pub fn failing_after(n: usize) -> Self {
        let adapter = Self::default();
        adapter.state.lock().fail_after = Some(n);
        adapter
    }

    /// Make every subsequent send fail.
    pub fn fail_sends(&self) {
        let mut state = self.state.lock();
        state.fail_after = Some(state.frames.len());
    }

    /// Get every frame sent so far.
    #[must_use]
    pub fn sent_frames(&self) -> Vec<Bytes> {
        self.state.lock().frames.clone()
    }

    /// Get the payloads of every publish frame sent so far.
    #[must_use]
    pub fn sent_payloads(&self) -> Vec<Bytes> {
        self.state
            .lock()
            .frames
            .iter()
            .filter(|frame| frame.first() == Some(&PUBLISH_TAG) && frame.len() >= 3)
            .map(|frame| frame.slice(3..))
            .collect()
    }

    /// Check whether the adapter has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl ConnectionAdapter for MemoryAdapter {
    async fn send(&self, frame: Bytes) -> AdapterResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AdapterError::Closed);
        }
        if state.fail_after.is_some_and(|limit| state.frames.len() >= limit) {
            return Err(AdapterError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )));
        }
        state.frames.push(frame);
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_proto::encode_publish;
    use tokio::io::AsyncReadExt;

    // ==================== MemoryAdapter Tests ====================

    #[tokio::test]
    async fn test_memory_adapter_records_frames() {
        let adapter = MemoryAdapter::new();
        adapter.send(encode_publish(b"cmd-A").unwrap()).await.unwrap();
        adapter.send(Bytes::from_static(&[0xD0, 0x00])).await.unwrap();

        assert_eq!(adapter.sent_frames().len(), 2);
        assert_eq!(adapter.sent_payloads(), vec![Bytes::from_static(b"cmd-A")]);
    }

    #[tokio::test]
    async fn test_memory_adapter_closed_rejects_send() {
        let adapter = MemoryAdapter::new();
        adapter.close().await;
        adapter.close().await;

        assert!(adapter.is_closed());
        let result = adapter.send(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(AdapterError::Closed)));
    }

    #[tokio::test]
    async fn test_memory_adapter_failing_after() {
        let adapter = MemoryAdapter::failing_after(1);
        assert!(adapter.send(Bytes::from_static(b"a")).await.is_ok());
        assert!(matches!(
            adapter.send(Bytes::from_static(b"b")).await,
            Err(AdapterError::Io(_))
        ));
        assert_eq!(adapter.sent_frames().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_adapter_fail_sends() {
        let adapter = MemoryAdapter::new();
        adapter.send(Bytes::from_static(b"a")).await.unwrap();
        adapter.fail_sends();
        assert!(adapter.send(Bytes::from_static(b"b")).await.is_err());
    }

    // ==================== StreamAdapter Tests ====================

    #[tokio::test]
    async fn test_stream_adapter_writes_frames() {
        let (client, mut server) = tokio::io::duplex(64);
        let adapter = StreamAdapter::new(client, Duration::from_secs(1), "test");

        adapter.send(Bytes::from_static(b"hello")).await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_stream_adapter_send_after_close() {
        let (client, _server) = tokio::io::duplex(64);
        let adapter = StreamAdapter::new(client, Duration::from_secs(1), "test");

        adapter.close().await;
        let result = adapter.send(Bytes::from_static(b"hello")).await;
        assert!(matches!(result, Err(AdapterError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_adapter_write_timeout() {
        // Nobody reads the other end, so the write stalls once the buffer is full.
        let (client, _server) = tokio::io::duplex(4);
        let adapter = StreamAdapter::new(client, Duration::from_millis(100), "test");

        let result = adapter.send(Bytes::from_static(b"more than four bytes")).await;
        assert!(matches!(result, Err(AdapterError::Timeout(_))));

        // The writer is discarded after a failure.
        let result = adapter.send(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(AdapterError::Closed)));
    }

    #[tokio::test]
    async fn test_stream_adapter_peer_gone() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let adapter = StreamAdapter::new(client, Duration::from_secs(1), "test");

        let result = adapter.send(Bytes::from_static(b"hello")).await;
        assert!(matches!(result, Err(AdapterError::Io(_))));
    }
}
