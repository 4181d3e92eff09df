//! Outbound publish frame codec.
//!
//! Commands are written to devices as `0x30 | u16 BE length | payload`.
//! There is no fragmentation: one command is one frame.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::FrameType;

/// First byte of every outbound publish frame.
pub const PUBLISH_TAG: u8 = FrameType::Publish as u8 * 16;

/// Largest payload a publish frame can carry.
pub const MAX_PUBLISH_PAYLOAD: usize = u16::MAX as usize;

/// Encode a payload as a publish frame.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the payload does not fit
/// the 2-byte length prefix.
pub fn encode_publish(payload: &[u8]) -> ProtocolResult<Bytes> {
    let len = u16::try_from(payload.len()).map_err(|_| ProtocolError::PayloadTooLarge {
        size: payload.len(),
        limit: MAX_PUBLISH_PAYLOAD,
    })?;

    let mut frame = BytesMut::with_capacity(3 + payload.len());
    frame.put_u8(PUBLISH_TAG);
    frame.put_u16(len);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Read one publish frame and return its payload (device side).
///
/// # Errors
///
/// Returns an error if the tag is not [`PUBLISH_TAG`] or the stream ends
/// early.
pub async fn decode_publish<R>(reader: &mut R) -> ProtocolResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    let tag = reader.read_u8().await?;
    if tag != PUBLISH_TAG {
        let name = FrameType::from_tag(tag >> 4)
            .map_or_else(|_| format!("tag {tag:#04x}"), |t| t.to_string());
        return Err(ProtocolError::UnexpectedFrame(name));
    }
    let len = usize::from(reader.read_u16().await?);
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}
