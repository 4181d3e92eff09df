//! Connection handshake (Connect frame) codec.
//!
//! Body layout after the fixed header:
//!
//! ```text
//! u16 BE len | protocol name | u8 version | u8 flags | u16 BE keep-alive | u16 BE len | client id
//! ```
//!
//! Bytes after the client id (will, username, password) are read as part
//! of the frame and ignored.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{decode_frame_header, encode_frame_header, FrameType};
use crate::types::DeviceId;

/// Default upper bound on a handshake body.
pub const DEFAULT_MAX_HANDSHAKE_SIZE: usize = 64 * 1024;

/// Default protocol name written by [`Handshake::new`].
pub const DEFAULT_PROTOCOL_NAME: &str = "MQTT";

/// Default protocol level written by [`Handshake::new`].
pub const DEFAULT_PROTOCOL_VERSION: u8 = 4;

/// Decoded connection handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol name announced by the device.
    pub protocol_name: String,
    /// Protocol level.
    pub protocol_version: u8,
    /// Connect flags byte.
    pub flags: u8,
    /// Keep-alive interval requested by the device, in seconds.
    pub keep_alive_secs: u16,
    /// Client identifier; becomes the device ID.
    pub client_id: String,
}

impl Handshake {
    /// Create a handshake with default protocol fields.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol_name: DEFAULT_PROTOCOL_NAME.to_string(),
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            flags: 0x02,
            keep_alive_secs: 60,
            client_id: client_id.into(),
        }
    }

    /// Set the protocol name.
    #[must_use]
    pub fn with_protocol_name(mut self, name: impl Into<String>) -> Self {
        self.protocol_name = name.into();
        self
    }

    /// Set the protocol version.
    #[must_use]
    pub const fn with_protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = version;
        self
    }

    /// Set the connect flags.
    #[must_use]
    pub const fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Set the keep-alive interval in seconds.
    #[must_use]
    pub const fn with_keep_alive_secs(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    /// Get the device ID carried by this handshake.
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.client_id.clone())
    }

    /// Get the keep-alive interval as a duration.
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_secs))
    }
}

/// Decode a handshake using [`DEFAULT_MAX_HANDSHAKE_SIZE`].
///
/// # Errors
///
/// See [`decode_handshake_with_limit`].
pub async fn decode_handshake<R>(reader: &mut R) -> ProtocolResult<Handshake>
where
    R: AsyncRead + Unpin,
{
    decode_handshake_with_limit(reader, DEFAULT_MAX_HANDSHAKE_SIZE).await
}

/// Decode a handshake, reading exactly one frame from `reader`.
///
/// # Errors
///
/// Returns an error if the first frame is not a Connect frame, if the frame
/// is larger than `max_size`, if the stream ends early, or if the client id
/// is empty.
pub async fn decode_handshake_with_limit<R>(
    reader: &mut R,
    max_size: usize,
) -> ProtocolResult<Handshake>
where
    R: AsyncRead + Unpin,
{
    let header = decode_frame_header(reader).await?;
    if header.frame_type != FrameType::Connect {
        return Err(ProtocolError::UnexpectedFrame(header.frame_type.to_string()));
    }
    if header.remaining_length > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: header.remaining_length,
            limit: max_size,
        });
    }

    let mut body = vec![0u8; header.remaining_length];
    reader.read_exact(&mut body).await?;
    parse_handshake_body(&body)
}

fn parse_handshake_body(mut body: &[u8]) -> ProtocolResult<Handshake> {
    let protocol_name = read_string(&mut body, "protocol name")?;
    let protocol_version = read_u8(&mut body, "protocol version")?;
    let flags = read_u8(&mut body, "connect flags")?;
    let keep_alive_secs = read_u16(&mut body, "keep alive")?;
    let client_id = read_string(&mut body, "client id")?;

    if client_id.is_empty() {
        return Err(ProtocolError::EmptyClientId);
    }

    Ok(Handshake {
        protocol_name,
        protocol_version,
        flags,
        keep_alive_secs,
        client_id,
    })
}

fn short_body(field: &'static str) -> ProtocolError {
    ProtocolError::Truncated(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("handshake body ended before {field}"),
    ))
}

fn read_u8(buf: &mut &[u8], field: &'static str) -> ProtocolResult<u8> {
    if buf.remaining() < 1 {
        return Err(short_body(field));
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut &[u8], field: &'static str) -> ProtocolResult<u16> {
    if buf.remaining() < 2 {
        return Err(short_body(field));
    }
    Ok(buf.get_u16())
}

fn read_string(buf: &mut &[u8], field: &'static str) -> ProtocolResult<String> {
    let len = usize::from(read_u16(buf, field)?);
    if buf.remaining() < len {
        return Err(short_body(field));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidString { field })
}

fn put_string(dst: &mut BytesMut, value: &str, field: &'static str) -> ProtocolResult<()> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        size: value.len(),
    })?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

/// Encode a handshake frame (device side).
///
/// # Errors
///
/// Returns an error if the client id is empty or a string field does not
/// fit its length prefix.
pub fn encode_handshake(handshake: &Handshake) -> ProtocolResult<Bytes> {
    if handshake.client_id.is_empty() {
        return Err(ProtocolError::EmptyClientId);
    }

    let mut body = BytesMut::with_capacity(
        8 + handshake.protocol_name.len() + handshake.client_id.len(),
    );
    put_string(&mut body, &handshake.protocol_name, "protocol name")?;
    body.put_u8(handshake.protocol_version);
    body.put_u8(handshake.flags);
    body.put_u16(handshake.keep_alive_secs);
    put_string(&mut body, &handshake.client_id, "client id")?;

    let mut frame = encode_frame_header(FrameType::Connect, 0, body.len())?;
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Return code carried by a CONNACK frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    /// Connection accepted.
    Accepted = 0,
    /// Client identifier rejected.
    IdentifierRejected = 2,
    /// Gateway cannot serve the connection right now.
    ServerUnavailable = 3,
    /// Device is not authorised to connect.
    NotAuthorized = 5,
}

/// Encode a CONNACK frame.
#[must_use]
pub fn encode_connack(code: ConnackCode) -> Bytes {
    Bytes::copy_from_slice(&[FrameType::ConnAck.tag() << 4, 0x02, 0x00, code as u8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_connect(body: &[u8]) -> Vec<u8> {
        let mut frame = encode_frame_header(FrameType::Connect, 0, body.len()).unwrap();
        frame.put_slice(body);
        frame.to_vec()
    }

    #[tokio::test]
    async fn test_decode_handshake_valid() {
        let handshake = Handshake::new("device-001").with_keep_alive_secs(30);
        let bytes = encode_handshake(&handshake).unwrap();

        let mut reader = &bytes[..];
        let decoded = decode_handshake(&mut reader).await.unwrap();

        assert_eq!(decoded, handshake);
        assert_eq!(decoded.device_id().as_str(), "device-001");
        assert_eq!(decoded.keep_alive(), Duration::from_secs(30));
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_decode_handshake_reads_exactly_one_frame() {
        let mut bytes = encode_handshake(&Handshake::new("dev")).unwrap().to_vec();
        bytes.extend_from_slice(&[0xC0, 0x00]);

        let mut reader = &bytes[..];
        decode_handshake(&mut reader).await.unwrap();
        assert_eq!(reader, &[0xC0, 0x00]);
    }

    #[tokio::test]
    async fn test_decode_handshake_rejects_non_connect() {
        let bytes = [0x30u8, 0x00];
        let mut reader = &bytes[..];
        let result = decode_handshake(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::UnexpectedFrame(_))));
    }

    #[tokio::test]
    async fn test_decode_handshake_truncated_stream() {
        let bytes = encode_handshake(&Handshake::new("device-001")).unwrap();
        let cut = &bytes[..bytes.len() - 3];
        let mut reader = cut;
        let result = decode_handshake(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::Truncated(_))));
    }

    #[tokio::test]
    async fn test_decode_handshake_truncated_body() {
        // Declared length covers the bytes present, but the body stops
        // before the client id.
        let body = [0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C];
        let bytes = raw_connect(&body);
        let mut reader = &bytes[..];
        let result = decode_handshake(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::Truncated(_))));
    }

    #[tokio::test]
    async fn test_decode_handshake_empty_client_id() {
        let body = [
            0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x00,
        ];
        let bytes = raw_connect(&body);
        let mut reader = &bytes[..];
        let result = decode_handshake(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::EmptyClientId)));
    }

    #[tokio::test]
    async fn test_decode_handshake_invalid_utf8() {
        let body = [
            0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x02, 0xC3, 0x28,
        ];
        let bytes = raw_connect(&body);
        let mut reader = &bytes[..];
        let result = decode_handshake(&mut reader).await;
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidString { field: "client id" })
        ));
    }

    #[tokio::test]
    async fn test_decode_handshake_over_limit() {
        let bytes = encode_handshake(&Handshake::new("device-with-a-long-name")).unwrap();
        let mut reader = &bytes[..];
        let result = decode_handshake_with_limit(&mut reader, 8).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { limit: 8, .. })));
    }

    #[tokio::test]
    async fn test_decode_handshake_length_overflow() {
        let bytes = [0x10u8, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        let mut reader = &bytes[..];
        let result = decode_handshake(&mut reader).await;
        assert!(matches!(
            result,
            Err(ProtocolError::RemainingLengthOverflow { .. })
        ));
    }

    #[test]
    fn test_encode_handshake_empty_client_id() {
        let handshake = Handshake::new("");
        assert!(matches!(
            encode_handshake(&handshake),
            Err(ProtocolError::EmptyClientId)
        ));
    }

    #[test]
    fn test_encode_connack() {
        assert_eq!(&encode_connack(ConnackCode::Accepted)[..], &[0x20, 0x02, 0x00, 0x00]);
        assert_eq!(
            &encode_connack(ConnackCode::NotAuthorized)[..],
            &[0x20, 0x02, 0x00, 0x05]
        );
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn handshake_round_trip(
                protocol_name in "[A-Za-z]{0,16}",
                version in any::<u8>(),
                flags in any::<u8>(),
                keep_alive in any::<u16>(),
                client_id in "[a-zA-Z0-9_-]{1,64}",
            ) {
                let handshake = Handshake {
                    protocol_name,
                    protocol_version: version,
                    flags,
                    keep_alive_secs: keep_alive,
                    client_id: client_id.clone(),
                };
                let bytes = encode_handshake(&handshake).unwrap();

                let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
                let decoded = runtime.block_on(async {
                    let mut reader = &bytes[..];
                    decode_handshake(&mut reader).await
                }).unwrap();

                prop_assert_eq!(decoded.client_id, client_id);
                prop_assert_eq!(decoded.keep_alive_secs, keep_alive);
                prop_assert_eq!(decoded.protocol_version, version);
            }
        }
    }
}
