//! Frame header codec.
//!
//! Every frame starts with one byte holding the frame type (high nibble) and
//! flags (low nibble), followed by the remaining length as a base-128
//! continuation sequence, least significant group first. A set high bit
//! means another length byte follows. At most
//! [`MAX_REMAINING_LENGTH_BYTES`] length bytes are accepted; a longer
//! sequence is a decode error rather than an unbounded read.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::Decoder;

use crate::error::{ProtocolError, ProtocolResult};

/// Maximum number of bytes in the remaining-length field.
pub const MAX_REMAINING_LENGTH_BYTES: usize = 4;

/// Largest value representable with [`MAX_REMAINING_LENGTH_BYTES`] bytes.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Control packet type carried in the high nibble of the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Connection request (handshake).
    Connect = 1,
    /// Connection acknowledgement.
    ConnAck = 2,
    /// Application message.
    Publish = 3,
    /// Publish acknowledgement.
    PubAck = 4,
    /// Subscription request.
    Subscribe = 8,
    /// Subscription acknowledgement.
    SubAck = 9,
    /// Unsubscribe request.
    Unsubscribe = 10,
    /// Unsubscribe acknowledgement.
    UnsubAck = 11,
    /// Keep-alive ping.
    PingReq = 12,
    /// Keep-alive ping response.
    PingResp = 13,
    /// Graceful disconnect.
    Disconnect = 14,
}

impl FrameType {
    /// Parse a frame type from its 4-bit tag.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownFrameType`] for unassigned tags.
    pub fn from_tag(tag: u8) -> ProtocolResult<Self> {
        match tag {
            1 => Ok(Self::Connect),
            2 => Ok(Self::ConnAck),
            3 => Ok(Self::Publish),
            4 => Ok(Self::PubAck),
            8 => Ok(Self::Subscribe),
            9 => Ok(Self::SubAck),
            10 => Ok(Self::Unsubscribe),
            11 => Ok(Self::UnsubAck),
            12 => Ok(Self::PingReq),
            13 => Ok(Self::PingResp),
            14 => Ok(Self::Disconnect),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }

    /// Get the 4-bit tag for this frame type.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "CONNECT",
            Self::ConnAck => "CONNACK",
            Self::Publish => "PUBLISH",
            Self::PubAck => "PUBACK",
            Self::Subscribe => "SUBSCRIBE",
            Self::SubAck => "SUBACK",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::UnsubAck => "UNSUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        };
        f.write_str(name)
    }
}

/// Decoded fixed header of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Control packet type.
    pub frame_type: FrameType,
    /// Low-nibble flags.
    pub flags: u8,
    /// Number of body bytes following the header.
    pub remaining_length: usize,
}

impl FrameHeader {
    /// Split the first header byte into a frame type and flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the type nibble is unknown.
    pub fn split_first_byte(byte: u8) -> ProtocolResult<(FrameType, u8)> {
        let frame_type = FrameType::from_tag(byte >> 4)?;
        Ok((frame_type, byte & 0x0F))
    }
}

/// Read a remaining-length field from a stream.
///
/// Reads one byte at a time and never more than
/// [`MAX_REMAINING_LENGTH_BYTES`] bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::RemainingLengthOverflow`] if the fourth byte
/// still has its continuation bit set, or [`ProtocolError::Truncated`] if
/// the stream ends early.
pub async fn decode_remaining_length<R>(reader: &mut R) -> ProtocolResult<usize>
where
    R: AsyncRead + Unpin,
{
    let mut value = 0usize;
    for index in 0..MAX_REMAINING_LENGTH_BYTES {
        let byte = reader.read_u8().await?;
        value |= usize::from(byte & 0x7F) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ProtocolError::RemainingLengthOverflow {
        max_bytes: MAX_REMAINING_LENGTH_BYTES,
    })
}

/// Parse a remaining-length field from a buffer without consuming it.
///
/// Returns `Ok(None)` if the buffer ends before the field is complete,
/// otherwise the decoded value and the number of length bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::RemainingLengthOverflow`] on a fifth
/// continuation byte.
pub fn parse_remaining_length(buf: &[u8]) -> ProtocolResult<Option<(usize, usize)>> {
    let mut value = 0usize;
    for index in 0..MAX_REMAINING_LENGTH_BYTES {
        let Some(&byte) = buf.get(index) else {
            return Ok(None);
        };
        value |= usize::from(byte & 0x7F) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
    }
    Err(ProtocolError::RemainingLengthOverflow {
        max_bytes: MAX_REMAINING_LENGTH_BYTES,
    })
}

/// Encode a remaining-length value.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if `len` exceeds
/// [`MAX_REMAINING_LENGTH`].
pub fn encode_remaining_length(mut len: usize, dst: &mut BytesMut) -> ProtocolResult<()> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            limit: MAX_REMAINING_LENGTH,
        });
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Encode a complete fixed header.
///
/// # Errors
///
/// Returns an error if `remaining_length` is not representable.
pub fn encode_frame_header(
    frame_type: FrameType,
    flags: u8,
    remaining_length: usize,
) -> ProtocolResult<BytesMut> {
    let mut dst = BytesMut::with_capacity(1 + MAX_REMAINING_LENGTH_BYTES + remaining_length);
    dst.put_u8((frame_type.tag() << 4) | (flags & 0x0F));
    encode_remaining_length(remaining_length, &mut dst)?;
    Ok(dst)
}

/// Read a fixed header from a stream.
///
/// # Errors
///
/// Returns an error on truncation, unknown frame types, or an oversized
/// remaining-length field.
pub async fn decode_frame_header<R>(reader: &mut R) -> ProtocolResult<FrameHeader>
where
    R: AsyncRead + Unpin,
{
    let first = reader.read_u8().await?;
    let (frame_type, flags) = FrameHeader::split_first_byte(first)?;
    let remaining_length = decode_remaining_length(reader).await?;
    Ok(FrameHeader {
        frame_type,
        flags,
        remaining_length,
    })
}

static PING_RESPONSE: [u8; 2] = [0xD0, 0x00];

/// Encode a PINGRESP frame.
#[must_use]
pub fn encode_ping_response() -> Bytes {
    Bytes::from_static(&PING_RESPONSE)
}

/// A complete frame received after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Fixed header.
    pub header: FrameHeader,
    /// Body bytes (`header.remaining_length` long).
    pub body: Bytes,
}

/// Stream decoder for frames that follow a successful handshake.
#[derive(Debug, Clone, Copy)]
pub struct InboundCodec {
    max_frame_size: usize,
}

impl InboundCodec {
    /// Create a codec that rejects bodies larger than `max_frame_size`.
    #[must_use]
    pub const fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Get the configured frame size limit.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for InboundCodec {
    type Item = InboundFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };
        let (frame_type, flags) = FrameHeader::split_first_byte(first)?;

        let Some((remaining_length, length_bytes)) = parse_remaining_length(&src[1..])? else {
            return Ok(None);
        };
        if remaining_length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: remaining_length,
                limit: self.max_frame_size,
            });
        }

        let total = 1 + length_bytes + remaining_length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(1 + length_bytes);
        let body = src.split_to(remaining_length).freeze();
        Ok(Some(InboundFrame {
            header: FrameHeader {
                frame_type,
                flags,
                remaining_length,
            },
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn encoded_length(len: usize) -> Vec<u8> {
        let mut dst = BytesMut::new();
        encode_remaining_length(len, &mut dst).unwrap();
        dst.to_vec()
    }

    // ==================== FrameType Tests ====================

    #[test_case(1, FrameType::Connect ; "connect")]
    #[test_case(3, FrameType::Publish ; "publish")]
    #[test_case(12, FrameType::PingReq ; "pingreq")]
    #[test_case(14, FrameType::Disconnect ; "disconnect")]
    fn test_frame_type_from_tag(tag: u8, expected: FrameType) {
        assert_eq!(FrameType::from_tag(tag).unwrap(), expected);
        assert_eq!(expected.tag(), tag);
    }

    #[test_case(0 ; "reserved zero")]
    #[test_case(5 ; "pubrec unsupported")]
    #[test_case(15 ; "reserved fifteen")]
    fn test_frame_type_unknown(tag: u8) {
        assert!(matches!(
            FrameType::from_tag(tag),
            Err(ProtocolError::UnknownFrameType(t)) if t == tag
        ));
    }

    #[test]
    fn test_split_first_byte() {
        let (frame_type, flags) = FrameHeader::split_first_byte(0x3B).unwrap();
        assert_eq!(frame_type, FrameType::Publish);
        assert_eq!(flags, 0x0B);
    }

    // ==================== Remaining Length Tests ====================

    #[test_case(0, &[0x00] ; "zero")]
    #[test_case(127, &[0x7F] ; "one byte max")]
    #[test_case(128, &[0x80, 0x01] ; "two byte min")]
    #[test_case(16_383, &[0xFF, 0x7F] ; "two byte max")]
    #[test_case(16_384, &[0x80, 0x80, 0x01] ; "three byte min")]
    #[test_case(2_097_152, &[0x80, 0x80, 0x80, 0x01] ; "four byte min")]
    #[test_case(MAX_REMAINING_LENGTH, &[0xFF, 0xFF, 0xFF, 0x7F] ; "four byte max")]
    fn test_remaining_length_boundaries(value: usize, bytes: &[u8]) {
        assert_eq!(encoded_length(value), bytes);
        assert_eq!(parse_remaining_length(bytes).unwrap(), Some((value, bytes.len())));
    }

    #[test]
    fn test_encode_remaining_length_too_large() {
        let mut dst = BytesMut::new();
        let result = encode_remaining_length(MAX_REMAINING_LENGTH + 1, &mut dst);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_parse_remaining_length_incomplete() {
        assert_eq!(parse_remaining_length(&[]).unwrap(), None);
        assert_eq!(parse_remaining_length(&[0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn test_parse_remaining_length_overflow() {
        let result = parse_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert!(matches!(
            result,
            Err(ProtocolError::RemainingLengthOverflow { max_bytes: 4 })
        ));
    }

    #[tokio::test]
    async fn test_decode_remaining_length_overflow_does_not_block() {
        // A run of continuation bytes must stop after the fourth byte.
        let bytes = vec![0x80u8; 64];
        let mut reader = bytes.as_slice();
        let result = decode_remaining_length(&mut reader).await;
        assert!(matches!(
            result,
            Err(ProtocolError::RemainingLengthOverflow { .. })
        ));
        assert_eq!(reader.len(), 60);
    }

    #[tokio::test]
    async fn test_decode_remaining_length_truncated() {
        let bytes = [0x80u8, 0x80];
        let mut reader = &bytes[..];
        let result = decode_remaining_length(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::Truncated(_))));
    }

    // ==================== Header Tests ====================

    #[tokio::test]
    async fn test_decode_frame_header() {
        let header = encode_frame_header(FrameType::Publish, 0x02, 321).unwrap();
        let mut reader = &header[..];
        let decoded = decode_frame_header(&mut reader).await.unwrap();

        assert_eq!(decoded.frame_type, FrameType::Publish);
        assert_eq!(decoded.flags, 0x02);
        assert_eq!(decoded.remaining_length, 321);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_decode_frame_header_unknown_type() {
        let bytes = [0x00u8, 0x00];
        let mut reader = &bytes[..];
        let result = decode_frame_header(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::UnknownFrameType(0))));
    }

    #[test]
    fn test_encode_ping_response() {
        assert_eq!(&encode_ping_response()[..], &[0xD0, 0x00]);
    }

    // ==================== InboundCodec Tests ====================

    #[test]
    fn test_inbound_codec_partial_then_complete() {
        let mut codec = InboundCodec::new(1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x30, 0x03, b'a']);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"bc");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.frame_type, FrameType::Publish);
        assert_eq!(&frame.body[..], b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_inbound_codec_multiple_frames() {
        let mut codec = InboundCodec::new(1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xC0, 0x00, 0xE0, 0x00]);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.header.frame_type, FrameType::PingReq);
        assert_eq!(second.header.frame_type, FrameType::Disconnect);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_inbound_codec_rejects_oversized() {
        let mut codec = InboundCodec::new(4);
        let mut buf = BytesMut::from(&[0x30u8, 0x05][..]);
        let result = codec.decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { size: 5, limit: 4 })
        ));
    }

    #[test]
    fn test_inbound_codec_rejects_length_overflow() {
        let mut codec = InboundCodec::new(usize::MAX);
        let mut buf = BytesMut::from(&[0x30u8, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::RemainingLengthOverflow { .. })
        ));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn remaining_length_never_exceeds_four_bytes(len in 0usize..=MAX_REMAINING_LENGTH) {
                let bytes = encoded_length(len);
                prop_assert!(bytes.len() <= MAX_REMAINING_LENGTH_BYTES);
                prop_assert_eq!(parse_remaining_length(&bytes).unwrap(), Some((len, bytes.len())));
            }
        }
    }
}
