//! Error types for the edge-proto crate.

use thiserror::Error;

/// Errors raised while decoding or encoding frames.
///
/// Every variant is fatal to the single connection that produced it and
/// never to the process.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The stream ended before a complete frame was read.
    #[error("truncated frame: {0}")]
    Truncated(#[source] std::io::Error),

    /// The remaining-length field used more continuation bytes than allowed.
    #[error("remaining length exceeds {max_bytes} continuation bytes")]
    RemainingLengthOverflow {
        /// Maximum number of length bytes accepted.
        max_bytes: usize,
    },

    /// The frame type nibble does not name a known control packet.
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    /// A frame other than Connect was received as the first frame.
    #[error("expected connect frame, got {0}")]
    UnexpectedFrame(String),

    /// The handshake carried an empty client identifier.
    #[error("client id must not be empty")]
    EmptyClientId,

    /// A length-prefixed string was not valid UTF-8.
    #[error("invalid utf-8 in {field}")]
    InvalidString {
        /// Name of the offending field.
        field: &'static str,
    },

    /// A frame declared more bytes than the configured limit.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A publish payload does not fit the 2-byte length prefix.
    #[error("payload of {size} bytes exceeds publish limit of {limit} bytes")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Maximum publish payload.
        limit: usize,
    },

    /// A string field does not fit its 2-byte length prefix.
    #[error("field {field} of {size} bytes does not fit a u16 length prefix")]
    FieldTooLong {
        /// Name of the offending field.
        field: &'static str,
        /// Field size.
        size: usize,
    },

    /// Underlying I/O failure other than end-of-stream.
    #[error("io error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Truncated(err)
        } else {
            Self::Io(err)
        }
    }
}

/// Result type for codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
