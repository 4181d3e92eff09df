//! # edge-proto
//!
//! Wire types and frame codec for the edgesphere device gateway.
//!
//! The wire format is a simplified publish/subscribe framing scheme:
//!
//! ```text
//! ┌──────────────┬──────────────────────────┬────────────────────┐
//! │ type | flags │ remaining length (1..=4) │ body               │
//! │  4b  |  4b   │ base-128, LSB first      │ remaining bytes    │
//! └──────────────┴──────────────────────────┴────────────────────┘
//! ```
//!
//! A device opens every connection with a Connect frame (see [`handshake`]).
//! Commands travel gateway → device as publish frames (see [`publish`]),
//! which use a fixed 2-byte big-endian length instead of the variable
//! remaining-length field.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod frame;
pub mod handshake;
pub mod publish;
pub mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use frame::{
    decode_frame_header, decode_remaining_length, encode_frame_header, encode_ping_response,
    encode_remaining_length, parse_remaining_length, FrameHeader, FrameType, InboundCodec, InboundFrame,
    MAX_REMAINING_LENGTH, MAX_REMAINING_LENGTH_BYTES,
};
pub use handshake::{
    decode_handshake, decode_handshake_with_limit, encode_connack, encode_handshake, ConnackCode,
    Handshake, DEFAULT_MAX_HANDSHAKE_SIZE,
};
pub use publish::{decode_publish, encode_publish, MAX_PUBLISH_PAYLOAD, PUBLISH_TAG};
pub use types::{DeviceId, NodeId};
