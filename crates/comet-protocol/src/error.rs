//! Protocol and codec error types.

use thiserror::Error;

/// A violation of the frame protocol detected while decoding a stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unexpected frame tag {0:?}")]
    UnknownTag(char),

    #[error("empty frame")]
    EmptyFrame,

    #[error("invalid heartbeat parameter {0:?}")]
    InvalidHeartbeat(String),

    #[error("invalid escape sequence at offset {offset}")]
    InvalidEscape { offset: usize },

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Failure of a [`WireCodec`](crate::WireCodec) to encode or decode an object.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode object: {0}")]
    Encode(String),

    #[error("failed to decode object: {0}")]
    Decode(String),
}
