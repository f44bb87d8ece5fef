//! Server-side error types.

use std::io;

use comet_protocol::CodecError;
use thiserror::Error;

/// Errors surfaced by [`ServerConnection`](crate::ServerConnection) operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("comet connection terminated")]
    Terminated,

    #[error("request and session can not be accessed after the connection has been suspended")]
    Suspended,

    #[error("response already committed")]
    Committed,

    #[error("{0}")]
    InvalidParameter(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors starting a [`CometServer`](crate::CometServer).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("failed to bind listener: {0}")]
    Bind(#[from] io::Error),
}
