//! Client error types, reported through [`CometListener::on_error`](crate::CometListener::on_error).

use std::time::Duration;

use comet_protocol::{CodecError, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CometError {
    #[error("timed out connecting to {url} after {}ms", timeout.as_millis())]
    Timeout { url: String, timeout: Duration },

    #[error("heartbeat failed")]
    HeartbeatFailed,

    #[error("unexpected disconnection")]
    UnexpectedDisconnection,

    #[error("HTTP status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("cannot decode object frame without a codec: {0}")]
    MissingCodec(String),

    #[error("expecting disconnection but received: {0}")]
    FrameAfterDisconnect(String),
}
