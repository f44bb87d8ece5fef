//! Comet Push - Client
//!
//! Keeps one push stream open against a comet endpoint. The
//! [`ClientConnection`] state machine owns the timers and reconnection
//! policy; the bytes come from a [`ClientTransport`], with
//! [`HttpStreamTransport`] as the streaming-request implementation.

pub mod config;
pub mod connection;
pub mod error;
pub mod http_transport;
pub mod listener;
pub mod transport;

pub use config::ClientConfig;
pub use connection::{ClientConnection, ClientPhase};
pub use error::CometError;
pub use http_transport::HttpStreamTransport;
pub use listener::{CometListener, set_uncaught_handler};
pub use transport::{ClientTransport, TransportEvents};
