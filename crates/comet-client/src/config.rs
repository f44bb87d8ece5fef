//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use comet_protocol::{JsonCodec, WireCodec};

#[derive(Clone)]
pub struct ClientConfig {
    /// How long to wait for the connect frame. Also added to the advertised
    /// heartbeat to get the heartbeat deadline.
    pub connect_timeout: Duration,
    /// Delay before retrying after a failed connect.
    pub reconnect_delay: Duration,
    /// Ask the server for a deflate-compressed stream.
    pub compression: bool,
    /// Decoder for object frames. `None` makes them an error.
    pub codec: Option<Arc<dyn WireCodec>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            compression: false,
            codec: Some(Arc::new(JsonCodec)),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("compression", &self.compression)
            .field("codec", &self.codec.is_some())
            .finish()
    }
}
