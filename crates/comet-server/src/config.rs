//! Server configuration.

use std::time::Duration;

/// Comet server configuration.
#[derive(Debug, Clone)]
pub struct CometConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Route serving comet streams
    pub path: String,
    /// Default and minimum heartbeat interval
    pub heartbeat: Duration,
    /// Messages written per drain step of a session queue
    pub batch_size: usize,
    /// Compress streams for clients that accept deflate
    pub deflate: bool,
    /// Maximum concurrent comet streams
    pub max_connections: Option<usize>,
    /// Enable CORS
    pub enable_cors: bool,
    /// HTTP session idle timeout (`None` never expires)
    pub session_max_inactive: Option<Duration>,
    /// How long before HTTP session expiry a keep-alive fires
    pub keep_alive_buffer: Duration,
    /// How often expired HTTP sessions are reaped
    pub reap_interval: Duration,
}

impl Default for CometConfig {
    fn default() -> Self {
        Self {
            port: 7080,
            hostname: "127.0.0.1".into(),
            path: "/comet".into(),
            heartbeat: Duration::from_millis(15_000),
            batch_size: 10,
            deflate: true,
            max_connections: Some(1024),
            enable_cors: false,
            session_max_inactive: Some(Duration::from_secs(30 * 60)),
            keep_alive_buffer: Duration::from_secs(10),
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// Byte thresholds of a managed stream, counted before compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    /// Past this, a stream without a session asks the client to reconnect.
    pub refresh: usize,
    /// Past this, the stream is terminated.
    pub hard: usize,
}

impl StreamLimits {
    pub const fn new(refresh: usize, hard: usize) -> Self {
        Self { refresh, hard }
    }

    /// Replace the hard limit, keeping the refresh point below it.
    pub fn with_hard(self, hard: usize) -> Self {
        Self { refresh: self.refresh.min(hard / 2), hard }
    }
}
