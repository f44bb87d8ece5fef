//! Client connection state machine.
//!
//! ```text
//! Idle ──start──▶ Connecting ──connect frame──▶ Connected
//!                   ▲    │                          │
//!                   │    └─timeout / error──┐       ├─ disconnect ─▶ Connecting
//!                   │                       ▼       │
//!                   └──── delay ──── Reconnecting ◀─┘ heartbeat failed
//! ```
//!
//! Every connect attempt is numbered. Timers and transport events carry the
//! attempt they belong to and are ignored once the connection has moved on,
//! so exactly one terminal event is acted on per attempt.

use std::sync::{Arc, Weak};
use std::time::Duration;

use comet_protocol::Message;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::CometError;
use crate::http_transport::HttpStreamTransport;
use crate::listener::{CometListener, guarded};
use crate::transport::{ClientTransport, TransportEvents};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl ClientPhase {
    fn is_running(self) -> bool {
        !matches!(self, ClientPhase::Idle | ClientPhase::Stopped)
    }
}

#[derive(Default)]
struct Timers {
    connect: Option<AbortHandle>,
    heartbeat: Option<AbortHandle>,
    reconnect: Option<AbortHandle>,
}

impl Timers {
    fn cancel_all(&mut self) {
        for timer in [self.connect.take(), self.heartbeat.take(), self.reconnect.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }
}

struct ClientState {
    phase: ClientPhase,
    attempt: u64,
    heartbeat: Duration,
    last_received: Instant,
    timers: Timers,
}

/// A reconnecting push stream against one URL.
pub struct ClientConnection {
    url: String,
    config: ClientConfig,
    listener: Arc<dyn CometListener>,
    transport: Arc<dyn ClientTransport>,
    runtime: Handle,
    this: Weak<ClientConnection>,
    state: Mutex<ClientState>,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("url", &self.url)
            .field("phase", &self.state())
            .finish()
    }
}

impl ClientConnection {
    /// Create a stopped connection. Must be called within a Tokio runtime,
    /// which drives its timers.
    pub fn new(
        url: impl Into<String>,
        config: ClientConfig,
        listener: Arc<dyn CometListener>,
        transport: Arc<dyn ClientTransport>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            url: url.into(),
            config,
            listener,
            transport,
            runtime: Handle::current(),
            this: this.clone(),
            state: Mutex::new(ClientState {
                phase: ClientPhase::Idle,
                attempt: 0,
                heartbeat: Duration::ZERO,
                last_received: Instant::now(),
                timers: Timers::default(),
            }),
        })
    }

    /// Create a connection over a streaming HTTP request.
    pub fn http(
        url: impl Into<String>,
        config: ClientConfig,
        listener: Arc<dyn CometListener>,
    ) -> Result<Arc<Self>, CometError> {
        let transport = Arc::new(HttpStreamTransport::new(&config)?);
        Ok(Self::new(url, config, listener, transport))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ClientPhase {
        self.state.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Heartbeat interval advertised by the server on the last connect.
    pub fn heartbeat(&self) -> Duration {
        self.state.lock().heartbeat
    }

    /// Start connecting. Does nothing while already running.
    pub fn start(&self) {
        let events = {
            let mut state = self.state.lock();
            if state.phase.is_running() {
                return;
            }
            info!(url = %self.url, "comet client starting");
            self.begin_attempt(&mut state)
        };
        self.transport.connect(&self.url, events);
    }

    /// Stop and tear down the transport. Does nothing while stopped.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if !state.phase.is_running() {
                return;
            }
            state.phase = ClientPhase::Stopped;
            state.attempt += 1;
            state.timers.cancel_all();
        }
        self.transport.disconnect();
        info!(url = %self.url, "comet client stopped");
    }

    pub(crate) fn is_current_attempt(&self, attempt: u64) -> bool {
        let state = self.state.lock();
        state.attempt == attempt && state.phase.is_running()
    }

    fn accepts(&self, state: &ClientState, attempt: u64) -> bool {
        if state.attempt == attempt && state.phase.is_running() {
            return true;
        }
        debug!(url = %self.url, attempt, current = state.attempt, "dropping stale transport event");
        false
    }

    fn begin_attempt(&self, state: &mut ClientState) -> TransportEvents {
        state.attempt += 1;
        state.phase = ClientPhase::Connecting;
        let attempt = state.attempt;
        state.timers.connect = Some(self.arm(self.config.connect_timeout, move |connection| {
            connection.connect_timed_out(attempt)
        }));
        debug!(url = %self.url, attempt, "connecting");
        TransportEvents::new(attempt, self.this.clone())
    }

    /// Run `f` after `delay` unless aborted first.
    fn arm<F>(&self, delay: Duration, f: F) -> AbortHandle
    where
        F: FnOnce(&ClientConnection) + Send + 'static,
    {
        let this = self.this.clone();
        self.runtime
            .spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(connection) = this.upgrade() {
                    f(&connection);
                }
            })
            .abort_handle()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transport events
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) fn on_connected(&self, attempt: u64, heartbeat: Duration) {
        {
            let mut state = self.state.lock();
            if !self.accepts(&state, attempt) {
                return;
            }
            state.timers.cancel_all();
            state.phase = ClientPhase::Connected;
            state.heartbeat = heartbeat;
            state.last_received = Instant::now();
            state.timers.heartbeat = Some(self.arm(
                heartbeat + self.config.connect_timeout,
                move |connection| connection.heartbeat_expired(attempt),
            ));
        }
        info!(url = %self.url, heartbeat_ms = heartbeat.as_millis() as u64, "comet client connected");
        guarded("on_connected", || self.listener.on_connected(heartbeat));
    }

    pub(crate) fn on_messages(&self, attempt: u64, batch: Vec<Message>) {
        if !self.received(attempt) {
            return;
        }
        debug!(url = %self.url, count = batch.len(), "messages received");
        guarded("on_message", || self.listener.on_message(&batch));
    }

    pub(crate) fn on_heartbeat(&self, attempt: u64) {
        if !self.received(attempt) {
            return;
        }
        guarded("on_heartbeat", || self.listener.on_heartbeat());
    }

    fn received(&self, attempt: u64) -> bool {
        let mut state = self.state.lock();
        if !self.accepts(&state, attempt) {
            return false;
        }
        state.last_received = Instant::now();
        true
    }

    /// Clean end of stream. Reconnects at once while running.
    pub(crate) fn on_disconnected(&self, attempt: u64) {
        {
            let mut state = self.state.lock();
            if !self.accepts(&state, attempt) {
                return;
            }
            state.timers.cancel_all();
            state.phase = ClientPhase::Reconnecting;
        }
        info!(url = %self.url, "comet client disconnected");
        guarded("on_disconnected", || self.listener.on_disconnected());

        let events = {
            let mut state = self.state.lock();
            if state.attempt != attempt || state.phase != ClientPhase::Reconnecting {
                return;
            }
            self.begin_attempt(&mut state)
        };
        self.transport.connect(&self.url, events);
    }

    /// A failure. Before the stream is established the attempt is torn down
    /// and retried after the reconnect delay; after, only the timers stop.
    pub(crate) fn on_error(&self, attempt: u64, error: CometError, connected: bool) {
        let retry_token = {
            let mut state = self.state.lock();
            if !self.accepts(&state, attempt) {
                return;
            }
            state.timers.cancel_all();
            if connected {
                None
            } else {
                state.phase = ClientPhase::Reconnecting;
                state.attempt += 1;
                Some(state.attempt)
            }
        };
        if retry_token.is_some() {
            self.transport.disconnect();
        }

        warn!(url = %self.url, connected, "comet client error: {error}");
        guarded("on_error", || self.listener.on_error(&error, connected));

        if let Some(token) = retry_token {
            let mut state = self.state.lock();
            if state.attempt == token && state.phase == ClientPhase::Reconnecting {
                state.timers.reconnect = Some(self.arm(self.config.reconnect_delay, move |connection| {
                    connection.reconnect_due(token)
                }));
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Timers
    // ─────────────────────────────────────────────────────────────────────

    fn connect_timed_out(&self, attempt: u64) {
        {
            let mut state = self.state.lock();
            if state.attempt != attempt || state.phase != ClientPhase::Connecting {
                return;
            }
            state.timers.connect = None;
        }
        let timeout = self.config.connect_timeout;
        self.on_error(attempt, CometError::Timeout { url: self.url.clone(), timeout }, false);
    }

    fn heartbeat_expired(&self, attempt: u64) {
        {
            let mut state = self.state.lock();
            if state.attempt != attempt || state.phase != ClientPhase::Connected {
                return;
            }
            let deadline = state.heartbeat + self.config.connect_timeout;
            let elapsed = state.last_received.elapsed();
            if elapsed < deadline {
                state.timers.heartbeat = Some(self.arm(deadline - elapsed, move |connection| {
                    connection.heartbeat_expired(attempt)
                }));
                return;
            }
            state.timers.heartbeat = None;
        }
        self.on_error(attempt, CometError::HeartbeatFailed, false);
    }

    fn reconnect_due(&self, token: u64) {
        let events = {
            let mut state = self.state.lock();
            if state.attempt != token || state.phase != ClientPhase::Reconnecting {
                return;
            }
            state.timers.reconnect = None;
            self.begin_attempt(&mut state)
        };
        self.transport.connect(&self.url, events);
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.state.get_mut().timers.cancel_all();
    }
}
