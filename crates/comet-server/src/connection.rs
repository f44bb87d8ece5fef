//! One suspended HTTP exchange.
//!
//! A `ServerConnection` moves through `Created → Initiated → Suspended →
//! Terminated`. Every write, heartbeat and termination happens under the
//! connection lock. When a session is involved the connection lock is taken
//! first; nothing takes them the other way round.

use std::io;
use std::ops::{Deref, DerefMut};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use axum::http::header::{CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum_extra::extract::cookie::Cookie;
use comet_protocol::{Message, WireCodec};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::StreamLimits;
use crate::endpoint::{CometHandler, CometRequest};
use crate::error::ConnectionError;
use crate::framing::TransportFraming;
use crate::host::{ExecutionHost, ScheduledTask, SuspendHandle};
use crate::http_session::{HttpSession, HttpSessionStore, SESSION_COOKIE};
use crate::output::{FrameWriter, ResponseBody};
use crate::session::Session;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a connection shares with the other connections of a server.
#[derive(Clone)]
pub struct ConnectionContext {
    pub host: Arc<dyn ExecutionHost>,
    pub handler: Arc<dyn CometHandler>,
    pub codec: Arc<dyn WireCodec>,
    pub sessions: HttpSessionStore,
    pub batch_size: usize,
    pub keep_alive_buffer: Duration,
}

/// Per-request stream settings, resolved from configuration and query
/// parameters.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub heartbeat: Duration,
    pub padding: usize,
    pub limits: Option<StreamLimits>,
    pub deflate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Created,
    Initiated,
    Suspended,
    Terminated,
}

pub(crate) enum DrainOutcome {
    /// A batch went out; more may be waiting.
    Wrote,
    /// Nothing to do until woken.
    Idle,
    /// The connection is finished.
    Stop,
}

pub(crate) struct ConnectionState {
    phase: ConnectionPhase,
    output: FrameWriter,
    status: StatusCode,
    headers: HeaderMap,
    request: Option<CometRequest>,
    http_session: Option<Arc<HttpSession>>,
    session: Option<Arc<Session>>,
    last_write: Instant,
    heartbeat_task: Option<ScheduledTask>,
    heartbeat_generation: u64,
    keep_alive_task: Option<ScheduledTask>,
    refreshed: bool,
    suspend_handle: Option<SuspendHandle>,
    // Run once the lock is released.
    pending_hook: Option<bool>,
    pending_wake: Option<Arc<Session>>,
}

pub struct ServerConnection {
    id: u64,
    this: Weak<ServerConnection>,
    ctx: ConnectionContext,
    framing: Box<dyn TransportFraming>,
    options: ConnectionOptions,
    terminated: AtomicBool,
    state: Mutex<ConnectionState>,
    monitor: Condvar,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id)
            .field("framing", &self.framing.name())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Connection lock. Deferred work (the termination hook, waking another
/// connection) runs when it is released.
pub(crate) struct Locked<'a> {
    connection: &'a ServerConnection,
    pub(crate) guard: MutexGuard<'a, ConnectionState>,
}

impl Deref for Locked<'_> {
    type Target = ConnectionState;

    fn deref(&self) -> &ConnectionState {
        &self.guard
    }
}

impl DerefMut for Locked<'_> {
    fn deref_mut(&mut self) -> &mut ConnectionState {
        &mut self.guard
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        let hook = self.guard.pending_hook.take();
        let wake = self.guard.pending_wake.take();
        if hook.is_none() && wake.is_none() {
            return;
        }
        let connection = self.connection;
        MutexGuard::unlocked(&mut self.guard, || {
            if let Some(session) = wake {
                session.enqueued();
            }
            if let Some(server_initiated) = hook {
                connection.run_terminated_hook(server_initiated);
            }
        });
    }
}

impl ServerConnection {
    pub fn new(
        ctx: ConnectionContext,
        framing: Box<dyn TransportFraming>,
        options: ConnectionOptions,
        request: CometRequest,
    ) -> (Arc<Self>, ResponseBody) {
        let (tx, body) = ResponseBody::channel();
        let http_session = request
            .session_id()
            .and_then(|id| ctx.sessions.get(id));

        let connection = Arc::new_cyclic(|this| Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            this: this.clone(),
            framing,
            options,
            terminated: AtomicBool::new(false),
            state: Mutex::new(ConnectionState {
                phase: ConnectionPhase::Created,
                output: FrameWriter::new(tx, options.deflate),
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                request: Some(request),
                http_session,
                session: None,
                last_write: Instant::now(),
                heartbeat_task: None,
                heartbeat_generation: 0,
                keep_alive_task: None,
                refreshed: false,
                suspend_handle: None,
                pending_hook: None,
                pending_wake: None,
            }),
            monitor: Condvar::new(),
            ctx,
        });
        (connection, body)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn heartbeat(&self) -> Duration {
        self.options.heartbeat
    }

    pub fn framing_name(&self) -> &'static str {
        self.framing.name()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.lock().phase
    }

    /// Bytes written so far, counted before compression.
    pub fn bytes_written(&self) -> usize {
        self.state.lock().output.written()
    }

    pub fn last_write(&self) -> Instant {
        self.state.lock().last_write
    }

    /// The comet session this connection drains, if any.
    pub fn bound_session(&self) -> Option<Arc<Session>> {
        self.state.lock().session.clone()
    }

    /// Status and headers to send with the response.
    pub fn response_head(&self) -> (StatusCode, HeaderMap) {
        let state = self.state.lock();
        (state.status, state.headers.clone())
    }

    /// Run `f` against the originating request. The request is dropped on
    /// suspension.
    pub fn with_request<R>(&self, f: impl FnOnce(&CometRequest) -> R) -> Result<R, ConnectionError> {
        let state = self.state.lock();
        state.request.as_ref().map(f).ok_or(ConnectionError::Suspended)
    }

    pub(crate) fn lock(&self) -> Locked<'_> {
        Locked { connection: self, guard: self.state.lock() }
    }

    pub(crate) fn monitor(&self) -> &Condvar {
        &self.monitor
    }

    /// Wake a thread parked on this connection.
    pub(crate) fn wake(&self) {
        let _state = self.state.lock();
        self.monitor.notify_all();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Prepare the response and announce the stream. If the request carries
    /// an existing comet session, this connection takes it over as the very
    /// last step, terminating whichever connection held it.
    pub fn initiate(&self) -> Result<(), ConnectionError> {
        let session = {
            let mut state = self.lock();
            if state.phase != ConnectionPhase::Created {
                return Ok(());
            }

            state.headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            state
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static(self.framing.content_type()));
            if self.options.deflate {
                state.headers.insert(CONTENT_ENCODING, HeaderValue::from_static("deflate"));
            }

            let mut frame = String::new();
            self.framing.connect(self.heartbeat_millis(), &mut frame);
            if let Err(e) = state.output.write_str(&frame) {
                self.terminate_locked(&mut state, false);
                return Err(e.into());
            }
            state.phase = ConnectionPhase::Initiated;
            self.schedule_heartbeat(&mut state);

            let session = state
                .http_session
                .as_deref()
                .and_then(Session::lookup)
                .filter(|session| session.is_valid());
            if let Some(session) = &session {
                session.touch();
                state.session = Some(session.clone());
                self.schedule_keep_alive(&mut state);
            }

            info!(
                connection = self.id,
                framing = self.framing.name(),
                heartbeat_ms = self.heartbeat_millis(),
                session = session.as_ref().map(|s| s.id()),
                "comet connection initiated"
            );
            session
        };

        if let Some(session) = session {
            self.take_binding(&session);
        }
        Ok(())
    }

    /// The comet session of this request. With `create`, an HTTP session and
    /// comet session are created as needed and this connection is bound.
    /// Not available once suspended.
    pub fn session(&self, create: bool) -> Result<Option<Arc<Session>>, ConnectionError> {
        let session = {
            let mut state = self.lock();
            if state.phase == ConnectionPhase::Suspended {
                return Err(ConnectionError::Suspended);
            }
            if let Some(session) = &state.session {
                return Ok(Some(session.clone()));
            }
            if !create {
                return Ok(None);
            }

            let http = match state.http_session.clone() {
                Some(http) => http,
                None => {
                    let http = self.ctx.sessions.create();
                    let cookie = Cookie::build((SESSION_COOKIE, http.id().to_string()))
                        .path("/")
                        .http_only(true)
                        .build();
                    if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
                        state.headers.append(SET_COOKIE, value);
                    }
                    state.http_session = Some(http.clone());
                    http
                }
            };

            let session = Session::get_or_create(&http, &self.ctx.host);
            session.touch();
            state.session = Some(session.clone());
            self.schedule_keep_alive(&mut state);
            session
        };

        self.take_binding(&session);
        Ok(Some(session))
    }

    fn take_binding(&self, session: &Arc<Session>) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if let Some(previous) = session.bind(&this) {
            info!(
                session = %session.id(),
                previous = previous.id(),
                connection = self.id,
                "comet connection superseded"
            );
            previous.terminate();
        }
        if self.is_terminated() {
            session.clear_binding(self.id);
        }
    }

    /// Write `messages` as data frames.
    pub fn write(&self, messages: &[Message], flush: bool) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        self.write_locked(&mut state, messages, flush)
    }

    /// Write and flush one message.
    pub fn send(&self, message: impl Into<Message>) -> Result<(), ConnectionError> {
        self.write(&[message.into()], true)
    }

    /// Write a heartbeat frame. A terminated connection ignores this.
    pub fn heartbeat_now(&self) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        self.heartbeat_locked(&mut state)
    }

    /// Top up padding, flush, drop the request and hand the connection to
    /// the execution host. On a blocking host this returns only once the
    /// connection has terminated.
    pub fn suspend(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let session = {
            let mut state = self.lock();
            if self.is_terminated() || state.phase == ConnectionPhase::Suspended {
                return Ok(());
            }

            if let Err(e) = self.top_up_padding(&mut state) {
                self.terminate_locked(&mut state, false);
                return Err(e.into());
            }
            let flush = state.session.as_ref().is_none_or(|s| s.is_queue_empty());
            if flush {
                if let Err(e) = self.emit(&mut state, "", true) {
                    self.terminate_locked(&mut state, false);
                    return Err(e.into());
                }
            }

            state.phase = ConnectionPhase::Suspended;
            state.request = None;
            let session = state.session.clone();
            debug!(connection = self.id, host = self.ctx.host.name(), "suspending");

            if !self.ctx.host.is_blocking() {
                match self.ctx.host.suspend(self, session.as_ref()) {
                    Ok(handle) => state.suspend_handle = handle,
                    Err(e) => {
                        self.terminate_locked(&mut state, false);
                        return Err(e);
                    }
                }
                return Ok(());
            }
            session
        };

        self.ctx.host.suspend(self, session.as_ref()).map(|_| ())
    }

    /// Terminate from the server side: the client gets a disconnect frame.
    pub fn terminate(&self) {
        self.terminate_with(true);
    }

    /// Terminate the stream. Only the first call has any effect.
    pub fn terminate_with(&self, server_initiated: bool) {
        let mut state = self.lock();
        self.terminate_locked(&mut state, server_initiated);
    }

    /// Replace the response with an error. Only possible before anything has
    /// been flushed to the client.
    pub fn send_error(&self, status: StatusCode, message: &str) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        if state.phase == ConnectionPhase::Suspended {
            return Err(ConnectionError::Suspended);
        }
        if self.is_terminated() {
            return Err(ConnectionError::Terminated);
        }
        if !state.output.reset_plain() {
            return Err(ConnectionError::Committed);
        }
        state.headers.remove(CONTENT_ENCODING);
        state.status = status;
        let body = self.framing.error_body(status, message);
        if let Err(e) = state.output.write_str(&body) {
            self.terminate_locked(&mut state, false);
            return Err(e.into());
        }
        self.finish_locked(&mut state, true, false);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Host and timer entry points
    // ─────────────────────────────────────────────────────────────────────

    /// Heartbeat timer fired. Stale timers are ignored.
    pub(crate) fn heartbeat_due(&self, generation: u64) {
        let mut state = self.lock();
        if state.heartbeat_generation != generation {
            return;
        }
        if let Err(e) = self.heartbeat_locked(&mut state) {
            debug!(connection = self.id, "heartbeat failed: {e}");
        }
    }

    /// Keep-alive timer fired: access the HTTP session before it expires, or
    /// terminate if it already has.
    pub(crate) fn keep_alive_due(&self) {
        let mut state = self.lock();
        if self.is_terminated() {
            return;
        }
        let Some(session) = state.session.clone() else {
            return;
        };
        if session.access() {
            debug!(connection = self.id, session = %session.id(), "session kept alive");
            self.schedule_keep_alive(&mut state);
        } else {
            self.terminate_locked(&mut state, true);
        }
    }

    /// Drain the bound session until it is empty or the connection stops.
    pub(crate) fn drain(&self) -> DrainOutcome {
        let mut state = self.lock();
        loop {
            match self.drain_locked(&mut state) {
                DrainOutcome::Wrote => continue,
                outcome => return outcome,
            }
        }
    }

    /// Write at most one batch from the bound session.
    pub(crate) fn drain_locked(&self, state: &mut ConnectionState) -> DrainOutcome {
        if self.is_terminated() {
            return DrainOutcome::Stop;
        }
        let Some(session) = state.session.clone() else {
            return DrainOutcome::Idle;
        };
        if !session.is_valid() {
            self.terminate_locked(state, true);
            return DrainOutcome::Stop;
        }
        let Some(batch) = session.take_batch(self.id, self.ctx.batch_size) else {
            self.terminate_locked(state, true);
            return DrainOutcome::Stop;
        };
        if batch.is_empty() {
            return DrainOutcome::Idle;
        }

        match self.write_locked(state, &batch, true) {
            Ok(()) if self.is_terminated() => DrainOutcome::Stop,
            Ok(()) => DrainOutcome::Wrote,
            Err(ConnectionError::Codec(e)) => {
                warn!(connection = self.id, "dropping batch that failed to encode: {e}");
                DrainOutcome::Wrote
            }
            Err(_) => {
                session.restore(batch);
                state.pending_wake = Some(session);
                DrainOutcome::Stop
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals (connection lock held)
    // ─────────────────────────────────────────────────────────────────────

    fn heartbeat_millis(&self) -> u64 {
        u64::try_from(self.options.heartbeat.as_millis()).unwrap_or(u64::MAX)
    }

    fn emit(&self, state: &mut ConnectionState, data: &str, flush: bool) -> io::Result<()> {
        if !data.is_empty() {
            state.output.write_str(data)?;
        }
        if flush {
            state.output.flush()?;
            self.ctx.host.socket_flush(self)?;
        }
        Ok(())
    }

    fn write_locked(
        &self,
        state: &mut ConnectionState,
        messages: &[Message],
        flush: bool,
    ) -> Result<(), ConnectionError> {
        if self.is_terminated() {
            return Err(ConnectionError::Terminated);
        }
        let mut data = String::new();
        self.framing.messages(messages, self.ctx.codec.as_ref(), &mut data)?;
        if let Err(e) = self.emit(state, &data, flush) {
            warn!(connection = self.id, "write failed: {e}");
            self.terminate_locked(state, false);
            return Err(e.into());
        }
        debug!(connection = self.id, count = messages.len(), "messages written");
        self.after_write(state);
        Ok(())
    }

    fn heartbeat_locked(&self, state: &mut ConnectionState) -> Result<(), ConnectionError> {
        if self.is_terminated() {
            return Ok(());
        }
        let mut data = String::new();
        self.framing.heartbeat(&mut data);
        if let Err(e) = self.emit(state, &data, true) {
            self.terminate_locked(state, false);
            return Err(e.into());
        }
        debug!(connection = self.id, "heartbeat");
        self.after_write(state);
        Ok(())
    }

    fn after_write(&self, state: &mut ConnectionState) {
        self.schedule_heartbeat(state);
        if self.ctx.host.extends_session_on_write() {
            if let Some(session) = &state.session {
                session.touch();
            }
        }
        self.check_length(state);
    }

    fn check_length(&self, state: &mut ConnectionState) {
        let Some(limits) = self.options.limits else {
            return;
        };
        let written = state.output.written();

        if state.session.is_none() && !state.refreshed && written > limits.refresh {
            state.refreshed = true;
            let mut data = String::new();
            self.framing.refresh(&mut data);
            debug!(connection = self.id, written, "asking client to refresh");
            if let Err(e) = self.emit(state, &data, true) {
                debug!(connection = self.id, "refresh failed: {e}");
                self.terminate_locked(state, false);
                return;
            }
        }

        // One write may cross both thresholds.
        if written > limits.hard && !self.is_terminated() {
            info!(connection = self.id, written, "stream length limit reached");
            self.terminate_locked(state, true);
        }
    }

    /// Bring the stream up to the required padding, preferring queued
    /// messages over filler.
    fn top_up_padding(&self, state: &mut ConnectionState) -> io::Result<()> {
        let required = self.options.padding;
        if required == 0 {
            return Ok(());
        }

        if let Some(session) = state.session.clone() {
            while state.output.written() < required {
                let Some(batch) = session.take_batch(self.id, self.ctx.batch_size) else {
                    break;
                };
                if batch.is_empty() {
                    break;
                }
                let mut data = String::new();
                if let Err(e) = self.framing.messages(&batch, self.ctx.codec.as_ref(), &mut data) {
                    warn!(connection = self.id, "dropping batch that failed to encode: {e}");
                    continue;
                }
                state.output.write_str(&data)?;
            }
        }

        if let Some(padding) = self.framing.padding(state.output.written(), required) {
            state.output.write_str(&padding)?;
        }
        Ok(())
    }

    fn schedule_heartbeat(&self, state: &mut ConnectionState) {
        if self.is_terminated() {
            return;
        }
        state.last_write = Instant::now();
        state.heartbeat_generation += 1;
        state.heartbeat_task = Some(self.ctx.host.schedule_heartbeat(
            self.this.clone(),
            self.options.heartbeat,
            state.heartbeat_generation,
        ));
    }

    fn schedule_keep_alive(&self, state: &mut ConnectionState) {
        let Some(session) = state.session.clone() else {
            return;
        };
        state.keep_alive_task = session
            .keep_alive_delay(self.ctx.keep_alive_buffer)
            .and_then(|delay| {
                self.ctx
                    .host
                    .schedule_session_keep_alive(self.this.clone(), &session, delay)
            });
    }

    fn terminate_locked(&self, state: &mut ConnectionState, server_initiated: bool) {
        self.finish_locked(state, server_initiated, server_initiated);
    }

    fn finish_locked(&self, state: &mut ConnectionState, server_initiated: bool, farewell: bool) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let was_suspended = state.phase == ConnectionPhase::Suspended;
        state.phase = ConnectionPhase::Terminated;
        state.heartbeat_task = None;
        state.keep_alive_task = None;

        if farewell && !state.output.is_closed() {
            let mut data = String::new();
            self.framing.terminate(&mut data);
            if let Err(e) = state.output.write_str(&data).and_then(|()| state.output.flush()) {
                debug!(connection = self.id, "disconnect frame not delivered: {e}");
            }
        }
        if let Err(e) = state.output.close() {
            debug!(connection = self.id, "closing stream: {e}");
        }

        if let Some(session) = &state.session {
            session.clear_binding(self.id);
        }
        if was_suspended {
            self.ctx.host.terminate(self, state.suspend_handle.as_ref());
        }
        state.request = None;
        state.pending_hook = Some(server_initiated);

        info!(
            connection = self.id,
            server_initiated,
            written = state.output.written(),
            "comet connection terminated"
        );
    }

    fn run_terminated_hook(&self, server_initiated: bool) {
        let handler = self.ctx.handler.clone();
        let result = catch_unwind(AssertUnwindSafe(|| handler.on_terminated(self, server_initiated)));
        if result.is_err() {
            error!(connection = self.id, "termination handler panicked");
        }
    }
}
