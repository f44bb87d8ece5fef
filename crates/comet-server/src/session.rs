//! Comet session: a message queue that outlives any single connection.
//!
//! The queue belongs to the HTTP session, so a client that reconnects picks
//! up whatever was enqueued while it was away. At most one connection is
//! bound at a time, and only the bound connection may take from the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use comet_protocol::Message;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::connection::ServerConnection;
use crate::host::ExecutionHost;
use crate::http_session::{COMET_SESSION_KEY, HttpSession};

struct SessionState {
    queue: VecDeque<Message>,
    bound: Option<(u64, Weak<ServerConnection>)>,
    last_accessed: Instant,
}

pub struct Session {
    id: String,
    host: Arc<dyn ExecutionHost>,
    http_session: Weak<HttpSession>,
    valid: AtomicBool,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .field("queued", &self.queue_len())
            .finish()
    }
}

impl Session {
    fn new(http: &Arc<HttpSession>, host: Arc<dyn ExecutionHost>) -> Self {
        Self {
            id: http.id().to_string(),
            host,
            http_session: Arc::downgrade(http),
            valid: AtomicBool::new(true),
            state: Mutex::new(SessionState {
                queue: VecDeque::new(),
                bound: None,
                last_accessed: Instant::now(),
            }),
        }
    }

    /// The comet session stored in `http`, if any.
    pub fn lookup(http: &HttpSession) -> Option<Arc<Session>> {
        http.attribute::<Session>(COMET_SESSION_KEY)
    }

    /// The comet session stored in `http`, creating it if absent.
    pub fn get_or_create(http: &Arc<HttpSession>, host: &Arc<dyn ExecutionHost>) -> Arc<Session> {
        http.attribute_or_insert_with(COMET_SESSION_KEY, || {
            info!(session = %http.id(), "comet session created");
            Session::new(http, host.clone())
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn http_session(&self) -> Option<Arc<HttpSession>> {
        self.http_session.upgrade()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Append a message and wake the bound connection. Returns `false` once
    /// the session has been invalidated.
    pub fn enqueue(&self, message: impl Into<Message>) -> bool {
        {
            let mut state = self.state.lock();
            if !self.is_valid() {
                return false;
            }
            state.queue.push_back(message.into());
        }
        self.enqueued();
        true
    }

    /// Append several messages with a single wake-up.
    pub fn enqueue_all<I>(&self, messages: I) -> bool
    where
        I: IntoIterator,
        I::Item: Into<Message>,
    {
        {
            let mut state = self.state.lock();
            if !self.is_valid() {
                return false;
            }
            state.queue.extend(messages.into_iter().map(Into::into));
        }
        self.enqueued();
        true
    }

    /// Tell the host the queue changed. Callers that mutate the queue through
    /// [`with_queue`](Self::with_queue) must call this afterwards.
    pub fn enqueued(&self) {
        self.host.enqueued(self);
    }

    /// Invalidate the session: the bound connection is terminated and queued
    /// messages are discarded. Later calls do nothing.
    pub fn invalidate(&self) {
        if !self.valid.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(session = %self.id, "comet session invalidated");

        self.host.invalidate(self);

        if let Some(http) = self.http_session.upgrade() {
            http.remove_attribute_if(COMET_SESSION_KEY, |s: &Session| std::ptr::eq(s, self));
        }

        let bound = {
            let mut state = self.state.lock();
            state.queue.clear();
            state.bound.take()
        };
        if let Some(connection) = bound.and_then(|(_, weak)| weak.upgrade()) {
            connection.terminate();
        }
    }

    pub fn pending(&self) -> bool {
        !self.state.lock().queue.is_empty()
    }

    pub fn is_queue_empty(&self) -> bool {
        !self.pending()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Run `f` against the queue. `None` once invalidated.
    pub fn with_queue<R>(&self, f: impl FnOnce(&mut VecDeque<Message>) -> R) -> Option<R> {
        let mut state = self.state.lock();
        if !self.is_valid() {
            return None;
        }
        Some(f(&mut state.queue))
    }

    pub fn last_accessed(&self) -> Instant {
        self.state.lock().last_accessed
    }

    /// Record an access of this session and its HTTP session.
    pub fn touch(&self) {
        self.state.lock().last_accessed = Instant::now();
        if let Some(http) = self.http_session.upgrade() {
            http.touch();
        }
    }

    /// Touch the HTTP session if it is still alive.
    pub(crate) fn access(&self) -> bool {
        match self.http_session.upgrade() {
            Some(http) if http.is_valid() && self.is_valid() => {
                self.touch();
                true
            }
            _ => false,
        }
    }

    /// Time until the HTTP session would expire, less `buffer`.
    /// `None` when it never expires.
    pub(crate) fn keep_alive_delay(&self, buffer: Duration) -> Option<Duration> {
        let http = self.http_session.upgrade()?;
        let max_inactive = http.max_inactive()?;
        let last = self.last_accessed().max(http.last_accessed());
        Some(
            max_inactive
                .saturating_sub(last.elapsed())
                .saturating_sub(buffer),
        )
    }

    // ─────────────────────────────────────────────────────────────────────
    // Binding
    // ─────────────────────────────────────────────────────────────────────

    /// Bind `connection`, returning the connection it replaced.
    pub(crate) fn bind(&self, connection: &Arc<ServerConnection>) -> Option<Arc<ServerConnection>> {
        let mut state = self.state.lock();
        if !self.is_valid() {
            return None;
        }
        let previous = state.bound.replace((connection.id(), Arc::downgrade(connection)));
        previous
            .filter(|(id, _)| *id != connection.id())
            .and_then(|(_, weak)| weak.upgrade())
    }

    /// Unbind `connection_id` if it is still the bound connection.
    pub(crate) fn clear_binding(&self, connection_id: u64) {
        let mut state = self.state.lock();
        if state.bound.as_ref().is_some_and(|(id, _)| *id == connection_id) {
            state.bound = None;
            debug!(session = %self.id, connection = connection_id, "binding cleared");
        }
    }

    pub fn bound_id(&self) -> Option<u64> {
        self.state.lock().bound.as_ref().map(|(id, _)| *id)
    }

    pub fn bound_connection(&self) -> Option<Arc<ServerConnection>> {
        self.state.lock().bound.as_ref().and_then(|(_, weak)| weak.upgrade())
    }

    /// Pop up to `max` messages for `connection_id`. `None` when that
    /// connection is no longer bound, so a superseded connection stops
    /// draining at once.
    pub(crate) fn take_batch(&self, connection_id: u64, max: usize) -> Option<Vec<Message>> {
        let mut state = self.state.lock();
        if !state.bound.as_ref().is_some_and(|(id, _)| *id == connection_id) {
            return None;
        }
        let n = state.queue.len().min(max.max(1));
        Some(state.queue.drain(..n).collect())
    }

    /// Put an undelivered batch back at the head of the queue. The caller
    /// wakes the host once it holds no connection lock.
    pub(crate) fn restore(&self, batch: Vec<Message>) {
        let mut state = self.state.lock();
        if !self.is_valid() {
            return;
        }
        for message in batch.into_iter().rev() {
            state.queue.push_front(message);
        }
    }
}
