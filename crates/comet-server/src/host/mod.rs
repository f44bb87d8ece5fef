//! Execution hosts: how a suspended connection is held open.
//!
//! The connection state machine never asks which host it runs on. A blocking
//! host parks the calling thread inside [`ExecutionHost::suspend`]; a task
//! host registers a continuation and returns immediately.

mod blocking;
mod task;

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::connection::ServerConnection;
use crate::error::ConnectionError;
use crate::session::Session;

pub use blocking::BlockingHost;
pub use task::TaskHost;

pub trait ExecutionHost: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Whether `suspend` parks the caller until the connection terminates.
    fn is_blocking(&self) -> bool;

    fn suspend(
        &self,
        connection: &Arc<ServerConnection>,
        session: Option<&Arc<Session>>,
    ) -> Result<Option<SuspendHandle>, ConnectionError>;

    /// Wake whatever is holding `connection`. Called with the connection
    /// locked, so implementations must not lock it again.
    fn terminate(&self, connection: &ServerConnection, handle: Option<&SuspendHandle>);

    fn enqueued(&self, session: &Session);

    fn invalidate(&self, session: &Session);

    fn schedule_heartbeat(
        &self,
        connection: Weak<ServerConnection>,
        delay: Duration,
        generation: u64,
    ) -> ScheduledTask;

    fn schedule_session_keep_alive(
        &self,
        connection: Weak<ServerConnection>,
        session: &Arc<Session>,
        delay: Duration,
    ) -> Option<ScheduledTask>;

    /// Whether every write counts as an access of the HTTP session.
    fn extends_session_on_write(&self) -> bool {
        false
    }

    /// Push buffered bytes past the host's own socket buffering.
    fn socket_flush(&self, _connection: &ServerConnection) -> io::Result<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Timers
// ─────────────────────────────────────────────────────────────────────────────

/// Timer service shared by every connection of a host.
#[derive(Debug, Clone)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler on the runtime of the calling task, if there is one.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    pub fn schedule<F>(&self, delay: Duration, f: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        ScheduledTask { abort: task.abort_handle() }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

/// A pending timer. Cancelled when dropped.
#[derive(Debug)]
pub struct ScheduledTask {
    abort: AbortHandle,
}

impl ScheduledTask {
    pub fn cancel(self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

pub(crate) fn heartbeat_task(
    scheduler: &Scheduler,
    connection: Weak<ServerConnection>,
    delay: Duration,
    generation: u64,
) -> ScheduledTask {
    scheduler.schedule(delay, move || {
        if let Some(connection) = connection.upgrade() {
            connection.heartbeat_due(generation);
        }
    })
}

/// Token a non-blocking host hands back from `suspend`.
#[derive(Debug, Clone)]
pub struct SuspendHandle {
    notify: Arc<Notify>,
}

impl SuspendHandle {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self { notify }
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }
}
