//! Callback-driven suspension on the async runtime.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

use super::{ExecutionHost, ScheduledTask, Scheduler, SuspendHandle, heartbeat_task};
use crate::connection::{DrainOutcome, ServerConnection};
use crate::error::ConnectionError;
use crate::session::Session;

/// Suspends by spawning a drain task per session-backed connection and
/// returning at once. Writes count as session accesses, so no keep-alive
/// timers are needed.
#[derive(Debug, Clone)]
pub struct TaskHost {
    scheduler: Scheduler,
    waiting: Arc<DashMap<u64, Arc<Notify>>>,
}

impl TaskHost {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler, waiting: Arc::new(DashMap::new()) }
    }

    /// Connections with a live drain task.
    pub fn suspended_count(&self) -> usize {
        self.waiting.len()
    }

    fn wake(&self, session: &Session) {
        if let Some(id) = session.bound_id() {
            if let Some(notify) = self.waiting.get(&id) {
                notify.notify_one();
            }
        }
    }
}

impl ExecutionHost for TaskHost {
    fn name(&self) -> &'static str {
        "task"
    }

    fn is_blocking(&self) -> bool {
        false
    }

    fn suspend(
        &self,
        connection: &Arc<ServerConnection>,
        session: Option<&Arc<Session>>,
    ) -> Result<Option<SuspendHandle>, ConnectionError> {
        if session.is_none() {
            return Ok(None);
        }

        let id = connection.id();
        let notify = Arc::new(Notify::new());
        self.waiting.insert(id, notify.clone());

        let weak = Arc::downgrade(connection);
        let waiting = self.waiting.clone();
        let wakeup = notify.clone();
        self.scheduler.handle().spawn(async move {
            loop {
                let Some(connection) = weak.upgrade() else { break };
                let outcome = connection.drain();
                drop(connection);
                if matches!(outcome, DrainOutcome::Stop) {
                    break;
                }
                wakeup.notified().await;
            }
            waiting.remove(&id);
            debug!(connection = id, "drain task finished");
        });

        Ok(Some(SuspendHandle::new(notify)))
    }

    fn terminate(&self, _connection: &ServerConnection, handle: Option<&SuspendHandle>) {
        if let Some(handle) = handle {
            handle.wake();
        }
    }

    fn enqueued(&self, session: &Session) {
        self.wake(session);
    }

    fn invalidate(&self, session: &Session) {
        self.wake(session);
    }

    fn schedule_heartbeat(
        &self,
        connection: Weak<ServerConnection>,
        delay: Duration,
        generation: u64,
    ) -> ScheduledTask {
        heartbeat_task(&self.scheduler, connection, delay, generation)
    }

    fn schedule_session_keep_alive(
        &self,
        _connection: Weak<ServerConnection>,
        _session: &Arc<Session>,
        _delay: Duration,
    ) -> Option<ScheduledTask> {
        None
    }

    fn extends_session_on_write(&self) -> bool {
        true
    }
}
