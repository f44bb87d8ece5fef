//! One parked thread per suspended connection.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::debug;

use super::{ExecutionHost, ScheduledTask, Scheduler, SuspendHandle, heartbeat_task};
use crate::connection::{DrainOutcome, ServerConnection};
use crate::error::ConnectionError;
use crate::session::Session;

/// Parks the suspending thread on the connection monitor until the
/// connection terminates, draining its session queue whenever woken.
///
/// Callers on an async runtime must run `suspend` on a blocking thread.
#[derive(Debug, Clone)]
pub struct BlockingHost {
    scheduler: Scheduler,
}

impl BlockingHost {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }
}

impl ExecutionHost for BlockingHost {
    fn name(&self) -> &'static str {
        "blocking"
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn suspend(
        &self,
        connection: &Arc<ServerConnection>,
        _session: Option<&Arc<Session>>,
    ) -> Result<Option<SuspendHandle>, ConnectionError> {
        debug!(connection = connection.id(), "parking connection");
        let mut locked = connection.lock();
        loop {
            match connection.drain_locked(&mut locked) {
                DrainOutcome::Stop => break,
                DrainOutcome::Wrote => continue,
                DrainOutcome::Idle => connection.monitor().wait(&mut locked.guard),
            }
        }
        drop(locked);
        debug!(connection = connection.id(), "connection released");
        Ok(None)
    }

    fn terminate(&self, connection: &ServerConnection, _handle: Option<&SuspendHandle>) {
        connection.monitor().notify_all();
    }

    fn enqueued(&self, session: &Session) {
        if let Some(connection) = session.bound_connection() {
            connection.wake();
        }
    }

    fn invalidate(&self, session: &Session) {
        if let Some(connection) = session.bound_connection() {
            connection.wake();
        }
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
        connection: Weak<ServerConnection>,
        _session: &Arc<Session>,
        delay: Duration,
    ) -> Option<ScheduledTask> {
        Some(self.scheduler.schedule(delay, move || {
            if let Some(connection) = connection.upgrade() {
                connection.keep_alive_due();
            }
        }))
    }
}
