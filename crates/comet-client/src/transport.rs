//! The transport contract and the event sink transports report through.

use std::sync::Weak;
use std::time::Duration;

use comet_protocol::Message;

use crate::connection::ClientConnection;
use crate::error::CometError;

/// Carries bytes for a [`ClientConnection`].
///
/// `connect` starts one attempt and returns at once; everything the attempt
/// observes is reported through `events`. `disconnect` aborts the current
/// attempt without reporting anything.
pub trait ClientTransport: Send + Sync + 'static {
    fn connect(&self, url: &str, events: TransportEvents);

    fn disconnect(&self);
}

/// Event sink for one connect attempt.
///
/// Each sink is stamped with the attempt it was issued for. Once the
/// connection has moved on to another attempt, or stopped, its events are
/// dropped, so a transport never has to worry about reporting late.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    attempt: u64,
    connection: Weak<ClientConnection>,
}

impl TransportEvents {
    pub(crate) fn new(attempt: u64, connection: Weak<ClientConnection>) -> Self {
        Self { attempt, connection }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// The connection this sink reports to, if it still exists.
    pub fn connection(&self) -> Option<std::sync::Arc<ClientConnection>> {
        self.connection.upgrade()
    }

    /// Whether events sent through this sink will still be observed.
    pub fn is_current(&self) -> bool {
        self.connection
            .upgrade()
            .is_some_and(|c| c.is_current_attempt(self.attempt))
    }

    pub fn connected(&self, heartbeat: Duration) {
        if let Some(connection) = self.connection.upgrade() {
            connection.on_connected(self.attempt, heartbeat);
        }
    }

    pub fn messages(&self, batch: Vec<Message>) {
        if batch.is_empty() {
            return;
        }
        if let Some(connection) = self.connection.upgrade() {
            connection.on_messages(self.attempt, batch);
        }
    }

    pub fn heartbeat(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.on_heartbeat(self.attempt);
        }
    }

    pub fn disconnected(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.on_disconnected(self.attempt);
        }
    }

    pub fn error(&self, error: CometError, connected: bool) {
        if let Some(connection) = self.connection.upgrade() {
            connection.on_error(self.attempt, error, connected);
        }
    }
}
