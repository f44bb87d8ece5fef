//! Application callbacks and the sink for panics escaping them.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use comet_protocol::Message;
use parking_lot::RwLock;
use tracing::error;

use crate::error::CometError;

/// Receives everything the client observes. Every method has a no-op default.
///
/// Callbacks run outside the connection's lock, so they may call
/// [`ClientConnection::stop`](crate::ClientConnection::stop) or
/// [`start`](crate::ClientConnection::start). A panic is caught and handed
/// to the uncaught handler; the connection carries on.
pub trait CometListener: Send + Sync + 'static {
    fn on_connected(&self, _heartbeat: Duration) {}

    fn on_disconnected(&self) {}

    /// `connected` tells whether the stream had been established when the
    /// error happened.
    fn on_error(&self, _error: &CometError, _connected: bool) {}

    fn on_heartbeat(&self) {}

    fn on_message(&self, _messages: &[Message]) {}
}

/// Formats a panic payload as its message where possible.
#[derive(Debug)]
pub struct PanicMessage(Box<dyn Any + Send>);

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}

type UncaughtHandler = Arc<dyn Fn(&'static str, &PanicMessage) + Send + Sync>;

static UNCAUGHT: RwLock<Option<UncaughtHandler>> = parking_lot::const_rwlock(None);

/// Install a process-wide handler for panics raised by listener callbacks.
/// It receives the callback name and the panic message. Without one, the
/// panic is logged.
pub fn set_uncaught_handler<F>(handler: F)
where
    F: Fn(&'static str, &PanicMessage) + Send + Sync + 'static,
{
    *UNCAUGHT.write() = Some(Arc::new(handler));
}

/// Run a listener callback, routing a panic to the uncaught handler.
pub(crate) fn guarded(callback: &'static str, f: impl FnOnce()) {
    let Err(payload) = catch_unwind(AssertUnwindSafe(f)) else {
        return;
    };
    let panic = PanicMessage(payload);
    let handler = UNCAUGHT.read().clone();
    match handler {
        Some(handler) => handler(callback, &panic),
        None => error!(callback, panic = %panic, "comet listener panicked"),
    }
}
