//! Comet Push - Server
//!
//! Holds HTTP responses open and pushes frames down them. The lifecycle of
//! each stream lives in [`ServerConnection`]; how a suspended stream is held
//! open is delegated to an [`ExecutionHost`]; queued delivery that survives
//! reconnection lives in [`Session`].

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod host;
pub mod http_session;
pub mod output;
pub mod session;

pub use config::{CometConfig, StreamLimits};
pub use connection::{ConnectionContext, ConnectionOptions, ConnectionPhase, ServerConnection};
pub use endpoint::{CometEndpoint, CometHandler, CometRequest, CometServer};
pub use error::{ConnectionError, ServerError};
pub use framing::{EventSourceFraming, HtmlFileFraming, HttpRequestFraming, TransportFraming};
pub use host::{BlockingHost, ExecutionHost, ScheduledTask, Scheduler, SuspendHandle, TaskHost};
pub use http_session::{COMET_SESSION_KEY, HttpSession, HttpSessionStore, SESSION_COOKIE};
pub use output::ResponseBody;
pub use session::Session;
