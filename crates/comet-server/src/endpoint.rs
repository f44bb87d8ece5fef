//! HTTP integration: the comet route, request validation and the server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    http::{
        HeaderMap, Method, StatusCode, Uri,
        header::{ACCEPT, ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_TYPE, USER_AGENT},
    },
    response::{IntoResponse, Json, Response},
    routing::get,
};
use axum_extra::extract::CookieJar;
use dashmap::DashMap;
use comet_protocol::{JsonCodec, WireCodec};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::config::CometConfig;
use crate::connection::{ConnectionContext, ConnectionOptions, ServerConnection};
use crate::error::{ConnectionError, ServerError};
use crate::framing::{self, TransportFraming};
use crate::host::ExecutionHost;
use crate::http_session::{HttpSessionStore, SESSION_COOKIE};

/// Application callbacks for comet requests.
pub trait CometHandler: Send + Sync + 'static {
    /// Called once the stream is initiated and before it is suspended. The
    /// handler may inspect the request, create the session or write.
    fn on_comet(&self, connection: &Arc<ServerConnection>) -> Result<(), ConnectionError>;

    /// Called exactly once per connection, outside the connection lock.
    fn on_terminated(&self, _connection: &ServerConnection, _server_initiated: bool) {}
}

/// The request a comet stream was opened with.
#[derive(Debug, Clone, Default)]
pub struct CometRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    pub session_id: Option<String>,
}

impl CometRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// Open comet streams by connection id.
type LiveConnections = Arc<DashMap<u64, Weak<ServerConnection>>>;

/// Builds the comet router.
pub struct CometEndpoint {
    config: CometConfig,
    ctx: ConnectionContext,
    live: LiveConnections,
}

struct AppState {
    config: CometConfig,
    ctx: ConnectionContext,
    live: LiveConnections,
}

impl CometEndpoint {
    pub fn new(
        config: CometConfig,
        handler: Arc<dyn CometHandler>,
        host: Arc<dyn ExecutionHost>,
    ) -> Self {
        let sessions = HttpSessionStore::new(config.session_max_inactive);
        let ctx = ConnectionContext {
            host,
            handler,
            codec: Arc::new(JsonCodec),
            sessions,
            batch_size: config.batch_size,
            keep_alive_buffer: config.keep_alive_buffer,
        };
        Self { config, ctx, live: Arc::new(DashMap::new()) }
    }

    pub fn with_codec(mut self, codec: Arc<dyn WireCodec>) -> Self {
        self.ctx.codec = codec;
        self
    }

    pub fn with_sessions(mut self, sessions: HttpSessionStore) -> Self {
        self.ctx.sessions = sessions;
        self
    }

    pub fn sessions(&self) -> &HttpSessionStore {
        &self.ctx.sessions
    }

    /// Number of open comet streams.
    pub fn connection_count(&self) -> usize {
        self.live.len()
    }

    /// Every open comet stream.
    pub fn connections(&self) -> Vec<Arc<ServerConnection>> {
        self.live.iter().filter_map(|entry| entry.value().upgrade()).collect()
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            ctx: self.ctx.clone(),
            live: self.live.clone(),
        });

        let mut app = Router::new()
            .route(&self.config.path, get(comet_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http());
        if self.config.enable_cors {
            app = app.layer(CorsLayer::permissive());
        }
        app
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

/// A running comet server.
pub struct CometServer {
    sessions: HttpSessionStore,
    live: LiveConnections,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
    reaper: Option<tokio::task::JoinHandle<()>>,
    port: u16,
}

impl CometServer {
    /// Start serving the comet route with `handler` on `host`.
    pub async fn start(
        config: CometConfig,
        handler: Arc<dyn CometHandler>,
        host: Arc<dyn ExecutionHost>,
    ) -> Result<Self, ServerError> {
        let endpoint = CometEndpoint::new(config.clone(), handler, host);
        let router = endpoint.router();
        Self::serve(&config, &endpoint, router).await
    }

    /// Serve `router`, which must include `endpoint`'s routes.
    pub async fn serve(
        config: &CometConfig,
        endpoint: &CometEndpoint,
        router: Router,
    ) -> Result<Self, ServerError> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        info!(
            "Comet endpoint listening on http://{}:{}{}",
            config.hostname, actual_port, config.path
        );

        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        });
        let reaper = endpoint.sessions().spawn_reaper(config.reap_interval);

        Ok(Self {
            sessions: endpoint.sessions().clone(),
            live: endpoint.live.clone(),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            reaper: Some(reaper),
            port: actual_port,
        })
    }

    pub fn sessions(&self) -> &HttpSessionStore {
        &self.sessions
    }

    pub fn connection_count(&self) -> usize {
        self.live.len()
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Gracefully stop the server. Open streams are told to disconnect.
    pub async fn stop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
        let open: Vec<_> = self.live.iter().filter_map(|e| e.value().upgrade()).collect();
        for connection in open {
            connection.terminate();
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Comet server stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps a stream counted and its connection alive for as long as the
/// response body exists. Dropped when the stream ends or the client leaves.
struct StreamGuard {
    connection: Arc<ServerConnection>,
    live: LiveConnections,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.live.remove(&self.connection.id());
        if !self.connection.is_terminated() {
            debug!(connection = self.connection.id(), "client went away");
            self.connection.terminate_with(false);
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: axum::http::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn error_response(framing: &dyn TransportFraming, status: StatusCode, message: &str) -> Response {
    (
        status,
        [
            (CONTENT_TYPE, framing.content_type()),
            (CACHE_CONTROL, "no-cache"),
        ],
        framing.error_body(status, message),
    )
        .into_response()
}

/// Heartbeat in milliseconds: a positive integer, raised to `minimum`.
fn parse_heartbeat(value: Option<&str>, minimum: Duration) -> Result<Duration, ConnectionError> {
    let Some(value) = value else {
        return Ok(minimum);
    };
    match value.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms).max(minimum)),
        _ => Err(ConnectionError::InvalidParameter("invalid heartbeat parameter".into())),
    }
}

fn parse_size(value: Option<&str>, name: &str) -> Result<Option<usize>, ConnectionError> {
    value
        .map(|v| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| ConnectionError::InvalidParameter(format!("invalid {name} parameter")))
        })
        .transpose()
}

async fn comet_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    jar: CookieJar,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let framing = framing::select(header(&headers, ACCEPT), header(&headers, USER_AGENT));

    if let Some(max) = state.config.max_connections {
        let current = state.live.len();
        if current >= max {
            warn!("Comet stream rejected: max connections reached ({max})");
            return error_response(
                framing.as_ref(),
                StatusCode::SERVICE_UNAVAILABLE,
                "too many connections",
            );
        }
    }

    let params = parse_heartbeat(query.get("heartbeat").map(String::as_str), state.config.heartbeat)
        .and_then(|heartbeat| {
            let padding = parse_size(query.get("padding").map(String::as_str), "padding")?;
            let length = parse_size(query.get("length").map(String::as_str), "length")?;
            Ok((heartbeat, padding, length))
        });
    let (heartbeat, padding, length) = match params {
        Ok(params) => params,
        Err(e) => {
            debug!("Rejecting comet request: {e}");
            return error_response(framing.as_ref(), StatusCode::BAD_REQUEST, &e.to_string());
        }
    };

    let user_agent = header(&headers, USER_AGENT);
    let secure = uri.scheme_str() == Some("https")
        || header(&headers, axum::http::HeaderName::from_static("x-forwarded-proto")) == Some("https");
    let options = ConnectionOptions {
        heartbeat,
        padding: padding.unwrap_or_else(|| framing.default_padding(user_agent, secure)),
        limits: framing
            .limits()
            .map(|limits| length.map_or(limits, |hard| limits.with_hard(hard))),
        deflate: state.config.deflate
            && header(&headers, ACCEPT_ENCODING).is_some_and(|v| v.contains("deflate")),
    };

    let request = CometRequest {
        method,
        uri,
        headers,
        query,
        session_id: jar.get(SESSION_COOKIE).map(|c| c.value().to_string()),
    };

    let (connection, body) = ServerConnection::new(state.ctx.clone(), framing, options, request);
    state.live.insert(connection.id(), Arc::downgrade(&connection));
    let guard = StreamGuard { connection: connection.clone(), live: state.live.clone() };

    if let Err(e) = connection.initiate() {
        warn!(connection = connection.id(), "failed to initiate comet stream: {e}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    if let Err(e) = state.ctx.handler.on_comet(&connection) {
        warn!(connection = connection.id(), "comet handler failed: {e}");
        if connection
            .send_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            .is_err()
        {
            connection.terminate();
        }
    }

    let (status, response_headers) = connection.response_head();

    if !connection.is_terminated() {
        if state.ctx.host.is_blocking() {
            let suspended = connection.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = suspended.suspend() {
                    warn!(connection = suspended.id(), "suspend failed: {e}");
                }
            });
        } else if let Err(e) = connection.suspend() {
            warn!(connection = connection.id(), "suspend failed: {e}");
        }
    }

    let mut response = Response::new(body.into_body(guard));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "host": state.ctx.host.name(),
        "connections": state.live.len(),
        "sessions": state.ctx.sessions.len(),
    }))
}
