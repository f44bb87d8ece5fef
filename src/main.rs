//! Comet Push: demo push server
//!
//! Holds one comet stream open per browser and pushes whatever is sent to
//! `/publish` into every comet session. Messages queue while a client is
//! reconnecting and are delivered once it is back.
//!
//! Usage:
//!   comet-push                              # Port 7080, task host
//!   comet-push --port 0                     # OS-assigned port
//!   comet-push --host blocking              # One parked thread per stream
//!   comet-push --heartbeat-ms 30000         # Raise the minimum heartbeat
//!   curl 'http://127.0.0.1:7080/publish?text=hi'

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use clap::{Parser, ValueEnum};
use comet_protocol::Message;
use comet_server::{
    BlockingHost, CometConfig, CometEndpoint, CometHandler, CometServer, ConnectionError,
    ExecutionHost, HttpSessionStore, Scheduler, ServerConnection, TaskHost,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HostKind {
    /// Park a blocking thread per suspended stream
    Blocking,
    /// Drain suspended streams from async tasks
    Task,
}

#[derive(Parser, Debug)]
#[command(name = "comet-push", about = "Comet Push: HTTP streaming push server")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "7080")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Path of the comet stream
    #[arg(long, default_value = "/comet")]
    path: String,

    /// Minimum heartbeat interval in milliseconds
    #[arg(long, default_value = "15000")]
    heartbeat_ms: u64,

    /// How suspended streams are held open
    #[arg(long, value_enum, default_value = "task")]
    host: HostKind,

    /// Maximum concurrent streams
    #[arg(long, default_value = "1024")]
    max_connections: usize,

    /// Never compress streams, even when the client accepts deflate
    #[arg(long)]
    no_deflate: bool,

    /// Allow cross-origin requests
    #[arg(long)]
    cors: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file (defaults to ./comet-push.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

/// Opens a session for every stream and greets it.
struct DemoHandler;

impl CometHandler for DemoHandler {
    fn on_comet(&self, connection: &Arc<ServerConnection>) -> Result<(), ConnectionError> {
        if let Some(session) = connection.session(true)? {
            if session.is_queue_empty() {
                session.enqueue(json!({
                    "type": "welcome",
                    "session": session.id(),
                    "heartbeat": connection.heartbeat().as_millis() as u64,
                }));
            }
        }
        Ok(())
    }

    fn on_terminated(&self, connection: &ServerConnection, server_initiated: bool) {
        info!(
            connection = connection.id(),
            server_initiated,
            bytes = connection.bytes_written(),
            "stream closed"
        );
    }
}

#[derive(Debug, Deserialize)]
struct PublishParams {
    text: Option<String>,
    json: Option<String>,
}

/// Queue a message on every comet session.
async fn publish(
    State(sessions): State<HttpSessionStore>,
    Query(params): Query<PublishParams>,
) -> Json<Value> {
    let message: Message = match (params.text, params.json) {
        (_, Some(raw)) => match serde_json::from_str::<Value>(&raw) {
            Ok(value) => value.into(),
            Err(e) => return Json(json!({ "error": format!("invalid json: {e}") })),
        },
        (Some(text), None) => text.into(),
        (None, None) => return Json(json!({ "error": "missing text or json parameter" })),
    };

    let delivered = sessions
        .comet_sessions()
        .iter()
        .filter(|session| session.enqueue(message.clone()))
        .count();
    info!("Published to {delivered} sessions");
    Json(json!({ "sessions": delivered }))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    if let Some(ref log_file_arg) = cli.log_file {
        let log_path = if log_file_arg == "DEFAULT" {
            PathBuf::from("comet-push.log")
        } else {
            PathBuf::from(log_file_arg)
        };

        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = match std::fs::OpenOptions::new().create(true).append(true).open(&log_path) {
            Ok(file) => file,
            Err(e) => {
                eprintln!("Failed to open log file {}: {e}", log_path.display());
                std::process::exit(1);
            }
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    };

    let config = CometConfig {
        port: cli.port,
        hostname: cli.hostname.clone(),
        path: cli.path.clone(),
        heartbeat: Duration::from_millis(cli.heartbeat_ms),
        deflate: !cli.no_deflate,
        max_connections: Some(cli.max_connections),
        enable_cors: cli.cors,
        ..CometConfig::default()
    };

    let scheduler = Scheduler::new(tokio::runtime::Handle::current());
    let host: Arc<dyn ExecutionHost> = match cli.host {
        HostKind::Blocking => Arc::new(BlockingHost::new(scheduler)),
        HostKind::Task => Arc::new(TaskHost::new(scheduler)),
    };

    let endpoint = CometEndpoint::new(config.clone(), Arc::new(DemoHandler), host.clone());
    let router = endpoint.router().merge(
        Router::new()
            .route("/publish", get(publish).post(publish))
            .with_state(endpoint.sessions().clone()),
    );

    let mut server = match CometServer::serve(&config, &endpoint, router).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start comet server: {e}");
            std::process::exit(1);
        }
    };

    let base = format!("http://{}:{}", cli.hostname, server.port());
    println!();
    println!("  Comet Push");
    println!();
    println!("  Host:       {}", host.name());
    println!("  Heartbeat:  {}ms minimum", cli.heartbeat_ms);
    println!("  Stream:     {base}{}", config.path);
    println!("  Publish:    {base}/publish?text=hello");
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }

    println!();
    println!("  Shutting down...");
    server.stop().await;
    println!("  Server stopped.");
}
