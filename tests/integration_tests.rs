//! End-to-end integration tests: a real comet server on a random port,
//! driven by the real client over HTTP.

use std::sync::Arc;
use std::time::Duration;

use comet_client::{ClientConfig, ClientConnection, CometError, CometListener};
use comet_protocol::Message;
use comet_server::{
    BlockingHost, CometConfig, CometHandler, CometServer, ConnectionError, ExecutionHost,
    Scheduler, ServerConnection, Session, TaskHost,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Connected(Duration),
    Disconnected,
    Error(String, bool),
    Heartbeat,
    Messages(Vec<Message>),
}

/// Forwards every callback into a channel the test can await.
struct ChannelListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl CometListener for ChannelListener {
    fn on_connected(&self, heartbeat: Duration) {
        let _ = self.tx.send(Event::Connected(heartbeat));
    }

    fn on_disconnected(&self) {
        let _ = self.tx.send(Event::Disconnected);
    }

    fn on_error(&self, error: &CometError, connected: bool) {
        let _ = self.tx.send(Event::Error(error.to_string(), connected));
    }

    fn on_heartbeat(&self) {
        let _ = self.tx.send(Event::Heartbeat);
    }

    fn on_message(&self, messages: &[Message]) {
        let _ = self.tx.send(Event::Messages(messages.to_vec()));
    }
}

/// Creates a session for every stream and greets new ones.
struct Greeter;

impl CometHandler for Greeter {
    fn on_comet(&self, connection: &Arc<ServerConnection>) -> Result<(), ConnectionError> {
        if let Some(session) = connection.session(true)? {
            if session.is_queue_empty() {
                session.enqueue("welcome");
            }
        }
        Ok(())
    }
}

struct Rejecter;

impl CometHandler for Rejecter {
    fn on_comet(&self, _connection: &Arc<ServerConnection>) -> Result<(), ConnectionError> {
        Err(ConnectionError::InvalidParameter("no access".into()))
    }
}

/// Start a server on a random port. The server is leaked so it outlives the
/// test body.
async fn start_server(handler: Arc<dyn CometHandler>, blocking: bool) -> (&'static CometServer, String) {
    let scheduler = Scheduler::new(tokio::runtime::Handle::current());
    let host: Arc<dyn ExecutionHost> = if blocking {
        Arc::new(BlockingHost::new(scheduler))
    } else {
        Arc::new(TaskHost::new(scheduler))
    };
    let config = CometConfig { port: 0, ..CometConfig::default() };
    let server = CometServer::start(config, handler, host).await.unwrap();
    let url = format!("http://127.0.0.1:{}/comet", server.port());
    (Box::leak(Box::new(server)), url)
}

fn client(url: &str, config: ClientConfig) -> (Arc<ClientConnection>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = ClientConnection::http(url, config, Arc::new(ChannelListener { tx })).unwrap();
    (client, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timeout waiting for client event")
        .expect("Listener dropped")
}

/// Skip events until one matches.
async fn wait_for(rx: &mut mpsc::UnboundedReceiver<Event>, wanted: impl Fn(&Event) -> bool) -> Event {
    loop {
        let event = next_event(rx).await;
        if wanted(&event) {
            return event;
        }
    }
}

async fn only_session(server: &CometServer) -> Arc<Session> {
    for _ in 0..50 {
        if let Some(session) = server.sessions().comet_sessions().into_iter().next() {
            return session;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no comet session was created");
}

fn texts(event: &Event) -> Vec<String> {
    match event {
        Event::Messages(batch) => batch.iter().map(ToString::to_string).collect(),
        _ => Vec::new(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connect and deliver
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_reports_server_heartbeat() {
    let (_server, url) = start_server(Arc::new(Greeter), false).await;
    let (client, mut rx) = client(&url, ClientConfig::default());
    client.start();

    assert_eq!(next_event(&mut rx).await, Event::Connected(Duration::from_millis(15_000)));
    let greeting = next_event(&mut rx).await;
    assert_eq!(texts(&greeting), vec!["welcome"]);
    client.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_enqueued_messages_arrive_in_order() {
    let (server, url) = start_server(Arc::new(Greeter), false).await;
    let (client, mut rx) = client(&url, ClientConfig::default());
    client.start();
    wait_for(&mut rx, |e| texts(e) == ["welcome"]).await;

    let session = only_session(server).await;
    session.enqueue_all(["one", "two\nlines", "three"]);
    session.enqueue(json!({"n": 4}));

    let mut received = Vec::new();
    while received.len() < 4 {
        let event = wait_for(&mut rx, |e| matches!(e, Event::Messages(_))).await;
        if let Event::Messages(batch) = event {
            received.extend(batch);
        }
    }
    assert_eq!(
        received,
        vec![
            Message::from("one"),
            Message::from("two\nlines"),
            Message::from("three"),
            Message::from(json!({"n": 4})),
        ]
    );
    client.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compressed_stream() {
    let (server, url) = start_server(Arc::new(Greeter), false).await;
    let config = ClientConfig { compression: true, ..ClientConfig::default() };
    let (client, mut rx) = client(&url, config);
    client.start();
    wait_for(&mut rx, |e| texts(e) == ["welcome"]).await;

    only_session(server).await.enqueue("squeezed");
    let event = wait_for(&mut rx, |e| matches!(e, Event::Messages(_))).await;
    assert_eq!(texts(&event), vec!["squeezed"]);
    client.stop();
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconnection
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_survives_server_disconnect() {
    let (server, url) = start_server(Arc::new(Greeter), false).await;
    let (client, mut rx) = client(&url, ClientConfig::default());
    client.start();
    wait_for(&mut rx, |e| texts(e) == ["welcome"]).await;

    let session = only_session(server).await;
    session.bound_connection().unwrap().terminate();
    session.enqueue("while away");

    wait_for(&mut rx, |e| *e == Event::Disconnected).await;
    wait_for(&mut rx, |e| matches!(e, Event::Connected(_))).await;
    let event = wait_for(&mut rx, |e| matches!(e, Event::Messages(_))).await;
    assert_eq!(texts(&event), vec!["while away"]);

    // The cookie brought the client back to the same session.
    assert_eq!(server.sessions().comet_sessions().len(), 1);
    client.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalidated_session_is_replaced() {
    let (server, url) = start_server(Arc::new(Greeter), false).await;
    let (client, mut rx) = client(&url, ClientConfig::default());
    client.start();
    wait_for(&mut rx, |e| texts(e) == ["welcome"]).await;

    let first = only_session(server).await;
    first.invalidate();
    assert!(!first.enqueue("dropped"));

    wait_for(&mut rx, |e| *e == Event::Disconnected).await;
    let greeting = wait_for(&mut rx, |e| matches!(e, Event::Messages(_))).await;
    assert_eq!(texts(&greeting), vec!["welcome"]);

    let second = only_session(server).await;
    assert!(!Arc::ptr_eq(&first, &second));
    client.stop();
}

// ─────────────────────────────────────────────────────────────────────────────
// Failures
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_error_reaches_client_as_status() {
    let (_server, url) = start_server(Arc::new(Rejecter), false).await;
    let config = ClientConfig { reconnect_delay: Duration::from_secs(60), ..ClientConfig::default() };
    let (client, mut rx) = client(&url, config);
    client.start();

    assert_eq!(
        next_event(&mut rx).await,
        Event::Error("HTTP status 500: no access".into(), false)
    );
    client.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_server_is_a_connect_failure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = ClientConfig { reconnect_delay: Duration::from_secs(60), ..ClientConfig::default() };
    let (client, mut rx) = client(&format!("http://127.0.0.1:{port}/comet"), config);
    client.start();

    match next_event(&mut rx).await {
        Event::Error(message, connected) => {
            assert!(message.starts_with("HTTP error"), "{message}");
            assert!(!connected);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    client.stop();
}

// ─────────────────────────────────────────────────────────────────────────────
// Blocking host
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_host_delivers() {
    let (server, url) = start_server(Arc::new(Greeter), true).await;
    let (client, mut rx) = client(&url, ClientConfig::default());
    client.start();
    wait_for(&mut rx, |e| texts(e) == ["welcome"]).await;

    let session = only_session(server).await;
    session.enqueue("from a parked thread");
    let event = wait_for(&mut rx, |e| matches!(e, Event::Messages(_))).await;
    assert_eq!(texts(&event), vec!["from a parked thread"]);

    session.invalidate();
    wait_for(&mut rx, |e| *e == Event::Disconnected).await;
    client.stop();
}
