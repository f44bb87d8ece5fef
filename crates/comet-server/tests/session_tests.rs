//! Session store, comet session queue and transport framing tests.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::StatusCode;
    use comet_protocol::{JsonCodec, Message};
    use comet_server::*;
    use serde_json::json;

    fn host() -> Arc<dyn ExecutionHost> {
        Arc::new(TaskHost::new(Scheduler::try_current().unwrap()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // HTTP sessions
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn store_creates_and_finds_sessions() {
        let store = HttpSessionStore::new(None);
        assert!(store.is_empty());
        let session = store.create();
        assert_eq!(session.id().len(), 32);
        assert_eq!(store.len(), 1);

        let found = store.get(session.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &session));
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn expired_sessions_are_not_returned() {
        let store = HttpSessionStore::new(Some(Duration::from_millis(30)));
        let session = store.create();
        std::thread::sleep(Duration::from_millis(60));

        assert!(session.is_expired());
        assert!(store.get(session.id()).is_none());
        assert!(!session.is_valid());
        assert!(store.is_empty());
    }

    #[test]
    fn reaper_drops_only_expired_sessions() {
        let store = HttpSessionStore::new(Some(Duration::from_millis(40)));
        let stale = store.create();
        std::thread::sleep(Duration::from_millis(60));
        let fresh = store.create();

        assert_eq!(store.reap_expired(), 1);
        assert!(!stale.is_valid());
        assert!(fresh.is_valid());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn attributes_are_typed() {
        let store = HttpSessionStore::new(None);
        let session = store.create();
        session.set_attribute("user", Arc::new(String::from("ada")));

        assert_eq!(session.attribute::<String>("user").as_deref().map(String::as_str), Some("ada"));
        assert!(session.attribute::<u32>("user").is_none());

        let counter = session.attribute_or_insert_with("visits", || 7u32);
        assert_eq!(*counter, 7);
        let again = session.attribute_or_insert_with("visits", || 99u32);
        assert_eq!(*again, 7);

        assert!(!session.remove_attribute_if::<u32, _>("visits", |v| *v == 8));
        assert!(session.remove_attribute_if::<u32, _>("visits", |v| *v == 7));
        assert!(session.remove_attribute("visits").is_none());
    }

    #[test]
    fn store_invalidate_by_id() {
        let store = HttpSessionStore::new(None);
        let session = store.create();
        assert!(store.invalidate(session.id()));
        assert!(!store.invalidate(session.id()));
        assert!(!session.is_valid());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Comet sessions
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn comet_session_is_stored_once() {
        let store = HttpSessionStore::new(None);
        let http = store.create();
        let host = host();

        assert!(Session::lookup(&http).is_none());
        let first = Session::get_or_create(&http, &host);
        let second = Session::get_or_create(&http, &host);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.id(), http.id());
        assert_eq!(store.comet_sessions().len(), 1);
    }

    #[tokio::test]
    async fn queue_accepts_messages_without_a_connection() {
        let http = HttpSessionStore::new(None).create();
        let session = Session::get_or_create(&http, &host());

        assert!(session.is_queue_empty());
        assert!(session.enqueue("a"));
        assert!(session.enqueue_all(["b", "c"]));
        assert!(session.enqueue(json!({"n": 1})));
        assert_eq!(session.queue_len(), 4);
        assert!(session.pending());
        assert!(session.bound_id().is_none());

        let front = session.with_queue(|queue| queue.pop_front()).flatten();
        assert_eq!(front, Some(Message::from("a")));
        assert_eq!(session.queue_len(), 3);
    }

    #[tokio::test]
    async fn invalidated_session_ignores_queue_operations() {
        let http = HttpSessionStore::new(None).create();
        let session = Session::get_or_create(&http, &host());
        session.enqueue("lost");

        session.invalidate();
        session.invalidate();

        assert!(!session.is_valid());
        assert!(session.is_queue_empty());
        assert!(!session.enqueue("late"));
        assert!(session.with_queue(|queue| queue.len()).is_none());
        assert!(Session::lookup(&http).is_none());
        assert!(http.is_valid());
    }

    #[tokio::test]
    async fn http_invalidation_cascades() {
        let http = HttpSessionStore::new(None).create();
        let session = Session::get_or_create(&http, &host());

        http.invalidate();
        assert!(!http.is_valid());
        assert!(!session.is_valid());
    }

    #[tokio::test]
    async fn touch_reaches_http_session() {
        let http = HttpSessionStore::new(None).create();
        let before = http.last_accessed();
        let session = Session::get_or_create(&http, &host());
        std::thread::sleep(Duration::from_millis(5));
        session.touch();
        assert!(http.last_accessed() > before);
        assert!(session.last_accessed() > before);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Framing
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn select_by_headers() {
        let name = |accept, ua| framing::select(accept, ua).name();
        assert_eq!(name(Some("text/plain"), Some("Opera/9.80")), "http-request");
        assert_eq!(name(Some("text/html"), Some("Opera/9.80")), "event-source");
        assert_eq!(name(None, Some("Mozilla/5.0")), "html-file");
        assert_eq!(name(None, None), "html-file");
    }

    #[test]
    fn http_request_padding() {
        let framing = HttpRequestFraming;
        assert_eq!(framing.padding(10, 14).as_deref(), Some("***\n"));
        assert_eq!(framing.padding(13, 14).as_deref(), Some("\n"));
        assert!(framing.padding(14, 14).is_none());
        assert_eq!(framing.default_padding(Some("Mozilla/5.0 Chrome/120"), false), 42);
        assert_eq!(framing.default_padding(Some("Mozilla/5.0 Chrome/120"), true), 64);
        assert_eq!(framing.default_padding(Some("Mozilla/5.0 Firefox/120"), false), 0);
    }

    #[test]
    fn event_source_frames() {
        let framing = EventSourceFraming;
        let mut out = String::new();
        framing
            .messages(&["a\nb".into(), json!([1]).into()], &JsonCodec, &mut out)
            .unwrap();
        framing.heartbeat(&mut out);
        assert_eq!(out, "Event: s\ndata: a\\nb\n\nEvent: o\ndata: [1]\n\nEvent: c\ndata: h\n\n");
        assert!(framing.limits().is_none());
        assert!(framing.padding(0, 100).is_none());
    }

    #[test]
    fn html_file_frames() {
        let framing = HtmlFileFraming;
        let mut out = String::new();
        framing
            .messages(&["it's </b>".into(), json!({"k": "v"}).into()], &JsonCodec, &mut out)
            .unwrap();
        assert_eq!(out, r#"<script>s('it\'s <\/b>');o('{"k":"v"}');</script>"#);

        out.clear();
        framing.refresh(&mut out);
        assert_eq!(out, "<script>parent.r();</script>");

        assert_eq!(
            framing.error_body(StatusCode::BAD_REQUEST, "bad"),
            "<html><script>parent.e(400,'bad')</script></html>"
        );
        assert_eq!(framing.padding(250, 256).as_deref(), Some("      "));
        assert_eq!(framing.default_padding(None, false), 256);
    }

    #[test]
    fn limits_follow_length_override() {
        let limits = HttpRequestFraming.limits().unwrap().with_hard(1000);
        assert_eq!(limits.hard, 1000);
        assert_eq!(limits.refresh, 500);

        let wide = StreamLimits::new(100, 200).with_hard(10_000);
        assert_eq!(wide.refresh, 100);
        assert_eq!(wide.hard, 10_000);
    }
}
