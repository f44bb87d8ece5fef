//! Endpoint tests: query validation, transport selection, cookies, health.

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use comet_server::*;
    use tower::ServiceExt;

    /// Writes a greeting, optionally opens a session, then ends the stream.
    struct Greeter {
        with_session: bool,
    }

    impl CometHandler for Greeter {
        fn on_comet(&self, connection: &Arc<ServerConnection>) -> Result<(), ConnectionError> {
            if self.with_session {
                connection.session(true)?;
            }
            let name = connection.with_request(|r| r.param("name").unwrap_or("world").to_string())?;
            connection.send(format!("hello {name}"))?;
            connection.terminate();
            Ok(())
        }
    }

    struct Rejecter;

    impl CometHandler for Rejecter {
        fn on_comet(&self, _connection: &Arc<ServerConnection>) -> Result<(), ConnectionError> {
            Err(ConnectionError::InvalidParameter("no access".into()))
        }
    }

    fn endpoint_with(config: CometConfig, handler: Arc<dyn CometHandler>) -> CometEndpoint {
        let scheduler = Scheduler::try_current().unwrap();
        CometEndpoint::new(config, handler, Arc::new(TaskHost::new(scheduler)))
    }

    fn endpoint(handler: Arc<dyn CometHandler>) -> CometEndpoint {
        endpoint_with(CometConfig::default(), handler)
    }

    fn greeter() -> Arc<dyn CometHandler> {
        Arc::new(Greeter { with_session: false })
    }

    fn plain(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::ACCEPT, "text/plain")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Query parameters
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn default_heartbeat_is_advertised() {
        let app = endpoint(greeter()).router();
        let response = app.oneshot(plain("/comet")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(body_text(response).await, "!15000\n|hello world\n?\n");
    }

    #[tokio::test]
    async fn heartbeat_is_clamped_to_minimum() {
        let app = endpoint(greeter()).router();
        let response = app.oneshot(plain("/comet?heartbeat=1000")).await.unwrap();
        assert!(body_text(response).await.starts_with("!15000\n"));
    }

    #[tokio::test]
    async fn longer_heartbeat_is_honoured() {
        let app = endpoint(greeter()).router();
        let response = app.oneshot(plain("/comet?heartbeat=20000&name=bob")).await.unwrap();
        assert_eq!(body_text(response).await, "!20000\n|hello bob\n?\n");
    }

    #[tokio::test]
    async fn invalid_heartbeat_is_rejected() {
        for uri in ["/comet?heartbeat=0", "/comet?heartbeat=-5", "/comet?heartbeat=soon"] {
            let app = endpoint(greeter()).router();
            let response = app.oneshot(plain(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body_text(response).await, "invalid heartbeat parameter");
        }
    }

    #[tokio::test]
    async fn invalid_padding_and_length_are_rejected() {
        let app = endpoint(greeter()).router();
        let response = app.clone().oneshot(plain("/comet?padding=x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "invalid padding parameter");

        let response = app.oneshot(plain("/comet?length=-1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "invalid length parameter");
    }

    #[tokio::test]
    async fn max_connections_rejects_with_503() {
        let config = CometConfig { max_connections: Some(0), ..CometConfig::default() };
        let app = endpoint_with(config, greeter()).router();
        let response = app.oneshot(plain("/comet")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transport selection
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn html_file_is_the_fallback() {
        let app = endpoint(greeter()).router();
        let request = Request::builder().uri("/comet").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/html")
        );
        let body = body_text(response).await;
        assert!(body.starts_with("<html><body onload='parent.d()'><script>parent.c(15000);"));
        assert!(body.contains("<script>s('hello world');</script>"));
        assert!(body.ends_with("<script>parent.t();</script>"));
    }

    #[tokio::test]
    async fn opera_gets_event_source() {
        let app = endpoint(greeter()).router();
        let request = Request::builder()
            .uri("/comet")
            .header(header::USER_AGENT, "Opera/9.80")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/x-dom-event-stream");
        assert_eq!(
            body_text(response).await,
            "Event: c\ndata: c15000\n\nEvent: s\ndata: hello world\n\nEvent: c\ndata: d\n\n"
        );
    }

    #[tokio::test]
    async fn deflate_when_accepted() {
        let app = endpoint(greeter()).router();
        let request = Request::builder()
            .uri("/comet")
            .header(header::ACCEPT, "text/plain")
            .header(header::ACCEPT_ENCODING, "gzip, deflate")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "deflate");

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mut inflated = String::new();
        flate2::read::ZlibDecoder::new(&bytes[..])
            .read_to_string(&mut inflated)
            .unwrap();
        assert_eq!(inflated, "!15000\n|hello world\n?\n");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sessions and handler failures
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn creating_a_session_sets_cookie() {
        let endpoint = endpoint(Arc::new(Greeter { with_session: true }));
        let app = endpoint.router();
        let response = app.oneshot(plain("/comet")).await.unwrap();

        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with(&format!("{SESSION_COOKIE}=")));
        assert!(cookie.contains("HttpOnly"));
        assert_eq!(endpoint.sessions().len(), 1);
        assert_eq!(endpoint.sessions().comet_sessions().len(), 1);
        body_text(response).await;
    }

    #[tokio::test]
    async fn known_cookie_reuses_session() {
        let endpoint = endpoint(Arc::new(Greeter { with_session: true }));
        let app = endpoint.router();
        let first = app.clone().oneshot(plain("/comet")).await.unwrap();
        let cookie = first.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        let pair = cookie.split(';').next().unwrap().to_string();
        body_text(first).await;

        let request = Request::builder()
            .uri("/comet")
            .header(header::ACCEPT, "text/plain")
            .header(header::COOKIE, pair)
            .body(Body::empty())
            .unwrap();
        let second = app.oneshot(request).await.unwrap();
        assert!(second.headers().get(header::SET_COOKIE).is_none());
        body_text(second).await;
        assert_eq!(endpoint.sessions().len(), 1);
    }

    #[tokio::test]
    async fn handler_error_becomes_500() {
        let app = endpoint(Arc::new(Rejecter)).router();
        let response = app.oneshot(plain("/comet")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
        assert_eq!(body_text(response).await, "no access");
    }

    #[tokio::test]
    async fn finished_streams_are_no_longer_counted() {
        let endpoint = endpoint(greeter());
        let response = endpoint.router().oneshot(plain("/comet")).await.unwrap();
        body_text(response).await;
        assert_eq!(endpoint.connection_count(), 0);
    }

    #[tokio::test]
    async fn health_reports_host() {
        let app = endpoint(greeter()).router();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["host"], "task");
        assert_eq!(json["connections"], 0);
    }
}
