//! Streaming HTTP request transport.
//!
//! One GET per attempt with `Accept: text/plain`. The body is read chunk by
//! chunk as it arrives and fed through a [`FrameDecoder`]; data frames that
//! arrive in one chunk are delivered as one batch.

use std::sync::Arc;
use std::time::Duration;

use comet_protocol::{Frame, FrameDecoder, Message, WireCodec};
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio::task::AbortHandle;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::CometError;
use crate::transport::{ClientTransport, TransportEvents};

pub struct HttpStreamTransport {
    client: reqwest::Client,
    codec: Option<Arc<dyn WireCodec>>,
    task: Mutex<Option<AbortHandle>>,
}

impl std::fmt::Debug for HttpStreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStreamTransport")
            .field("active", &self.task.lock().is_some())
            .finish()
    }
}

impl HttpStreamTransport {
    /// Build the HTTP client. Cookies persist across attempts so the server
    /// session survives reconnection.
    pub fn new(config: &ClientConfig) -> Result<Self, CometError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .deflate(config.compression)
            .build()?;
        Ok(Self { client, codec: config.codec.clone(), task: Mutex::new(None) })
    }
}

impl ClientTransport for HttpStreamTransport {
    fn connect(&self, url: &str, events: TransportEvents) {
        let request = self
            .client
            .get(url)
            .header(ACCEPT, "text/plain")
            .header(CACHE_CONTROL, "no-cache");
        let reader = StreamReader::new(self.codec.clone(), events);
        let task = tokio::spawn(reader.run(request)).abort_handle();
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }

    fn disconnect(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for HttpStreamTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Parses one response body and reports it to the attempt's sink.
struct StreamReader {
    decoder: FrameDecoder,
    codec: Option<Arc<dyn WireCodec>>,
    events: TransportEvents,
    expecting_disconnection: bool,
}

impl StreamReader {
    fn new(codec: Option<Arc<dyn WireCodec>>, events: TransportEvents) -> Self {
        Self { decoder: FrameDecoder::new(), codec, events, expecting_disconnection: false }
    }

    async fn run(mut self, request: reqwest::RequestBuilder) {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return self.events.error(e.into(), false),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return self.events.error(CometError::Status { code: status.as_u16(), body }, false);
        }

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    self.decoder.feed(&bytes);
                    if self.drain(false) {
                        return self.events.disconnected();
                    }
                }
                Err(e) => return self.events.error(e.into(), false),
            }
        }

        if self.drain(true) || self.expecting_disconnection {
            self.events.disconnected();
        } else {
            self.events.error(CometError::UnexpectedDisconnection, false);
        }
    }

    /// Dispatch every complete frame. Returns `true` on a refresh frame.
    fn drain(&mut self, finished: bool) -> bool {
        let mut batch = Vec::new();
        let mut refresh = false;
        loop {
            let next = match self.decoder.next_frame() {
                Some(next) => next,
                None if finished => match self.decoder.finish() {
                    Some(next) => next,
                    None => break,
                },
                None => break,
            };
            match next {
                Ok(frame) => {
                    if self.dispatch(frame, &mut batch) {
                        refresh = true;
                        break;
                    }
                }
                Err(e) => self.events.error(e.into(), true),
            }
        }
        self.events.messages(batch);
        refresh
    }

    fn dispatch(&mut self, frame: Frame, batch: &mut Vec<Message>) -> bool {
        if self.expecting_disconnection && frame != Frame::Padding {
            self.events.error(CometError::FrameAfterDisconnect(frame.encode().trim_end().to_string()), true);
            return false;
        }

        match frame {
            Frame::Text(text) => batch.push(Message::Text(text)),
            Frame::Object(text) => match &self.codec {
                Some(codec) => match codec.decode(&text) {
                    Ok(value) => batch.push(Message::Object(value)),
                    Err(e) => self.events.error(e.into(), true),
                },
                None => self.events.error(CometError::MissingCodec(text), true),
            },
            Frame::Padding => {}
            control => {
                // Keep control events ordered with the data around them.
                self.events.messages(std::mem::take(batch));
                match control {
                    Frame::Connect { heartbeat } => {
                        self.events.connected(Duration::from_millis(heartbeat))
                    }
                    Frame::Heartbeat => self.events.heartbeat(),
                    Frame::Disconnect => {
                        debug!(attempt = self.events.attempt(), "server closing stream");
                        self.expecting_disconnection = true;
                    }
                    Frame::Refresh => {
                        debug!(attempt = self.events.attempt(), "server asked for refresh");
                        return true;
                    }
                    _ => {}
                }
            }
        }
        false
    }
}
