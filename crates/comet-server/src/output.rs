//! Response body plumbing: a channel-backed sink, optional deflate, and the
//! axum body that drains it.

use std::io::{self, Write};

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use flate2::Compression;
use flate2::write::ZlibEncoder;
use futures_util::stream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Flushed chunks a client may leave unread before its stream counts as
/// failed.
pub const MAX_BACKLOG_CHUNKS: usize = 1024;

/// Writes land in a local buffer and are sent to the response body on flush.
pub(crate) struct BodySink {
    tx: mpsc::Sender<Bytes>,
    pending: BytesMut,
}

impl BodySink {
    fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx, pending: BytesMut::new() }
    }
}

impl Write for BodySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.tx.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"));
        }
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = self.pending.split().freeze();
        self.tx.try_send(chunk).map_err(|e| match e {
            TrySendError::Full(_) => {
                io::Error::new(io::ErrorKind::WouldBlock, "client is not reading the stream")
            }
            TrySendError::Closed(_) => io::Error::new(io::ErrorKind::BrokenPipe, "client went away"),
        })
    }
}

enum Output {
    Plain(BodySink),
    Deflate(ZlibEncoder<BodySink>),
}

/// Character stream of one comet response.
///
/// Counts bytes before compression so stream limits mean the same thing
/// whether or not deflate is on. Flushing a deflate stream performs a sync
/// flush so the client can inflate everything sent so far.
pub(crate) struct FrameWriter {
    out: Option<Output>,
    tx: Option<mpsc::Sender<Bytes>>,
    written: usize,
    flushed: bool,
}

impl FrameWriter {
    pub(crate) fn new(tx: mpsc::Sender<Bytes>, deflate: bool) -> Self {
        let sink = BodySink::new(tx.clone());
        let out = if deflate {
            Output::Deflate(ZlibEncoder::new(sink, Compression::default()))
        } else {
            Output::Plain(sink)
        };
        Self { out: Some(out), tx: Some(tx), written: 0, flushed: false }
    }

    pub(crate) fn write_str(&mut self, data: &str) -> io::Result<()> {
        let bytes = data.as_bytes();
        match self.out.as_mut() {
            Some(Output::Plain(sink)) => sink.write_all(bytes)?,
            Some(Output::Deflate(encoder)) => encoder.write_all(bytes)?,
            None => return Err(closed()),
        }
        self.written += bytes.len();
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        match self.out.as_mut() {
            Some(Output::Plain(sink)) => sink.flush()?,
            Some(Output::Deflate(encoder)) => encoder.flush()?,
            None => return Err(closed()),
        }
        self.flushed = true;
        Ok(())
    }

    /// Finish the stream and end the response body.
    pub(crate) fn close(&mut self) -> io::Result<()> {
        self.tx = None;
        match self.out.take() {
            Some(Output::Plain(mut sink)) => sink.flush(),
            Some(Output::Deflate(encoder)) => encoder.finish()?.flush(),
            None => Ok(()),
        }
    }

    /// Discard everything buffered and restart as an uncompressed stream.
    /// Only possible while nothing has reached the client.
    pub(crate) fn reset_plain(&mut self) -> bool {
        let Some(tx) = self.tx.clone() else {
            return false;
        };
        if self.flushed {
            return false;
        }
        self.out = Some(Output::Plain(BodySink::new(tx)));
        self.written = 0;
        true
    }

    pub(crate) fn written(&self) -> usize {
        self.written
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.out.is_none()
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "response stream closed")
}

/// Receiving end of a comet response.
#[derive(Debug)]
pub struct ResponseBody {
    rx: mpsc::Receiver<Bytes>,
}

impl ResponseBody {
    pub(crate) fn channel() -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(MAX_BACKLOG_CHUNKS);
        (tx, Self { rx })
    }

    /// Next flushed chunk; `None` once the connection has closed its stream.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Everything flushed so far, without waiting.
    pub fn take_available(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(chunk) = self.rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Convert into an axum body. `guard` is dropped together with the body,
    /// which happens when the stream ends or the client goes away.
    pub fn into_body<G: Send + 'static>(self, guard: G) -> Body {
        let chunks = stream::unfold((self.rx, guard), |(mut rx, guard)| async move {
            rx.recv()
                .await
                .map(|chunk| (Ok::<_, io::Error>(chunk), (rx, guard)))
        });
        Body::from_stream(chunks)
    }
}
