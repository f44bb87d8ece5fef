//! Incremental line decoder over a growing byte stream.

use bytes::{Buf, BytesMut};

use crate::error::ProtocolError;
use crate::frame::Frame;

/// Splits an arbitrarily chunked byte stream into frames.
///
/// Bytes already searched for a separator are not searched again when the
/// next chunk arrives, so a long frame delivered in many small chunks costs
/// linear time.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete line, without its separator or a trailing `\r`.
    pub fn next_line(&mut self) -> Option<Result<String, ProtocolError>> {
        let found = self.buffer[self.scanned..].iter().position(|b| *b == b'\n');
        let Some(pos) = found else {
            self.scanned = self.buffer.len();
            return None;
        };

        let end = self.scanned + pos;
        let mut line = self.buffer.split_to(end);
        self.buffer.advance(1);
        self.scanned = 0;

        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(String::from_utf8(line.to_vec()).map_err(|_| ProtocolError::InvalidUtf8))
    }

    /// Next complete frame. Empty lines are skipped.
    pub fn next_frame(&mut self) -> Option<Result<Frame, ProtocolError>> {
        loop {
            match self.next_line()? {
                Ok(line) if line.is_empty() => continue,
                Ok(line) => return Some(Frame::parse(&line)),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Flush a trailing unterminated frame once the stream has ended.
    pub fn finish(&mut self) -> Option<Result<Frame, ProtocolError>> {
        if self.buffer.is_empty() {
            return None;
        }
        self.buffer.extend_from_slice(b"\n");
        self.next_frame()
    }

    /// Bytes buffered but not yet returned as a line.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
