//! Frame tags, encoding and parsing.
//!
//! Every frame is one line: a single tag character followed by an optional
//! payload and terminated by `\n`. Payloads that could contain a newline are
//! escaped so a frame never spans more than one line.

use std::borrow::Cow;

use crate::error::ProtocolError;

/// Leading tag characters.
pub mod tags {
    pub const CONNECT: char = '!';
    pub const DISCONNECT: char = '?';
    pub const HEARTBEAT: char = '#';
    pub const PADDING: char = '*';
    pub const REFRESH: char = ';';
    pub const RAW_TEXT: char = '|';
    pub const ESCAPED_TEXT: char = ']';
    pub const OBJECT: char = '[';
}

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Stream established; the server will write something at least every
    /// `heartbeat` milliseconds.
    Connect { heartbeat: u64 },
    /// Clean disconnect notice. Nothing but the end of the stream may follow.
    Disconnect,
    Heartbeat,
    /// The client should reconnect now, before the stream hits its hard limit.
    Refresh,
    Padding,
    Text(String),
    /// Codec text of an object, already unescaped.
    Object(String),
}

impl Frame {
    /// Append the wire form of this frame, including the trailing newline.
    pub fn encode_into(&self, out: &mut String) {
        match self {
            Frame::Connect { heartbeat } => {
                out.push(tags::CONNECT);
                out.push_str(&heartbeat.to_string());
            }
            Frame::Disconnect => out.push(tags::DISCONNECT),
            Frame::Heartbeat => out.push(tags::HEARTBEAT),
            Frame::Refresh => out.push(tags::REFRESH),
            Frame::Padding => out.push(tags::PADDING),
            Frame::Text(text) => match escape(text) {
                Cow::Borrowed(raw) => {
                    out.push(tags::RAW_TEXT);
                    out.push_str(raw);
                }
                Cow::Owned(escaped) => {
                    out.push(tags::ESCAPED_TEXT);
                    out.push_str(&escaped);
                }
            },
            Frame::Object(text) => {
                out.push(tags::OBJECT);
                out.push_str(&escape(text));
            }
        }
        out.push('\n');
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        self.encode_into(&mut out);
        out
    }

    /// Parse one line (without its terminating newline).
    pub fn parse(line: &str) -> Result<Frame, ProtocolError> {
        let mut chars = line.chars();
        let tag = chars.next().ok_or(ProtocolError::EmptyFrame)?;
        let payload = chars.as_str();

        match tag {
            tags::CONNECT => payload
                .parse::<u64>()
                .map(|heartbeat| Frame::Connect { heartbeat })
                .map_err(|_| ProtocolError::InvalidHeartbeat(payload.to_string())),
            tags::DISCONNECT => Ok(Frame::Disconnect),
            tags::HEARTBEAT => Ok(Frame::Heartbeat),
            tags::REFRESH => Ok(Frame::Refresh),
            tags::PADDING => Ok(Frame::Padding),
            tags::RAW_TEXT => Ok(Frame::Text(payload.to_string())),
            tags::ESCAPED_TEXT => Ok(Frame::Text(unescape(payload)?.into_owned())),
            tags::OBJECT => Ok(Frame::Object(unescape(payload)?.into_owned())),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    /// Whether this frame carries application data.
    pub fn is_data(&self) -> bool {
        matches!(self, Frame::Text(_) | Frame::Object(_))
    }
}

/// Escape `\`, newline and carriage return. Returns the input untouched when
/// none occurs.
///
/// A carriage return must never reach the wire raw: decoders strip one
/// before the line separator.
pub fn escape(text: &str) -> Cow<'_, str> {
    if !text.contains(['\\', '\n', '\r']) {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Reverse [`escape`].
pub fn unescape(text: &str) -> Result<Cow<'_, str>, ProtocolError> {
    if !text.contains('\\') {
        return Ok(Cow::Borrowed(text));
    }

    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices();
    while let Some((offset, c)) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some((_, '\\')) => out.push('\\'),
            Some((_, 'n')) => out.push('\n'),
            Some((_, 'r')) => out.push('\r'),
            _ => return Err(ProtocolError::InvalidEscape { offset }),
        }
    }
    Ok(Cow::Owned(out))
}
