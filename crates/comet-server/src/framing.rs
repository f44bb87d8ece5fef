//! Per-transport wire formatting.
//!
//! A [`ServerConnection`](crate::ServerConnection) owns one framing and asks
//! it how to render each event. The lifecycle logic is identical across
//! transports; only bytes and thresholds differ.

use std::fmt::Write as _;

use axum::http::StatusCode;
use comet_protocol::{CodecError, Frame, Message, WireCodec, escape};

use crate::config::StreamLimits;

const MIB: usize = 1024 * 1024;

pub trait TransportFraming: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn content_type(&self) -> &'static str;

    fn connect(&self, heartbeat_ms: u64, out: &mut String);

    fn messages(
        &self,
        batch: &[Message],
        codec: &dyn WireCodec,
        out: &mut String,
    ) -> Result<(), CodecError>;

    fn heartbeat(&self, out: &mut String);

    fn terminate(&self, out: &mut String);

    fn refresh(&self, out: &mut String);

    /// Filler that brings `written` up to `required` bytes, if any is needed.
    fn padding(&self, written: usize, required: usize) -> Option<String>;

    /// Padding required when the request does not ask for a specific amount.
    fn default_padding(&self, _user_agent: Option<&str>, _secure: bool) -> usize {
        0
    }

    /// Refresh and hard limits; `None` for unmanaged streams.
    fn limits(&self) -> Option<StreamLimits>;

    fn error_body(&self, status: StatusCode, message: &str) -> String;
}

/// Pick a framing from the request's `Accept` and `User-Agent` headers.
pub fn select(accept: Option<&str>, user_agent: Option<&str>) -> Box<dyn TransportFraming> {
    if accept.is_some_and(|a| a.contains("text/plain")) {
        Box::new(HttpRequestFraming)
    } else if user_agent.is_some_and(|ua| ua.contains("Opera")) {
        Box::new(EventSourceFraming)
    } else {
        Box::new(HtmlFileFraming)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming HTTP request (text/plain)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpRequestFraming;

impl TransportFraming for HttpRequestFraming {
    fn name(&self) -> &'static str {
        "http-request"
    }

    fn content_type(&self) -> &'static str {
        "text/plain; charset=utf-8"
    }

    fn connect(&self, heartbeat_ms: u64, out: &mut String) {
        Frame::Connect { heartbeat: heartbeat_ms }.encode_into(out);
    }

    fn messages(
        &self,
        batch: &[Message],
        codec: &dyn WireCodec,
        out: &mut String,
    ) -> Result<(), CodecError> {
        for message in batch {
            message.to_frame(codec)?.encode_into(out);
        }
        Ok(())
    }

    fn heartbeat(&self, out: &mut String) {
        Frame::Heartbeat.encode_into(out);
    }

    fn terminate(&self, out: &mut String) {
        Frame::Disconnect.encode_into(out);
    }

    fn refresh(&self, out: &mut String) {
        Frame::Refresh.encode_into(out);
    }

    fn padding(&self, written: usize, required: usize) -> Option<String> {
        if written >= required {
            return None;
        }
        let mut pad = "*".repeat(required - written - 1);
        pad.push('\n');
        Some(pad)
    }

    fn default_padding(&self, user_agent: Option<&str>, secure: bool) -> usize {
        // Chrome holds back the first bytes of a streamed response.
        match user_agent {
            Some(ua) if ua.contains("Chrome") => {
                if secure {
                    64
                } else {
                    42
                }
            }
            _ => 0,
        }
    }

    fn limits(&self) -> Option<StreamLimits> {
        Some(StreamLimits::new(MIB, 2 * MIB))
    }

    fn error_body(&self, _status: StatusCode, message: &str) -> String {
        message.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event source (application/x-dom-event-stream)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct EventSourceFraming;

impl EventSourceFraming {
    fn event(out: &mut String, event: char, data: &str) {
        let _ = write!(out, "Event: {event}\ndata: {}\n\n", escape(data));
    }
}

impl TransportFraming for EventSourceFraming {
    fn name(&self) -> &'static str {
        "event-source"
    }

    fn content_type(&self) -> &'static str {
        "application/x-dom-event-stream"
    }

    fn connect(&self, heartbeat_ms: u64, out: &mut String) {
        Self::event(out, 'c', &format!("c{heartbeat_ms}"));
    }

    fn messages(
        &self,
        batch: &[Message],
        codec: &dyn WireCodec,
        out: &mut String,
    ) -> Result<(), CodecError> {
        for message in batch {
            match message {
                Message::Text(text) => Self::event(out, 's', text),
                Message::Object(value) => Self::event(out, 'o', &codec.encode(value)?),
            }
        }
        Ok(())
    }

    fn heartbeat(&self, out: &mut String) {
        Self::event(out, 'c', "h");
    }

    fn terminate(&self, out: &mut String) {
        Self::event(out, 'c', "d");
    }

    fn refresh(&self, out: &mut String) {
        Self::event(out, 'c', "r");
    }

    fn padding(&self, _written: usize, _required: usize) -> Option<String> {
        None
    }

    fn limits(&self) -> Option<StreamLimits> {
        None
    }

    fn error_body(&self, status: StatusCode, message: &str) -> String {
        let mut out = String::new();
        Self::event(&mut out, 'c', &format!("e{} {message}", status.as_u16()));
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTML file (text/html, script callbacks into the parent frame)
// ─────────────────────────────────────────────────────────────────────────────

const HTML_HEAD: &str = "<html><body onload='parent.d()'><script>parent.c(";
const HTML_TAIL: &str = ");var s=parent.s;var o=parent.o;var h=parent.h;</script>";
const HTML_PADDING: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlFileFraming;

/// Escape for a single-quoted JavaScript string literal.
fn escape_script(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\/"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
}

impl TransportFraming for HtmlFileFraming {
    fn name(&self) -> &'static str {
        "html-file"
    }

    fn content_type(&self) -> &'static str {
        "text/html; charset=utf-8"
    }

    fn connect(&self, heartbeat_ms: u64, out: &mut String) {
        out.push_str(HTML_HEAD);
        out.push_str(&heartbeat_ms.to_string());
        out.push_str(HTML_TAIL);
    }

    fn messages(
        &self,
        batch: &[Message],
        codec: &dyn WireCodec,
        out: &mut String,
    ) -> Result<(), CodecError> {
        out.push_str("<script>");
        for message in batch {
            match message {
                Message::Text(text) => {
                    out.push_str("s('");
                    escape_script(text, out);
                }
                Message::Object(value) => {
                    out.push_str("o('");
                    escape_script(&codec.encode(value)?, out);
                }
            }
            out.push_str("');");
        }
        out.push_str("</script>");
        Ok(())
    }

    fn heartbeat(&self, out: &mut String) {
        out.push_str("<script>h();</script>");
    }

    fn terminate(&self, out: &mut String) {
        out.push_str("<script>parent.t();</script>");
    }

    fn refresh(&self, out: &mut String) {
        out.push_str("<script>parent.r();</script>");
    }

    fn padding(&self, written: usize, required: usize) -> Option<String> {
        (written < required).then(|| " ".repeat(required - written))
    }

    fn default_padding(&self, _user_agent: Option<&str>, _secure: bool) -> usize {
        HTML_PADDING
    }

    fn limits(&self) -> Option<StreamLimits> {
        Some(StreamLimits::new(2 * MIB, 4 * MIB))
    }

    fn error_body(&self, status: StatusCode, message: &str) -> String {
        let mut out = format!("<html><script>parent.e({}", status.as_u16());
        if !message.is_empty() {
            out.push_str(",'");
            escape_script(message, &mut out);
            out.push('\'');
        }
        out.push_str(")</script></html>");
        out
    }
}
