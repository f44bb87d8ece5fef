//! Application messages and the codec contract for object payloads.

use std::fmt;

use serde_json::Value;

use crate::error::CodecError;
use crate::frame::Frame;

/// One application message. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Object(Value),
}

impl Message {
    /// Convert to a data frame, encoding objects with `codec`.
    pub fn to_frame(&self, codec: &dyn WireCodec) -> Result<Frame, CodecError> {
        match self {
            Message::Text(text) => Ok(Frame::Text(text.clone())),
            Message::Object(value) => codec.encode(value).map(Frame::Object),
        }
    }

    /// Convert a data frame back into a message. Control frames yield `None`.
    pub fn from_frame(frame: Frame, codec: &dyn WireCodec) -> Option<Result<Message, CodecError>> {
        match frame {
            Frame::Text(text) => Some(Ok(Message::Text(text))),
            Frame::Object(text) => Some(codec.decode(&text).map(Message::Object)),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Object(_) => None,
        }
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message::Object(value)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Text(text) => f.write_str(text),
            Message::Object(value) => write!(f, "{value}"),
        }
    }
}

/// Turns objects into text for the wire and back.
///
/// Both ends of a stream must agree on the codec.
pub trait WireCodec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<String, CodecError>;
    fn decode(&self, text: &str) -> Result<Value, CodecError>;
}

/// JSON codec, the default on both ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        serde_json::to_string(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, text: &str) -> Result<Value, CodecError> {
        serde_json::from_str(text).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
