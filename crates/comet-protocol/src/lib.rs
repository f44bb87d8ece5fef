//! Comet Push - Frame Protocol
//!
//! Newline-delimited, single-character-tagged frames carried over one
//! held-open HTTP response. This crate is shared by the server (which
//! encodes frames) and the client (which decodes them incrementally).

pub mod codec;
pub mod decoder;
pub mod error;
pub mod frame;

pub use codec::{JsonCodec, Message, WireCodec};
pub use decoder::FrameDecoder;
pub use error::{CodecError, ProtocolError};
pub use frame::{escape, unescape, Frame, tags};
