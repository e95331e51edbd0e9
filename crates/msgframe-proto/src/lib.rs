//! Length-prefixed TLV framing for the msgframe wire protocol.
//!
//! A message on the wire is `[4-byte LE header length][TLV header][payload]`.
//! This crate owns that format exclusively: encoding, decoding, and the
//! header field types (`Status`, `Compression`, `Metadata`, `ConversationId`).
//! It has no knowledge of sockets, sessions, or authentication semantics —
//! those live in `msgframe-core` and above.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod errors;
mod frame;
mod header;
mod varint;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::{
    Compression, ConversationId, Header, Metadata, MetadataValue, Status, MAX_CONTENT_LENGTH,
    MAX_HEADER_LENGTH,
};
