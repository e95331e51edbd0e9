//! Framer-level error taxonomy.

use thiserror::Error;

/// Result alias used throughout the framing layer.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed the connection before a complete frame was read.
    #[error("peer closed connection mid-frame")]
    PeerClosed,

    /// The header bytes violate the tag/wire-type grammar, declare an
    /// impossible content length, or repeat a field that must be unique.
    #[error("malformed header: {reason}")]
    Malformed {
        /// Human-readable cause, never shown to the remote peer.
        reason: String,
    },

    /// Header or payload declared a size larger than this implementation
    /// allows.
    #[error("payload too large: {size} bytes exceeds limit of {max}")]
    PayloadTooLarge {
        /// Declared size in bytes.
        size: usize,
        /// Configured ceiling in bytes.
        max: usize,
    },

    /// Fewer bytes were available than the header's `ContentLength` claimed.
    #[error("frame truncated: expected {expected} payload bytes, found {actual}")]
    FrameTruncated {
        /// Bytes the header claimed would follow.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },
}

impl ProtocolError {
    /// Construct a [`ProtocolError::Malformed`] from any displayable cause.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed { reason: reason.into() }
    }
}
