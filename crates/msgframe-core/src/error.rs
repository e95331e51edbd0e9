//! Error taxonomy for the session state machine.
//!
//! Strongly typed so callers can match on the exact failure rather than
//! string-sniffing. `msgframe-client`/`msgframe-server` wrap this in their own
//! transport-aware error type (`Io`, `TlsHandshake`, ...).

use thiserror::Error;

use crate::session::SessionState;

/// Errors raised by the `Session` state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The peer closed the connection before a complete frame was read.
    #[error("peer closed connection")]
    PeerClosed,

    /// A frame violated the wire grammar or a data invariant.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A timeout elapsed: connecting, idle, or a synchronous wait.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The preshared key presented by the client did not match, or was the
    /// wrong length.
    #[error("authentication failed")]
    AuthFailure,

    /// TLS handshake failed.
    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),

    /// An operation was attempted on a session that is not connected.
    #[error("not connected")]
    NotConnected,

    /// A write was rejected because the session is terminating or the
    /// underlying transport rejected it.
    #[error("write rejected: {0}")]
    WriteRejected(String),

    /// The caller passed an invalid argument (wrong PSK length, sync timeout
    /// below the 1000 ms floor, conflicting handler registration, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A message arrived that is not valid for the session's current state.
    #[error("unexpected message with status {status:?} while in state {state:?}")]
    InvalidState {
        /// The session's state at the time.
        state: SessionState,
        /// The status code of the message that triggered the error.
        status: msgframe_proto::Status,
    },

    /// A synchronous request or response reused a conversation id that is
    /// already registered; this is a protocol violation and the connection
    /// must be terminated.
    #[error("duplicate conversation id")]
    DuplicateConversationId,
}

impl SessionError {
    /// Returns `true` if this error is transient and may resolve on retry
    /// (as opposed to a protocol violation from a broken or malicious peer).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<msgframe_proto::ProtocolError> for SessionError {
    fn from(err: msgframe_proto::ProtocolError) -> Self {
        match err {
            msgframe_proto::ProtocolError::PeerClosed => Self::PeerClosed,
            other => Self::Malformed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_transient() {
        assert!(SessionError::Timeout("idle".to_string()).is_transient());
    }

    #[test]
    fn protocol_violations_are_not_transient() {
        assert!(!SessionError::Malformed("bad tag".to_string()).is_transient());
        assert!(!SessionError::AuthFailure.is_transient());
        assert!(!SessionError::DuplicateConversationId.is_transient());
    }
}
