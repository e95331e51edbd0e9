//! Client-facing error type.
//!
//! Wraps [`SessionError`] and adds the transport/TLS-level failures that can
//! only happen before a [`Session`](msgframe_core::Session) exists yet.

use std::io;

use msgframe_core::SessionError;
use thiserror::Error;

/// Errors surfaced by [`crate::ClientEndpoint`].
#[derive(Error, Debug)]
pub enum ClientError {
    /// The connection attempt did not complete within `ConnectTimeoutSeconds`.
    #[error("timed out connecting to {0}")]
    TimeoutConnecting(String),

    /// The TLS handshake failed.
    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),

    /// The peer refused the connection outright.
    #[error("connection refused: {0}")]
    Refused(String),

    /// An I/O error not covered by the more specific variants above.
    #[error("i/o error: {0}")]
    Io(#[source] std::sync::Arc<io::Error>),

    /// The session state machine rejected an operation or the connection.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Two mutually exclusive message handlers were registered.
    #[error("invalid handler registration: {0}")]
    InvalidHandler(String),
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        Self::Io(std::sync::Arc::new(err))
    }
}
