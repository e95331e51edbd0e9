//! Server-facing error type.
//!
//! A single `thiserror`-derived `ServerError` covering the driver,
//! transport, and registry layers in one place, matching
//! `msgframe-client::ClientError`'s shape.

use std::io;

use msgframe_core::SessionError;
use thiserror::Error;

/// Errors surfaced by [`crate::ServerEndpoint`].
#[derive(Error, Debug)]
pub enum ServerError {
    /// The bind address could not be parsed or bound.
    #[error("failed to bind {0}: {1}")]
    Bind(String, String),

    /// Loading or applying the TLS configuration failed.
    #[error("tls configuration error: {0}")]
    TlsConfig(String),

    /// A per-connection TLS handshake failed.
    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),

    /// An I/O error not covered by the more specific variants above.
    #[error("i/o error: {0}")]
    Io(#[source] std::sync::Arc<io::Error>),

    /// The session state machine rejected an operation or a connection.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The caller addressed a peer that is not currently connected.
    #[error("no such client: {0}")]
    UnknownPeer(String),

    /// Two mutually exclusive message handlers were registered.
    #[error("invalid handler registration: {0}")]
    InvalidHandler(String),
}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> Self {
        Self::Io(std::sync::Arc::new(err))
    }
}
