//! Events the client endpoint surfaces to its caller.
//!
//! A thin, client-flavored projection of [`SessionEvent`]: `ServerConnected`
//! has no counterpart in `Session` (it fires once the transport and any TLS
//! handshake succeed, before a single frame has been exchanged), and
//! `ExceptionEncountered` reports a handler panic or reader-loop failure that
//! would otherwise have nowhere to go once caught.

use bytes::Bytes;
use msgframe_core::{DisconnectReason, SessionEvent};
use msgframe_proto::{ConversationId, Metadata};

/// Delivered to the caller's event channel as the connection progresses.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The transport (and TLS handshake, if configured) succeeded.
    ServerConnected,
    /// The server ended the connection, or the idle watchdog fired.
    ServerDisconnected {
        /// Why the connection ended.
        reason: DisconnectReason,
    },
    /// The preshared-key handshake succeeded (or none was required).
    AuthenticationSucceeded,
    /// The server rejected the presented preshared key.
    AuthenticationFailed,
    /// The server demands a preshared key before anything else is processed.
    AuthenticationRequired,
    /// A buffered `Normal` message arrived.
    MessageReceived {
        /// Attributes attached by the sender.
        metadata: Metadata,
        /// The full payload.
        payload: Bytes,
    },
    /// A `Normal` message arrived whose payload was streamed rather than
    /// buffered (it cleared `MaxProxiedStreamSize`).
    StreamReceived {
        /// Attributes attached by the sender.
        metadata: Metadata,
        /// Payload length in bytes.
        length: u64,
    },
    /// The server sent a synchronous request of its own (the protocol is
    /// symmetric; most deployments never see this on the client side).
    SyncRequestReceived {
        /// Correlates the eventual response.
        conversation_id: ConversationId,
        /// Deadline, milliseconds since the Unix epoch.
        expiration: i64,
        /// Attributes attached by the sender.
        metadata: Metadata,
        /// The request payload.
        payload: Bytes,
    },
    /// A handler raised an error, or the reader loop hit one it could not
    /// propagate any other way.
    ExceptionEncountered {
        /// Human-readable description of the failure.
        reason: String,
    },
}

impl ClientEvent {
    /// Projects a [`SessionEvent`] onto the client's event surface.
    /// `SessionEvent::SyncResponseArrived` and `MessageReceived`'s streamed
    /// sibling never reach here: `send_and_wait` consumes sync responses
    /// directly, and the streamed payload itself is handed to the caller out
    /// of band by [`crate::ClientEndpoint`]'s reader loop, not through this
    /// channel.
    pub(crate) fn from_session_event(event: SessionEvent) -> Self {
        match event {
            SessionEvent::AuthenticationSucceeded => Self::AuthenticationSucceeded,
            SessionEvent::AuthenticationFailed => Self::AuthenticationFailed,
            SessionEvent::AuthenticationRequired => Self::AuthenticationRequired,
            SessionEvent::Disconnected { reason } => Self::ServerDisconnected { reason },
            SessionEvent::MessageReceived { metadata, payload } => {
                Self::MessageReceived { metadata, payload }
            },
            SessionEvent::StreamAnnounced { metadata, length } => {
                Self::StreamReceived { metadata, length }
            },
            SessionEvent::SyncRequestReceived { conversation_id, expiration, metadata, payload } => {
                Self::SyncRequestReceived { conversation_id, expiration, metadata, payload }
            },
            SessionEvent::SyncResponseArrived { .. } => {
                unreachable!("ClientEndpoint intercepts SyncResponseArrived before projection")
            },
        }
    }
}
