//! Events the server endpoint surfaces to its caller.
//!
//! Mirrors `msgframe_client::ClientEvent`'s shape -- a thin projection of
//! [`SessionEvent`] -- but every variant carries the originating `peer`
//! (`"ip:port"`), since one channel now fans in from every connected
//! client instead of one connection owning the whole channel.

use bytes::Bytes;
use msgframe_core::{DisconnectReason, SessionEvent};
use msgframe_proto::{ConversationId, Metadata};

/// Delivered to the caller's event channel as clients connect, authenticate,
/// send, and disconnect.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new TCP (and TLS, if configured) connection was accepted and
    /// passed the `PermittedIPs`/`MaxConnections` checks.
    ClientConnected {
        /// The client's address, `"ip:port"`.
        peer: String,
    },
    /// A client's session ended, whether by its own choice, a protocol
    /// error, or the idle watchdog.
    ClientDisconnected {
        /// The client's address, `"ip:port"`.
        peer: String,
        /// Why the connection ended.
        reason: DisconnectReason,
    },
    /// A client presented a preshared key that matched the configured one.
    AuthenticationSucceeded {
        /// The client's address, `"ip:port"`.
        peer: String,
    },
    /// A client presented a preshared key that did not match.
    AuthenticationFailed {
        /// The client's address, `"ip:port"`.
        peer: String,
    },
    /// A buffered `Normal` message arrived from `peer`.
    MessageReceived {
        /// The client's address, `"ip:port"`.
        peer: String,
        /// Attributes attached by the sender.
        metadata: Metadata,
        /// The full payload.
        payload: Bytes,
    },
    /// A `Normal` message arrived whose payload cleared
    /// `MaxProxiedStreamSize` and would have been streamed had a streamed
    /// handler been registered for `peer`.
    StreamReceived {
        /// The client's address, `"ip:port"`.
        peer: String,
        /// Attributes attached by the sender.
        metadata: Metadata,
        /// Payload length in bytes.
        length: u64,
    },
    /// `peer` sent a synchronous request.
    SyncRequestReceived {
        /// The client's address, `"ip:port"`.
        peer: String,
        /// Correlates the eventual response via
        /// [`crate::ServerEndpoint::send_sync_response`].
        conversation_id: ConversationId,
        /// Deadline, milliseconds since the Unix epoch.
        expiration: i64,
        /// Attributes attached by the sender.
        metadata: Metadata,
        /// The request payload.
        payload: Bytes,
    },
    /// Something went wrong handling `peer` that could not be turned into a
    /// more specific event (a write failure delivering a queued action,
    /// a malformed frame, ...).
    ExceptionEncountered {
        /// The client's address, `"ip:port"`, if the failure is
        /// attributable to one connection.
        peer: Option<String>,
        /// Human-readable description of the failure.
        reason: String,
    },
}

impl ServerEvent {
    /// Projects a [`SessionEvent`] for `peer` onto the server's event
    /// surface. `SyncResponseArrived` never reaches here: a server
    /// receiving its own sync response (the protocol is symmetric; this
    /// happens when the server itself called `send_and_wait`) is consumed
    /// directly by `ServerEndpoint::send_and_wait`, the same way the client
    /// intercepts it.
    pub(crate) fn from_session_event(peer: &str, event: SessionEvent) -> Self {
        match event {
            SessionEvent::AuthenticationSucceeded => {
                Self::AuthenticationSucceeded { peer: peer.to_owned() }
            },
            SessionEvent::AuthenticationFailed => {
                Self::AuthenticationFailed { peer: peer.to_owned() }
            },
            SessionEvent::AuthenticationRequired => {
                // The server is the side that ever sends AuthRequired; it
                // never receives one, so this arm only exists to keep the
                // match exhaustive against `SessionEvent` for both roles.
                Self::ExceptionEncountered {
                    peer: Some(peer.to_owned()),
                    reason: "unexpected AuthenticationRequired on a server session".to_owned(),
                }
            },
            SessionEvent::Disconnected { reason } => {
                Self::ClientDisconnected { peer: peer.to_owned(), reason }
            },
            SessionEvent::MessageReceived { metadata, payload } => {
                Self::MessageReceived { peer: peer.to_owned(), metadata, payload }
            },
            SessionEvent::StreamAnnounced { metadata, length } => {
                Self::StreamReceived { peer: peer.to_owned(), metadata, length }
            },
            SessionEvent::SyncRequestReceived { conversation_id, expiration, metadata, payload } => {
                Self::SyncRequestReceived {
                    peer: peer.to_owned(),
                    conversation_id,
                    expiration,
                    metadata,
                    payload,
                }
            },
            SessionEvent::SyncResponseArrived { .. } => {
                unreachable!("ServerEndpoint intercepts SyncResponseArrived before projection")
            },
        }
    }
}
