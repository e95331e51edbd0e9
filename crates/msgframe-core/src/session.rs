//! The session state machine.
//!
//! `Session` is sans-IO: every method takes the current time explicitly and
//! returns a list of [`SessionAction`]s for the caller to carry out (write a
//! frame, tear down the transport, hand an event to the application). It
//! never touches a socket, a clock, or an RNG directly, which is what makes
//! it exhaustively unit-testable without a network.
//!
//! ```text
//!                    ┌─────────┐
//!        (connected) │ PreAuth │
//!            ┌───────┴────┬────┴───────────┐
//!            │ AuthRequired (client only)   │ no PSK configured
//!            ▼                              ▼
//!     ┌─────────────┐                   ┌────────┐
//!     │Authenticating│──AuthFailure────▶│Terminating│
//!     └──────┬───────┘                   └────┬────┘
//!            │AuthSuccess                      │
//!            ▼                                 ▼
//!        ┌────────┐     disconnect()/Removed/Shutdown
//!        │ Steady │─────────────────────────▶ Closed
//!        └────────┘
//! ```
//!
//! The server side of the handshake never passes through `Authenticating`:
//! it stays in `PreAuth`, silently discarding `Normal`/sync traffic, until it
//! sees `AuthRequested` and answers with `AuthSuccess` or `AuthFailure`.

use std::ops::Sub;
use std::time::Duration;

use msgframe_proto::{ConversationId, Frame, Header, Metadata, Status};

use crate::error::SessionError;

/// Which side of the wire this session represents.
///
/// The two roles share one state machine because the wire grammar and most
/// of the transition logic is identical; only the authentication handshake
/// and who may send `AuthRequired` differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that initiated the TCP connection.
    Client,
    /// The side that accepted the TCP connection.
    Server,
}

/// The session's position in the handshake/lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport is up; authentication has not completed (or is not
    /// required).
    PreAuth,
    /// Client has sent `AuthRequested` and is waiting on `AuthSuccess` or
    /// `AuthFailure`. Server sessions never enter this state.
    Authenticating,
    /// Fully authenticated (or no authentication was required). Normal and
    /// synchronous traffic flows freely.
    Steady,
    /// A close has been initiated; no further sends are accepted.
    Terminating,
    /// The transport is gone.
    Closed,
}

/// Why a session ended, carried on the wire via [`Status`] and surfaced to
/// the application in [`SessionEvent::Disconnected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A clean, voluntary close by either side.
    Normal,
    /// The server forcibly evicted this peer.
    Removed,
    /// The idle-timeout watchdog fired.
    Timeout,
    /// The server is shutting down.
    Shutdown,
    /// The preshared key handshake failed.
    AuthFailure,
}

/// Inbound message bytes, classified by how `ConnectionIO` chose to deliver
/// them.
///
/// `Streamed` carries no bytes: the bounded reader is wired directly from
/// `ConnectionIO` to the application's streamed handler, bypassing `Session`
/// entirely, so the state machine only needs to know that it happened.
#[derive(Debug)]
pub enum InboundPayload {
    /// The payload was fully read into memory before `Session` saw it.
    Buffered(bytes::Bytes),
    /// The payload is being streamed directly to a registered streamed
    /// handler and is not available here.
    Streamed {
        /// Payload length, for the announcement event.
        length: u64,
    },
}

/// Events the application observes. `ClientEndpoint` and `ServerEndpoint`
/// each expose only the subset relevant to their role; `Session` itself
/// does not distinguish.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The handshake finished successfully (or no PSK was required).
    AuthenticationSucceeded,
    /// The server rejected the presented preshared key.
    AuthenticationFailed,
    /// The peer demands a preshared key before anything else is processed.
    AuthenticationRequired,
    /// The session ended.
    Disconnected {
        /// Why it ended.
        reason: DisconnectReason,
    },
    /// A buffered `Normal` message arrived.
    MessageReceived {
        /// Attributes attached by the sender.
        metadata: Metadata,
        /// The full payload.
        payload: bytes::Bytes,
    },
    /// A `Normal` message is being delivered to a streamed handler; the
    /// bytes themselves do not pass through this event.
    StreamAnnounced {
        /// Attributes attached by the sender.
        metadata: Metadata,
        /// Payload length in bytes.
        length: u64,
    },
    /// A synchronous request arrived and has not expired.
    SyncRequestReceived {
        /// Correlates the eventual response.
        conversation_id: ConversationId,
        /// Deadline, milliseconds since the Unix epoch.
        expiration: i64,
        /// Attributes attached by the sender.
        metadata: Metadata,
        /// The request payload.
        payload: bytes::Bytes,
    },
    /// A synchronous response arrived and has not expired.
    SyncResponseArrived {
        /// Correlates the original request.
        conversation_id: ConversationId,
        /// Attributes attached by the sender.
        metadata: Metadata,
        /// The response payload.
        payload: bytes::Bytes,
    },
}

/// A side effect the caller must carry out. `Session` produces these; it
/// never performs I/O itself.
#[derive(Debug, Clone)]
pub enum SessionAction {
    /// Write this frame to the transport.
    SendFrame(Frame),
    /// Tear down the transport and stop reading.
    CloseTransport,
    /// Hand this event to the application.
    Emit(SessionEvent),
}

/// Configuration the session needs to run the handshake and the idle
/// watchdog. Transport-level concerns (TLS, connect timeout) live one layer
/// up in the endpoint types.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The preshared key the server demands before leaving `PreAuth`.
    /// `None` means no authentication is required. Ignored on client
    /// sessions (the client presents whatever key the caller passes to
    /// [`Session::authenticate`]).
    pub required_preshared_key: Option<[u8; 16]>,
    /// How long the session may go without a decoded inbound message before
    /// `tick` reports a timeout. Zero disables the watchdog.
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { required_preshared_key: None, idle_timeout: Duration::from_secs(300) }
    }
}

/// What `ConnectionIO` should do with the payload bytes that follow a
/// decoded header, before it has read any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDecision {
    /// Always buffer: control and synchronous messages are small and the
    /// state machine needs the full payload to dispatch them.
    MustBuffer,
    /// May be streamed to a registered streamed handler instead of
    /// buffered, at `ConnectionIO`'s discretion (size threshold, handler
    /// kind).
    MayStream,
}

/// Classifies a decoded header for delivery-mode purposes, ahead of reading
/// any payload bytes. Sync and control messages always buffer; only
/// `Normal` application data may stream.
#[must_use]
pub fn on_header(header: &Header) -> HeaderDecision {
    if header.status == Status::Normal && !header.sync_request && !header.sync_response {
        HeaderDecision::MayStream
    } else {
        HeaderDecision::MustBuffer
    }
}

/// The session state machine. Generic over the clock type so tests can run
/// against a virtual clock (see `connection_io.rs`'s test module for the
/// concrete I/O-driving counterpart); production code uses
/// `RealEnvironment::Instant` (`std::time::Instant`).
pub struct Session<I> {
    role: Role,
    state: SessionState,
    config: SessionConfig,
    peer: String,
    last_activity: I,
}

impl<I> Session<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Creates a new session immediately after the transport (and, if
    /// configured, the TLS handshake) is established.
    #[must_use]
    pub fn new(role: Role, peer: impl Into<String>, config: SessionConfig, now: I) -> Self {
        Self { role, state: SessionState::PreAuth, config, peer: peer.into(), last_activity: now }
    }

    /// The session's current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The role this session plays.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// A human-readable identifier for the remote side (address or a
    /// server-assigned name), used for logging and `ServerEndpoint`'s
    /// registry key.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// `true` once the session is ready to carry `Normal`/sync traffic in
    /// both directions.
    #[must_use]
    pub fn is_steady(&self) -> bool {
        self.state == SessionState::Steady
    }

    /// Server-side entry point, called once right after accept. If a
    /// preshared key is configured it announces `AuthRequired`; otherwise
    /// the session moves straight to `Steady`.
    pub fn server_begin(&mut self) -> Vec<SessionAction> {
        debug_assert_eq!(self.role, Role::Server);
        if self.config.required_preshared_key.is_some() {
            let header = Header { status: Status::AuthRequired, ..Header::default() };
            let frame = Frame::new(header, Vec::new()).unwrap_or_else(|_| unreachable_frame());
            vec![SessionAction::SendFrame(frame)]
        } else {
            self.state = SessionState::Steady;
            vec![SessionAction::Emit(SessionEvent::AuthenticationSucceeded)]
        }
    }

    /// Client-side entry point: presents `psk` to the server.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidArgument`] if `psk` is not 16 bytes, or
    /// [`SessionError::InvalidState`] if the session is not in `PreAuth`.
    pub fn authenticate(&mut self, psk: &[u8]) -> Result<Vec<SessionAction>, SessionError> {
        debug_assert_eq!(self.role, Role::Client);
        if self.state != SessionState::PreAuth {
            return Err(SessionError::InvalidState {
                state: self.state,
                status: Status::AuthRequested,
            });
        }
        let key: [u8; 16] = psk
            .try_into()
            .map_err(|_| SessionError::InvalidArgument("preshared key must be 16 bytes".into()))?;

        let header = Header {
            status: Status::AuthRequested,
            preshared_key: Some(key),
            ..Header::default()
        };
        let frame = Frame::new(header, Vec::new())
            .map_err(|e| SessionError::Malformed(e.to_string()))?;

        self.state = SessionState::Authenticating;
        Ok(vec![SessionAction::SendFrame(frame)])
    }

    /// Ends the session, sending `Shutdown` and closing the transport.
    /// Idempotent: a second call returns [`SessionError::NotConnected`]
    /// rather than sending a second frame. `reason` is carried only on the
    /// locally emitted [`SessionEvent::Disconnected`] -- a voluntary local
    /// close passes [`DisconnectReason::Normal`], while a server evicting a
    /// peer passes [`DisconnectReason::Removed`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] if the session is already
    /// `Terminating` or `Closed`.
    pub fn disconnect(
        &mut self,
        reason: DisconnectReason,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if matches!(self.state, SessionState::Terminating | SessionState::Closed) {
            return Err(SessionError::NotConnected);
        }
        self.state = SessionState::Terminating;
        let header = Header { status: Status::Shutdown, ..Header::default() };
        let frame =
            Frame::new(header, Vec::new()).map_err(|e| SessionError::Malformed(e.to_string()))?;
        Ok(vec![
            SessionAction::SendFrame(frame),
            SessionAction::CloseTransport,
            SessionAction::Emit(SessionEvent::Disconnected { reason }),
        ])
    }

    /// Idle-timeout watchdog. Call periodically (driven by `ConnectionIO`'s
    /// reader loop, at `config.idle_timeout / 2` or so) with the current
    /// time. Once `idle_timeout` has elapsed since the last decoded inbound
    /// message, sends `{Status=Timeout}` so the peer observes why the
    /// connection is closing, then tears down the transport locally.
    pub fn tick(&mut self, now: I) -> Vec<SessionAction> {
        if self.config.idle_timeout.is_zero() {
            return Vec::new();
        }
        let since_last_activity = now - self.last_activity;
        if since_last_activity < self.config.idle_timeout {
            return Vec::new();
        }
        if matches!(self.state, SessionState::Terminating | SessionState::Closed) {
            return Vec::new();
        }
        self.state = SessionState::Terminating;
        let header = Header { status: Status::Timeout, ..Header::default() };
        let frame = Frame::new(header, Vec::new()).unwrap_or_else(|_| unreachable_frame());
        vec![
            SessionAction::SendFrame(frame),
            SessionAction::CloseTransport,
            SessionAction::Emit(SessionEvent::Disconnected { reason: DisconnectReason::Timeout }),
        ]
    }

    /// Builds the `AuthSuccess`/`AuthFailure` or `Shutdown`/`Removed`
    /// response actions a [`Status`]-only control frame requires.
    fn handle_control(&mut self, status: Status) -> Result<Vec<SessionAction>, SessionError> {
        match status {
            Status::Removed => {
                self.state = SessionState::Closed;
                Ok(vec![
                    SessionAction::CloseTransport,
                    SessionAction::Emit(SessionEvent::Disconnected {
                        reason: DisconnectReason::Removed,
                    }),
                ])
            },
            Status::Shutdown => {
                self.state = SessionState::Closed;
                Ok(vec![
                    SessionAction::CloseTransport,
                    SessionAction::Emit(SessionEvent::Disconnected {
                        reason: DisconnectReason::Normal,
                    }),
                ])
            },
            Status::Timeout => {
                self.state = SessionState::Closed;
                Ok(vec![
                    SessionAction::CloseTransport,
                    SessionAction::Emit(SessionEvent::Disconnected {
                        reason: DisconnectReason::Timeout,
                    }),
                ])
            },
            Status::AuthSuccess => {
                if self.role != Role::Client || self.state != SessionState::Authenticating {
                    return Err(SessionError::InvalidState { state: self.state, status });
                }
                self.state = SessionState::Steady;
                Ok(vec![SessionAction::Emit(SessionEvent::AuthenticationSucceeded)])
            },
            Status::AuthFailure => {
                if self.role != Role::Client || self.state != SessionState::Authenticating {
                    return Err(SessionError::InvalidState { state: self.state, status });
                }
                self.state = SessionState::Terminating;
                Ok(vec![
                    SessionAction::CloseTransport,
                    SessionAction::Emit(SessionEvent::AuthenticationFailed),
                    SessionAction::Emit(SessionEvent::Disconnected {
                        reason: DisconnectReason::AuthFailure,
                    }),
                ])
            },
            Status::AuthRequired => {
                if self.role != Role::Client {
                    return Err(SessionError::InvalidState { state: self.state, status });
                }
                Ok(vec![SessionAction::Emit(SessionEvent::AuthenticationRequired)])
            },
            Status::Heartbeat | Status::Success | Status::Failure | Status::Normal => {
                // Not reached: the caller only routes here for the
                // control-status subset above; anything else falls through
                // to on_message's Normal-handling branch.
                Ok(Vec::new())
            },
        }
    }

    /// Server-side: validates a presented preshared key and answers with
    /// `AuthSuccess` or `AuthFailure`.
    fn handle_auth_requested(&mut self, header: &Header) -> Result<Vec<SessionAction>, SessionError> {
        debug_assert_eq!(self.role, Role::Server);
        let presented = header.preshared_key.unwrap_or([0; 16]);
        let expected = self.config.required_preshared_key.unwrap_or([0; 16]);
        // Constant-time-ish comparison is not a concern here: both sides
        // already trust the transport's confidentiality (TLS, when
        // configured); this is a membership check, not a cryptographic MAC.
        if presented == expected && self.config.required_preshared_key.is_some() {
            self.state = SessionState::Steady;
            let response = Header { status: Status::AuthSuccess, ..Header::default() };
            let frame = Frame::new(response, Vec::new())
                .map_err(|e| SessionError::Malformed(e.to_string()))?;
            Ok(vec![
                SessionAction::SendFrame(frame),
                SessionAction::Emit(SessionEvent::AuthenticationSucceeded),
            ])
        } else {
            self.state = SessionState::Terminating;
            let response = Header { status: Status::AuthFailure, ..Header::default() };
            let frame = Frame::new(response, Vec::new())
                .map_err(|e| SessionError::Malformed(e.to_string()))?;
            Ok(vec![
                SessionAction::SendFrame(frame),
                SessionAction::CloseTransport,
                SessionAction::Emit(SessionEvent::AuthenticationFailed),
                SessionAction::Emit(SessionEvent::Disconnected {
                    reason: DisconnectReason::AuthFailure,
                }),
            ])
        }
    }

    /// `true` while the server must silently discard `Normal`/sync traffic
    /// from a client that has not yet authenticated.
    fn gating_unauthenticated_client(&self) -> bool {
        self.role == Role::Server
            && self.state == SessionState::PreAuth
            && self.config.required_preshared_key.is_some()
    }

    /// Dispatches one decoded inbound message. `now_millis` is the
    /// receiver's current wall-clock time, used to evaluate `Expiration` on
    /// synchronous messages.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] if the message is not valid
    /// for the session's current role/state (e.g. a server receiving
    /// `AuthRequired`, or `AuthSuccess` outside `Authenticating`).
    pub fn on_message(
        &mut self,
        header: &Header,
        payload: InboundPayload,
        now: I,
        now_millis: i64,
    ) -> Result<Vec<SessionAction>, SessionError> {
        self.last_activity = now;
        match header.status {
            Status::Removed
            | Status::Shutdown
            | Status::Timeout
            | Status::AuthSuccess
            | Status::AuthFailure
            | Status::AuthRequired => self.handle_control(header.status),
            Status::AuthRequested => {
                if self.role != Role::Server {
                    return Err(SessionError::InvalidState {
                        state: self.state,
                        status: header.status,
                    });
                }
                self.handle_auth_requested(header)
            },
            Status::Heartbeat | Status::Success | Status::Failure | Status::Normal => {
                if self.gating_unauthenticated_client() {
                    return Ok(Vec::new());
                }
                self.dispatch_data_message(header, payload, now_millis)
            },
        }
    }

    /// Routes a `Normal`-class message once past the auth gate: a
    /// synchronous request, a synchronous response, or plain application
    /// data (buffered or streamed).
    fn dispatch_data_message(
        &mut self,
        header: &Header,
        payload: InboundPayload,
        now_millis: i64,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if header.sync_request {
            let Some(expiration) = header.expiration else {
                return Err(SessionError::Malformed("SyncRequest missing Expiration".into()));
            };
            let Some(conversation_id) = header.conversation_id else {
                return Err(SessionError::Malformed("SyncRequest missing ConversationId".into()));
            };
            if now_millis >= expiration {
                return Ok(Vec::new());
            }
            let InboundPayload::Buffered(payload) = payload else {
                return Err(SessionError::Malformed("SyncRequest must be buffered".into()));
            };
            return Ok(vec![SessionAction::Emit(SessionEvent::SyncRequestReceived {
                conversation_id,
                expiration,
                metadata: header.metadata.clone(),
                payload,
            })]);
        }

        if header.sync_response {
            let Some(conversation_id) = header.conversation_id else {
                return Err(SessionError::Malformed("SyncResponse missing ConversationId".into()));
            };
            if let Some(expiration) = header.expiration {
                if now_millis >= expiration {
                    return Ok(Vec::new());
                }
            }
            let InboundPayload::Buffered(payload) = payload else {
                return Err(SessionError::Malformed("SyncResponse must be buffered".into()));
            };
            return Ok(vec![SessionAction::Emit(SessionEvent::SyncResponseArrived {
                conversation_id,
                metadata: header.metadata.clone(),
                payload,
            })]);
        }

        match payload {
            InboundPayload::Buffered(payload) => {
                Ok(vec![SessionAction::Emit(SessionEvent::MessageReceived {
                    metadata: header.metadata.clone(),
                    payload,
                })])
            },
            InboundPayload::Streamed { length } => {
                Ok(vec![SessionAction::Emit(SessionEvent::StreamAnnounced {
                    metadata: header.metadata.clone(),
                    length,
                })])
            },
        }
    }

    /// Builds the outbound frame for a plain application message.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::WriteRejected`] if the session is not
    /// `Steady` (for a server session still in `PreAuth`, or either role
    /// once terminating/closed).
    pub fn send_normal(
        &self,
        payload: impl Into<bytes::Bytes>,
        metadata: Metadata,
    ) -> Result<SessionAction, SessionError> {
        self.require_steady()?;
        let header = Header { status: Status::Normal, metadata, ..Header::default() };
        let frame = Frame::new(header, payload.into())
            .map_err(|e| SessionError::Malformed(e.to_string()))?;
        Ok(SessionAction::SendFrame(frame))
    }

    /// Builds the outbound frame for a synchronous request.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::WriteRejected`] if not `Steady`.
    pub fn send_sync_request(
        &self,
        conversation_id: ConversationId,
        now_millis: i64,
        timeout: Duration,
        payload: impl Into<bytes::Bytes>,
        metadata: Metadata,
    ) -> Result<SessionAction, SessionError> {
        self.require_steady()?;
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let expiration = now_millis + timeout.as_millis() as i64;
        let header = Header {
            status: Status::Normal,
            sync_request: true,
            sender_timestamp: Some(now_millis),
            expiration: Some(expiration),
            conversation_id: Some(conversation_id),
            metadata,
            ..Header::default()
        };
        let frame = Frame::new(header, payload.into())
            .map_err(|e| SessionError::Malformed(e.to_string()))?;
        Ok(SessionAction::SendFrame(frame))
    }

    /// Builds the outbound frame answering a synchronous request.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::WriteRejected`] if not `Steady`.
    pub fn send_sync_response(
        &self,
        conversation_id: ConversationId,
        payload: impl Into<bytes::Bytes>,
        metadata: Metadata,
    ) -> Result<SessionAction, SessionError> {
        self.require_steady()?;
        let header = Header {
            status: Status::Normal,
            sync_response: true,
            conversation_id: Some(conversation_id),
            metadata,
            ..Header::default()
        };
        let frame = Frame::new(header, payload.into())
            .map_err(|e| SessionError::Malformed(e.to_string()))?;
        Ok(SessionAction::SendFrame(frame))
    }

    fn require_steady(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Steady {
            Ok(())
        } else {
            Err(SessionError::WriteRejected(format!("session is in state {:?}", self.state)))
        }
    }
}

/// `Header::default()` with an empty payload always validates; this only
/// exists to give `server_begin`/`handle_control` an infallible path without
/// sprinkling `expect` through the happy path.
fn unreachable_frame() -> Frame {
    Frame::new(Header::default(), Vec::new()).unwrap_or_else(|_| {
        // `Header::default()` is always valid, so `Frame::new` cannot fail
        // here; this arm exists only to avoid `unwrap` in non-test code.
        Frame { header: Header::default(), payload: bytes::Bytes::new() }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use msgframe_proto::MetadataValue;

    use super::*;

    /// A trivial monotonic clock for tests: ticks expressed in milliseconds
    /// from an arbitrary epoch, satisfying the same bounds `RealEnvironment`
    /// meets with `std::time::Instant`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    struct MockInstant(u64);

    impl Sub for MockInstant {
        type Output = Duration;
        fn sub(self, rhs: Self) -> Duration {
            Duration::from_millis(self.0.saturating_sub(rhs.0))
        }
    }

    fn at(ms: u64) -> MockInstant {
        MockInstant(ms)
    }

    fn psk_config(key: [u8; 16]) -> SessionConfig {
        SessionConfig { required_preshared_key: Some(key), idle_timeout: Duration::from_secs(60) }
    }

    #[test]
    fn server_without_psk_goes_straight_to_steady() {
        let mut session =
            Session::new(Role::Server, "127.0.0.1:1", SessionConfig::default(), at(0));
        let actions = session.server_begin();
        assert_eq!(session.state(), SessionState::Steady);
        assert!(matches!(actions[0], SessionAction::Emit(SessionEvent::AuthenticationSucceeded)));
    }

    #[test]
    fn server_with_psk_announces_auth_required() {
        let mut session =
            Session::new(Role::Server, "127.0.0.1:1", psk_config([1; 16]), at(0));
        let actions = session.server_begin();
        assert_eq!(session.state(), SessionState::PreAuth);
        match &actions[0] {
            SessionAction::SendFrame(frame) => assert_eq!(frame.header.status, Status::AuthRequired),
            other => panic!("expected SendFrame, got {other:?}"),
        }
    }

    #[test]
    fn client_authenticate_then_success() {
        let mut session = Session::new(Role::Client, "server", SessionConfig::default(), at(0));
        let actions = session.authenticate(&[9; 16]).expect("should authenticate");
        assert_eq!(session.state(), SessionState::Authenticating);
        match &actions[0] {
            SessionAction::SendFrame(frame) => {
                assert_eq!(frame.header.status, Status::AuthRequested);
                assert_eq!(frame.header.preshared_key, Some([9; 16]));
            },
            other => panic!("expected SendFrame, got {other:?}"),
        }

        let success_header = Header { status: Status::AuthSuccess, ..Header::default() };
        let events = session
            .on_message(&success_header, InboundPayload::Buffered(bytes::Bytes::new()), at(1), 0)
            .expect("should accept AuthSuccess");
        assert_eq!(session.state(), SessionState::Steady);
        assert!(matches!(
            events[0],
            SessionAction::Emit(SessionEvent::AuthenticationSucceeded)
        ));
    }

    #[test]
    fn client_authenticate_wrong_length_is_rejected() {
        let mut session = Session::new(Role::Client, "server", SessionConfig::default(), at(0));
        let err = session.authenticate(&[9; 8]).unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument(_)));
    }

    #[test]
    fn server_rejects_wrong_preshared_key() {
        let mut session = Session::new(Role::Server, "client", psk_config([1; 16]), at(0));
        session.server_begin();

        let request = Header {
            status: Status::AuthRequested,
            preshared_key: Some([2; 16]),
            ..Header::default()
        };
        let actions = session
            .on_message(&request, InboundPayload::Buffered(bytes::Bytes::new()), at(1), 0)
            .expect("handles auth request");
        assert_eq!(session.state(), SessionState::Terminating);
        assert!(actions.iter().any(|a| matches!(
            a,
            SessionAction::SendFrame(f) if f.header.status == Status::AuthFailure
        )));
    }

    #[test]
    fn unauthenticated_normal_message_is_silently_discarded() {
        let mut session = Session::new(Role::Server, "client", psk_config([1; 16]), at(0));
        session.server_begin();

        let header = Header::normal(0);
        let actions = session
            .on_message(&header, InboundPayload::Buffered(bytes::Bytes::new()), at(1), 0)
            .expect("discard, not error");
        assert!(actions.is_empty());
        assert_eq!(session.state(), SessionState::PreAuth);
    }

    #[test]
    fn expired_sync_request_is_dropped() {
        let mut session = Session::new(Role::Server, "client", SessionConfig::default(), at(0));
        session.server_begin();

        let header = Header {
            status: Status::Normal,
            sync_request: true,
            sender_timestamp: Some(0),
            expiration: Some(100),
            conversation_id: Some(ConversationId::from_bytes([3; 16])),
            ..Header::default()
        };
        let actions = session
            .on_message(&header, InboundPayload::Buffered(bytes::Bytes::new()), at(1), 500)
            .expect("expired request is just dropped");
        assert!(actions.is_empty());
    }

    #[test]
    fn live_sync_request_is_emitted() {
        let mut session = Session::new(Role::Server, "client", SessionConfig::default(), at(0));
        session.server_begin();

        let mut metadata = HashMap::new();
        metadata.insert("k".to_string(), MetadataValue::Bool(true));

        let header = Header {
            status: Status::Normal,
            sync_request: true,
            sender_timestamp: Some(0),
            expiration: Some(10_000),
            conversation_id: Some(ConversationId::from_bytes([3; 16])),
            metadata,
            ..Header::default()
        };
        let actions = session
            .on_message(
                &header,
                InboundPayload::Buffered(bytes::Bytes::from_static(b"hi")),
                at(1),
                500,
            )
            .expect("live request is emitted");
        assert!(matches!(
            actions[0],
            SessionAction::Emit(SessionEvent::SyncRequestReceived { .. })
        ));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut session = Session::new(Role::Client, "server", SessionConfig::default(), at(0));
        session.authenticate(&[1; 16]).unwrap();
        let success = Header { status: Status::AuthSuccess, ..Header::default() };
        session
            .on_message(&success, InboundPayload::Buffered(bytes::Bytes::new()), at(1), 0)
            .unwrap();

        session.disconnect(DisconnectReason::Normal).expect("first disconnect succeeds");
        let err = session.disconnect(DisconnectReason::Normal).unwrap_err();
        assert_eq!(err, SessionError::NotConnected);
    }

    #[test]
    fn idle_timeout_fires_once_exceeded() {
        let mut session = Session::new(
            Role::Server,
            "client",
            SessionConfig { required_preshared_key: None, idle_timeout: Duration::from_secs(5) },
            at(0),
        );
        session.server_begin();

        assert!(session.tick(at(1_000)).is_empty());
        let actions = session.tick(at(10_000));
        assert_eq!(session.state(), SessionState::Terminating);
        assert!(actions.iter().any(|a| matches!(
            a,
            SessionAction::Emit(SessionEvent::Disconnected { reason: DisconnectReason::Timeout })
        )));
        assert!(actions.iter().any(|a| matches!(
            a,
            SessionAction::SendFrame(frame) if frame.header.status == Status::Timeout
        )));
    }

    #[test]
    fn send_normal_before_steady_is_rejected() {
        let session = Session::new(Role::Client, "server", SessionConfig::default(), at(0));
        let err = session.send_normal(Vec::new(), Metadata::new()).unwrap_err();
        assert!(matches!(err, SessionError::WriteRejected(_)));
    }

    #[test]
    fn on_header_excludes_sync_and_control_from_streaming() {
        assert_eq!(on_header(&Header::normal(0)), HeaderDecision::MayStream);
        assert_eq!(
            on_header(&Header { sync_request: true, ..Header::default() }),
            HeaderDecision::MustBuffer
        );
        assert_eq!(
            on_header(&Header { status: Status::Heartbeat, ..Header::default() }),
            HeaderDecision::MustBuffer
        );
    }
}
