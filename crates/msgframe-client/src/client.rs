//! The client endpoint.
//!
//! `ClientEndpoint` owns one [`Session`] driven over one
//! [`ConnectionIO`](msgframe_core::ConnectionIO), plus the reader task that
//! keeps pulling frames off the wire and turning them into [`ClientEvent`]s
//! (or, for synchronous responses, waking whoever is waiting in
//! [`ClientEndpoint::send_and_wait`]). Everything public here is safe to
//! call from any task; the reader task is the only thing that ever touches
//! the session's read side.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use msgframe_core::{
    ClientConfig, ConnectionIO, DisconnectReason, Environment, InboundPayload, RealEnvironment,
    Role, Session, SessionAction, SessionConfig, SessionError, SessionEvent, SyncRegistry,
    SyncResponse,
};
use msgframe_proto::{ConversationId, Metadata};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::ClientError;
use crate::event::ClientEvent;
use crate::transport::{self, ClientStream, ClientTlsConfig};

/// Reading is always fully buffered at the endpoint layer: the session and
/// `ConnectionIO` both support the streamed path (see
/// `ConnectionIO::read_message`'s `allow_streaming` parameter), but wiring a
/// second, streamed-handler registration surface through `ClientEndpoint`
/// adds a second caller-facing API for comparatively little value on the
/// client side, where inbound payloads are rarely the multi-gigabyte
/// proxied blobs `MaxProxiedStreamSize` exists for on the server. Buffering
/// still respects that ceiling: a peer cannot force unbounded memory use
/// this way, since `ConnectionIO` rejects any `content_length` above
/// `MAX_CONTENT_LENGTH` before either path is chosen.
const ALLOW_STREAMING: bool = false;

/// A connected TCP/TLS client session speaking the msgframe wire protocol.
///
/// Construct with [`ClientEndpoint::connect`]. Dropping this without calling
/// [`ClientEndpoint::disconnect`] leaves the reader task running until the
/// peer closes the transport or the process exits; call
/// [`ClientEndpoint::stop`] to tear it down immediately.
pub struct ClientEndpoint {
    conn: Arc<ConnectionIO<ClientStream>>,
    session: Arc<Mutex<Session<Instant>>>,
    sync: Arc<SyncRegistry>,
    env: RealEnvironment,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    reader_task: JoinHandle<()>,
}

impl ClientEndpoint {
    /// Opens a TCP connection to `host:port`, optionally upgrading it to
    /// TLS, and starts the session in `PreAuth`. The returned receiver is
    /// the caller's only way to observe what happens next: connection
    /// success is itself reported as [`ClientEvent::ServerConnected`] before
    /// any other event can arrive.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::TimeoutConnecting`] if the TCP connect or TLS
    /// handshake exceeds `config.connect_timeout`, and
    /// [`ClientError::TlsHandshake`] if the handshake itself fails.
    pub async fn connect(
        host: &str,
        port: u16,
        config: &ClientConfig,
        tls: Option<&ClientTlsConfig>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let stream =
            transport::connect(host, port, config.local_port, config.connect_timeout, tls)
                .await?;

        let env = RealEnvironment::new();
        let peer = format!("{host}:{port}");
        let session_config =
            SessionConfig { required_preshared_key: None, idle_timeout: config.idle_timeout };
        let session = Arc::new(Mutex::new(Session::new(Role::Client, peer, session_config, env.now())));
        let conn = Arc::new(ConnectionIO::new(stream));
        let sync = Arc::new(SyncRegistry::new());
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let _ = event_tx.send(ClientEvent::ServerConnected);

        let reader_task = tokio::spawn(reader_loop(
            Arc::clone(&conn),
            Arc::clone(&session),
            Arc::clone(&sync),
            env,
            config.idle_timeout,
            event_tx.clone(),
        ));

        Ok((Self { conn, session, sync, env, event_tx, reader_task }, event_rx))
    }

    /// Presents a 16-byte preshared key to the server.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Session`] if the session is not in `PreAuth`
    /// or `Authenticating`, or if `psk` is not exactly 16 bytes.
    pub async fn authenticate(&self, psk: &[u8]) -> Result<(), ClientError> {
        let actions = self.session.lock().await.authenticate(psk)?;
        self.run_actions(actions).await
    }

    /// Sends a buffered `Normal` message and returns once it is on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Session`] if the session is not `Steady`.
    pub async fn send(&self, payload: impl Into<Bytes>, metadata: Metadata) -> Result<(), ClientError> {
        let action = self.session.lock().await.send_normal(payload, metadata)?;
        self.run_actions(vec![action]).await
    }

    /// Sends a buffered `Normal` message without waiting for the write to
    /// land; failures surface later as [`ClientEvent::ExceptionEncountered`]
    /// instead of as an `Err` from this call.
    pub fn send_async(&self, payload: impl Into<Bytes> + Send + 'static, metadata: Metadata) {
        let session = Arc::clone(&self.session);
        let conn = Arc::clone(&self.conn);
        let sync = Arc::clone(&self.sync);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let action = match session.lock().await.send_normal(payload, metadata) {
                Ok(action) => action,
                Err(err) => {
                    let _ = event_tx.send(ClientEvent::ExceptionEncountered { reason: err.to_string() });
                    return;
                },
            };
            let _ = deliver_action(&conn, &sync, &event_tx, action).await;
        });
    }

    /// Sends a `Normal` message whose payload is read from `source` rather
    /// than supplied as a single buffer. `length` must match the number of
    /// bytes `source` yields.
    ///
    /// `ConnectionIO::write_frame` only has a fully-buffered form (there is
    /// no streamed-write counterpart to `PayloadSource::Streamed` on the
    /// read side), so this reads `source` to completion before handing the
    /// bytes to [`ClientEndpoint::send`]. The wire contract (`content_length`
    /// matching the payload) is unaffected; only the local memory profile
    /// differs from a true streamed write.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Io`] if `source` does not yield exactly
    /// `length` bytes, or [`ClientError::Session`] if the session is not
    /// `Steady`.
    pub async fn send_stream(
        &self,
        mut source: impl AsyncRead + Unpin,
        length: u64,
        metadata: Metadata,
    ) -> Result<(), ClientError> {
        let mut buf = vec![0u8; usize::try_from(length).unwrap_or(usize::MAX)];
        source.read_exact(&mut buf).await?;
        self.send(buf, metadata).await
    }

    /// Sends a synchronous request and waits up to `timeout` for the
    /// matching response.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Session`] wrapping [`SessionError::Timeout`] if
    /// `timeout` elapses first, or if `timeout` is below
    /// [`msgframe_core::MIN_TIMEOUT`].
    pub async fn send_and_wait(
        &self,
        timeout: Duration,
        payload: impl Into<Bytes>,
        metadata: Metadata,
    ) -> Result<SyncResponse, ClientError> {
        SyncRegistry::validate_timeout(timeout)?;

        let mut id_bytes = [0u8; 16];
        self.env.random_bytes(&mut id_bytes);
        let conversation_id = ConversationId::from_bytes(id_bytes);

        let now_millis = self.env.unix_millis();
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let expiration_millis = now_millis + timeout.as_millis() as i64;
        let rx = self.sync.register(conversation_id, expiration_millis).await?;

        let action = {
            let session = self.session.lock().await;
            session.send_sync_request(conversation_id, now_millis, timeout, payload, metadata)?
        };
        if let SessionAction::SendFrame(frame) = &action {
            self.conn.write_frame(frame).await?;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.sync.deregister(&conversation_id).await;
                Err(ClientError::Session(SessionError::Timeout(
                    "sync response channel closed before a reply arrived".to_owned(),
                )))
            },
            Err(_) => {
                self.sync.deregister(&conversation_id).await;
                Err(ClientError::Session(SessionError::Timeout(format!(
                    "no response to conversation within {timeout:?}"
                ))))
            },
        }
    }

    /// Answers a [`ClientEvent::SyncRequestReceived`] with `payload`, tagged
    /// with the same `conversation_id` the request carried.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Session`] if the session is not `Steady`.
    pub async fn send_sync_response(
        &self,
        conversation_id: ConversationId,
        payload: impl Into<Bytes>,
        metadata: Metadata,
    ) -> Result<(), ClientError> {
        let action = self.session.lock().await.send_sync_response(conversation_id, payload, metadata)?;
        self.run_actions(vec![action]).await
    }

    /// Ends the session cleanly: sends a `Shutdown` frame and closes the
    /// transport. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates a write failure from the outbound `Shutdown` frame.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let actions = self.session.lock().await.disconnect(DisconnectReason::Normal)?;
        self.run_actions(actions).await
    }

    /// Aborts the reader task without a graceful shutdown handshake. Use
    /// when the caller is tearing down regardless of the server's reply.
    pub fn stop(&self) {
        self.reader_task.abort();
    }

    async fn run_actions(&self, actions: Vec<SessionAction>) -> Result<(), ClientError> {
        for action in actions {
            deliver_action(&self.conn, &self.sync, &self.event_tx, action).await?;
        }
        Ok(())
    }
}

/// Executes one `SessionAction` against the live transport, forwarding
/// emitted events to the caller's channel except `SyncResponseArrived`,
/// which resolves a [`SyncRegistry`] waiter instead of surfacing as a
/// [`ClientEvent`] (`send_and_wait` is the only consumer of that event).
async fn deliver_action(
    conn: &ConnectionIO<ClientStream>,
    sync: &SyncRegistry,
    event_tx: &mpsc::UnboundedSender<ClientEvent>,
    action: SessionAction,
) -> Result<(), ClientError> {
    match action {
        SessionAction::SendFrame(frame) => conn.write_frame(&frame).await?,
        SessionAction::CloseTransport => conn.close().await,
        SessionAction::Emit(SessionEvent::SyncResponseArrived { conversation_id, metadata, payload }) => {
            sync.complete(conversation_id, SyncResponse { metadata, payload }).await;
        },
        SessionAction::Emit(event) => {
            let _ = event_tx.send(ClientEvent::from_session_event(event));
        },
    }
    Ok(())
}

/// Runs every action, reporting whether a `CloseTransport` was among them
/// (the signal the reader loop uses to stop).
async fn run_and_detect_close(
    conn: &ConnectionIO<ClientStream>,
    sync: &SyncRegistry,
    event_tx: &mpsc::UnboundedSender<ClientEvent>,
    actions: Vec<SessionAction>,
) -> bool {
    let mut should_close = false;
    for action in actions {
        if matches!(action, SessionAction::CloseTransport) {
            should_close = true;
        }
        let _ = deliver_action(conn, sync, event_tx, action).await;
    }
    should_close
}

/// Drives the connection: one inbound frame at a time, plus a periodic
/// `tick` so the idle-timeout watchdog fires even on a connection that
/// never hears from the server again. Exits once the transport closes or a
/// session-terminal action (`CloseTransport`) is executed.
async fn reader_loop(
    conn: Arc<ConnectionIO<ClientStream>>,
    session: Arc<Mutex<Session<Instant>>>,
    sync: Arc<SyncRegistry>,
    env: RealEnvironment,
    idle_timeout: Duration,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
) {
    let watchdog_period = if idle_timeout.is_zero() { Duration::from_secs(1) } else { idle_timeout / 3 };
    let mut watchdog = tokio::time::interval(watchdog_period.max(Duration::from_millis(100)));

    loop {
        tokio::select! {
            _ = watchdog.tick() => {
                let actions = session.lock().await.tick(env.now());
                if run_and_detect_close(&conn, &sync, &event_tx, actions).await {
                    break;
                }
            },
            result = conn.read_message(ALLOW_STREAMING, u64::MAX) => {
                match result {
                    Ok((header, payload)) => {
                        let bytes = match payload.into_buffered().await {
                            Ok(bytes) => bytes,
                            Err(err) => {
                                let _ = event_tx.send(ClientEvent::ExceptionEncountered {
                                    reason: err.to_string(),
                                });
                                break;
                            },
                        };
                        let now = env.now();
                        let now_millis = env.unix_millis();
                        let outcome = session
                            .lock()
                            .await
                            .on_message(&header, InboundPayload::Buffered(bytes), now, now_millis);
                        match outcome {
                            Ok(actions) => {
                                if run_and_detect_close(&conn, &sync, &event_tx, actions).await {
                                    break;
                                }
                            },
                            Err(err) => {
                                let _ = event_tx.send(ClientEvent::ExceptionEncountered {
                                    reason: err.to_string(),
                                });
                                break;
                            },
                        }
                    },
                    Err(err) => {
                        let _ = event_tx.send(ClientEvent::ExceptionEncountered {
                            reason: err.to_string(),
                        });
                        break;
                    },
                }
            },
        }
    }
}
