//! Server endpoint for the msgframe wire protocol.
//!
//! # Architecture
//!
//! Mirrors `msgframe-client`: [`ServerEndpoint`] wraps a listening socket,
//! one [`msgframe_core::Session`] per accepted connection, and the
//! bookkeeping (a `ClientRegistry`) needed to address a specific
//! connected client or fan out to all of them. Every session stays pure --
//! it only ever produces [`msgframe_core::SessionAction`]s -- and this crate
//! is the shell that executes them against real sockets.
//!
//! # Components
//!
//! - [`ServerEndpoint`]: start, send/send_and_wait/send_sync_response,
//!   disconnect, list connected clients
//! - [`ServerEvent`]: events delivered over the channel returned by
//!   [`ServerEndpoint::start`]
//! - [`ServerError`]: the error type every fallible method here returns
//! - [`transport::ServerTlsConfig`]: optional TLS parameters for `start`

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod driver;
mod error;
mod event;
mod registry;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
pub use error::ServerError;
pub use event::ServerEvent;
use msgframe_core::{
    DisconnectReason, Environment, RealEnvironment, ServerConfig, SessionAction, SyncRegistry,
    SyncResponse,
};
use msgframe_proto::{ConversationId, Metadata};
use registry::ClientRegistry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
pub use transport::ServerTlsConfig;

use crate::transport::{Listener, ServerStream};

/// A listening msgframe server. Accepts TCP (optionally TLS) connections on
/// a background task and hands every decoded message to the caller through
/// the event channel returned by [`ServerEndpoint::start`].
pub struct ServerEndpoint {
    listener: Arc<Listener>,
    registry: Arc<ClientRegistry<ServerStream>>,
    sync: Arc<SyncRegistry>,
    env: RealEnvironment,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ServerEndpoint {
    /// Binds `address` and starts accepting connections under `config`. The
    /// returned receiver is the caller's only way to observe activity:
    /// every accepted client, message, and disconnect arrives as a
    /// [`ServerEvent`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if `address` cannot be parsed or bound,
    /// and [`ServerError::TlsConfig`] if `tls` names unreadable or invalid
    /// certificate material.
    pub async fn start(
        address: &str,
        config: ServerConfig,
        tls: Option<&ServerTlsConfig>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), ServerError> {
        let listener = Arc::new(Listener::bind(address, tls).await?);
        let registry = Arc::new(ClientRegistry::new());
        let sync = Arc::new(SyncRegistry::new());
        let env = RealEnvironment::new();
        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(driver::accept_loop(
            Arc::clone(&listener),
            Arc::clone(&registry),
            Arc::clone(&sync),
            config,
            env,
            event_tx.clone(),
            cancel.clone(),
        ));

        let expirer_sync = (*sync).clone();
        let expirer_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = expirer_cancel.cancelled() => {},
                _ = msgframe_core::sync_registry::run_expirer(expirer_sync, env) => {},
            }
        });

        Ok((Self { listener, registry, sync, env, cancel, accept_task, event_tx }, event_rx))
    }

    /// The address the server actually bound to.
    ///
    /// # Errors
    ///
    /// Propagates the underlying `TcpListener::local_addr` error.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Every currently-connected client, by `"ip:port"`.
    pub async fn list_clients(&self) -> Vec<String> {
        self.registry.list_clients().await
    }

    /// `true` if `peer` is currently connected.
    pub async fn is_connected(&self, peer: &str) -> bool {
        self.registry.is_connected(peer).await
    }

    /// Sends a buffered `Normal` message to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::UnknownPeer`] if `peer` is not connected, or
    /// [`ServerError::Session`] if its session is not `Steady`.
    pub async fn send(
        &self,
        peer: &str,
        payload: impl Into<Bytes>,
        metadata: Metadata,
    ) -> Result<(), ServerError> {
        let (conn, session) =
            self.registry.get(peer).await.ok_or_else(|| ServerError::UnknownPeer(peer.to_owned()))?;
        let action = session.lock().await.send_normal(payload, metadata)?;
        driver::deliver_action(&conn, &self.sync, peer, &self.event_tx, action).await
    }

    /// Sends a synchronous request to `peer` and waits up to `timeout` for
    /// its response.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::UnknownPeer`] if `peer` is not connected, and
    /// [`ServerError::Session`] wrapping
    /// [`msgframe_core::SessionError::Timeout`] if `timeout` elapses first.
    pub async fn send_and_wait(
        &self,
        peer: &str,
        timeout: Duration,
        payload: impl Into<Bytes>,
        metadata: Metadata,
    ) -> Result<SyncResponse, ServerError> {
        SyncRegistry::validate_timeout(timeout)?;
        let (conn, session) =
            self.registry.get(peer).await.ok_or_else(|| ServerError::UnknownPeer(peer.to_owned()))?;

        let mut id_bytes = [0u8; 16];
        self.env.random_bytes(&mut id_bytes);
        let conversation_id = ConversationId::from_bytes(id_bytes);

        let now_millis = self.env.unix_millis();
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let expiration_millis = now_millis + timeout.as_millis() as i64;
        let rx = self.sync.register(conversation_id, expiration_millis).await?;

        let action = {
            let session = session.lock().await;
            session.send_sync_request(conversation_id, now_millis, timeout, payload, metadata)?
        };
        if let SessionAction::SendFrame(frame) = &action {
            conn.write_frame(frame).await?;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.sync.deregister(&conversation_id).await;
                Err(ServerError::Session(msgframe_core::SessionError::Timeout(
                    "sync response channel closed before a reply arrived".to_owned(),
                )))
            },
            Err(_) => {
                self.sync.deregister(&conversation_id).await;
                Err(ServerError::Session(msgframe_core::SessionError::Timeout(format!(
                    "no response to conversation within {timeout:?}"
                ))))
            },
        }
    }

    /// Answers `peer`'s [`ServerEvent::SyncRequestReceived`] with `payload`,
    /// tagged with the same `conversation_id` the request carried.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::UnknownPeer`] if `peer` is not connected, or
    /// [`ServerError::Session`] if its session is not `Steady`.
    pub async fn send_sync_response(
        &self,
        peer: &str,
        conversation_id: ConversationId,
        payload: impl Into<Bytes>,
        metadata: Metadata,
    ) -> Result<(), ServerError> {
        let (conn, session) =
            self.registry.get(peer).await.ok_or_else(|| ServerError::UnknownPeer(peer.to_owned()))?;
        let action = session.lock().await.send_sync_response(conversation_id, payload, metadata)?;
        driver::deliver_action(&conn, &self.sync, peer, &self.event_tx, action).await
    }

    /// Disconnects `peer`: sends a `Shutdown` frame (idempotent on a
    /// session that already began shutting down) and closes the transport.
    /// `reason` is carried only on the locally emitted
    /// [`ServerEvent::ClientDisconnected`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::UnknownPeer`] if `peer` is not connected.
    pub async fn disconnect_client(&self, peer: &str, reason: DisconnectReason) -> Result<(), ServerError> {
        let (conn, session) =
            self.registry.get(peer).await.ok_or_else(|| ServerError::UnknownPeer(peer.to_owned()))?;
        let actions = session.lock().await.disconnect(reason)?;
        for action in actions {
            driver::deliver_action(&conn, &self.sync, peer, &self.event_tx, action).await?;
        }
        self.registry.unregister(peer).await;
        Ok(())
    }

    /// Stops accepting new connections and aborts the accept loop.
    /// In-flight connections are left running; disconnect them individually
    /// via [`ServerEndpoint::disconnect_client`] first if a clean shutdown
    /// is required.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.accept_task.abort();
    }
}
