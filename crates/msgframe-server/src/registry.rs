//! Connected-client registry.
//!
//! Register on accept, unregister on disconnect, concurrent reads for
//! fan-out, keyed by `peer: String` (`"ip:port"`) holding the live handles
//! `ServerEndpoint` needs to reach that connection: its `ConnectionIO` for
//! writes and its `Session` for building the outbound frame.
//!
//! Generic over the transport (`S`) rather than hardcoded to
//! [`crate::transport::ServerStream`] so it can be exercised in tests
//! against an in-memory duplex instead of a real socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use msgframe_core::{ConnectionIO, Session};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock};

/// The live handles for one connected client.
pub struct ClientHandle<S> {
    /// The connection's framed I/O.
    pub conn: Arc<ConnectionIO<S>>,
    /// The connection's session state machine.
    pub session: Arc<Mutex<Session<Instant>>>,
}

/// Tracks every currently-connected client by peer address.
///
/// Reads (the common case: fan-out sends, `list_clients`, `is_connected`)
/// take a shared lock; only accept and disconnect take an exclusive one.
pub struct ClientRegistry<S> {
    clients: RwLock<HashMap<String, ClientHandle<S>>>,
}

impl<S> Default for ClientRegistry<S> {
    fn default() -> Self {
        Self { clients: RwLock::new(HashMap::new()) }
    }
}

impl<S> ClientRegistry<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly-accepted client. Overwrites any existing entry
    /// under the same peer string, which can only happen if a previous
    /// connection from that exact address was never unregistered --
    /// `ServerEndpoint` always unregisters before this is called again for
    /// the same peer, so this is a defensive replace, not an expected path.
    pub async fn register(&self, peer: String, handle: ClientHandle<S>) {
        self.clients.write().await.insert(peer, handle);
    }

    /// Removes a client. Returns its handles so the caller can still close
    /// the transport after this returns.
    pub async fn unregister(&self, peer: &str) -> Option<ClientHandle<S>> {
        self.clients.write().await.remove(peer)
    }

    /// Number of currently-registered clients, checked against
    /// `MaxConnections` before a new one is accepted.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// `true` if `peer` is currently registered.
    pub async fn is_connected(&self, peer: &str) -> bool {
        self.clients.read().await.contains_key(peer)
    }

    /// Every currently-connected peer address.
    pub async fn list_clients(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }

    /// Looks up one client's handles without removing it. Handles are
    /// individually `Arc`-shared, so the lock only needs to be held for the
    /// lookup itself, not for whatever I/O the caller does with the clones.
    pub async fn get(&self, peer: &str) -> Option<(Arc<ConnectionIO<S>>, Arc<Mutex<Session<Instant>>>)> {
        self.clients.read().await.get(peer).map(|h| (Arc::clone(&h.conn), Arc::clone(&h.session)))
    }
}

#[cfg(test)]
mod tests {
    use msgframe_core::{Role, SessionConfig};
    use tokio::io::{duplex, DuplexStream};

    use super::*;

    fn handle() -> ClientHandle<DuplexStream> {
        let (stream, _peer_side) = duplex(1024);
        let conn = Arc::new(ConnectionIO::new(stream));
        let session = Arc::new(Mutex::new(Session::new(
            Role::Server,
            "127.0.0.1:1",
            SessionConfig::default(),
            Instant::now(),
        )));
        ClientHandle { conn, session }
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry: ClientRegistry<DuplexStream> = ClientRegistry::new();
        registry.register("127.0.0.1:1".to_owned(), handle()).await;

        assert!(registry.is_connected("127.0.0.1:1").await);
        assert!(!registry.is_connected("127.0.0.1:2").await);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.list_clients().await, vec!["127.0.0.1:1".to_owned()]);
    }

    #[tokio::test]
    async fn unregister_removes_entry() {
        let registry: ClientRegistry<DuplexStream> = ClientRegistry::new();
        registry.register("127.0.0.1:1".to_owned(), handle()).await;

        assert!(registry.unregister("127.0.0.1:1").await.is_some());
        assert!(!registry.is_connected("127.0.0.1:1").await);
        assert!(registry.unregister("127.0.0.1:1").await.is_none());
    }

    #[tokio::test]
    async fn get_returns_cloned_handles() {
        let registry: ClientRegistry<DuplexStream> = ClientRegistry::new();
        registry.register("127.0.0.1:1".to_owned(), handle()).await;

        let (conn, session) = registry.get("127.0.0.1:1").await.expect("should be registered");
        assert_eq!(Arc::strong_count(&conn), 2);
        assert_eq!(session.lock().await.role(), Role::Server);
    }
}
