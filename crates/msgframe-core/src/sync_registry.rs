//! Synchronous request/response correlation.
//!
//! `send_and_wait` registers a waiter keyed by `ConversationId` before the
//! request frame goes out; `complete` (called when a `SyncResponse` frame
//! decodes) looks the waiter up and wakes it. A waiter that never wakes
//! (peer never answers) times out on its own; a background sweep only
//! exists to bound memory when a caller abandons the wait entirely (a
//! cancelled future, a panicking caller) without the expirer ever having to
//! race the waiter for who "wins" the entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use msgframe_proto::{ConversationId, Metadata};
use tokio::sync::{oneshot, Mutex};

use crate::env::Environment;
use crate::error::SessionError;

/// The minimum timeout `send_and_wait` accepts. Shorter windows are
/// rejected at the API rather than silently clamped.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// A decoded synchronous response, handed back to the caller of
/// `send_and_wait`.
#[derive(Debug, Clone)]
pub struct SyncResponse {
    /// Attributes attached by the responder.
    pub metadata: Metadata,
    /// The response payload.
    pub payload: Bytes,
}

struct Waiter {
    sender: oneshot::Sender<SyncResponse>,
    expiration_millis: i64,
}

/// Tracks in-flight synchronous requests for one session.
///
/// Cheaply cloneable: internally an `Arc` around a mutex-guarded table, so
/// the reader task (which calls [`SyncRegistry::complete`]) and the caller
/// of `send_and_wait` (running on whatever task issued the request) can
/// share one registry per connection.
#[derive(Clone)]
pub struct SyncRegistry {
    waiters: Arc<Mutex<HashMap<ConversationId, Waiter>>>,
}

impl SyncRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { waiters: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Validates `timeout` against [`MIN_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidArgument`] if `timeout` is below the
    /// floor.
    pub fn validate_timeout(timeout: Duration) -> Result<(), SessionError> {
        if timeout < MIN_TIMEOUT {
            return Err(SessionError::InvalidArgument(format!(
                "sync timeout must be at least {MIN_TIMEOUT:?}, got {timeout:?}"
            )));
        }
        Ok(())
    }

    /// Registers a waiter for `conversation_id` and returns the receiving
    /// half the caller should await (racing it against its own deadline
    /// timer, since the registry does not enforce the deadline itself).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DuplicateConversationId`] if a waiter is
    /// already registered under this id — a protocol violation, since
    /// conversation ids are expected to be unique with overwhelming
    /// probability.
    pub async fn register(
        &self,
        conversation_id: ConversationId,
        expiration_millis: i64,
    ) -> Result<oneshot::Receiver<SyncResponse>, SessionError> {
        let mut waiters = self.waiters.lock().await;
        if waiters.contains_key(&conversation_id) {
            return Err(SessionError::DuplicateConversationId);
        }
        let (tx, rx) = oneshot::channel();
        waiters.insert(conversation_id, Waiter { sender: tx, expiration_millis });
        Ok(rx)
    }

    /// Called when a `SyncResponse` frame decodes. Wakes the matching
    /// waiter, if still registered; a response for an id with no live
    /// waiter (already timed out and deregistered) is silently dropped.
    pub async fn complete(&self, conversation_id: ConversationId, response: SyncResponse) {
        let mut waiters = self.waiters.lock().await;
        if let Some(waiter) = waiters.remove(&conversation_id) {
            let _ = waiter.sender.send(response);
        }
    }

    /// Removes the waiter for `conversation_id` without waking it. Called
    /// by `send_and_wait` once its own deadline fires, so a late response
    /// cannot resurrect a waiter the caller has already given up on.
    pub async fn deregister(&self, conversation_id: &ConversationId) {
        self.waiters.lock().await.remove(conversation_id);
    }

    /// Removes waiters whose `Expiration` has passed. Run periodically by a
    /// background task so an abandoned waiter (caller dropped its future
    /// without deregistering) cannot grow the table unboundedly.
    pub async fn sweep_expired(&self, now_millis: i64) {
        self.waiters.lock().await.retain(|_, waiter| waiter.expiration_millis >= now_millis);
    }

    /// The number of in-flight requests. Exposed for tests and metrics.
    pub async fn len(&self) -> usize {
        self.waiters.lock().await.len()
    }

    /// `true` if no requests are in flight.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for SyncRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs [`SyncRegistry::sweep_expired`] once a second until `env` reports
/// cancellation is no longer needed (the caller wraps this future in a
/// `tokio_util::sync::CancellationToken`-guarded `select!`).
pub async fn run_expirer<E: Environment>(registry: SyncRegistry, env: E) -> std::convert::Infallible {
    loop {
        env.sleep(Duration::from_secs(1)).await;
        registry.sweep_expired(env.unix_millis()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_complete_wakes_waiter() {
        let registry = SyncRegistry::new();
        let id = ConversationId::from_bytes([1; 16]);
        let rx = registry.register(id, 10_000).await.expect("should register");

        registry
            .complete(id, SyncResponse { metadata: Metadata::new(), payload: Bytes::from_static(b"ok") })
            .await;

        let response = rx.await.expect("should receive");
        assert_eq!(response.payload, Bytes::from_static(b"ok"));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = SyncRegistry::new();
        let id = ConversationId::from_bytes([2; 16]);
        let _rx = registry.register(id, 10_000).await.unwrap();

        let err = registry.register(id, 10_000).await.unwrap_err();
        assert_eq!(err, SessionError::DuplicateConversationId);
    }

    #[tokio::test]
    async fn response_with_no_live_waiter_is_dropped_silently() {
        let registry = SyncRegistry::new();
        let id = ConversationId::from_bytes([3; 16]);
        // No register() call: this must not panic.
        registry
            .complete(id, SyncResponse { metadata: Metadata::new(), payload: Bytes::new() })
            .await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn sweep_expired_evicts_past_deadline_entries() {
        let registry = SyncRegistry::new();
        let id = ConversationId::from_bytes([4; 16]);
        let _rx = registry.register(id, 1_000).await.unwrap();

        registry.sweep_expired(500).await;
        assert_eq!(registry.len().await, 1, "not yet expired");

        registry.sweep_expired(1_500).await;
        assert_eq!(registry.len().await, 0, "swept once past its deadline");
    }

    #[tokio::test]
    async fn deregister_prevents_a_late_response_from_resurrecting_a_waiter() {
        let registry = SyncRegistry::new();
        let id = ConversationId::from_bytes([5; 16]);
        let rx = registry.register(id, 1_000).await.unwrap();

        registry.deregister(&id).await;
        drop(rx);

        registry
            .complete(id, SyncResponse { metadata: Metadata::new(), payload: Bytes::new() })
            .await;
        assert!(registry.is_empty().await);
    }

    #[test]
    fn timeout_floor_is_enforced() {
        assert!(SyncRegistry::validate_timeout(Duration::from_millis(999)).is_err());
        assert!(SyncRegistry::validate_timeout(Duration::from_millis(1000)).is_ok());
    }
}
