//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (time, randomness). Enables
//! deterministic unit tests against a virtual clock and seeded RNG, with
//! production use backed by real system resources via [`RealEnvironment`].

use std::time::Duration;

/// Abstract environment providing time, randomness, and async primitives.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion, incorrect simulation setup)
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`, while simulation
    /// environments use virtual time (e.g., `turmoil::Instant`).
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    ///
    /// # Invariants
    ///
    /// - This method MUST return values that never decrease within a single
    ///   execution context. Subsequent calls must return times >= previous
    ///   calls.
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// This is the ONLY async method in the trait, and it should only be used
    /// by driver code (not protocol logic).
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Current wall-clock time as milliseconds since the Unix epoch.
    ///
    /// Distinct from [`Environment::now`]: this is the absolute timestamp
    /// carried on the wire in `SenderTimestamp`/`Expiration` header fields,
    /// not the monotonic clock used for idle-timeout/backoff arithmetic.
    fn unix_millis(&self) -> i64;

    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same RNG seed, this produces the same sequence of bytes
    /// - Uses cryptographically secure RNG
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    ///
    /// This is a convenience method for common use cases like generating
    /// session IDs or request IDs.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u128`.
    ///
    /// Useful for UUIDs or room IDs.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }
}

/// Production environment using system time and cryptographic RNG.
///
/// Shared by `msgframe-client` and `msgframe-server` so both endpoints agree
/// on clock and RNG behavior without duplicating the implementation.
///
/// # Panics
///
/// [`RealEnvironment::random_bytes`] panics if the OS RNG fails. A server
/// without functioning cryptographic randomness cannot safely generate
/// conversation identifiers and should not continue running.
#[derive(Clone, Copy, Default)]
pub struct RealEnvironment;

impl RealEnvironment {
    /// Creates a new real-clock, real-RNG environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for RealEnvironment {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::disallowed_methods, clippy::expect_used)]
    fn unix_millis(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after the Unix epoch (1970-01-01)")
            .as_millis() as i64
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - server cannot operate securely");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn real_environment_time_advances() {
        let env = RealEnvironment::new();

        let t1 = env.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = env.now();

        assert!(t2 > t1, "time should advance");
    }

    #[test]
    fn real_environment_random_bytes_differ() {
        let env = RealEnvironment::new();

        let mut bytes1 = [0u8; 32];
        let mut bytes2 = [0u8; 32];
        env.random_bytes(&mut bytes1);
        env.random_bytes(&mut bytes2);

        assert_ne!(bytes1, bytes2, "random bytes should differ between calls");
    }

    #[tokio::test]
    async fn real_environment_sleep_waits_at_least_requested_duration() {
        let env = RealEnvironment::new();

        let start = env.now();
        env.sleep(Duration::from_millis(20)).await;
        let elapsed = env.now() - start;

        assert!(elapsed >= Duration::from_millis(20));
    }
}
