//! Counter store abstraction shared by every quota algorithm.
//!
//! Each operation is a single atomic round trip to the store. Implementations
//! must be linearizable per key: two concurrent callers against the same key
//! never observe the same pre-update state.

mod clock;
mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use clock::{Clock, MockClock, SystemClock};
pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};

/// Failures talking to the counter store.
///
/// These are infrastructure failures, never quota decisions.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or the connection dropped.
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with an error.
    #[error("Counter store protocol error: {0}")]
    Protocol(String),

    /// The store answered with something the adapter cannot interpret.
    #[error("Malformed counter store reply: {0}")]
    MalformedReply(String),

    /// The caller's deadline elapsed before the store answered.
    #[error("Counter store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Result of `increment_with_expiry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Counter value after the increment
    pub total: u64,
    /// Time left before the counter expires
    pub ms_until_expiry: u64,
}

/// Result of the slotted and token bucket primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    /// Whether the consumption was granted
    pub allowed: bool,
    /// Whole units still available to the key
    pub remaining: u64,
    /// Time until the next unit becomes available
    pub ms_until_next: u64,
}

/// Parameters for a token bucket consume.
///
/// The bucket refills `capacity` tokens over `refill_window`, i.e. at
/// `capacity / refill_window` tokens per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSpec {
    /// Maximum number of tokens the bucket holds
    pub capacity: u64,
    /// Time to refill an empty bucket
    pub refill_window: Duration,
    /// Tokens deducted by this consume
    pub cost: u64,
    /// How long a key stays blocked once observed empty
    pub cooldown: Duration,
}

impl BucketSpec {
    /// Continuous refill rate.
    pub fn refill_per_second(&self) -> f64 {
        self.capacity as f64 / self.refill_window.as_secs_f64()
    }
}

/// Atomic primitives the quota algorithms are built on.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment a counter, setting its TTL only when the key is new.
    async fn increment_with_expiry(
        &self,
        key: &str,
        amount: u64,
        ttl: Duration,
    ) -> Result<WindowCount, StoreError>;

    /// Refill a bucket from elapsed time and deduct `spec.cost` if possible.
    async fn token_bucket_consume(&self, key: &str, spec: BucketSpec) -> Result<Grant, StoreError>;

    /// Grant a slot if at least `window / capacity` has passed since the last grant.
    async fn slotted_consume(
        &self,
        key: &str,
        capacity: u64,
        window: Duration,
    ) -> Result<Grant, StoreError>;

    /// Remove whatever record the store holds for the key.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Minimum spacing between slotted grants, rounded up to the millisecond.
pub(crate) fn slot_millis(capacity: u64, window: Duration) -> u64 {
    let window_ms = window.as_millis() as u64;
    window_ms.div_ceil(capacity.max(1)).max(1)
}
