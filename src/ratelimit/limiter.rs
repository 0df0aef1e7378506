//! Rate limiter capability shared by all algorithms.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::fixed_window::FixedWindowLimiter;
use super::key::LimiterKey;
use super::policy::{Algorithm, LimiterPolicy};
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::TokenBucketLimiter;
use crate::store::{CounterStore, StoreError};

/// Result of one consume attempt. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOutcome {
    /// Whether the request fits in the quota
    pub allowed: bool,
    /// Capacity of the policy
    pub limit: u64,
    /// Points left, always within `[0, limit]`
    pub remaining: u64,
    /// Time until the quota frees up again
    pub ms_until_reset: u64,
}

impl ConsumeOutcome {
    pub fn new(allowed: bool, limit: u64, remaining: u64, ms_until_reset: u64) -> Self {
        Self {
            allowed,
            limit,
            remaining: remaining.min(limit),
            ms_until_reset,
        }
    }
}

/// One quota algorithm bound to a policy and a counter store.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// The policy this limiter enforces.
    fn policy(&self) -> &LimiterPolicy;

    /// Attempt to take one point from the key's quota.
    ///
    /// A denial is a normal outcome; only store failures are errors.
    async fn consume(&self, key: &LimiterKey) -> Result<ConsumeOutcome, StoreError>;

    /// Forget everything the store holds for the key.
    async fn reset(&self, key: &LimiterKey) -> Result<(), StoreError>;
}

/// Build the limiter the policy's algorithm calls for.
pub fn build_limiter(policy: LimiterPolicy, store: Arc<dyn CounterStore>) -> Arc<dyn RateLimiter> {
    debug!(
        namespace = %policy.key_namespace(),
        algorithm = %policy.algorithm(),
        capacity = policy.capacity(),
        window_secs = policy.window().as_secs(),
        "Building rate limiter"
    );

    match policy.algorithm() {
        Algorithm::FixedWindow => Arc::new(FixedWindowLimiter::new(policy, store)),
        Algorithm::SlidingWindow => Arc::new(SlidingWindowLimiter::new(policy, store)),
        Algorithm::TokenBucket => Arc::new(TokenBucketLimiter::new(policy, store)),
    }
}
