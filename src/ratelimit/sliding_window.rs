//! Sliding window quota with even distribution.
//!
//! Grants are spaced at least `window / capacity` apart per key. Eligibility is
//! anchored to the last grant rather than a calendar boundary, so there is no
//! rollover burst, and any rolling window still holds at most `capacity`
//! grants. Early requests are denied with the wait until the next slot; they
//! are never queued.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::key::LimiterKey;
use super::limiter::{ConsumeOutcome, RateLimiter};
use super::policy::LimiterPolicy;
use crate::store::{CounterStore, StoreError};

/// Even distribution limiter.
pub struct SlidingWindowLimiter {
    policy: LimiterPolicy,
    store: Arc<dyn CounterStore>,
}

impl SlidingWindowLimiter {
    pub fn new(policy: LimiterPolicy, store: Arc<dyn CounterStore>) -> Self {
        Self { policy, store }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    fn policy(&self) -> &LimiterPolicy {
        &self.policy
    }

    async fn consume(&self, key: &LimiterKey) -> Result<ConsumeOutcome, StoreError> {
        let capacity = self.policy.capacity();
        let grant = self
            .store
            .slotted_consume(&key.to_store_key(), capacity, self.policy.window())
            .await?;

        trace!(
            key = %key,
            allowed = grant.allowed,
            remaining = grant.remaining,
            "Sliding window consume"
        );

        if !grant.allowed {
            debug!(
                key = %key,
                wait_ms = grant.ms_until_next,
                "Request arrived before the next slot"
            );
        }

        Ok(ConsumeOutcome::new(
            grant.allowed,
            capacity,
            grant.remaining,
            grant.ms_until_next,
        ))
    }

    async fn reset(&self, key: &LimiterKey) -> Result<(), StoreError> {
        self.store.delete(&key.to_store_key()).await
    }
}
