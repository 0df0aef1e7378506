//! Fixed window quota.
//!
//! One counter per key and window; the store sets its TTL on creation and the
//! counter disappears when the window ends. A client can spend a full quota at
//! the tail of one window and another right after the rollover. That burst is
//! inherent to the algorithm.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::key::LimiterKey;
use super::limiter::{ConsumeOutcome, RateLimiter};
use super::policy::LimiterPolicy;
use crate::store::{CounterStore, StoreError};

/// Fixed window limiter.
pub struct FixedWindowLimiter {
    policy: LimiterPolicy,
    store: Arc<dyn CounterStore>,
}

impl FixedWindowLimiter {
    pub fn new(policy: LimiterPolicy, store: Arc<dyn CounterStore>) -> Self {
        Self { policy, store }
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    fn policy(&self) -> &LimiterPolicy {
        &self.policy
    }

    async fn consume(&self, key: &LimiterKey) -> Result<ConsumeOutcome, StoreError> {
        let capacity = self.policy.capacity();
        let count = self
            .store
            .increment_with_expiry(&key.to_store_key(), 1, self.policy.window())
            .await?;

        let allowed = count.total <= capacity;
        trace!(key = %key, total = count.total, capacity = capacity, "Fixed window consume");

        if !allowed {
            debug!(
                key = %key,
                total = count.total,
                limit = capacity,
                "Fixed window quota exhausted"
            );
        }

        // A live window always has at least a millisecond left.
        Ok(ConsumeOutcome::new(
            allowed,
            capacity,
            capacity.saturating_sub(count.total),
            count.ms_until_expiry.max(1),
        ))
    }

    async fn reset(&self, key: &LimiterKey) -> Result<(), StoreError> {
        self.store.delete(&key.to_store_key()).await
    }
}
