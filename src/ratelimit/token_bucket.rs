//! Token bucket quota.
//!
//! The bucket holds `capacity` tokens and refills at `capacity / window`
//! tokens per second, computed from elapsed time on each consume. Once a key
//! runs dry it is blocked for a cooldown, so sustained overload cannot trickle
//! through on fractional refill.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::key::LimiterKey;
use super::limiter::{ConsumeOutcome, RateLimiter};
use super::policy::LimiterPolicy;
use crate::store::{BucketSpec, CounterStore, StoreError};

/// Token bucket limiter.
pub struct TokenBucketLimiter {
    policy: LimiterPolicy,
    store: Arc<dyn CounterStore>,
    spec: BucketSpec,
}

impl TokenBucketLimiter {
    pub fn new(policy: LimiterPolicy, store: Arc<dyn CounterStore>) -> Self {
        let spec = BucketSpec {
            capacity: policy.capacity(),
            refill_window: policy.window(),
            cost: 1,
            cooldown: policy.effective_block_cooldown(),
        };
        Self {
            policy,
            store,
            spec,
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    fn policy(&self) -> &LimiterPolicy {
        &self.policy
    }

    async fn consume(&self, key: &LimiterKey) -> Result<ConsumeOutcome, StoreError> {
        let grant = self
            .store
            .token_bucket_consume(&key.to_store_key(), self.spec)
            .await?;

        trace!(
            key = %key,
            allowed = grant.allowed,
            tokens = grant.remaining,
            "Token bucket consume"
        );

        if !grant.allowed {
            debug!(
                key = %key,
                wait_ms = grant.ms_until_next,
                refill_per_second = self.spec.refill_per_second(),
                "Token bucket empty"
            );
        }

        Ok(ConsumeOutcome::new(
            grant.allowed,
            self.policy.capacity(),
            grant.remaining,
            grant.ms_until_next,
        ))
    }

    async fn reset(&self, key: &LimiterKey) -> Result<(), StoreError> {
        self.store.delete(&key.to_store_key()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::Algorithm;
    use crate::store::{MemoryStore, MockClock};
    use std::time::Duration;

    fn limiter(policy: LimiterPolicy) -> (TokenBucketLimiter, MockClock) {
        let clock = MockClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        (TokenBucketLimiter::new(policy, store), clock)
    }

    #[tokio::test]
    async fn test_exhaust_then_refill_one_token() {
        // 5 tokens per 10s: one token every 2s.
        let policy = LimiterPolicy::new(5, 10, Algorithm::TokenBucket, "tb:").unwrap();
        let (limiter, clock) = limiter(policy);
        let key = LimiterKey::new("tb:", "10.0.0.1");

        for expected in (0..5).rev() {
            let outcome = limiter.consume(&key).await.unwrap();
            assert!(outcome.allowed);
            assert_eq!(outcome.remaining, expected);
        }

        clock.advance(Duration::from_millis(1_999));
        let denied = limiter.consume(&key).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.ms_until_reset, 1);

        clock.advance(Duration::from_millis(1));
        assert!(limiter.consume(&key).await.unwrap().allowed);
        assert!(!limiter.consume(&key).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_fractional_refill() {
        let policy = LimiterPolicy::new(10, 10, Algorithm::TokenBucket, "tb:")
            .unwrap()
            .with_block_cooldown(Duration::from_secs(5));
        let (limiter, clock) = limiter(policy);
        let key = LimiterKey::new("tb:", "a");

        for _ in 0..10 {
            assert!(limiter.consume(&key).await.unwrap().allowed);
        }

        // Three tokens have refilled, but the key is cooling down.
        clock.advance(Duration::from_secs(3));
        let blocked = limiter.consume(&key).await.unwrap();
        assert!(!blocked.allowed);
        assert_eq!(blocked.remaining, 3);
        assert_eq!(blocked.ms_until_reset, 2_000);

        clock.advance(Duration::from_secs(2));
        let outcome = limiter.consume(&key).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 4);
    }

    #[tokio::test]
    async fn test_full_bucket_reports_no_wait() {
        let policy = LimiterPolicy::new(2, 2, Algorithm::TokenBucket, "tb:").unwrap();
        let (limiter, clock) = limiter(policy);
        let key = LimiterKey::new("tb:", "a");

        let first = limiter.consume(&key).await.unwrap();
        assert_eq!(first.ms_until_reset, 1_000);

        clock.advance(Duration::from_secs(10));
        let refilled = limiter.consume(&key).await.unwrap();
        assert!(refilled.allowed);
        assert_eq!(refilled.remaining, 1);
    }
}
