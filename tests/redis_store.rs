//! Integration tests for the Redis counter store.
//!
//! These tests require a Redis instance running at `redis://127.0.0.1/`.
//! They are ignored by default; run with `cargo test --test redis_store -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use quorate::ratelimit::{build_limiter, Algorithm, LimiterKey, LimiterPolicy};
use quorate::store::{BucketSpec, CounterStore, RedisStore, RedisStoreConfig};

const REDIS_URL: &str = "redis://127.0.0.1/";

/// Connect with a per-test prefix, or `None` when Redis is not running.
async fn test_store(test_name: &str) -> Option<RedisStore> {
    let config = RedisStoreConfig {
        key_prefix: format!("quorate-test:{}:", test_name),
    };
    match RedisStore::connect_with_config(REDIS_URL, config).await {
        Ok(store) => Some(store),
        Err(e) => {
            eprintln!("Skipping test: Redis not available ({})", e);
            None
        }
    }
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_ping() {
    let Some(store) = test_store("ping").await else {
        return;
    };
    store.ping().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_increment_sets_ttl_once() {
    let Some(store) = test_store("increment").await else {
        return;
    };
    store.delete("k").await.unwrap();

    let first = store
        .increment_with_expiry("k", 1, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(first.total, 1);
    assert!(first.ms_until_expiry <= 30_000);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = store
        .increment_with_expiry("k", 1, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(second.total, 2);
    assert!(second.ms_until_expiry < first.ms_until_expiry);

    store.delete("k").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_token_bucket_blocks_when_empty() {
    let Some(store) = test_store("bucket").await else {
        return;
    };
    store.delete("b").await.unwrap();

    let spec = BucketSpec {
        capacity: 2,
        refill_window: Duration::from_secs(60),
        cost: 1,
        cooldown: Duration::from_secs(30),
    };

    assert!(store.token_bucket_consume("b", spec).await.unwrap().allowed);
    let last = store.token_bucket_consume("b", spec).await.unwrap();
    assert!(last.allowed);
    assert_eq!(last.remaining, 0);

    let denied = store.token_bucket_consume("b", spec).await.unwrap();
    assert!(!denied.allowed);
    assert!(denied.ms_until_next > 29_000);

    store.delete("b").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_slotted_reports_slot_wait() {
    let Some(store) = test_store("slotted").await else {
        return;
    };
    store.delete("s").await.unwrap();

    let window = Duration::from_secs(60);
    let first = store.slotted_consume("s", 6, window).await.unwrap();
    assert!(first.allowed);
    assert_eq!(first.ms_until_next, 10_000);

    let second = store.slotted_consume("s", 6, window).await.unwrap();
    assert!(!second.allowed);
    assert!(second.ms_until_next <= 10_000);
    assert!(second.ms_until_next > 9_000);

    store.delete("s").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_concurrent_consumes_share_one_quota() {
    let Some(store) = test_store("concurrent").await else {
        return;
    };
    let store: Arc<dyn CounterStore> = Arc::new(store);
    let key = LimiterKey::new("fw:", "10.0.0.1");
    store.delete(&key.to_store_key()).await.unwrap();

    let policy = LimiterPolicy::new(20, 60, Algorithm::FixedWindow, "fw:").unwrap();
    let limiter = build_limiter(policy, store.clone());

    let outcomes = join_all((0..100).map(|_| {
        let limiter = limiter.clone();
        let key = key.clone();
        tokio::spawn(async move { limiter.consume(&key).await })
    }))
    .await;

    let granted = outcomes
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .filter(|outcome| outcome.allowed)
        .count();
    assert_eq!(granted, 20);

    store.delete(&key.to_store_key()).await.unwrap();
}
