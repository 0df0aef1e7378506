//! End-to-end checks of the gate against the in-process store.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio_test::{assert_err, assert_ok};

use quorate::config::QuorateConfig;
use quorate::error::{ErrorKind, RateLimitError};
use quorate::ratelimit::{
    build_limiter, Algorithm, LimiterKey, LimiterPolicy, RateLimitGate, RateLimiter, Subject,
    Tier, HEADER_LIMIT, HEADER_REMAINING, HEADER_RETRY_AFTER,
};
use quorate::store::{CounterStore, MemoryStore, MockClock};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn header<'a>(headers: &'a [(&'static str, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.as_str())
}

/// Fire `n` consumes for one key from concurrent tasks and count the grants.
async fn concurrent_grants(limiter: Arc<dyn RateLimiter>, key: LimiterKey, n: usize) -> usize {
    let tasks = (0..n).map(|_| {
        let limiter = limiter.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let yields = rand::thread_rng().gen_range(0..4);
            for _ in 0..yields {
                tokio::task::yield_now().await;
            }
            limiter.consume(&key).await
        })
    });

    join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("store failed"))
        .filter(|outcome| outcome.allowed)
        .count()
}

fn frozen_store() -> Arc<dyn CounterStore> {
    Arc::new(MemoryStore::with_clock(Arc::new(MockClock::default())))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fixed_window_grants_exactly_capacity() {
    let policy = LimiterPolicy::new(10, 60, Algorithm::FixedWindow, "fw:").unwrap();
    let limiter = build_limiter(policy, frozen_store());

    let granted = concurrent_grants(limiter, LimiterKey::new("fw:", "10.0.0.1"), 100).await;
    assert_eq!(granted, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_token_bucket_grants_exactly_capacity() {
    let policy = LimiterPolicy::new(25, 60, Algorithm::TokenBucket, "tb:").unwrap();
    let limiter = build_limiter(policy, frozen_store());

    let granted = concurrent_grants(limiter, LimiterKey::new("tb:", "10.0.0.1"), 200).await;
    assert_eq!(granted, 25);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sliding_window_grants_one_slot() {
    let policy = LimiterPolicy::new(10, 60, Algorithm::SlidingWindow, "sw:").unwrap();
    let limiter = build_limiter(policy, frozen_store());

    // Every request lands in the same instant, so only one slot is free.
    let granted = concurrent_grants(limiter, LimiterKey::new("sw:", "10.0.0.1"), 50).await;
    assert_eq!(granted, 1);
}

#[tokio::test]
async fn test_restricted_denied_while_default_has_quota() {
    let yaml = r#"
store:
  backend: memory
policies:
  restricted:
    capacity: 2
    window_secs: 60
    key_namespace: "restricted:"
  anonymous:
    capacity: 10
    window_secs: 60
    key_namespace: "anon:"
restricted:
  ips: ["192.0.2.66"]
trusted:
  ips: ["192.0.2.66", "10.0.0.1"]
"#;
    let config = QuorateConfig::from_yaml(yaml).unwrap();
    let gate = RateLimitGate::from_config(&config, Arc::new(MemoryStore::new())).unwrap();

    let restricted = Subject::anonymous(ip("192.0.2.66"));
    let ordinary = Subject::anonymous(ip("198.51.100.7"));

    for _ in 0..2 {
        let admission = assert_ok!(gate.check(&restricted).await);
        assert_eq!(admission.tier, Tier::Restricted);
    }
    let err = assert_err!(gate.check(&restricted).await);
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

    let admission = assert_ok!(gate.check(&ordinary).await);
    assert_eq!(admission.tier, Tier::Anonymous);
    assert_eq!(admission.headers.remaining, 9);

    let trusted = assert_ok!(gate.check(&Subject::anonymous(ip("10.0.0.1"))).await);
    assert_eq!(trusted.tier, Tier::Trusted);
}

#[tokio::test]
async fn test_same_identity_in_different_tiers_never_collides() {
    let mut config = QuorateConfig::default();
    config.policies.authenticated.capacity = 1;
    config.policies.authenticated.algorithm = Algorithm::FixedWindow;
    config.policies.anonymous.capacity = 1;
    let gate = RateLimitGate::from_config(&config, Arc::new(MemoryStore::new())).unwrap();

    // "10.0.0.1" used as a user id and as an IP lands in two namespaces.
    let as_user = Subject::authenticated(ip("203.0.113.1"), "10.0.0.1");
    let as_ip = Subject::anonymous(ip("10.0.0.1"));

    assert_ok!(gate.check(&as_user).await);
    assert_ok!(gate.check(&as_ip).await);
    assert_err!(gate.check(&as_user).await);
    assert_err!(gate.check(&as_ip).await);
}

#[tokio::test]
async fn test_retry_after_present_iff_denied() {
    let clock = MockClock::default();
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let mut config = QuorateConfig::default();
    config.policies.anonymous.capacity = 3;
    config.policies.anonymous.window_secs = 10;
    let gate = RateLimitGate::from_config(&config, store).unwrap();
    let subject = Subject::anonymous(ip("198.51.100.7"));

    for round in 0..8 {
        match gate.check(&subject).await {
            Ok(admission) => {
                assert!(round < 3);
                let headers = admission.headers.to_headers();
                assert_eq!(header(&headers, HEADER_RETRY_AFTER), None);
                assert_eq!(header(&headers, HEADER_LIMIT), Some("3"));
                assert!(admission.headers.remaining <= admission.headers.limit);
            }
            Err(RateLimitError::QuotaExceeded(rejection)) => {
                assert!(round >= 3);
                let headers = rejection.to_headers();
                assert_eq!(header(&headers, HEADER_REMAINING), Some("0"));
                assert_eq!(header(&headers, HEADER_RETRY_AFTER), Some("10"));
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    clock.advance(Duration::from_secs(10));
    let admission = assert_ok!(gate.check(&subject).await);
    assert_eq!(admission.headers.remaining, 2);
}
