//! In-process counter store.
//!
//! Every primitive runs inside a `DashMap` entry guard, so concurrent calls
//! for the same key are serialized by the shard lock and never observe the
//! same pre-update state. Nothing is held across an await point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::{slot_millis, BucketSpec, CounterStore, Grant, StoreError, WindowCount};

/// Expired records are swept once every this many primitive calls.
const PURGE_INTERVAL: u64 = 1024;

/// Per-key state, one shape per primitive.
#[derive(Debug, Clone)]
enum Record {
    Counter {
        total: u64,
        expires_at: u64,
    },
    Slots {
        last_grant: Option<u64>,
        granted: u64,
        anchor: u64,
        expires_at: u64,
    },
    Bucket {
        /// Token balance scaled by the refill window in ms, so refill stays integral.
        units: u64,
        last_refill: u64,
        blocked_until: u64,
        expires_at: u64,
    },
}

impl Record {
    fn expires_at(&self) -> u64 {
        match self {
            Record::Counter { expires_at, .. }
            | Record::Slots { expires_at, .. }
            | Record::Bucket { expires_at, .. } => *expires_at,
        }
    }
}

/// Counter store living in process memory.
///
/// Only consistent within a single process; use `RedisStore` to share
/// quotas between instances. Expired records are dropped lazily, by a sweep
/// every `PURGE_INTERVAL` calls.
pub struct MemoryStore {
    records: DashMap<String, Record>,
    clock: Arc<dyn Clock>,
    calls: AtomicU64,
}

impl MemoryStore {
    /// Create a store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store reading time from the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
            calls: AtomicU64::new(0),
        }
    }

    /// Number of live records, counting ones not yet purged after expiry.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop records whose TTL has elapsed.
    pub fn purge_expired(&self) {
        let now = self.clock.now_millis();
        self.records.retain(|_, record| record.expires_at() > now);
    }

    /// Count a call and sweep on every `PURGE_INTERVAL`th one.
    ///
    /// Must run before any entry guard is taken, `retain` locks every shard.
    fn tick(&self) {
        let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if calls % PURGE_INTERVAL == 0 {
            let before = self.records.len();
            self.purge_expired();
            trace!(purged = before.saturating_sub(self.records.len()), "Swept expired records");
        }
    }

    /// Lock the entry for `key`, replacing it with `fresh()` if absent or expired.
    fn live_entry(
        &self,
        key: &str,
        now: u64,
        fresh: impl Fn() -> Record,
    ) -> RefMut<'_, String, Record> {
        let mut entry = self.records.entry(key.to_string()).or_insert_with(&fresh);
        if entry.expires_at() <= now {
            trace!(key = %key, "Replacing expired record");
            *entry = fresh();
        }
        entry
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Protocol(format!(
        "WRONGTYPE key {} holds a record of another algorithm",
        key
    ))
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_with_expiry(
        &self,
        key: &str,
        amount: u64,
        ttl: Duration,
    ) -> Result<WindowCount, StoreError> {
        self.tick();
        let now = self.clock.now_millis();
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let mut entry = self.live_entry(key, now, || Record::Counter {
            total: 0,
            expires_at: now.saturating_add(ttl_ms),
        });

        match &mut *entry {
            Record::Counter { total, expires_at } => {
                *total = total.saturating_add(amount);
                Ok(WindowCount {
                    total: *total,
                    ms_until_expiry: expires_at.saturating_sub(now),
                })
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn token_bucket_consume(&self, key: &str, spec: BucketSpec) -> Result<Grant, StoreError> {
        self.tick();
        let now = self.clock.now_millis();
        let window_ms = (spec.refill_window.as_millis() as u64).max(1);
        let cooldown_ms = spec.cooldown.as_millis() as u64;
        let capacity = spec.capacity.max(1);
        let full = capacity.saturating_mul(window_ms);
        let ttl_ms = window_ms.saturating_add(cooldown_ms);

        let mut entry = self.live_entry(key, now, || Record::Bucket {
            units: full,
            last_refill: now,
            blocked_until: 0,
            expires_at: now.saturating_add(ttl_ms),
        });

        let Record::Bucket {
            units,
            last_refill,
            blocked_until,
            expires_at,
        } = &mut *entry
        else {
            return Err(wrong_type(key));
        };

        let elapsed = now.saturating_sub(*last_refill);
        *units = units
            .saturating_add(elapsed.saturating_mul(capacity))
            .min(full);
        *last_refill = now;
        *expires_at = now.saturating_add(ttl_ms);

        let cost = spec.cost.saturating_mul(window_ms);
        let allowed = if *blocked_until > now {
            false
        } else if *units >= cost {
            *units -= cost;
            if *units < cost && cooldown_ms > 0 {
                *blocked_until = now.saturating_add(cooldown_ms);
            }
            true
        } else {
            if cooldown_ms > 0 {
                *blocked_until = now.saturating_add(cooldown_ms);
            }
            false
        };

        let token_wait = if allowed {
            next_token_wait(*units, full, window_ms, capacity)
        } else {
            (cost - (*units).min(cost)).div_ceil(capacity)
        };

        Ok(Grant {
            allowed,
            remaining: *units / window_ms,
            ms_until_next: token_wait.max(blocked_until.saturating_sub(now)),
        })
    }

    async fn slotted_consume(
        &self,
        key: &str,
        capacity: u64,
        window: Duration,
    ) -> Result<Grant, StoreError> {
        self.tick();
        let now = self.clock.now_millis();
        let window_ms = (window.as_millis() as u64).max(1);
        let slot = slot_millis(capacity, window);

        let mut entry = self.live_entry(key, now, || Record::Slots {
            last_grant: None,
            granted: 0,
            anchor: now,
            expires_at: now.saturating_add(window_ms),
        });

        let Record::Slots {
            last_grant,
            granted,
            anchor,
            expires_at,
        } = &mut *entry
        else {
            return Err(wrong_type(key));
        };

        if now.saturating_sub(*anchor) >= window_ms {
            *anchor = now;
            *granted = 0;
        }

        if let Some(last) = *last_grant {
            let since = now.saturating_sub(last);
            if since < slot {
                return Ok(Grant {
                    allowed: false,
                    remaining: capacity.saturating_sub(*granted),
                    ms_until_next: slot - since,
                });
            }
        }

        *last_grant = Some(now);
        *granted += 1;
        *expires_at = now.saturating_add(window_ms);

        Ok(Grant {
            allowed: true,
            remaining: capacity.saturating_sub(*granted),
            ms_until_next: slot,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.records.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Milliseconds until the balance reaches the next whole token.
fn next_token_wait(units: u64, full: u64, window_ms: u64, capacity: u64) -> u64 {
    if units >= full {
        return 0;
    }
    let missing = window_ms - units % window_ms;
    missing.div_ceil(capacity)
}
