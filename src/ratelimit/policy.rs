//! Quota policies.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Quota algorithm a policy is enforced with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter reset at the end of each window
    FixedWindow,
    /// Minimum spacing of `window / capacity` between grants
    SlidingWindow,
    /// Continuously refilling bucket of `capacity` tokens
    TokenBucket,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
        };
        f.write_str(name)
    }
}

/// Reasons a policy cannot be constructed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("capacity must be positive")]
    ZeroCapacity,

    #[error("window must be at least one second")]
    ZeroWindow,

    #[error("key namespace must not be empty")]
    EmptyNamespace,

    #[error("token bucket of {capacity} tokens per {window_secs}s is too large to track exactly")]
    BucketTooLarge { capacity: u64, window_secs: u64 },
}

/// Largest token bucket balance, in token-milliseconds, that stays exact in
/// Lua's double-precision arithmetic.
const MAX_BUCKET_UNITS: u64 = 1 << 53;

/// Immutable quota configuration for one endpoint/tier pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterPolicy {
    capacity: u64,
    window: Duration,
    algorithm: Algorithm,
    key_namespace: String,
    block_cooldown: Option<Duration>,
}

impl LimiterPolicy {
    /// Create a policy allowing `capacity` points per `window_secs` seconds.
    pub fn new(
        capacity: u64,
        window_secs: u64,
        algorithm: Algorithm,
        key_namespace: impl Into<String>,
    ) -> Result<Self, PolicyError> {
        let key_namespace = key_namespace.into();
        if capacity == 0 {
            return Err(PolicyError::ZeroCapacity);
        }
        if window_secs == 0 {
            return Err(PolicyError::ZeroWindow);
        }
        if key_namespace.is_empty() {
            return Err(PolicyError::EmptyNamespace);
        }
        if algorithm == Algorithm::TokenBucket {
            let units = window_secs
                .checked_mul(1000)
                .and_then(|window_ms| window_ms.checked_mul(capacity));
            if !units.is_some_and(|units| units <= MAX_BUCKET_UNITS) {
                return Err(PolicyError::BucketTooLarge {
                    capacity,
                    window_secs,
                });
            }
        }

        Ok(Self {
            capacity,
            window: Duration::from_secs(window_secs),
            algorithm,
            key_namespace,
            block_cooldown: None,
        })
    }

    /// Override the token bucket cooldown applied once a key runs dry.
    ///
    /// Zero disables the cooldown.
    pub fn with_block_cooldown(mut self, cooldown: Duration) -> Self {
        self.block_cooldown = Some(cooldown);
        self
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn key_namespace(&self) -> &str {
        &self.key_namespace
    }

    /// Cooldown as configured, `None` when derived from the refill rate.
    pub fn block_cooldown(&self) -> Option<Duration> {
        self.block_cooldown
    }

    /// Cooldown in effect: the configured one, or the time to refill a single token.
    pub fn effective_block_cooldown(&self) -> Duration {
        self.block_cooldown.unwrap_or_else(|| {
            let window_ms = self.window.as_millis() as u64;
            Duration::from_millis(window_ms.div_ceil(self.capacity))
        })
    }
}
