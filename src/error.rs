//! Error types for Quorate.

use thiserror::Error;

use crate::ratelimit::{PolicyError, QuotaExceeded};
use crate::store::StoreError;

/// Errors raised while setting up or operating the service.
#[derive(Error, Debug)]
pub enum QuorateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid quota policy
    #[error("Invalid policy for tier {tier}: {source}")]
    Policy {
        tier: &'static str,
        #[source]
        source: PolicyError,
    },

    /// Counter store errors
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for QuorateError {
    fn from(e: config::ConfigError) -> Self {
        QuorateError::Config(e.to_string())
    }
}

/// Result type alias for Quorate operations.
pub type Result<T> = std::result::Result<T, QuorateError>;

/// What went wrong with a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request is over its quota
    QuotaExceeded,
    /// The counter store failed
    StoreFailure,
}

/// Failure of a rate limit check.
///
/// A denial and an infrastructure failure are distinct variants; callers
/// branch on [`RateLimitError::kind`].
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Too many requests, retry after {}s", .0.retry_after_secs)]
    QuotaExceeded(QuotaExceeded),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Status code used for store failures.
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

impl RateLimitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RateLimitError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            RateLimitError::Store(_) => ErrorKind::StoreFailure,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            RateLimitError::QuotaExceeded(q) => q.status_code(),
            RateLimitError::Store(_) => STATUS_SERVICE_UNAVAILABLE,
        }
    }

    /// Response headers; store failures carry none.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            RateLimitError::QuotaExceeded(q) => q.to_headers(),
            RateLimitError::Store(_) => Vec::new(),
        }
    }
}

impl From<QuotaExceeded> for RateLimitError {
    fn from(q: QuotaExceeded) -> Self {
        RateLimitError::QuotaExceeded(q)
    }
}
