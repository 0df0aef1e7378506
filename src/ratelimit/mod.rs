//! Quota algorithms, tier selection and decision translation.

mod decision;
mod fixed_window;
mod gate;
mod key;
mod limiter;
mod policy;
mod selector;
mod sliding_window;
mod token_bucket;

pub use decision::{
    translate, QuotaExceeded, RateLimitHeaders, RejectionBody, HEADER_LIMIT, HEADER_REMAINING,
    HEADER_RESET, HEADER_RETRY_AFTER, STATUS_TOO_MANY_REQUESTS,
};
pub use fixed_window::FixedWindowLimiter;
pub use gate::{Admission, RateLimitGate};
pub use key::LimiterKey;
pub use limiter::{build_limiter, ConsumeOutcome, RateLimiter};
pub use policy::{Algorithm, LimiterPolicy, PolicyError};
pub use selector::{LimiterSelector, Membership, Selection, Subject, Tier, TierLimiters};
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;
