//! Translation of consume outcomes into the response contract.
//!
//! Allowed requests get the informational `X-RateLimit-*` headers. Denied
//! requests get the same headers plus `Retry-After`, a 429 status and a JSON
//! rejection body.

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::Serialize;

use super::limiter::ConsumeOutcome;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Status code for a denied request.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Informational quota headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// When the quota frees up again
    pub reset: DateTime<Utc>,
}

impl RateLimitHeaders {
    pub fn to_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (
                HEADER_RESET,
                self.reset.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        ]
    }
}

/// Body sent with a 429.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: &'static str,
    pub message: String,
    pub retry_after: u64,
}

/// A request denied by its quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaExceeded {
    pub headers: RateLimitHeaders,
    pub ms_until_reset: u64,
    /// `ceil(ms_until_reset / 1000)`
    pub retry_after_secs: u64,
}

impl QuotaExceeded {
    pub fn limit(&self) -> u64 {
        self.headers.limit
    }

    pub fn remaining(&self) -> u64 {
        self.headers.remaining
    }

    pub fn status_code(&self) -> u16 {
        STATUS_TOO_MANY_REQUESTS
    }

    /// Quota headers followed by `Retry-After`.
    pub fn to_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = self.headers.to_headers();
        headers.push((HEADER_RETRY_AFTER, self.retry_after_secs.to_string()));
        headers
    }

    pub fn body(&self) -> RejectionBody {
        RejectionBody {
            error: "Too Many Requests",
            message: format!(
                "Rate limit exceeded. Try again in {} seconds.",
                self.retry_after_secs
            ),
            retry_after: self.retry_after_secs,
        }
    }
}

/// Map an outcome to headers, or to a rejection when it was denied.
pub fn translate(
    outcome: &ConsumeOutcome,
    now: DateTime<Utc>,
) -> Result<RateLimitHeaders, QuotaExceeded> {
    let headers = RateLimitHeaders {
        limit: outcome.limit,
        remaining: outcome.remaining.min(outcome.limit),
        reset: reset_at(now, outcome.ms_until_reset),
    };

    if outcome.allowed {
        Ok(headers)
    } else {
        Err(QuotaExceeded {
            headers,
            ms_until_reset: outcome.ms_until_reset,
            retry_after_secs: outcome.ms_until_reset.div_ceil(1000),
        })
    }
}

fn reset_at(now: DateTime<Utc>, ms_until_reset: u64) -> DateTime<Utc> {
    i64::try_from(ms_until_reset)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn header<'a>(headers: &'a [(&'static str, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_allowed_headers() {
        let outcome = ConsumeOutcome::new(true, 10, 7, 1_500);
        let headers = translate(&outcome, now()).unwrap().to_headers();

        assert_eq!(header(&headers, HEADER_LIMIT), Some("10"));
        assert_eq!(header(&headers, HEADER_REMAINING), Some("7"));
        assert_eq!(
            header(&headers, HEADER_RESET),
            Some("2024-03-01T12:00:01.500Z")
        );
        assert_eq!(header(&headers, HEADER_RETRY_AFTER), None);
    }

    #[test]
    fn test_denied_adds_retry_after() {
        let outcome = ConsumeOutcome::new(false, 10, 0, 2_001);
        let rejection = translate(&outcome, now()).unwrap_err();

        assert_eq!(rejection.retry_after_secs, 3);
        assert_eq!(rejection.status_code(), 429);
        assert_eq!(rejection.limit(), 10);
        assert_eq!(rejection.remaining(), 0);

        let headers = rejection.to_headers();
        assert_eq!(header(&headers, HEADER_RETRY_AFTER), Some("3"));
        assert_eq!(header(&headers, HEADER_LIMIT), Some("10"));
    }

    #[test]
    fn test_retry_after_rounds_up_exact_seconds() {
        let outcome = ConsumeOutcome::new(false, 1, 0, 4_000);
        assert_eq!(translate(&outcome, now()).unwrap_err().retry_after_secs, 4);

        let outcome = ConsumeOutcome::new(false, 1, 0, 1);
        assert_eq!(translate(&outcome, now()).unwrap_err().retry_after_secs, 1);
    }

    #[test]
    fn test_rejection_body_json() {
        let outcome = ConsumeOutcome::new(false, 5, 0, 30_000);
        let body = translate(&outcome, now()).unwrap_err().body();
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["error"], "Too Many Requests");
        assert_eq!(json["retryAfter"], 30);
        assert_eq!(
            json["message"],
            "Rate limit exceeded. Try again in 30 seconds."
        );
    }

    #[test]
    fn test_huge_wait_saturates() {
        let outcome = ConsumeOutcome::new(true, 1, 1, u64::MAX);
        let headers = translate(&outcome, now()).unwrap();
        assert_eq!(headers.reset, DateTime::<Utc>::MAX_UTC);
    }
}
