//! Request admission service.
//!
//! Built once at startup and shared by every request task. Wires the selector,
//! the per-tier limiters and the decision translator together.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::decision::{translate, RateLimitHeaders};
use super::key::LimiterKey;
use super::limiter::{build_limiter, ConsumeOutcome};
use super::selector::{LimiterSelector, Selection, Subject, Tier, TierLimiters};
use crate::config::QuorateConfig;
use crate::error::{RateLimitError, Result};
use crate::store::{CounterStore, StoreError};

/// An admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub tier: Tier,
    pub key: LimiterKey,
    pub headers: RateLimitHeaders,
}

/// Admits or rejects requests against their tier's quota.
pub struct RateLimitGate {
    selector: LimiterSelector,
    /// Caller-side deadline for each store call
    store_timeout: Option<Duration>,
}

impl RateLimitGate {
    pub fn new(selector: LimiterSelector) -> Self {
        Self {
            selector,
            store_timeout: None,
        }
    }

    /// Bound every store call; an elapsed deadline is reported as a store failure.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    /// Build limiters for every tier from configuration.
    pub fn from_config(config: &QuorateConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        let policies = &config.policies;
        let limiters = TierLimiters {
            restricted: build_limiter(policies.restricted.to_policy("restricted")?, store.clone()),
            trusted: build_limiter(policies.trusted.to_policy("trusted")?, store.clone()),
            authenticated: build_limiter(
                policies.authenticated.to_policy("authenticated")?,
                store.clone(),
            ),
            anonymous: build_limiter(policies.anonymous.to_policy("anonymous")?, store),
        };

        let selector = LimiterSelector::new(
            limiters,
            config.trusted.to_membership(),
            config.restricted.to_membership(),
        );

        info!(
            trusted_ips = config.trusted.ips.len(),
            trusted_users = config.trusted.users.len(),
            restricted_ips = config.restricted.ips.len(),
            restricted_users = config.restricted.users.len(),
            "Rate limit gate initialized"
        );

        let gate = Self::new(selector);
        Ok(match config.store.timeout() {
            Some(timeout) => gate.with_store_timeout(timeout),
            None => gate,
        })
    }

    pub fn selector(&self) -> &LimiterSelector {
        &self.selector
    }

    /// Consume one point for the subject and translate the outcome.
    #[instrument(skip(self, subject), fields(ip = %subject.ip, user = ?subject.user_id))]
    pub async fn check(&self, subject: &Subject) -> std::result::Result<Admission, RateLimitError> {
        let selection = self.selector.select(subject);
        let outcome = self.consume(&selection).await?;

        match translate(&outcome, Utc::now()) {
            Ok(headers) => Ok(Admission {
                tier: selection.tier,
                key: selection.key,
                headers,
            }),
            Err(rejection) => {
                debug!(
                    tier = %selection.tier,
                    key = %selection.key,
                    retry_after = rejection.retry_after_secs,
                    "Request over quota"
                );
                Err(RateLimitError::QuotaExceeded(rejection))
            }
        }
    }

    /// Clear the subject's counter for the tier it currently falls in.
    pub async fn reset(&self, subject: &Subject) -> std::result::Result<Selection, StoreError> {
        let selection = self.selector.select(subject);
        selection.limiter.reset(&selection.key).await.map_err(|e| {
            warn!(key = %selection.key, error = %e, "Failed to reset quota");
            e
        })?;
        info!(tier = %selection.tier, key = %selection.key, "Quota reset");
        Ok(selection)
    }

    async fn consume(
        &self,
        selection: &Selection,
    ) -> std::result::Result<ConsumeOutcome, StoreError> {
        let consume = selection.limiter.consume(&selection.key);
        let result = match self.store_timeout {
            Some(timeout) => tokio::time::timeout(timeout, consume)
                .await
                .unwrap_or(Err(StoreError::Timeout(timeout))),
            None => consume.await,
        };

        result.map_err(|e| {
            warn!(
                tier = %selection.tier,
                key = %selection.key,
                error = %e,
                "Counter store failure during consume"
            );
            e
        })
    }
}
