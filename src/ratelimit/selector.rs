//! Tier classification and limiter selection.
//!
//! Selection is recomputed for every request. Membership sets are fixed when
//! the selector is built and only read afterwards.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;

use super::key::LimiterKey;
use super::limiter::RateLimiter;

/// Who a request comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Client network address
    pub ip: IpAddr,
    /// User id supplied by the authentication layer, if any
    pub user_id: Option<String>,
}

impl Subject {
    pub fn anonymous(ip: IpAddr) -> Self {
        Self { ip, user_id: None }
    }

    pub fn authenticated(ip: IpAddr, user_id: impl Into<String>) -> Self {
        Self {
            ip,
            user_id: Some(user_id.into()),
        }
    }

    /// Identifier the quota is tracked under: the user id when known, else the IP.
    pub fn identity(&self) -> String {
        match &self.user_id {
            Some(user) => user.clone(),
            None => self.ip.to_string(),
        }
    }
}

/// Classification bucket mapping to a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Restricted,
    Trusted,
    Authenticated,
    Anonymous,
}

impl Tier {
    pub fn name(&self) -> &'static str {
        match self {
            Tier::Restricted => "restricted",
            Tier::Trusted => "trusted",
            Tier::Authenticated => "authenticated",
            Tier::Anonymous => "anonymous",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of IPs and user ids belonging to a tier.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    ips: HashSet<IpAddr>,
    users: HashSet<String>,
}

impl Membership {
    pub fn new(
        ips: impl IntoIterator<Item = IpAddr>,
        users: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            ips: ips.into_iter().collect(),
            users: users.into_iter().collect(),
        }
    }

    /// Whether the subject's IP or user id is listed.
    pub fn contains(&self, subject: &Subject) -> bool {
        self.ips.contains(&subject.ip)
            || subject
                .user_id
                .as_ref()
                .is_some_and(|user| self.users.contains(user))
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.users.is_empty()
    }
}

/// One limiter per tier.
#[derive(Clone)]
pub struct TierLimiters {
    pub restricted: Arc<dyn RateLimiter>,
    pub trusted: Arc<dyn RateLimiter>,
    pub authenticated: Arc<dyn RateLimiter>,
    pub anonymous: Arc<dyn RateLimiter>,
}

impl TierLimiters {
    pub fn get(&self, tier: Tier) -> &Arc<dyn RateLimiter> {
        match tier {
            Tier::Restricted => &self.restricted,
            Tier::Trusted => &self.trusted,
            Tier::Authenticated => &self.authenticated,
            Tier::Anonymous => &self.anonymous,
        }
    }
}

/// The limiter and key chosen for a request.
#[derive(Clone)]
pub struct Selection {
    pub tier: Tier,
    pub limiter: Arc<dyn RateLimiter>,
    pub key: LimiterKey,
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selection")
            .field("tier", &self.tier)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Picks the tier, limiter and key for each request.
pub struct LimiterSelector {
    limiters: TierLimiters,
    trusted: Membership,
    restricted: Membership,
}

impl LimiterSelector {
    pub fn new(limiters: TierLimiters, trusted: Membership, restricted: Membership) -> Self {
        Self {
            limiters,
            trusted,
            restricted,
        }
    }

    /// Classify a subject. First match wins: restricted, trusted, authenticated, anonymous.
    pub fn classify(&self, subject: &Subject) -> Tier {
        if self.restricted.contains(subject) {
            Tier::Restricted
        } else if self.trusted.contains(subject) {
            Tier::Trusted
        } else if subject.user_id.is_some() {
            Tier::Authenticated
        } else {
            Tier::Anonymous
        }
    }

    pub fn select(&self, subject: &Subject) -> Selection {
        let tier = self.classify(subject);
        let limiter = self.limiters.get(tier).clone();
        let key = LimiterKey::new(limiter.policy().key_namespace(), &subject.identity());
        Selection { tier, limiter, key }
    }
}
