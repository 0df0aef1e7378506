//! Limiter key generation.

use std::fmt;

/// Identifies one quota counter in the store.
///
/// The key is the policy namespace followed by the subject identifier, so two
/// tiers never share a counter even for the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    /// Namespace of the policy the key belongs to
    pub namespace: String,
    /// Client IP or authenticated user id
    pub subject: String,
}

impl LimiterKey {
    pub fn new(namespace: &str, subject: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            subject: subject.to_string(),
        }
    }

    /// The key as stored.
    pub fn to_store_key(&self) -> String {
        format!("{}{}", self.namespace, self.subject)
    }
}

impl fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.namespace, self.subject)
    }
}
