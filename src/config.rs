//! Configuration management for Quorate.
//!
//! Loaded once at startup from an optional YAML file, overridden by
//! `QUORATE__`-prefixed environment variables
//! (e.g. `QUORATE__STORE__URL=redis://cache:6379/`), and immutable afterwards.
//! Every field is optional: a tier policy given in part keeps that tier's
//! defaults for the rest (`QUORATE__POLICIES__ANONYMOUS__CAPACITY=5` alone
//! is a valid override).

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{QuorateError, Result};
use crate::ratelimit::{Algorithm, LimiterPolicy, Membership};

/// Main configuration for the Quorate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuorateConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// One policy per tier
    #[serde(default)]
    pub policies: TierPolicies,

    /// Identities granted the trusted policy
    #[serde(default)]
    pub trusted: MembershipConfig,

    /// Identities held to the restricted policy
    #[serde(default)]
    pub restricted: MembershipConfig,
}

/// Which counter store backs the limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// Process-local; quotas are not shared between instances
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix put in front of every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline for a single store call; none when unset
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: None,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_prefix() -> String {
    "quorate:".to_string()
}

/// Policy parameters for one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyConfig {
    /// Points allowed per window
    pub capacity: u64,
    /// Window length in seconds
    pub window_secs: u64,
    pub algorithm: Algorithm,
    /// Prefix separating this tier's counters from the others
    pub key_namespace: String,
    /// Token bucket cooldown once empty; derived from the refill rate when unset
    pub block_cooldown_secs: Option<u64>,
}

/// A tier policy as written in a source, with any field left out.
#[derive(Debug, Clone, Default, Deserialize)]
struct PolicyOverride {
    capacity: Option<u64>,
    window_secs: Option<u64>,
    algorithm: Option<Algorithm>,
    key_namespace: Option<String>,
    block_cooldown_secs: Option<u64>,
}

impl PolicyOverride {
    fn apply_to(self, mut policy: PolicyConfig) -> PolicyConfig {
        if let Some(capacity) = self.capacity {
            policy.capacity = capacity;
        }
        if let Some(window_secs) = self.window_secs {
            policy.window_secs = window_secs;
        }
        if let Some(algorithm) = self.algorithm {
            policy.algorithm = algorithm;
        }
        if let Some(key_namespace) = self.key_namespace {
            policy.key_namespace = key_namespace;
        }
        if self.block_cooldown_secs.is_some() {
            policy.block_cooldown_secs = self.block_cooldown_secs;
        }
        policy
    }
}

impl PolicyConfig {
    fn new(capacity: u64, window_secs: u64, algorithm: Algorithm, key_namespace: &str) -> Self {
        Self {
            capacity,
            window_secs,
            algorithm,
            key_namespace: key_namespace.to_string(),
            block_cooldown_secs: None,
        }
    }

    /// Validate into a policy.
    pub fn to_policy(&self, tier: &'static str) -> Result<LimiterPolicy> {
        let policy = LimiterPolicy::new(
            self.capacity,
            self.window_secs,
            self.algorithm,
            self.key_namespace.clone(),
        )
        .map_err(|source| QuorateError::Policy { tier, source })?;

        Ok(match self.block_cooldown_secs {
            Some(secs) => policy.with_block_cooldown(Duration::from_secs(secs)),
            None => policy,
        })
    }
}

/// Policies for each tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "TierOverrides")]
pub struct TierPolicies {
    pub restricted: PolicyConfig,
    pub trusted: PolicyConfig,
    pub authenticated: PolicyConfig,
    pub anonymous: PolicyConfig,
}

#[derive(Debug, Default, Deserialize)]
struct TierOverrides {
    #[serde(default)]
    restricted: PolicyOverride,
    #[serde(default)]
    trusted: PolicyOverride,
    #[serde(default)]
    authenticated: PolicyOverride,
    #[serde(default)]
    anonymous: PolicyOverride,
}

impl From<TierOverrides> for TierPolicies {
    fn from(overrides: TierOverrides) -> Self {
        Self {
            restricted: overrides.restricted.apply_to(default_restricted()),
            trusted: overrides.trusted.apply_to(default_trusted()),
            authenticated: overrides.authenticated.apply_to(default_authenticated()),
            anonymous: overrides.anonymous.apply_to(default_anonymous()),
        }
    }
}

impl Default for TierPolicies {
    fn default() -> Self {
        Self {
            restricted: default_restricted(),
            trusted: default_trusted(),
            authenticated: default_authenticated(),
            anonymous: default_anonymous(),
        }
    }
}

fn default_restricted() -> PolicyConfig {
    PolicyConfig::new(10, 60, Algorithm::FixedWindow, "restricted:")
}

fn default_trusted() -> PolicyConfig {
    PolicyConfig::new(1000, 60, Algorithm::TokenBucket, "trusted:")
}

fn default_authenticated() -> PolicyConfig {
    PolicyConfig::new(300, 60, Algorithm::SlidingWindow, "user:")
}

fn default_anonymous() -> PolicyConfig {
    PolicyConfig::new(60, 60, Algorithm::FixedWindow, "anon:")
}

/// IPs and user ids belonging to a tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MembershipConfig {
    #[serde(default)]
    pub ips: Vec<IpAddr>,
    #[serde(default)]
    pub users: Vec<String>,
}

impl MembershipConfig {
    pub fn to_membership(&self) -> Membership {
        Membership::new(self.ips.iter().copied(), self.users.iter().cloned())
    }
}

impl QuorateConfig {
    /// Load from an optional YAML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let config: QuorateConfig = builder
            .add_source(
                config::Environment::with_prefix("QUORATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a YAML file alone, without environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| QuorateError::Config(e.to_string()))
    }
}
