//! Subscription tiers and their quota policies.
//!
//! The built-in table is the reference policy for every tier. Deployments
//! may override individual tiers through configuration; anything not
//! overridden keeps the built-in limits. Lookups never fail: an unknown or
//! missing tier resolves to [`Tier::Anonymous`], the most restrictive one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::debug;

use super::window::Granularity;

/// Subscription tier, ordered from most to least restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Free,
    Starter,
    Professional,
    Enterprise,
}

impl Tier {
    /// All tiers, lowest to highest.
    pub const ALL: [Tier; 5] = [
        Tier::Anonymous,
        Tier::Free,
        Tier::Starter,
        Tier::Professional,
        Tier::Enterprise,
    ];

    /// Lowercase tier name as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Resolve an optional tier name, falling back to `Anonymous`.
    pub fn resolve(name: Option<&str>) -> Tier {
        match name {
            Some(name) => name.parse().unwrap_or_else(|_| {
                debug!(tier = %name, "Unknown tier, using anonymous");
                Tier::Anonymous
            }),
            None => Tier::Anonymous,
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Tier::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| UnknownTier(name.to_string()))
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing a tier name that is not in the table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tier: {0}")]
pub struct UnknownTier(pub String);

/// Quota limits for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub per_minute: u64,
    pub per_hour: u64,
    pub per_day: u64,
    /// Requests allowed per 10-second burst window
    pub burst_limit: u64,
}

impl TierPolicy {
    pub const fn new(per_minute: u64, per_hour: u64, per_day: u64, burst_limit: u64) -> Self {
        Self {
            per_minute,
            per_hour,
            per_day,
            burst_limit,
        }
    }

    /// The limit that applies to a window granularity.
    pub fn limit_for(&self, granularity: Granularity) -> u64 {
        match granularity {
            Granularity::Burst => self.burst_limit,
            Granularity::Minute => self.per_minute,
            Granularity::Hour => self.per_hour,
            Granularity::Day => self.per_day,
        }
    }
}

/// Built-in policies, indexed by `Tier as usize`.
const BUILTIN_POLICIES: [TierPolicy; 5] = [
    TierPolicy::new(10, 50, 100, 5),
    TierPolicy::new(30, 500, 1_000, 10),
    TierPolicy::new(100, 2_000, 10_000, 30),
    TierPolicy::new(300, 10_000, 50_000, 100),
    TierPolicy::new(1_000, 50_000, 500_000, 500),
];

/// Lookup table from tier to policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPolicyRegistry {
    policies: [TierPolicy; 5],
}

impl TierPolicyRegistry {
    /// Registry with the built-in policy for every tier.
    pub fn new() -> Self {
        Self {
            policies: BUILTIN_POLICIES,
        }
    }

    /// Registry with some tiers replaced by configured policies.
    pub fn with_overrides(overrides: &HashMap<Tier, TierPolicy>) -> Self {
        let mut registry = Self::new();
        for (tier, policy) in overrides {
            debug!(tier = %tier, policy = ?policy, "Overriding tier policy");
            registry.policies[tier.index()] = *policy;
        }
        registry
    }

    /// The policy for a tier.
    pub fn policy(&self, tier: Tier) -> &TierPolicy {
        &self.policies[tier.index()]
    }

    /// Resolve an optional tier name to a tier and its policy.
    ///
    /// Unknown or missing names get the anonymous policy.
    pub fn resolve(&self, name: Option<&str>) -> (Tier, &TierPolicy) {
        let tier = Tier::resolve(name);
        (tier, self.policy(tier))
    }
}

impl Default for TierPolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
