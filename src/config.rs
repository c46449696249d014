//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{EscalationPolicy, Tier, TierPolicy, TierPolicyRegistry};

/// Prefix for environment variable overrides, e.g.
/// `TURNSTILE__LIMITER__FAIL_OPEN=true`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Upper bound for any configured duration: one year.
const MAX_DURATION_SECS: u64 = 365 * 24 * 3600;

/// Main configuration for the limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Escalation and housekeeping settings
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Per-tier overrides of the built-in quota table, keyed by tier name
    #[serde(default)]
    pub tiers: HashMap<String, TierPolicy>,
}

/// Escalation and housekeeping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Violations per bucket that trigger a block
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,

    /// Lifetime of a violation bucket in seconds
    #[serde(default = "default_violation_window")]
    pub violation_window_secs: u64,

    /// Block duration in seconds
    #[serde(default = "default_block_duration")]
    pub block_duration_secs: u64,

    /// Interval between sweeps of expired state in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Admit requests when the store fails instead of denying them
    #[serde(default)]
    pub fail_open: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            violation_threshold: default_violation_threshold(),
            violation_window_secs: default_violation_window(),
            block_duration_secs: default_block_duration(),
            sweep_interval_secs: default_sweep_interval(),
            fail_open: false,
        }
    }
}

fn default_violation_threshold() -> u32 {
    10
}

fn default_violation_window() -> u64 {
    3600
}

fn default_block_duration() -> u64 {
    900
}

fn default_sweep_interval() -> u64 {
    300
}

impl LimiterConfig {
    /// Escalation policy described by this configuration.
    pub fn escalation_policy(&self) -> Result<EscalationPolicy> {
        let violation_window =
            bounded_seconds("violation_window_secs", self.violation_window_secs)?;
        let block_duration = bounded_seconds("block_duration_secs", self.block_duration_secs)?;
        Ok(EscalationPolicy {
            threshold: self.violation_threshold,
            violation_window,
            block_duration,
        })
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Convert a configured number of seconds, rejecting zero and anything
/// longer than a year.
fn bounded_seconds(name: &str, secs: u64) -> Result<chrono::Duration> {
    if secs == 0 {
        return Err(TurnstileError::Config(format!(
            "limiter.{} must be greater than zero",
            name
        )));
    }
    if secs > MAX_DURATION_SECS {
        return Err(TurnstileError::Config(format!(
            "limiter.{} must be at most {} seconds, got {}",
            name, MAX_DURATION_SECS, secs
        )));
    }
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| TurnstileError::Config(format!("limiter.{} is out of range", name)))
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `TURNSTILE__*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(::config::File::with_name(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        let limiter = &self.limiter;
        if limiter.violation_threshold == 0 {
            return Err(TurnstileError::Config(
                "limiter.violation_threshold must be at least 1".to_string(),
            ));
        }
        limiter.escalation_policy()?;
        bounded_seconds("sweep_interval_secs", limiter.sweep_interval_secs)?;
        self.tier_overrides().map(|_| ())
    }

    /// Registry with the configured overrides applied.
    pub fn tier_registry(&self) -> Result<TierPolicyRegistry> {
        Ok(TierPolicyRegistry::with_overrides(&self.tier_overrides()?))
    }

    fn tier_overrides(&self) -> Result<HashMap<Tier, TierPolicy>> {
        self.tiers
            .iter()
            .map(|(name, policy)| -> Result<(Tier, TierPolicy)> {
                let tier = name
                    .parse::<Tier>()
                    .map_err(|e| TurnstileError::Config(e.to_string()))?;
                Ok((tier, *policy))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.limiter.violation_threshold, 10);
        assert_eq!(config.limiter.sweep_interval(), Duration::from_secs(300));
        assert!(!config.limiter.fail_open);

        let policy = config.limiter.escalation_policy().unwrap();
        assert_eq!(policy, EscalationPolicy::default());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
limiter:
  block_duration_secs: 1800
tiers:
  free:
    per_minute: 60
    per_hour: 600
    per_day: 2000
    burst_limit: 15
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.block_duration_secs, 1800);
        assert_eq!(config.limiter.violation_threshold, 10);

        let registry = config.tier_registry().unwrap();
        assert_eq!(registry.policy(Tier::Free).burst_limit, 15);
        assert_eq!(registry.policy(Tier::Starter).burst_limit, 30);
    }

    #[test]
    fn test_rejects_unknown_tier_override() {
        let yaml = r#"
tiers:
  platinum:
    per_minute: 1
    per_hour: 1
    per_day: 1
    burst_limit: 1
"#;
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("platinum"));
    }

    #[test]
    fn test_rejects_zero_values() {
        assert_err!(TurnstileConfig::from_yaml("limiter:\n  violation_threshold: 0\n"));
        assert_err!(TurnstileConfig::from_yaml("limiter:\n  sweep_interval_secs: 0\n"));
    }

    #[test]
    fn test_rejects_oversized_durations() {
        let err = TurnstileConfig::from_yaml("limiter:\n  block_duration_secs: 10000000000000000\n")
            .unwrap_err();
        assert!(err.to_string().contains("block_duration_secs"));

        let err =
            TurnstileConfig::from_yaml("limiter:\n  violation_window_secs: 18446744073709551615\n")
                .unwrap_err();
        assert!(err.to_string().contains("violation_window_secs"));

        assert_err!(TurnstileConfig::from_yaml(
            "limiter:\n  sweep_interval_secs: 18446744073709551615\n"
        ));

        let config = TurnstileConfig::from_yaml("limiter:\n  block_duration_secs: 31536000\n")
            .unwrap();
        assert_eq!(
            config.limiter.escalation_policy().unwrap().block_duration,
            chrono::Duration::days(365)
        );
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = assert_ok!(TurnstileConfig::load(None));
        assert_eq!(config.limiter.block_duration_secs, 900);
    }
}
