//! Core admission decision logic.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use super::clock::{retry_after_seconds, Clock, SystemClock};
use super::escalation::{EscalationPolicy, EscalationState};
use super::key::RateLimitKey;
use super::store::{InMemoryStore, RateLimitStore, StoreResult, StoreStats, SweepStats};
use super::sweeper::{Sweeper, SweeperHandle};
use super::tier::{Tier, TierPolicy, TierPolicyRegistry};
use super::window::{Granularity, WindowCheck, WindowEntry};
use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};

/// Default interval between sweeps of expired state.
const DEFAULT_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// At least one quota window is exhausted
    RateLimitExceeded,
    /// The identifier is temporarily blocked for repeated violations
    Blocked,
}

/// Admission outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Allowed,
    Denied {
        reason: DenialReason,
        retry_after_secs: u64,
    },
}

/// The result of evaluating one request, with per-window telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub outcome: Outcome,
    /// Tier whose limits were applied
    pub tier: Tier,
    /// Window states in burst, minute, hour, day order
    pub windows: Vec<WindowCheck>,
    pub evaluated_at: DateTime<Utc>,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self.outcome, Outcome::Allowed)
    }

    pub fn denial_reason(&self) -> Option<DenialReason> {
        match self.outcome {
            Outcome::Allowed => None,
            Outcome::Denied { reason, .. } => Some(reason),
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self.outcome {
            Outcome::Allowed => None,
            Outcome::Denied {
                retry_after_secs, ..
            } => Some(retry_after_secs),
        }
    }

    /// Telemetry for one window.
    pub fn window(&self, granularity: Granularity) -> Option<&WindowCheck> {
        self.windows.iter().find(|w| w.granularity == granularity)
    }
}

/// Tiered multi-window limiter with abuse escalation.
///
/// Cheap to share behind an `Arc`; all state lives in the store.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    tiers: TierPolicyRegistry,
    escalation: EscalationPolicy,
    sweep_interval: std::time::Duration,
    fail_open: bool,
}

impl RateLimiter {
    /// Create a limiter with the built-in tiers and an in-memory store.
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            clock: Arc::new(SystemClock),
            tiers: TierPolicyRegistry::new(),
            escalation: EscalationPolicy::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            fail_open: false,
        }
    }

    /// Create a limiter from configuration.
    pub fn with_config(config: &TurnstileConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            tiers: config.tier_registry()?,
            escalation: config.limiter.escalation_policy()?,
            sweep_interval: config.limiter.sweep_interval(),
            fail_open: config.limiter.fail_open,
            ..Self::new()
        })
    }

    /// Replace the backing store.
    pub fn with_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.store = store;
        self
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_tiers(mut self, tiers: TierPolicyRegistry) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn with_escalation(mut self, escalation: EscalationPolicy) -> Self {
        self.escalation = escalation;
        self
    }

    /// Decide whether to admit a request.
    ///
    /// Blocked identifiers are refused before any window is touched.
    /// Otherwise the burst, minute, hour and day windows are checked in
    /// that order and the request is admitted only if all four admit it.
    /// A denial counts as a violation and may open a block.
    ///
    /// Fails only when `identifier` is empty.
    pub fn evaluate(
        &self,
        identifier: &str,
        tier: Option<&str>,
        endpoint: Option<&str>,
    ) -> Result<Decision> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(TurnstileError::Validation(
                "identifier is required".to_string(),
            ));
        }

        let now = self.clock.now();
        let key = RateLimitKey::new(identifier, endpoint);
        let (tier, policy) = self.tiers.resolve(tier);

        trace!(key = %key, tier = %tier, "Evaluating admission");

        match self.decide(&key, tier, policy, now) {
            Ok(decision) => Ok(decision),
            Err(e) => {
                error!(
                    key = %key,
                    error = %e,
                    fail_open = self.fail_open,
                    "Rate limit store failure"
                );
                Ok(self.store_fault_decision(tier, policy, now))
            }
        }
    }

    fn decide(
        &self,
        key: &RateLimitKey,
        tier: Tier,
        policy: &TierPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Decision> {
        if let Some(block) = self.store.active_block(&key.identifier, now)? {
            debug!(
                identifier = %key.identifier,
                blocked_until = %block.blocked_until,
                "Identifier is blocked"
            );
            let windows = Granularity::ALL
                .iter()
                .map(|&g| {
                    self.store
                        .peek_window(&key.window_key(g), policy.limit_for(g), now)
                })
                .collect::<StoreResult<Vec<_>>>()?;
            return Ok(Decision {
                outcome: Outcome::Denied {
                    reason: DenialReason::Blocked,
                    retry_after_secs: retry_after_seconds(block.blocked_until, now),
                },
                tier,
                windows,
                evaluated_at: now,
            });
        }

        let windows = Granularity::ALL
            .iter()
            .map(|&g| {
                self.store
                    .check_window(&key.window_key(g), policy.limit_for(g), now)
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let earliest_reset = windows
            .iter()
            .filter(|w| !w.allowed)
            .map(|w| w.reset_at)
            .min();

        let Some(earliest_reset) = earliest_reset else {
            return Ok(Decision {
                outcome: Outcome::Allowed,
                tier,
                windows,
                evaluated_at: now,
            });
        };

        let violation = self
            .store
            .record_violation(&key.identifier, now, &self.escalation)?;

        let outcome = match violation.blocked_until {
            Some(blocked_until) => {
                warn!(
                    identifier = %key.identifier,
                    violations = violation.violations,
                    blocked_until = %blocked_until,
                    "Blocking identifier after repeated rate limit violations"
                );
                Outcome::Denied {
                    reason: DenialReason::Blocked,
                    retry_after_secs: retry_after_seconds(blocked_until, now),
                }
            }
            None => {
                debug!(
                    key = %key,
                    tier = %tier,
                    violations = violation.violations,
                    exhausted = ?windows
                        .iter()
                        .filter(|w| !w.allowed)
                        .map(|w| w.granularity)
                        .collect::<Vec<_>>(),
                    "Rate limit exceeded"
                );
                Outcome::Denied {
                    reason: DenialReason::RateLimitExceeded,
                    retry_after_secs: retry_after_seconds(earliest_reset, now),
                }
            }
        };

        Ok(Decision {
            outcome,
            tier,
            windows,
            evaluated_at: now,
        })
    }

    /// Decision used when the store cannot be consulted.
    fn store_fault_decision(
        &self,
        tier: Tier,
        policy: &TierPolicy,
        now: DateTime<Utc>,
    ) -> Decision {
        let windows = Granularity::ALL
            .iter()
            .map(|&g| {
                let mut check = WindowEntry::peek(None, g, policy.limit_for(g), now);
                if !self.fail_open {
                    check.allowed = false;
                    check.remaining = 0;
                }
                check
            })
            .collect();

        let outcome = if self.fail_open {
            Outcome::Allowed
        } else {
            Outcome::Denied {
                reason: DenialReason::RateLimitExceeded,
                retry_after_secs: 1,
            }
        };

        Decision {
            outcome,
            tier,
            windows,
            evaluated_at: now,
        }
    }

    /// Escalation state of an identifier.
    pub fn escalation_state(&self, identifier: &str) -> Result<EscalationState> {
        Ok(self.store.escalation_state(identifier, self.clock.now())?)
    }

    /// Run one sweep of expired state now.
    pub fn sweep(&self) -> SweepStats {
        self.store.sweep(self.clock.now())
    }

    /// Entries currently held by the store.
    pub fn store_stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Start the background sweeper on the current tokio runtime.
    ///
    /// The sweeper stops when the returned handle is shut down or dropped.
    pub fn start_sweeper(&self) -> SweeperHandle {
        Sweeper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.sweep_interval,
        )
        .start()
    }

    pub fn tiers(&self) -> &TierPolicyRegistry {
        &self.tiers
    }

    pub fn escalation_policy(&self) -> &EscalationPolicy {
        &self.escalation
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::escalation::{BlockEntry, ViolationOutcome};
    use crate::ratelimit::key::WindowKey;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn test_limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let limiter = RateLimiter::new().with_clock(clock.clone());
        (limiter, clock)
    }

    #[test]
    fn test_first_request_is_allowed() {
        let (limiter, _) = test_limiter();
        let decision = limiter.evaluate("ip:10.0.0.1", Some("free"), None).unwrap();

        assert!(decision.is_allowed());
        assert_eq!(decision.tier, Tier::Free);
        assert_eq!(decision.windows.len(), 4);
        assert_eq!(decision.window(Granularity::Burst).unwrap().remaining, 9);
        assert_eq!(decision.window(Granularity::Minute).unwrap().remaining, 29);
        assert_eq!(decision.window(Granularity::Hour).unwrap().remaining, 499);
        assert_eq!(decision.window(Granularity::Day).unwrap().remaining, 999);
        assert_eq!(decision.retry_after_secs(), None);
    }

    #[test]
    fn test_empty_identifier_rejected() {
        let (limiter, _) = test_limiter();
        let result = limiter.evaluate("   ", Some("free"), None);
        assert!(matches!(result, Err(TurnstileError::Validation(_))));
        assert_eq!(limiter.store_stats(), StoreStats::default());
    }

    #[test]
    fn test_burst_denies_inside_minute_budget() {
        let (limiter, _) = test_limiter();

        for _ in 0..5 {
            assert!(limiter.evaluate("caller", None, None).unwrap().is_allowed());
        }

        let decision = limiter.evaluate("caller", None, None).unwrap();
        assert_eq!(decision.denial_reason(), Some(DenialReason::RateLimitExceeded));
        assert_eq!(decision.retry_after_secs(), Some(10));
        assert!(!decision.window(Granularity::Burst).unwrap().allowed);
        // The minute window still counts the request it admitted
        assert_eq!(decision.window(Granularity::Minute).unwrap().remaining, 4);
    }

    #[test]
    fn test_retry_after_uses_earliest_denying_window() {
        let (limiter, clock) = test_limiter();
        for _ in 0..5 {
            limiter.evaluate("caller", None, None).unwrap();
        }

        clock.advance(Duration::milliseconds(2_500));
        let decision = limiter.evaluate("caller", None, None).unwrap();
        // Burst window closes at t0 + 10s; 7.5s away rounds up to 8
        assert_eq!(decision.retry_after_secs(), Some(8));
    }

    #[test]
    fn test_endpoint_scopes_windows_but_not_blocks() {
        let (limiter, _) = test_limiter();

        for _ in 0..5 {
            assert!(limiter
                .evaluate("caller", None, Some("search"))
                .unwrap()
                .is_allowed());
        }
        assert!(!limiter
            .evaluate("caller", None, Some("search"))
            .unwrap()
            .is_allowed());
        assert!(limiter
            .evaluate("caller", None, Some("upload"))
            .unwrap()
            .is_allowed());
        assert_eq!(
            limiter.escalation_state("caller").unwrap(),
            EscalationState::Warned { violations: 1 }
        );
    }

    #[test]
    fn test_tenth_violation_blocks() {
        let (limiter, clock) = test_limiter();
        for _ in 0..5 {
            limiter.evaluate("abuser", None, None).unwrap();
        }

        for i in 1..10 {
            let decision = limiter.evaluate("abuser", None, None).unwrap();
            assert_eq!(
                decision.denial_reason(),
                Some(DenialReason::RateLimitExceeded),
                "violation {} should not block yet",
                i
            );
        }

        let decision = limiter.evaluate("abuser", None, None).unwrap();
        assert_eq!(decision.denial_reason(), Some(DenialReason::Blocked));
        assert_eq!(decision.retry_after_secs(), Some(900));

        clock.advance(Duration::minutes(5));
        let decision = limiter.evaluate("abuser", None, None).unwrap();
        assert_eq!(decision.denial_reason(), Some(DenialReason::Blocked));
        assert_eq!(decision.retry_after_secs(), Some(600));
    }

    #[test]
    fn test_blocked_calls_do_not_touch_windows() {
        let (limiter, clock) = test_limiter();
        for _ in 0..15 {
            limiter.evaluate("abuser", None, None).unwrap();
        }
        assert!(matches!(
            limiter.escalation_state("abuser").unwrap(),
            EscalationState::Blocked { .. }
        ));

        clock.advance(Duration::seconds(30));
        for _ in 0..20 {
            let decision = limiter.evaluate("abuser", None, None).unwrap();
            assert_eq!(decision.denial_reason(), Some(DenialReason::Blocked));
            // Burst window from t0 has expired; peeking reports it as fresh
            assert_eq!(decision.window(Granularity::Burst).unwrap().remaining, 5);
            assert_eq!(decision.window(Granularity::Minute).unwrap().remaining, 0);
            assert_eq!(decision.window(Granularity::Hour).unwrap().remaining, 35);
        }
    }

    #[test]
    fn test_lapsed_block_rearms_within_bucket() {
        let (limiter, clock) = test_limiter();
        for _ in 0..15 {
            limiter.evaluate("abuser", None, None).unwrap();
        }

        clock.advance(Duration::minutes(15));
        assert_eq!(
            limiter.escalation_state("abuser").unwrap(),
            EscalationState::Warned { violations: 10 }
        );

        for _ in 0..5 {
            assert!(limiter.evaluate("abuser", None, None).unwrap().is_allowed());
        }
        let decision = limiter.evaluate("abuser", None, None).unwrap();
        assert_eq!(decision.denial_reason(), Some(DenialReason::Blocked));
        assert_eq!(decision.retry_after_secs(), Some(900));
    }

    #[test]
    fn test_unknown_tier_gets_anonymous_limits() {
        let (limiter, _) = test_limiter();
        let decision = limiter.evaluate("caller", Some("diamond"), None).unwrap();
        assert_eq!(decision.tier, Tier::Anonymous);
        assert_eq!(decision.window(Granularity::Day).unwrap().limit, 100);
    }

    /// Store whose every operation fails.
    struct UnavailableStore;

    impl RateLimitStore for UnavailableStore {
        fn check_window(
            &self,
            _: &WindowKey,
            _: u64,
            _: DateTime<Utc>,
        ) -> StoreResult<WindowCheck> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        fn peek_window(
            &self,
            _: &WindowKey,
            _: u64,
            _: DateTime<Utc>,
        ) -> StoreResult<WindowCheck> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        fn active_block(
            &self,
            _: &str,
            _: DateTime<Utc>,
        ) -> StoreResult<Option<BlockEntry>> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        fn record_violation(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: &EscalationPolicy,
        ) -> StoreResult<ViolationOutcome> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        fn escalation_state(
            &self,
            _: &str,
            _: DateTime<Utc>,
        ) -> StoreResult<EscalationState> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        fn sweep(&self, _: DateTime<Utc>) -> SweepStats {
            SweepStats::default()
        }

        fn stats(&self) -> StoreStats {
            StoreStats::default()
        }
    }

    #[test]
    fn test_store_failure_fails_closed() {
        let limiter = RateLimiter::new().with_store(Arc::new(UnavailableStore));
        let decision = limiter.evaluate("caller", Some("enterprise"), None).unwrap();

        assert_eq!(decision.denial_reason(), Some(DenialReason::RateLimitExceeded));
        assert_eq!(decision.retry_after_secs(), Some(1));
        assert!(decision.windows.iter().all(|w| w.remaining == 0));
        assert!(limiter.escalation_state("caller").is_err());
    }

    #[test]
    fn test_store_failure_can_fail_open() {
        let config = TurnstileConfig::from_yaml("limiter:\n  fail_open: true\n").unwrap();
        let limiter = RateLimiter::with_config(&config)
            .unwrap()
            .with_store(Arc::new(UnavailableStore));

        let decision = limiter.evaluate("caller", None, None).unwrap();
        assert!(decision.is_allowed());
    }
}
