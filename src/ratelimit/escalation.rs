//! Abuse escalation: violation tracking and temporary blocks.
//!
//! Every denied evaluation counts as a violation against the caller's
//! identifier. Violations accumulate in a bucket that lives for one
//! `violation_window` from the first violation; once the count reaches
//! `threshold` inside a bucket the identifier is blocked for
//! `block_duration`. While blocked, evaluations short-circuit before any
//! quota or violation state is touched, so a block can only end by time.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Escalation thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    /// Violations inside one bucket that trigger a block
    pub threshold: u32,
    /// Lifetime of a violation bucket
    pub violation_window: Duration,
    /// How long a block lasts
    pub block_duration: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            threshold: 10,
            violation_window: Duration::hours(1),
            block_duration: Duration::minutes(15),
        }
    }
}

/// Violations recorded for one identifier in the current bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationRecord {
    pub count: u32,
    pub bucket_reset_at: DateTime<Utc>,
}

impl ViolationRecord {
    /// A placeholder that is already expired at `now`.
    pub fn expired(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            bucket_reset_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.bucket_reset_at
    }

    /// Count one violation and return the running total for the bucket.
    ///
    /// An expired bucket restarts at 1.
    pub fn record(&mut self, now: DateTime<Utc>, policy: &EscalationPolicy) -> u32 {
        if self.is_expired(now) {
            *self = Self {
                count: 0,
                bucket_reset_at: now + policy.violation_window,
            };
        }
        self.count = self.count.saturating_add(1);
        self.count
    }

    /// Violations still counting at `now`.
    pub fn active_count(&self, now: DateTime<Utc>) -> u32 {
        if self.is_expired(now) {
            0
        } else {
            self.count
        }
    }
}

/// An identifier that is denied outright until `blocked_until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    pub blocked_until: DateTime<Utc>,
}

impl BlockEntry {
    /// A block starting at `now`.
    pub fn starting(now: DateTime<Utc>, policy: &EscalationPolicy) -> Self {
        Self {
            blocked_until: now + policy.block_duration,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.blocked_until
    }
}

/// Result of recording a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationOutcome {
    /// Violations in the current bucket, including this one
    pub violations: u32,
    /// Set when this violation opened a block
    pub blocked_until: Option<DateTime<Utc>>,
}

/// Escalation state of an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum EscalationState {
    /// No violations in the current bucket
    Clean,
    /// Violations in the current bucket and no active block.
    ///
    /// Normally below the threshold. When a block lapses before its bucket
    /// does, the count stays at or above the threshold and the next denial
    /// blocks again.
    Warned { violations: u32 },
    /// Denied outright until the timestamp
    Blocked { until: DateTime<Utc> },
}

impl EscalationState {
    /// Derive the state from stored records.
    pub fn from_records(
        violations: Option<&ViolationRecord>,
        block: Option<&BlockEntry>,
        now: DateTime<Utc>,
    ) -> Self {
        if let Some(block) = block.filter(|b| b.is_active(now)) {
            return EscalationState::Blocked {
                until: block.blocked_until,
            };
        }
        match violations.map(|v| v.active_count(now)).unwrap_or(0) {
            0 => EscalationState::Clean,
            violations => EscalationState::Warned { violations },
        }
    }
}
