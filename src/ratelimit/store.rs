//! Storage for window, violation and block state.
//!
//! The limiter talks to state only through [`RateLimitStore`], so a shared
//! cache can replace the in-memory map for multi-instance deployments. Every
//! method that mutates state must do its read-modify-write atomically for
//! the key it touches; two concurrent checks on a window that has one slot
//! left must not both be admitted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use super::escalation::{
    BlockEntry, EscalationPolicy, EscalationState, ViolationOutcome, ViolationRecord,
};
use super::key::WindowKey;
use super::window::{WindowCheck, WindowEntry};
use crate::error::StoreError;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Backing store for limiter state.
pub trait RateLimitStore: Send + Sync {
    /// Atomically check a window and count the request if it fits.
    fn check_window(
        &self,
        key: &WindowKey,
        limit: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<WindowCheck>;

    /// Read a window's state without counting a request.
    fn peek_window(
        &self,
        key: &WindowKey,
        limit: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<WindowCheck>;

    /// The block on `identifier`, if one is active at `now`.
    fn active_block(&self, identifier: &str, now: DateTime<Utc>)
        -> StoreResult<Option<BlockEntry>>;

    /// Atomically record a violation and open a block once the policy's
    /// threshold is reached.
    fn record_violation(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
        policy: &EscalationPolicy,
    ) -> StoreResult<ViolationOutcome>;

    /// Current escalation state of `identifier`.
    fn escalation_state(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<EscalationState>;

    /// Physically remove every entry that has expired at `now`.
    fn sweep(&self, now: DateTime<Utc>) -> SweepStats;

    /// Number of stored entries, expired or not.
    fn stats(&self) -> StoreStats;
}

/// Entries removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub windows: usize,
    pub violations: usize,
    pub blocks: usize,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.windows + self.violations + self.blocks
    }
}

/// Entries currently held by a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub windows: usize,
    pub violations: usize,
    pub blocks: usize,
}

/// Process-local store built on sharded concurrent maps.
///
/// Per-key atomicity comes from `DashMap` entry guards, which hold the
/// shard's write lock for the whole check-and-increment.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    windows: DashMap<WindowKey, WindowEntry>,
    violations: DashMap<String, ViolationRecord>,
    blocks: DashMap<String, BlockEntry>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored window entry, ignoring expiry.
    pub fn window_entry(&self, key: &WindowKey) -> Option<WindowEntry> {
        self.windows.get(key).map(|e| *e)
    }
}

impl RateLimitStore for InMemoryStore {
    fn check_window(
        &self,
        key: &WindowKey,
        limit: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<WindowCheck> {
        let mut entry = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| WindowEntry::expired(now));
        Ok(entry.check(key.granularity, limit, now))
    }

    fn peek_window(
        &self,
        key: &WindowKey,
        limit: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<WindowCheck> {
        let entry = self.windows.get(key);
        Ok(WindowEntry::peek(entry.as_deref(), key.granularity, limit, now))
    }

    fn active_block(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<BlockEntry>> {
        Ok(self
            .blocks
            .get(identifier)
            .map(|b| *b)
            .filter(|b| b.is_active(now)))
    }

    fn record_violation(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
        policy: &EscalationPolicy,
    ) -> StoreResult<ViolationOutcome> {
        // Holding the violation guard while opening the block keeps the two
        // in step for this identifier.
        let mut record = self
            .violations
            .entry(identifier.to_string())
            .or_insert_with(|| ViolationRecord::expired(now));
        let violations = record.record(now, policy);

        let blocked_until = if violations >= policy.threshold {
            let block = BlockEntry::starting(now, policy);
            self.blocks.insert(identifier.to_string(), block);
            Some(block.blocked_until)
        } else {
            None
        };

        Ok(ViolationOutcome {
            violations,
            blocked_until,
        })
    }

    fn escalation_state(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<EscalationState> {
        let record = self.violations.get(identifier).map(|r| *r);
        let block = self.blocks.get(identifier).map(|b| *b);
        Ok(EscalationState::from_records(
            record.as_ref(),
            block.as_ref(),
            now,
        ))
    }

    fn sweep(&self, now: DateTime<Utc>) -> SweepStats {
        let before = self.stats();

        self.windows.retain(|_, entry| !entry.is_expired(now));
        self.violations.retain(|_, record| !record.is_expired(now));
        self.blocks.retain(|_, block| block.is_active(now));

        let after = self.stats();
        let removed = SweepStats {
            windows: before.windows.saturating_sub(after.windows),
            violations: before.violations.saturating_sub(after.violations),
            blocks: before.blocks.saturating_sub(after.blocks),
        };

        if removed.total() > 0 {
            info!(
                windows = removed.windows,
                violations = removed.violations,
                blocks = removed.blocks,
                "Swept expired rate limit state"
            );
        } else {
            debug!("Sweep found no expired rate limit state");
        }
        removed
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            windows: self.windows.len(),
            violations: self.violations.len(),
            blocks: self.blocks.len(),
        }
    }
}
