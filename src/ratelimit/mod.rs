//! Rate limiting logic and state management.

mod clock;
mod escalation;
mod key;
mod limiter;
mod store;
mod sweeper;
mod tier;
mod window;

pub use clock::{retry_after_seconds, Clock, ManualClock, SystemClock};
pub use escalation::{
    BlockEntry, EscalationPolicy, EscalationState, ViolationOutcome, ViolationRecord,
};
pub use key::{RateLimitKey, WindowKey};
pub use limiter::{Decision, DenialReason, Outcome, RateLimiter};
pub use store::{InMemoryStore, RateLimitStore, StoreResult, StoreStats, SweepStats};
pub use sweeper::{Sweeper, SweeperHandle};
pub use tier::{Tier, TierPolicy, TierPolicyRegistry, UnknownTier};
pub use window::{Granularity, WindowCheck, WindowEntry};
