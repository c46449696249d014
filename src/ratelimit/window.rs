//! Fixed-window counter implementation.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Time granularity of a quota window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Short 10-second burst cap
    Burst,
    /// Per-minute budget
    Minute,
    /// Per-hour budget
    Hour,
    /// Per-day budget
    Day,
}

impl Granularity {
    /// All granularities in evaluation order.
    pub const ALL: [Granularity; 4] = [
        Granularity::Burst,
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
    ];

    /// Get the length of this window.
    pub fn duration(&self) -> std::time::Duration {
        match self {
            Granularity::Burst => std::time::Duration::from_secs(10),
            Granularity::Minute => std::time::Duration::from_secs(60),
            Granularity::Hour => std::time::Duration::from_secs(3600),
            Granularity::Day => std::time::Duration::from_secs(86400),
        }
    }

    /// The window length as a signed span for timestamp arithmetic.
    pub fn span(&self) -> Duration {
        match self {
            Granularity::Burst => Duration::seconds(10),
            Granularity::Minute => Duration::seconds(60),
            Granularity::Hour => Duration::seconds(3600),
            Granularity::Day => Duration::seconds(86400),
        }
    }

    /// Short lowercase name, used in logs and storage keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Burst => "burst",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored state of one (key, granularity) window.
///
/// The entry is logically absent once `now >= reset_at`, whether or not it
/// has been physically removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Admitted requests in the current window; never exceeds the limit.
    pub count: u64,
    /// When the current window closes.
    pub reset_at: DateTime<Utc>,
}

impl WindowEntry {
    /// A placeholder that is already expired at `now`.
    ///
    /// The first [`WindowEntry::check`] against it opens a fresh window.
    pub fn expired(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            reset_at: now,
        }
    }

    /// Whether this window has closed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }

    /// Check the window and count the request if there is room.
    ///
    /// A denied request leaves both `count` and `reset_at` untouched.
    pub fn check(
        &mut self,
        granularity: Granularity,
        limit: u64,
        now: DateTime<Utc>,
    ) -> WindowCheck {
        if self.is_expired(now) {
            *self = Self {
                count: 0,
                reset_at: now + granularity.span(),
            };
        }

        let allowed = self.count < limit;
        if allowed {
            self.count += 1;
        }

        WindowCheck {
            granularity,
            allowed,
            limit,
            remaining: limit.saturating_sub(self.count),
            reset_at: self.reset_at,
        }
    }

    /// Report the window state without counting a request.
    pub fn peek(
        entry: Option<&WindowEntry>,
        granularity: Granularity,
        limit: u64,
        now: DateTime<Utc>,
    ) -> WindowCheck {
        match entry {
            Some(entry) if !entry.is_expired(now) => WindowCheck {
                granularity,
                allowed: entry.count < limit,
                limit,
                remaining: limit.saturating_sub(entry.count),
                reset_at: entry.reset_at,
            },
            _ => WindowCheck {
                granularity,
                allowed: limit > 0,
                limit,
                remaining: limit,
                reset_at: now + granularity.span(),
            },
        }
    }
}

/// Outcome of checking a single window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowCheck {
    /// Which window was checked
    pub granularity: Granularity,
    /// Whether the window admitted the request
    pub allowed: bool,
    /// The window's limit
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window closes
    pub reset_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_granularity_duration() {
        assert_eq!(Granularity::Burst.duration(), std::time::Duration::from_secs(10));
        assert_eq!(Granularity::Minute.duration(), std::time::Duration::from_secs(60));
        assert_eq!(Granularity::Hour.duration(), std::time::Duration::from_secs(3600));
        assert_eq!(Granularity::Day.duration(), std::time::Duration::from_secs(86400));
        for g in Granularity::ALL {
            assert_eq!(g.span().to_std().unwrap(), g.duration());
        }
    }

    #[test]
    fn test_first_check_opens_window() {
        let mut entry = WindowEntry::expired(t0());
        let check = entry.check(Granularity::Minute, 10, t0());

        assert!(check.allowed);
        assert_eq!(check.remaining, 9);
        assert_eq!(check.reset_at, t0() + Duration::seconds(60));
        assert_eq!(entry.count, 1);
    }

    #[test]
    fn test_check_exceeds_limit() {
        let mut entry = WindowEntry::expired(t0());

        for i in 0..5 {
            let check = entry.check(Granularity::Burst, 5, t0());
            assert!(check.allowed, "request {} should be allowed", i + 1);
            assert_eq!(check.remaining, 4 - i);
        }

        // The 6th request should be rejected
        let check = entry.check(Granularity::Burst, 5, t0());
        assert!(!check.allowed);
        assert_eq!(check.remaining, 0);
    }

    #[test]
    fn test_denial_does_not_increment() {
        let mut entry = WindowEntry::expired(t0());
        for _ in 0..3 {
            entry.check(Granularity::Minute, 3, t0());
        }
        let reset_at = entry.reset_at;

        for s in 1..20 {
            let check = entry.check(Granularity::Minute, 3, t0() + Duration::seconds(s));
            assert!(!check.allowed);
            assert_eq!(check.reset_at, reset_at);
        }
        assert_eq!(entry.count, 3);
    }

    #[test]
    fn test_expired_window_is_replaced() {
        let mut entry = WindowEntry::expired(t0());
        for _ in 0..3 {
            entry.check(Granularity::Burst, 3, t0());
        }
        assert!(!entry.check(Granularity::Burst, 3, t0()).allowed);

        let later = t0() + Duration::seconds(10);
        let check = entry.check(Granularity::Burst, 3, later);
        assert!(check.allowed);
        assert_eq!(check.remaining, 2);
        assert_eq!(check.reset_at, later + Duration::seconds(10));
    }

    #[test]
    fn test_zero_limit_denies() {
        let mut entry = WindowEntry::expired(t0());
        let check = entry.check(Granularity::Day, 0, t0());
        assert!(!check.allowed);
        assert_eq!(check.remaining, 0);
        assert_eq!(entry.count, 0);
    }

    #[test]
    fn test_peek_does_not_mutate() {
        let mut entry = WindowEntry::expired(t0());
        entry.check(Granularity::Hour, 50, t0());

        let peeked = WindowEntry::peek(Some(&entry), Granularity::Hour, 50, t0());
        assert_eq!(peeked.remaining, 49);
        assert!(peeked.allowed);
        assert_eq!(entry.count, 1);

        let absent = WindowEntry::peek(None, Granularity::Hour, 50, t0());
        assert_eq!(absent.remaining, 50);
        assert_eq!(absent.reset_at, t0() + Duration::seconds(3600));
    }
}
