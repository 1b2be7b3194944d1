//! Duration arithmetic and clock abstraction.
//!
//! [`TimeSpan`] is a non-negative duration with millisecond precision, used
//! for TTLs, retry intervals, and blocking budgets. `Option<TimeSpan>` models
//! nullable TTLs: `None` means "never expires".
//!
//! [`ClockSource`] abstracts the wall clock for dependency injection, so
//! expiration behavior is testable without sleeping. The default
//! implementation ([`SystemClock`]) delegates to `std::time::SystemTime`;
//! [`ManualClock`] is an advanceable clock for deterministic tests.

use std::fmt;
use std::ops::{Add, Div};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A non-negative duration with millisecond precision.
///
/// Arithmetic saturates instead of overflowing; durations this large are
/// already past any meaningful expiration horizon.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TimeSpan {
    millis: u64,
}

impl TimeSpan {
    /// The zero-length span.
    pub const ZERO: Self = Self { millis: 0 };

    /// Creates a span from whole milliseconds.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    /// Creates a span from whole seconds.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs * 1_000,
        }
    }

    /// Creates a span from whole minutes.
    #[must_use]
    pub const fn from_mins(mins: u64) -> Self {
        Self {
            millis: mins * 60_000,
        }
    }

    /// Creates a span from whole hours.
    #[must_use]
    pub const fn from_hours(hours: u64) -> Self {
        Self {
            millis: hours * 3_600_000,
        }
    }

    /// Total length in milliseconds.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.millis
    }

    /// Whether this is the zero-length span.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.millis == 0
    }

    /// Converts to a [`std::time::Duration`] for sleeping.
    #[must_use]
    pub const fn to_duration(self) -> Duration {
        Duration::from_millis(self.millis)
    }

    /// Adds `millis` to this span, saturating at the maximum.
    #[must_use]
    pub const fn add_millis(self, millis: u64) -> Self {
        Self {
            millis: self.millis.saturating_add(millis),
        }
    }

    /// Subtracts `other`, saturating at zero.
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self {
            millis: self.millis.saturating_sub(other.millis),
        }
    }

    /// Computes the absolute end instant (epoch millis) of this span
    /// starting at `now_ms`.
    #[must_use]
    pub const fn end_from(self, now_ms: u64) -> u64 {
        now_ms.saturating_add(self.millis)
    }
}

impl Add for TimeSpan {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            millis: self.millis.saturating_add(rhs.millis),
        }
    }
}

impl Div<u32> for TimeSpan {
    type Output = Self;

    /// Divides the span by a scalar. Panics on a zero divisor, like integer
    /// division does.
    fn div(self, rhs: u32) -> Self {
        Self {
            millis: self.millis / u64::from(rhs),
        }
    }
}

impl From<Duration> for TimeSpan {
    fn from(duration: Duration) -> Self {
        // Durations beyond u64::MAX millis saturate; see the type docs.
        Self {
            millis: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.millis)
    }
}

/// Abstraction over the wall clock for dependency injection.
///
/// All expiration logic reads time through this trait, which makes expiry
/// deterministic under test. Readings are milliseconds since the Unix epoch.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_ms(&self) -> u64 {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch");
        u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock for deterministic expiry tests.
///
/// Starts at an arbitrary instant and only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Creates a clock pinned at `start_ms`.
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    /// Moves the clock forward by `span`.
    pub fn advance(&self, span: TimeSpan) {
        self.now_ms.fetch_add(span.as_millis(), Ordering::SeqCst);
    }

    /// Pins the clock at an absolute instant.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Computes the absolute expiration for a nullable TTL starting at `now_ms`.
///
/// `None` stays `None`: the record never expires.
#[must_use]
pub fn expiry_from(ttl: Option<TimeSpan>, now_ms: u64) -> Option<u64> {
    ttl.map(|span| span.end_from(now_ms))
}

/// Whether a record with the given absolute expiration is still live.
///
/// A `None` expiration is always live; an expiration at or before `now_ms`
/// is dead and must be treated as absent.
#[must_use]
pub fn is_live(expires_at_ms: Option<u64>, now_ms: u64) -> bool {
    match expires_at_ms {
        None => true,
        Some(at) => at > now_ms,
    }
}

/// Remaining lifetime of a record, or `None` when it never expires.
#[must_use]
pub fn remaining(expires_at_ms: Option<u64>, now_ms: u64) -> Option<TimeSpan> {
    expires_at_ms.map(|at| TimeSpan::from_millis(at.saturating_sub(now_ms)))
}
