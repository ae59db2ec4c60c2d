//! Staleness, expiry and retry policies.
//!
//! Both policies are plain values with pure functions over timestamps and
//! attempt numbers, so they can be evaluated anywhere without a runtime.
//!
//! ## Staleness vs expiry
//!
//! An entry is **stale** once it is older than `stale_time`: it is still
//! served, and a background refresh is started. It is **expired** once it is
//! older than `cache_time`: it is treated as a miss and the consumer waits
//! for a fresh value.
//!
//! `cache_time` is expected to be at least `stale_time`. The relationship is
//! not enforced: with `cache_time < stale_time` entries expire before they are
//! ever observed as stale. [`Freshness::validate`] reports that setup so the
//! caller can decide what to do with it.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::entry::CacheEntry;
use crate::state::CacheState;

/// Default time before an entry becomes stale.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(120);
/// Default time before an entry expires.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(300);
/// Default number of retries after the first failed attempt.
pub const DEFAULT_RETRY: u32 = 3;
/// Default base delay between retries.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Staleness and expiry windows of a query.
///
/// ```
/// use querybox_core::Freshness;
/// use std::time::Duration;
/// use tokio::time::Instant;
///
/// let freshness = Freshness::new(Duration::from_millis(100), Duration::from_millis(200));
/// let written = Instant::now();
///
/// assert!(!freshness.is_stale(written, written + Duration::from_millis(100)));
/// assert!(freshness.is_stale(written, written + Duration::from_millis(150)));
/// assert!(!freshness.is_expired(written, written + Duration::from_millis(150)));
/// assert!(freshness.is_expired(written, written + Duration::from_millis(201)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    stale_time: Duration,
    cache_time: Duration,
}

impl Default for Freshness {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_TIME, DEFAULT_CACHE_TIME)
    }
}

/// Reported by [`Freshness::validate`] when `cache_time < stale_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "cache_time ({cache_time:?}) is shorter than stale_time ({stale_time:?}); entries expire before they are ever stale"
)]
pub struct FreshnessConflict {
    /// Configured stale time.
    pub stale_time: Duration,
    /// Configured cache time.
    pub cache_time: Duration,
}

impl Freshness {
    /// Creates a policy from the two windows.
    pub const fn new(stale_time: Duration, cache_time: Duration) -> Self {
        Freshness {
            stale_time,
            cache_time,
        }
    }

    /// Time before an entry becomes stale.
    pub fn stale_time(&self) -> Duration {
        self.stale_time
    }

    /// Time before an entry expires.
    pub fn cache_time(&self) -> Duration {
        self.cache_time
    }

    /// `now - updated_at > stale_time`
    pub fn is_stale(&self, updated_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(updated_at) > self.stale_time
    }

    /// `now - updated_at > cache_time`
    pub fn is_expired(&self, updated_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(updated_at) > self.cache_time
    }

    /// Evaluates an entry at `now`. Expiry takes precedence over staleness.
    pub fn state<T>(&self, entry: Option<&CacheEntry<T>>, now: Instant) -> CacheState {
        let updated_at = match entry {
            Some(entry) if entry.value().is_some() => entry.updated_at(),
            _ => None,
        };
        match updated_at {
            None => CacheState::Missing,
            Some(at) if self.is_expired(at, now) => CacheState::Expired,
            Some(at) if self.is_stale(at, now) => CacheState::Stale,
            Some(_) => CacheState::Actual,
        }
    }

    /// Checks that `cache_time >= stale_time`.
    pub fn validate(&self) -> Result<(), FreshnessConflict> {
        if self.cache_time < self.stale_time {
            Err(FreshnessConflict {
                stale_time: self.stale_time,
                cache_time: self.cache_time,
            })
        } else {
            Ok(())
        }
    }
}

/// Bounded retry with exponential backoff.
///
/// Attempt `n` (zero-based) that fails is retried after
/// `retry_delay * 2^n`, as long as `n < retry`.
///
/// ```
/// use querybox_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(2, Duration::from_millis(10));
/// assert!(policy.should_retry(0));
/// assert!(policy.should_retry(1));
/// assert!(!policy.should_retry(2));
/// assert_eq!(policy.delay(0), Duration::from_millis(10));
/// assert_eq!(policy.delay(1), Duration::from_millis(20));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retry: u32,
    retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY, DEFAULT_RETRY_DELAY)
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `retry` retries with base delay `retry_delay`.
    pub const fn new(retry: u32, retry_delay: Duration) -> Self {
        RetryPolicy { retry, retry_delay }
    }

    /// A policy that never retries.
    pub const fn never() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Maximum number of retries.
    pub fn retry(&self) -> u32 {
        self.retry
    }

    /// Base delay.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Whether a failure of zero-based `attempt` is retried.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.retry
    }

    /// Delay before retrying after zero-based `attempt` failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.retry_delay.saturating_mul(factor)
    }
}
