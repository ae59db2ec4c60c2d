//! Cached entry with freshness metadata.
//!
//! A [`CacheEntry`] records the last successful value of a query together
//! with the last failure, if any. A failed refresh never discards the value
//! that was already cached: consumers keep seeing last-known-good data next
//! to the error.
//!
//! Timestamps use [`tokio::time::Instant`] so that freshness follows the
//! runtime clock (and therefore paused time in tests). The wall-clock
//! [`CacheEntry::written_at`] is kept for diagnostics only.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::Raw;
use crate::error::FetchError;

/// A cache entry for one query key.
///
/// # Example
///
/// ```
/// use querybox_core::{CacheEntry, FetchError};
/// use tokio::time::Instant;
///
/// let now = Instant::now();
/// let mut entry = CacheEntry::fetched("A", now);
/// assert_eq!(entry.value(), Some(&"A"));
///
/// entry.record_failure(FetchError::new("down", 4), now);
/// assert_eq!(entry.value(), Some(&"A"));
/// assert!(entry.error().is_some());
/// assert_eq!(entry.failure_count(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    value: Option<T>,
    error: Option<FetchError>,
    updated_at: Option<Instant>,
    written_at: Option<DateTime<Utc>>,
    error_updated_at: Option<Instant>,
    failure_count: u32,
}

impl<T> Default for CacheEntry<T> {
    fn default() -> Self {
        CacheEntry {
            value: None,
            error: None,
            updated_at: None,
            written_at: None,
            error_updated_at: None,
            failure_count: 0,
        }
    }
}

impl<T> CacheEntry<T> {
    /// Creates an entry for a successful fetch completed at `now`.
    pub fn fetched(value: T, now: Instant) -> Self {
        CacheEntry {
            value: Some(value),
            updated_at: Some(now),
            written_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Creates an entry for a key whose first fetch failed.
    pub fn failed(error: FetchError, now: Instant) -> Self {
        let mut entry = Self::default();
        entry.record_failure(error, now);
        entry
    }

    /// Replaces the value after a successful fetch, clearing any error.
    pub fn record_success(&mut self, value: T, now: Instant) {
        *self = Self::fetched(value, now);
    }

    /// Records an exhausted-retries failure. The cached value and its
    /// timestamp are left untouched.
    pub fn record_failure(&mut self, error: FetchError, now: Instant) {
        self.failure_count = error.attempts();
        self.error = Some(error);
        self.error_updated_at = Some(now);
    }

    /// Returns the last successful value.
    #[inline]
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Returns the last failure, if the latest fetch failed.
    #[inline]
    pub fn error(&self) -> Option<&FetchError> {
        self.error.as_ref()
    }

    /// Time of the last successful write.
    #[inline]
    pub fn updated_at(&self) -> Option<Instant> {
        self.updated_at
    }

    /// Wall-clock time of the last successful write.
    #[inline]
    pub fn written_at(&self) -> Option<DateTime<Utc>> {
        self.written_at
    }

    /// Time of the last recorded failure.
    #[inline]
    pub fn error_updated_at(&self) -> Option<Instant> {
        self.error_updated_at
    }

    /// Attempts spent by the last failed fetch; zero after a success.
    #[inline]
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

impl CacheEntry<Raw> {
    /// Returns the estimated memory usage of this entry in bytes.
    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.value.as_ref().map_or(0, |v| v.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn success_clears_previous_failure() {
        let start = Instant::now();
        let mut entry = CacheEntry::failed(FetchError::new("boom", 3), start);
        assert_eq!(entry.value(), None::<&u32>);
        assert_eq!(entry.failure_count(), 3);
        assert_eq!(entry.updated_at(), None);

        tokio::time::advance(Duration::from_millis(5)).await;
        let later = Instant::now();
        entry.record_success(7u32, later);

        assert_eq!(entry.value(), Some(&7));
        assert!(entry.error().is_none());
        assert_eq!(entry.failure_count(), 0);
        assert_eq!(entry.updated_at(), Some(later));
        assert!(entry.written_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_keeps_last_known_good_timestamp() {
        let start = Instant::now();
        let mut entry = CacheEntry::fetched("A".to_string(), start);

        tokio::time::advance(Duration::from_secs(1)).await;
        entry.record_failure(FetchError::new("down", 2), Instant::now());

        assert_eq!(entry.value().map(String::as_str), Some("A"));
        assert_eq!(entry.updated_at(), Some(start));
        assert_eq!(entry.error_updated_at(), Some(start + Duration::from_secs(1)));
    }

    #[test]
    fn memory_size_counts_payload() {
        let entry = CacheEntry::fetched(Raw::from_static(b"0123456789"), Instant::now());
        assert_eq!(entry.memory_size(), std::mem::size_of::<CacheEntry<Raw>>() + 10);
    }
}
