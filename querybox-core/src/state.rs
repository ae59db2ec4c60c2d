//! Freshness state of a cache entry.

/// Freshness of a cache entry at a given moment.
///
/// - [`CacheState::Actual`] - value is fresh, serve it as is
/// - [`CacheState::Stale`] - value is usable but should be refreshed in the background
/// - [`CacheState::Expired`] - value is too old to serve, fetch before use
/// - [`CacheState::Missing`] - nothing was ever fetched successfully
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheState {
    /// Value is fresh.
    Actual,
    /// Value is stale but not expired.
    Stale,
    /// Value has expired.
    Expired,
    /// No successful value exists for the key.
    Missing,
}

impl CacheState {
    /// Returns `true` if a consumer must wait for a fetch before it has
    /// anything to show.
    pub fn is_miss(self) -> bool {
        matches!(self, CacheState::Expired | CacheState::Missing)
    }

    /// Returns `true` if the entry should be refetched at all.
    pub fn needs_refresh(self) -> bool {
        !matches!(self, CacheState::Actual)
    }

    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            CacheState::Actual => "hit",
            CacheState::Stale => "stale",
            CacheState::Expired => "expired",
            CacheState::Missing => "miss",
        }
    }
}
