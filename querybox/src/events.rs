//! Notifications about cache mutations.

use querybox_core::QueryKey;
use smol_str::SmolStr;

/// Something changed in the cache.
///
/// Events are broadcast after the store or the in-flight table changed, so a
/// receiver that reads them on an event always sees the new state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A fetch for the key started.
    Fetching(QueryKey),
    /// The entry for the key was written (value or error).
    Updated(QueryKey),
    /// The entry for the key was deleted.
    Removed(QueryKey),
    /// Every entry whose key contains the pattern was deleted.
    RemovedMatching(SmolStr),
    /// The store was cleared.
    Cleared,
    /// The in-flight fetch for the key was cancelled without a result.
    Cancelled(QueryKey),
}

impl CacheEvent {
    /// Returns `true` if the event may have changed the entry for `key`.
    pub fn affects(&self, key: &QueryKey) -> bool {
        match self {
            CacheEvent::Fetching(k)
            | CacheEvent::Updated(k)
            | CacheEvent::Removed(k)
            | CacheEvent::Cancelled(k) => k == key,
            CacheEvent::RemovedMatching(pattern) => key.contains(pattern),
            CacheEvent::Cleared => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affects_matches_keys_and_patterns() {
        let key = QueryKey::from_params("invoices", &serde_json::json!({"page": 1}));
        let other = QueryKey::named("clients");

        assert!(CacheEvent::Updated(key.clone()).affects(&key));
        assert!(!CacheEvent::Updated(other.clone()).affects(&key));
        assert!(CacheEvent::RemovedMatching("invoices".into()).affects(&key));
        assert!(!CacheEvent::RemovedMatching("invoices".into()).affects(&other));
        assert!(CacheEvent::Cleared.affects(&other));
        assert!(CacheEvent::Cancelled(other.clone()).affects(&other));
    }
}
