use std::sync::Arc;

use querybox_core::{CacheEntry, QueryKey, Raw};

use crate::DeleteStatus;
use crate::format::{Format, JsonFormat};

/// Keyed map from query identity to cache entry.
///
/// Operations are synchronous: a store is an in-process structure and the
/// executor needs to pair a store write with its own bookkeeping without an
/// await point in between. Implementations must be safe for concurrent use.
///
/// Entries are never evicted by the store itself; they live until
/// [`delete`](CacheStore::delete), [`delete_matching`](CacheStore::delete_matching)
/// or [`clear`](CacheStore::clear) removes them.
pub trait CacheStore: Send + Sync {
    /// Returns a snapshot of the entry for `key`.
    fn get(&self, key: &QueryKey) -> Option<CacheEntry<Raw>>;

    /// Inserts or replaces the entry for `key`.
    fn set(&self, key: &QueryKey, entry: CacheEntry<Raw>);

    /// Removes the entry for `key`.
    fn delete(&self, key: &QueryKey) -> DeleteStatus;

    /// Removes every entry whose rendered key contains `pattern`.
    fn delete_matching(&self, pattern: &str) -> DeleteStatus;

    /// Removes every entry.
    fn clear(&self) -> DeleteStatus;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Returns `true` if the store holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently present.
    fn keys(&self) -> Vec<QueryKey>;

    /// Returns the name of this store, used in logs and metrics labels.
    fn name(&self) -> &str {
        "store"
    }

    /// Format used to turn typed values into the stored bytes.
    fn value_format(&self) -> &dyn Format {
        &JsonFormat
    }
}

impl<S: CacheStore + ?Sized> CacheStore for Arc<S> {
    fn get(&self, key: &QueryKey) -> Option<CacheEntry<Raw>> {
        (**self).get(key)
    }

    fn set(&self, key: &QueryKey, entry: CacheEntry<Raw>) {
        (**self).set(key, entry)
    }

    fn delete(&self, key: &QueryKey) -> DeleteStatus {
        (**self).delete(key)
    }

    fn delete_matching(&self, pattern: &str) -> DeleteStatus {
        (**self).delete_matching(pattern)
    }

    fn clear(&self) -> DeleteStatus {
        (**self).clear()
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn keys(&self) -> Vec<QueryKey> {
        (**self).keys()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn value_format(&self) -> &dyn Format {
        (**self).value_format()
    }
}

impl CacheStore for Box<dyn CacheStore> {
    fn get(&self, key: &QueryKey) -> Option<CacheEntry<Raw>> {
        (**self).get(key)
    }

    fn set(&self, key: &QueryKey, entry: CacheEntry<Raw>) {
        (**self).set(key, entry)
    }

    fn delete(&self, key: &QueryKey) -> DeleteStatus {
        (**self).delete(key)
    }

    fn delete_matching(&self, pattern: &str) -> DeleteStatus {
        (**self).delete_matching(pattern)
    }

    fn clear(&self) -> DeleteStatus {
        (**self).clear()
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn keys(&self) -> Vec<QueryKey> {
        (**self).keys()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn value_format(&self) -> &dyn Format {
        (**self).value_format()
    }
}

impl CacheStore for &dyn CacheStore {
    fn get(&self, key: &QueryKey) -> Option<CacheEntry<Raw>> {
        (*self).get(key)
    }

    fn set(&self, key: &QueryKey, entry: CacheEntry<Raw>) {
        (*self).set(key, entry)
    }

    fn delete(&self, key: &QueryKey) -> DeleteStatus {
        (*self).delete(key)
    }

    fn delete_matching(&self, pattern: &str) -> DeleteStatus {
        (*self).delete_matching(pattern)
    }

    fn clear(&self) -> DeleteStatus {
        (*self).clear()
    }

    fn len(&self) -> usize {
        (*self).len()
    }

    fn keys(&self) -> Vec<QueryKey> {
        (*self).keys()
    }

    fn name(&self) -> &str {
        (*self).name()
    }

    fn value_format(&self) -> &dyn Format {
        (*self).value_format()
    }
}
