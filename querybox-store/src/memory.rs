//! In-memory store backed by [`DashMap`].

use std::sync::Arc;

use dashmap::DashMap;
use querybox_core::{CacheEntry, QueryKey, Raw};
use smol_str::SmolStr;
use tracing::trace;

use crate::DeleteStatus;
use crate::format::{Format, JsonFormat};
use crate::store::CacheStore;

/// Unbounded in-memory store.
///
/// `MemoryStore` keeps every entry until it is deleted. It uses a sharded
/// concurrent map, so reads and writes of different keys rarely contend.
/// Clones share the same map.
///
/// # Examples
///
/// ```
/// use querybox_core::{CacheEntry, QueryKey, Raw};
/// use querybox_store::{CacheStore, MemoryStore};
/// use tokio::time::Instant;
///
/// let store = MemoryStore::builder().label("dashboard").build();
/// let key = QueryKey::named("stats");
///
/// store.set(&key, CacheEntry::fetched(Raw::from_static(b"42"), Instant::now()));
/// assert_eq!(store.len(), 1);
/// assert_eq!(store.name(), "dashboard");
/// ```
///
/// # Caveats
///
/// - Data is **not persisted** and **not shared** across processes
/// - There is **no eviction**: memory grows with the number of distinct keys
#[derive(Clone)]
pub struct MemoryStore<S = JsonFormat>
where
    S: Format,
{
    entries: Arc<DashMap<QueryKey, CacheEntry<Raw>>>,
    serializer: S,
    label: SmolStr,
}

impl<S: Format> std::fmt::Debug for MemoryStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("label", &self.label)
            .field("entries", &self.entries.len())
            .field("serializer", &std::any::type_name::<S>())
            .finish()
    }
}

impl MemoryStore<JsonFormat> {
    /// Creates a store with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a new builder for `MemoryStore`.
    pub fn builder() -> MemoryStoreBuilder<JsonFormat> {
        MemoryStoreBuilder::new()
    }
}

impl Default for MemoryStore<JsonFormat> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Format> CacheStore for MemoryStore<S> {
    fn get(&self, key: &QueryKey) -> Option<CacheEntry<Raw>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &QueryKey, entry: CacheEntry<Raw>) {
        trace!(store = %self.label, key = %key, bytes = entry.memory_size(), "store set");
        self.entries.insert(key.clone(), entry);
    }

    fn delete(&self, key: &QueryKey) -> DeleteStatus {
        match self.entries.remove(key) {
            Some(_) => DeleteStatus::Deleted(1),
            None => DeleteStatus::Missing,
        }
    }

    fn delete_matching(&self, pattern: &str) -> DeleteStatus {
        let mut removed = 0u32;
        self.entries.retain(|key, _| {
            let matched = key.contains(pattern);
            if matched {
                removed += 1;
            }
            !matched
        });
        trace!(store = %self.label, pattern, removed, "store delete matching");
        DeleteStatus::from_count(removed)
    }

    fn clear(&self) -> DeleteStatus {
        let removed = u32::try_from(self.entries.len()).unwrap_or(u32::MAX);
        self.entries.clear();
        DeleteStatus::from_count(removed)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn keys(&self) -> Vec<QueryKey> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    fn name(&self) -> &str {
        &self.label
    }

    fn value_format(&self) -> &dyn Format {
        &self.serializer
    }
}

/// Builder for creating and configuring a [`MemoryStore`].
///
/// ```
/// use querybox_store::MemoryStore;
/// use querybox_store::format::JsonFormat;
///
/// let store = MemoryStore::builder()
///     .label("widgets")
///     .initial_capacity(64)
///     .value_format(JsonFormat)
///     .build();
/// # let _ = store;
/// ```
pub struct MemoryStoreBuilder<S = JsonFormat>
where
    S: Format,
{
    serializer: S,
    label: SmolStr,
    initial_capacity: usize,
}

impl MemoryStoreBuilder<JsonFormat> {
    /// Creates a builder with the JSON format and the `memory` label.
    pub fn new() -> Self {
        MemoryStoreBuilder {
            serializer: JsonFormat,
            label: SmolStr::new_static("memory"),
            initial_capacity: 0,
        }
    }
}

impl Default for MemoryStoreBuilder<JsonFormat> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Format> MemoryStoreBuilder<S> {
    /// Sets the label used in logs and metrics.
    pub fn label(self, label: impl Into<SmolStr>) -> Self {
        Self {
            label: label.into(),
            ..self
        }
    }

    /// Pre-allocates room for `capacity` entries. This is not a bound.
    pub fn initial_capacity(self, capacity: usize) -> Self {
        Self {
            initial_capacity: capacity,
            ..self
        }
    }

    /// Sets the value format.
    pub fn value_format<NewS: Format>(self, serializer: NewS) -> MemoryStoreBuilder<NewS> {
        MemoryStoreBuilder {
            serializer,
            label: self.label,
            initial_capacity: self.initial_capacity,
        }
    }

    /// Builds the store.
    pub fn build(self) -> MemoryStore<S> {
        MemoryStore {
            entries: Arc::new(DashMap::with_capacity(self.initial_capacity)),
            serializer: self.serializer,
            label: self.label,
        }
    }
}
