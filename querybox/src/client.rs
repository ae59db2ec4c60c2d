//! The query client: composition root of the cache.

use std::fmt;
use std::sync::Arc;

use querybox_core::{CacheEntry, CacheState, QueryData, QueryFn, QueryKey, Raw};
use querybox_store::{CacheStore, DeleteStatus, FormatExt, MemoryStore};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{ClientConfig, QueryConfig};
use crate::error::QueryError;
use crate::events::CacheEvent;
use crate::executor::FetchExecutor;
use crate::focus::FocusManager;
use crate::observer::QueryObserver;
use crate::offload::{OffloadConfig, OffloadManager, TimeoutPolicy};
use crate::options::QueryOptions;

struct ClientInner {
    executor: Arc<FetchExecutor>,
    focus: FocusManager,
    offload: OffloadManager,
    defaults: QueryConfig,
}

/// Shared handle to one query cache.
///
/// Cloning is cheap; every clone talks to the same store, executor and
/// background tasks. Create one client per application and hand it to the
/// components that need it.
///
/// ```
/// use querybox::{QueryClient, QueryContext, QueryKey, MemoryStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let client = QueryClient::new(MemoryStore::new());
/// let key = QueryKey::named("motd");
/// let query = |_ctx: QueryContext| async { Ok::<_, std::io::Error>("hello".to_string()) };
///
/// let value = client.fetch_query(&key, &query, &client.options()).await.unwrap();
/// assert_eq!(value, "hello");
/// assert_eq!(client.get_query_data::<String>(&key).unwrap().as_deref(), Some("hello"));
/// # }
/// ```
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("executor", &self.inner.executor)
            .field("defaults", &self.inner.defaults)
            .finish()
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl QueryClient {
    /// Creates a client over `store` with default configuration.
    pub fn new<S>(store: S) -> Self
    where
        S: CacheStore + 'static,
    {
        Self::builder().store(store).build()
    }

    /// Creates a builder for a client.
    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::default()
    }

    /// Options initialised from the client's defaults.
    pub fn options<T>(&self) -> QueryOptions<T> {
        QueryOptions::from_config(self.inner.defaults)
    }

    /// Default query configuration.
    pub fn defaults(&self) -> &QueryConfig {
        &self.inner.defaults
    }

    /// Binds an observer to `key`. See [`QueryObserver`].
    ///
    /// Must be called within a Tokio runtime.
    pub fn observe<T, Q>(&self, key: QueryKey, query: Q, options: QueryOptions<T>) -> QueryObserver<T>
    where
        T: QueryData,
        Q: QueryFn<T> + 'static,
    {
        QueryObserver::bind(self.clone(), key, Arc::new(query), options)
    }

    /// Returns the cached value if it is fresh, otherwise fetches it.
    ///
    /// The fetch always starts a new attempt. A fetch already running for the
    /// key, including one an observer started or joined, is superseded rather
    /// than joined; observers of the key settle with this call's result.
    /// Returns [`QueryError::Cancelled`] if this attempt is itself superseded.
    pub async fn fetch_query<T, Q>(
        &self,
        key: &QueryKey,
        query: &Q,
        options: &QueryOptions<T>,
    ) -> Result<T, QueryError>
    where
        T: QueryData,
        Q: QueryFn<T> + ?Sized,
    {
        let entry = self.store().get(key);
        let state = options.freshness().state(entry.as_ref(), Instant::now());
        if state == CacheState::Actual
            && let Some(raw) = entry.as_ref().and_then(CacheEntry::value)
        {
            return self.decode(raw);
        }
        debug!(key = %key, state = state.as_str(), "fetching query");
        self.inner
            .executor
            .execute(key, query, options)
            .await
            .into_result()
    }

    /// Returns the last successful value for `key`, fresh or not.
    pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Result<Option<T>, QueryError> {
        match self.store().get(key) {
            Some(entry) => entry.value().map(|raw| self.decode(raw)).transpose(),
            None => Ok(None),
        }
    }

    /// Writes `value` as if it had just been fetched.
    ///
    /// A fetch in flight for the key is left running and overwrites the value
    /// when it settles.
    pub fn set_query_data<T: Serialize>(&self, key: &QueryKey, value: &T) -> Result<(), QueryError> {
        let raw = self
            .store()
            .value_format()
            .serialize(value)
            .map_err(|e| QueryError::Encode(Arc::new(e)))?;
        self.store().set(key, CacheEntry::fetched(raw, Instant::now()));
        self.inner.executor.emit(CacheEvent::Updated(key.clone()));
        Ok(())
    }

    /// Freshness of the entry for `key` under the client's defaults.
    pub fn query_state(&self, key: &QueryKey) -> CacheState {
        let entry = self.store().get(key);
        self.inner
            .defaults
            .freshness()
            .state(entry.as_ref(), Instant::now())
    }

    /// Cancels the fetch in flight for `key` and deletes its entry.
    pub fn invalidate(&self, key: &QueryKey) -> DeleteStatus {
        self.inner.executor.cancel(key);
        let status = self.store().delete(key);
        debug!(key = %key, deleted = status.count(), "query invalidated");
        self.inner.executor.emit(CacheEvent::Removed(key.clone()));
        status
    }

    /// Cancels and deletes every query whose key contains `pattern`.
    pub fn invalidate_matching(&self, pattern: &str) -> DeleteStatus {
        let cancelled = self.inner.executor.cancel_matching(pattern);
        let status = self.store().delete_matching(pattern);
        debug!(pattern, cancelled, deleted = status.count(), "queries invalidated");
        self.inner
            .executor
            .emit(CacheEvent::RemovedMatching(pattern.into()));
        status
    }

    /// Cancels every fetch and empties the store.
    pub fn clear(&self) -> DeleteStatus {
        let cancelled = self.inner.executor.cancel_all();
        let status = self.store().clear();
        debug!(cancelled, deleted = status.count(), "cache cleared");
        self.inner.executor.emit(CacheEvent::Cleared);
        status
    }

    /// Cancels the fetch in flight for `key`. The entry is kept.
    pub fn cancel_queries(&self, key: &QueryKey) -> bool {
        self.inner.executor.cancel(key)
    }

    /// Subscribes to cache events.
    pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.executor.subscribe()
    }

    /// Focus tracking shared by all observers of this client.
    pub fn focus_manager(&self) -> &FocusManager {
        &self.inner.focus
    }

    /// Background task manager running observer fetches.
    pub fn offload(&self) -> &OffloadManager {
        &self.inner.offload
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        self.inner.executor.store()
    }

    /// The fetch executor.
    pub fn executor(&self) -> &Arc<FetchExecutor> {
        &self.inner.executor
    }

    /// Cancels every fetch and background task. Cached entries are kept.
    pub fn shutdown(&self) {
        let cancelled = self.inner.executor.cancel_all();
        self.inner.offload.cancel_all();
        debug!(cancelled, "query client shut down");
    }

    fn decode<T: DeserializeOwned>(&self, raw: &Raw) -> Result<T, QueryError> {
        self.store()
            .value_format()
            .deserialize(raw)
            .map_err(|e| QueryError::Decode(Arc::new(e)))
    }
}

/// Builder for [`QueryClient`].
#[derive(Default)]
pub struct QueryClientBuilder {
    store: Option<Arc<dyn CacheStore>>,
    config: ClientConfig,
    offload: Option<OffloadManager>,
    focus: Option<FocusManager>,
}

impl QueryClientBuilder {
    /// Store to cache into. Defaults to a fresh [`MemoryStore`].
    pub fn store<S>(mut self, store: S) -> Self
    where
        S: CacheStore + 'static,
    {
        self.store = Some(Arc::new(store));
        self
    }

    /// Client configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Default options for every query.
    pub fn defaults(mut self, defaults: QueryConfig) -> Self {
        self.config.defaults = defaults;
        self
    }

    /// Offload manager for background fetches. Defaults to one built from
    /// [`ClientConfig::slow_task_warning`].
    pub fn offload(mut self, offload: OffloadManager) -> Self {
        self.offload = Some(offload);
        self
    }

    /// Focus manager, for sharing focus state between clients.
    pub fn focus_manager(mut self, focus: FocusManager) -> Self {
        self.focus = Some(focus);
        self
    }

    /// Builds the client. Conflicting settings are logged, not rejected.
    pub fn build(self) -> QueryClient {
        let config = self.config;
        if let Err(err) = config.defaults.validate() {
            warn!(error = %err, "query defaults conflict; values expire before they go stale");
        }
        if config.event_capacity == 0 {
            warn!("event_capacity of 0 raised to 1");
        }

        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let offload = self.offload.unwrap_or_else(|| {
            let timeout_policy = config
                .slow_task_warning
                .map_or(TimeoutPolicy::None, TimeoutPolicy::Warn);
            OffloadManager::new(OffloadConfig { timeout_policy })
        });

        debug!(store = store.name(), "query client created");
        QueryClient {
            inner: Arc::new(ClientInner {
                executor: Arc::new(FetchExecutor::new(store, config.event_capacity)),
                focus: self.focus.unwrap_or_default(),
                offload,
                defaults: config.defaults,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use querybox_core::QueryContext;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn fetch_query_serves_fresh_values() {
        let client = QueryClient::new(MemoryStore::new());
        let key = QueryKey::named("counter");
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let query = {
            let calls = calls.clone();
            move |_ctx: QueryContext| {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move { Ok::<_, std::io::Error>(n) }
            }
        };
        let options = client
            .options::<u32>()
            .stale_time(Duration::from_millis(100));

        assert_eq!(client.fetch_query(&key, &query, &options).await.unwrap(), 0);
        assert_eq!(client.fetch_query(&key, &query, &options).await.unwrap(), 0);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(client.query_state(&key), CacheState::Actual);
        assert_eq!(client.fetch_query(&key, &query, &options).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn set_query_data_announces_update() {
        let client = QueryClient::default();
        let key = QueryKey::named("manual");
        let mut events = client.events();

        client.set_query_data(&key, &vec![1, 2, 3]).unwrap();

        assert_eq!(events.recv().await.unwrap(), CacheEvent::Updated(key.clone()));
        assert_eq!(
            client.get_query_data::<Vec<i32>>(&key).unwrap(),
            Some(vec![1, 2, 3])
        );
        assert!(matches!(
            client.get_query_data::<String>(&key),
            Err(QueryError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn invalidate_removes_entries() {
        let client = QueryClient::default();
        let page1 = QueryKey::from_params("invoices", &serde_json::json!({"page": 1}));
        let page2 = QueryKey::from_params("invoices", &serde_json::json!({"page": 2}));
        let other = QueryKey::named("clients");
        for key in [&page1, &page2, &other] {
            client.set_query_data(key, &"x").unwrap();
        }

        assert_eq!(client.invalidate(&page1), DeleteStatus::Deleted(1));
        assert_eq!(client.invalidate(&page1), DeleteStatus::Missing);
        assert_eq!(client.query_state(&page1), CacheState::Missing);

        assert_eq!(client.invalidate_matching("invoices"), DeleteStatus::Deleted(1));
        assert_eq!(client.store().len(), 1);

        assert_eq!(client.clear(), DeleteStatus::Deleted(1));
        assert!(client.store().is_empty());
    }

    #[tokio::test]
    async fn cancelled_fetch_query_reports_cancellation() {
        let client = QueryClient::default();
        let key = QueryKey::named("slow");
        let query = |_ctx: QueryContext| async {
            std::future::pending::<()>().await;
            Ok::<_, std::io::Error>(0u8)
        };

        let fetch = tokio::spawn({
            let client = client.clone();
            let key = key.clone();
            async move { client.fetch_query(&key, &query, &client.options()).await }
        });
        while !client.executor().is_in_flight(&key) {
            tokio::task::yield_now().await;
        }

        assert!(client.cancel_queries(&key));
        assert!(matches!(fetch.await.unwrap(), Err(QueryError::Cancelled)));
    }

    #[test]
    fn builder_accepts_conflicting_windows() {
        let client = QueryClient::builder()
            .defaults(QueryConfig {
                stale_time: Duration::from_secs(600),
                cache_time: Duration::from_secs(60),
                ..Default::default()
            })
            .build();
        assert_eq!(client.defaults().stale_time, Duration::from_secs(600));
    }
}
