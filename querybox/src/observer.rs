//! Observers: a consumer's live view of one query.
//!
//! An observer reads through the cache with stale-while-revalidate semantics:
//!
//! | entry on bind     | shown immediately | fetch started        |
//! |-------------------|-------------------|----------------------|
//! | missing / expired | nothing (loading) | yes, awaited by user |
//! | stale             | cached value      | yes, in background   |
//! | fresh             | cached value      | no                   |
//!
//! State is derived from the store and the executor's in-flight table, so
//! several observers of the same key always agree, and a fetch started by one
//! of them is visible to all.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use querybox_core::{CacheState, QueryData, QueryFn, QueryKey};
use querybox_store::FormatExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::events::CacheEvent;
use crate::focus::{FocusManager, FocusState};
use crate::metrics;
use crate::options::QueryOptions;

/// Snapshot of a query as seen by an observer.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    /// Last successful value, unless it expired.
    pub value: Option<T>,
    /// Error of the latest fetch, or a decode failure of the cached value.
    pub error: Option<QueryError>,
    /// A fetch is running and there is no value to show.
    pub is_loading: bool,
    /// A fetch is running for the key.
    pub is_fetching: bool,
    /// `error` is set.
    pub is_error: bool,
    /// There is a value and no error.
    pub is_success: bool,
    /// The value is older than the stale time, or there is none.
    pub is_stale: bool,
    /// Attempts made by the latest failed fetch.
    pub failure_count: u32,
    /// When the value was fetched.
    pub updated_at: Option<Instant>,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        QueryState {
            value: None,
            error: None,
            is_loading: false,
            is_fetching: false,
            is_error: false,
            is_success: false,
            is_stale: true,
            failure_count: 0,
            updated_at: None,
        }
    }
}

#[derive(Default)]
struct ObserverTasks {
    events: Option<JoinHandle<()>>,
    focus: Option<JoinHandle<()>>,
}

impl ObserverTasks {
    fn abort_focus(&mut self) {
        if let Some(task) = self.focus.take() {
            task.abort();
        }
    }
}

struct Shared<T> {
    client: QueryClient,
    key: QueryKey,
    query: Arc<dyn QueryFn<T>>,
    options: QueryOptions<T>,
    enabled: AtomicBool,
    /// Generation of the last fetch this observer started, 0 for none.
    generation: AtomicU64,
    state: watch::Sender<QueryState<T>>,
}

impl<T: QueryData> Shared<T> {
    fn derive(&self) -> QueryState<T> {
        let executor = self.client.executor();
        let store = executor.store();
        let entry = store.get(&self.key);
        let freshness = self.options.freshness();
        let cache_state = freshness.state(entry.as_ref(), Instant::now());
        let is_fetching = executor.is_in_flight(&self.key);

        let mut state = QueryState {
            is_fetching,
            is_stale: cache_state.needs_refresh(),
            ..QueryState::default()
        };
        let Some(entry) = entry else {
            state.is_loading = is_fetching;
            return state;
        };

        state.error = entry.error().cloned().map(QueryError::Fetch);
        state.failure_count = entry.failure_count();
        if cache_state != CacheState::Expired
            && let Some(raw) = entry.value()
        {
            match store.value_format().deserialize::<T>(raw) {
                Ok(value) => {
                    state.value = Some(value);
                    state.updated_at = entry.updated_at();
                }
                Err(err) => state.error = Some(QueryError::Decode(Arc::new(err))),
            }
        }
        state.is_loading = is_fetching && state.value.is_none();
        state.is_error = state.error.is_some();
        state.is_success = state.value.is_some() && !state.is_error;
        state
    }

    fn sync(&self) {
        self.state.send_replace(self.derive());
    }

    fn start_fetch(&self, kind: &'static str) {
        let executor = self.client.executor().clone();
        let attempt = executor.begin(&self.key);
        self.generation.store(attempt.generation(), Ordering::Release);
        trace!(key = %self.key, generation = attempt.generation(), kind, "observer fetch started");
        self.sync();

        let query = self.query.clone();
        let options = self.options.clone();
        self.client.offload().spawn(kind, async move {
            executor.run(attempt, &*query, &options).await;
        });
    }

    /// Reads the entry and fetches if it is not fresh.
    fn bind(&self) {
        let store = self.client.store();
        let entry = store.get(&self.key);
        let cache_state = self.options.freshness().state(entry.as_ref(), Instant::now());
        metrics::record_bind(self.key.name(), cache_state);
        debug!(key = %self.key, state = cache_state.as_str(), "observer bound");

        if let Some(generation) = self.client.executor().in_flight_generation(&self.key) {
            self.generation.store(generation, Ordering::Release);
            trace!(key = %self.key, generation, "observer joined running fetch");
            self.sync();
        } else if !cache_state.needs_refresh() {
            self.sync();
        } else if cache_state.is_miss() {
            self.start_fetch("fetch");
        } else {
            self.start_fetch("revalidate");
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

async fn listen_events<T: QueryData>(
    shared: Arc<Shared<T>>,
    mut events: broadcast::Receiver<CacheEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) if event.affects(&shared.key) => shared.sync(),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                trace!(key = %shared.key, skipped, "observer lagged behind cache events");
                shared.sync();
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn listen_focus<T: QueryData>(
    shared: Arc<Shared<T>>,
    mut rx: watch::Receiver<FocusState>,
    mut seen: u64,
) {
    while let Some(count) = FocusManager::regained_since(&mut rx, seen).await {
        seen = count;
        if !shared.is_enabled() {
            continue;
        }
        let entry = shared.client.store().get(&shared.key);
        let cache_state = shared.options.freshness().state(entry.as_ref(), Instant::now());
        if cache_state.needs_refresh() && !shared.client.executor().is_in_flight(&shared.key) {
            debug!(key = %shared.key, state = cache_state.as_str(), "refetching on focus");
            shared.start_fetch("focus");
        }
    }
}

/// A consumer's binding to one query key.
///
/// Created by [`QueryClient::observe`]. Binding reads the cache and starts a
/// fetch when the entry is missing, expired or stale. The current state is
/// available through [`state`](Self::state) and as a push stream through
/// [`subscribe`](Self::subscribe).
///
/// Dropping the last observer of a key cancels the fetch it started or
/// joined, if that fetch is still the current one for the key. Fetches shared
/// with observers that are still bound keep running.
///
/// ```
/// use querybox::{QueryClient, QueryContext, QueryKey};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let client = QueryClient::default();
/// let query = |_ctx: QueryContext| async { Ok::<_, std::io::Error>(vec!["INV-1".to_string()]) };
///
/// let observer = client.observe(QueryKey::named("invoices"), query, client.options());
/// assert!(observer.state().is_loading);
///
/// let state = observer.settled().await;
/// assert!(state.is_success);
/// assert_eq!(state.value.unwrap(), vec!["INV-1".to_string()]);
/// # }
/// ```
pub struct QueryObserver<T: QueryData> {
    shared: Arc<Shared<T>>,
    tasks: Mutex<ObserverTasks>,
}

impl<T: QueryData> std::fmt::Debug for QueryObserver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserver")
            .field("key", &self.shared.key)
            .field("enabled", &self.shared.is_enabled())
            .finish()
    }
}

impl<T: QueryData> QueryObserver<T> {
    pub(crate) fn bind(
        client: QueryClient,
        key: QueryKey,
        query: Arc<dyn QueryFn<T>>,
        options: QueryOptions<T>,
    ) -> Self {
        let enabled = options.config().enabled;
        let events = client.events();
        client.executor().attach_observer(&key);
        let (state, _) = watch::channel(QueryState::default());
        let shared = Arc::new(Shared {
            client,
            key,
            query,
            options,
            enabled: AtomicBool::new(enabled),
            generation: AtomicU64::new(0),
            state,
        });

        let observer = QueryObserver {
            tasks: Mutex::new(ObserverTasks {
                events: Some(tokio::spawn(listen_events(shared.clone(), events))),
                focus: None,
            }),
            shared,
        };
        if enabled {
            observer.activate();
        } else {
            observer.shared.sync();
        }
        observer
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, ObserverTasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn activate(&self) {
        self.shared.bind();
        if self.shared.options.config().refetch_on_window_focus {
            let focus = self.shared.client.focus_manager();
            let (rx, seen) = (focus.subscribe(), focus.regain_count());
            let mut tasks = self.lock_tasks();
            tasks.abort_focus();
            tasks.focus = Some(tokio::spawn(listen_focus(self.shared.clone(), rx, seen)));
        }
    }

    /// Key this observer is bound to.
    pub fn key(&self) -> &QueryKey {
        &self.shared.key
    }

    /// Options this observer was created with.
    pub fn options(&self) -> &QueryOptions<T> {
        &self.shared.options
    }

    /// Whether the observer fetches automatically.
    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled()
    }

    /// Current state, read from the cache at call time.
    pub fn state(&self) -> QueryState<T> {
        let state = self.shared.derive();
        self.shared.state.send_replace(state.clone());
        state
    }

    /// Receiver notified whenever the state changes.
    ///
    /// `is_stale` in pushed states reflects the moment of the push; call
    /// [`state`](Self::state) for an up-to-date answer.
    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.shared.state.subscribe()
    }

    /// Waits until no fetch is running for the key and returns the state.
    pub async fn settled(&self) -> QueryState<T> {
        let mut rx = self.shared.state.subscribe();
        self.shared.sync();
        match rx.wait_for(|state| !state.is_fetching).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Fetches regardless of freshness, superseding any fetch in flight.
    pub fn refetch(&self) {
        self.shared.start_fetch("refetch");
    }

    /// Deletes the cached entry and, when enabled, fetches it again.
    pub fn invalidate(&self) {
        self.shared.client.invalidate(&self.shared.key);
        if self.is_enabled() {
            self.shared.start_fetch("fetch");
        }
    }

    /// Enables or disables automatic fetching.
    ///
    /// Enabling runs the bind logic again; disabling stops refetching on
    /// focus. A running fetch is not affected.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.shared.enabled.swap(enabled, Ordering::AcqRel);
        match (was, enabled) {
            (false, true) => self.activate(),
            (true, false) => self.lock_tasks().abort_focus(),
            _ => {}
        }
    }
}

impl<T: QueryData> Drop for QueryObserver<T> {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = tasks.events.take() {
            task.abort();
        }
        tasks.abort_focus();

        // A fetch shared with other observers of the key keeps running.
        let executor = self.shared.client.executor();
        let remaining = executor.detach_observer(&self.shared.key);
        let generation = self.shared.generation.load(Ordering::Acquire);
        if remaining == 0 && generation != 0 {
            executor.cancel_generation(&self.shared.key, generation);
        }
        debug!(key = %self.shared.key, remaining, "observer dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use querybox_core::{CacheEntry, QueryContext};
    use std::time::Duration;

    #[tokio::test]
    async fn disabled_observer_does_not_fetch() {
        let client = QueryClient::default();
        let query = |_ctx: QueryContext| async { Ok::<_, std::io::Error>(1u8) };
        let observer = client.observe(
            QueryKey::named("idle"),
            query,
            client.options().enabled(false),
        );

        let state = observer.state();
        assert!(!state.is_fetching);
        assert!(state.value.is_none());
        assert_eq!(client.executor().in_flight_count(), 0);

        observer.set_enabled(true);
        assert_eq!(observer.settled().await.value, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_value_is_not_shown() {
        let client = QueryClient::default();
        let key = QueryKey::named("old");
        client
            .store()
            .set(&key, CacheEntry::fetched(bytes_of("\"cached\""), Instant::now()));
        tokio::time::advance(Duration::from_millis(250)).await;

        let query = |_ctx: QueryContext| async {
            std::future::pending::<()>().await;
            Ok::<_, std::io::Error>(String::new())
        };
        let options = client
            .options()
            .stale_time(Duration::from_millis(100))
            .cache_time(Duration::from_millis(200));
        let observer = client.observe(key, query, options);

        let state = observer.state();
        assert!(state.value.is_none());
        assert!(state.is_loading);
    }

    #[tokio::test]
    async fn undecodable_value_is_an_error() {
        let client = QueryClient::default();
        let key = QueryKey::named("mixed");
        client.set_query_data(&key, &"text").unwrap();

        let query = |_ctx: QueryContext| async { Ok::<_, std::io::Error>(7u32) };
        let observer = client.observe(key, query, client.options().enabled(false));

        let state = observer.state();
        assert!(state.is_error);
        assert!(matches!(state.error, Some(QueryError::Decode(_))));
    }

    fn bytes_of(json: &'static str) -> querybox_core::Raw {
        querybox_core::Raw::from_static(json.as_bytes())
    }
}
