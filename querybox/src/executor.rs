//! Fetch execution with retries, supersession and cancellation.
//!
//! Every fetch starts with [`FetchExecutor::begin`], which hands out a
//! generation number and makes it the key's current attempt. Only the current
//! attempt may write its result into the store; starting a new attempt for
//! the same key cancels the previous one. The check and the store write happen
//! while the key's in-flight record is locked, so a result can never land after
//! the attempt that replaced it.
//!
//! ```
//! use querybox::executor::{FetchExecutor, FetchOutcome};
//! use querybox::{MemoryStore, QueryContext, QueryKey, QueryOptions};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let executor = FetchExecutor::new(Arc::new(MemoryStore::new()), 16);
//! let key = QueryKey::named("greeting");
//! let query = |_ctx: QueryContext| async { Ok::<_, std::io::Error>("hello".to_string()) };
//!
//! let outcome = executor.execute(&key, &query, &QueryOptions::new()).await;
//! assert!(matches!(outcome, FetchOutcome::Fetched(ref v) if v == "hello"));
//! assert!(executor.store().get(&key).is_some());
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use querybox_core::{
    CacheEntry, CancellationSignal, FetchError, QueryContext, QueryData, QueryFn, QueryKey, Raw,
};
use querybox_store::{CacheStore, FormatExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::error::QueryError;
use crate::events::CacheEvent;
use crate::metrics::{self, SettledAs};
use crate::options::QueryOptions;

/// The attempt currently allowed to write a key's entry.
#[derive(Debug)]
struct InFlight {
    generation: u64,
    signal: CancellationSignal,
}

/// Ticket for one fetch of one key, obtained from [`FetchExecutor::begin`].
#[derive(Debug, Clone)]
pub struct FetchAttempt {
    key: QueryKey,
    generation: u64,
    signal: CancellationSignal,
}

impl FetchAttempt {
    /// Key being fetched.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Generation number, unique and increasing across the executor.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Signal cancelled when the attempt is superseded or cancelled.
    pub fn signal(&self) -> &CancellationSignal {
        &self.signal
    }
}

/// How a fetch ended.
#[derive(Debug, Clone)]
pub enum FetchOutcome<T> {
    /// The value was fetched and written.
    Fetched(T),
    /// Every attempt failed; the error was written.
    Failed(FetchError),
    /// A newer attempt replaced this one, or it was cancelled. Nothing was
    /// written.
    Superseded,
}

impl<T> FetchOutcome<T> {
    /// Returns `true` if the fetch ended without a result.
    pub fn is_superseded(&self) -> bool {
        matches!(self, FetchOutcome::Superseded)
    }

    /// Converts the outcome into a result, reporting supersession as
    /// [`QueryError::Cancelled`].
    pub fn into_result(self) -> Result<T, QueryError> {
        match self {
            FetchOutcome::Fetched(value) => Ok(value),
            FetchOutcome::Failed(err) => Err(QueryError::Fetch(err)),
            FetchOutcome::Superseded => Err(QueryError::Cancelled),
        }
    }
}

/// Releases the in-flight record of an attempt whose future was dropped.
struct InFlightGuard<'a> {
    executor: &'a FetchExecutor,
    key: QueryKey,
    generation: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.executor.cancel_generation(&self.key, self.generation);
    }
}

/// Runs query functions and writes their results into the store.
pub struct FetchExecutor {
    store: Arc<dyn CacheStore>,
    inflight: DashMap<QueryKey, InFlight>,
    /// Bound observers per key.
    observers: DashMap<QueryKey, usize>,
    generation: AtomicU64,
    events: broadcast::Sender<CacheEvent>,
}

impl std::fmt::Debug for FetchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchExecutor")
            .field("store", &self.store.name())
            .field("in_flight", &self.inflight.len())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

impl FetchExecutor {
    /// Creates an executor writing into `store` and broadcasting events on a
    /// channel of `event_capacity` (at least 1).
    pub fn new(store: Arc<dyn CacheStore>, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        FetchExecutor {
            store,
            inflight: DashMap::new(),
            observers: DashMap::new(),
            generation: AtomicU64::new(0),
            events,
        }
    }

    /// Store results are written into.
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Subscribes to cache events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: CacheEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Starts a new attempt for `key`, cancelling the one in flight.
    pub fn begin(&self, key: &QueryKey) -> FetchAttempt {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let signal = CancellationSignal::new();
        let previous = self.inflight.insert(
            key.clone(),
            InFlight {
                generation,
                signal: signal.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.signal.cancel();
            debug!(
                key = %key,
                superseded = previous.generation,
                generation,
                "superseding in-flight fetch"
            );
        }
        metrics::record_fetch_started(key.name());
        self.emit(CacheEvent::Fetching(key.clone()));
        FetchAttempt {
            key: key.clone(),
            generation,
            signal,
        }
    }

    /// Starts and runs a fetch.
    pub async fn execute<T, Q>(
        &self,
        key: &QueryKey,
        query: &Q,
        options: &QueryOptions<T>,
    ) -> FetchOutcome<T>
    where
        T: QueryData,
        Q: QueryFn<T> + ?Sized,
    {
        let attempt = self.begin(key);
        self.run(attempt, query, options).await
    }

    /// Runs an attempt obtained from [`begin`](Self::begin) to completion.
    ///
    /// Failed calls are retried with exponential backoff. The query call and
    /// the backoff sleep both stop as soon as the attempt is cancelled.
    /// Dropping the returned future, polled or not, releases the attempt.
    pub fn run<'a, T, Q>(
        &'a self,
        attempt: FetchAttempt,
        query: &'a Q,
        options: &'a QueryOptions<T>,
    ) -> impl Future<Output = FetchOutcome<T>> + 'a
    where
        T: QueryData,
        Q: QueryFn<T> + ?Sized,
    {
        let span = debug_span!(
            "querybox::fetch",
            key = %attempt.key,
            generation = attempt.generation,
        );
        let guard = InFlightGuard {
            executor: self,
            key: attempt.key.clone(),
            generation: attempt.generation,
        };
        async move {
            let started = Instant::now();
            let outcome = match self.call_with_retries(&attempt, query, options).await {
                Some(Ok((value, attempts))) => {
                    self.settle_success(&attempt, value, attempts, options)
                }
                Some(Err(err)) => self.settle_failure(&attempt, err, options),
                None => FetchOutcome::Superseded,
            };
            let settled_as = match &outcome {
                FetchOutcome::Fetched(_) => SettledAs::Fetched,
                FetchOutcome::Failed(_) => SettledAs::Failed,
                FetchOutcome::Superseded => SettledAs::Superseded,
            };
            metrics::record_fetch_settled(attempt.key.name(), settled_as, started.elapsed());
            drop(guard);
            outcome
        }
        .instrument(span)
    }

    /// Returns `None` once the attempt is cancelled.
    async fn call_with_retries<T, Q>(
        &self,
        attempt: &FetchAttempt,
        query: &Q,
        options: &QueryOptions<T>,
    ) -> Option<Result<(T, u32), FetchError>>
    where
        T: QueryData,
        Q: QueryFn<T> + ?Sized,
    {
        let policy = options.retry_policy();
        let mut n = 0u32;
        loop {
            if attempt.signal.is_cancelled() {
                return None;
            }
            let ctx = QueryContext::new(
                attempt.key.clone(),
                options.params_value().clone(),
                attempt.signal.clone(),
                n,
            );
            let result = tokio::select! {
                biased;
                _ = attempt.signal.cancelled() => return None,
                result = query.call(ctx) => result,
            };
            match result {
                Ok(value) => return Some(Ok((value, n + 1))),
                Err(err) if policy.should_retry(n) => {
                    let delay = policy.delay(n);
                    debug!(attempt = n, ?delay, error = %err, "query attempt failed, retrying");
                    metrics::record_retry(attempt.key.name());
                    tokio::select! {
                        biased;
                        _ = attempt.signal.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    n += 1;
                }
                Err(err) => return Some(Err(FetchError::new(err, n + 1))),
            }
        }
    }

    fn settle_success<T: QueryData>(
        &self,
        attempt: &FetchAttempt,
        value: T,
        attempts: u32,
        options: &QueryOptions<T>,
    ) -> FetchOutcome<T> {
        let raw = match self.store.value_format().serialize(&value) {
            Ok(raw) => raw,
            Err(err) => {
                // A value the store cannot hold is a failed fetch.
                let err = FetchError::new(err, attempts);
                return self.settle_failure(attempt, err, options);
            }
        };
        let now = Instant::now();
        if !self.write_if_current(attempt, |_| CacheEntry::fetched(raw, now)) {
            return FetchOutcome::Superseded;
        }
        debug!("query fetched");
        options.notify_success(&value);
        FetchOutcome::Fetched(value)
    }

    fn settle_failure<T: QueryData>(
        &self,
        attempt: &FetchAttempt,
        err: FetchError,
        options: &QueryOptions<T>,
    ) -> FetchOutcome<T> {
        let now = Instant::now();
        let written = self.write_if_current(attempt, |previous| {
            let mut entry = previous.unwrap_or_default();
            entry.record_failure(err.clone(), now);
            entry
        });
        if !written {
            return FetchOutcome::Superseded;
        }
        warn!(attempts = err.attempts(), error = %err.inner(), "query failed");
        options.notify_error(&err);
        FetchOutcome::Failed(err)
    }

    /// Writes the entry built by `build` if `attempt` is still current, then
    /// releases the in-flight record and announces the update.
    fn write_if_current<F>(&self, attempt: &FetchAttempt, build: F) -> bool
    where
        F: FnOnce(Option<CacheEntry<Raw>>) -> CacheEntry<Raw>,
    {
        {
            let current = match self.inflight.get(&attempt.key) {
                Some(record) if record.generation == attempt.generation => record,
                _ => {
                    trace!("attempt is no longer current, dropping result");
                    return false;
                }
            };
            let previous = self.store.get(&attempt.key);
            self.store.set(&attempt.key, build(previous));
            drop(current);
        }
        self.inflight
            .remove_if(&attempt.key, |_, record| record.generation == attempt.generation);
        self.emit(CacheEvent::Updated(attempt.key.clone()));
        true
    }

    fn release(&self, key: &QueryKey, record: InFlight) {
        record.signal.cancel();
        debug!(key = %key, generation = record.generation, "fetch cancelled");
        self.emit(CacheEvent::Cancelled(key.clone()));
    }

    /// Cancels the in-flight fetch for `key`. Returns `false` if there was none.
    pub fn cancel(&self, key: &QueryKey) -> bool {
        match self.inflight.remove(key) {
            Some((key, record)) => {
                self.release(&key, record);
                true
            }
            None => false,
        }
    }

    /// Cancels the in-flight fetch for `key` only if it is still `generation`.
    pub fn cancel_generation(&self, key: &QueryKey, generation: u64) -> bool {
        match self
            .inflight
            .remove_if(key, |_, record| record.generation == generation)
        {
            Some((key, record)) => {
                self.release(&key, record);
                true
            }
            None => false,
        }
    }

    /// Cancels every in-flight fetch and returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let keys: Vec<QueryKey> = self.inflight.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter(|key| self.cancel(key)).count()
    }

    /// Cancels the in-flight fetches of keys containing `pattern`.
    pub fn cancel_matching(&self, pattern: &str) -> usize {
        let keys: Vec<QueryKey> = self
            .inflight
            .iter()
            .filter(|e| e.key().contains(pattern))
            .map(|e| e.key().clone())
            .collect();
        keys.iter().filter(|key| self.cancel(key)).count()
    }

    /// Returns `true` if a fetch for `key` is running.
    pub fn is_in_flight(&self, key: &QueryKey) -> bool {
        self.inflight.contains_key(key)
    }

    /// Generation of the fetch running for `key`, if any.
    pub fn in_flight_generation(&self, key: &QueryKey) -> Option<u64> {
        self.inflight.get(key).map(|record| record.generation)
    }

    /// Number of running fetches.
    pub fn in_flight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Number of observers bound to `key`.
    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.observers.get(key).map_or(0, |count| *count)
    }

    pub(crate) fn attach_observer(&self, key: &QueryKey) {
        *self.observers.entry(key.clone()).or_insert(0) += 1;
    }

    /// Returns how many observers are still bound to `key`.
    pub(crate) fn detach_observer(&self, key: &QueryKey) -> usize {
        match self.observers.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let remaining = entry.get().saturating_sub(1);
                if remaining == 0 {
                    entry.remove();
                } else {
                    *entry.get_mut() = remaining;
                }
                remaining
            }
            Entry::Vacant(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use querybox_store::MemoryStore;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn executor() -> FetchExecutor {
        FetchExecutor::new(Arc::new(MemoryStore::new()), 16)
    }

    fn decode(executor: &FetchExecutor, key: &QueryKey) -> Option<String> {
        let entry = executor.store().get(key)?;
        let raw = entry.value()?;
        executor.store().value_format().deserialize(raw).ok()
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_exponential_backoff() {
        let executor = executor();
        let key = QueryKey::named("flaky");
        let calls = Arc::new(AtomicU32::new(0));
        let query = {
            let calls = calls.clone();
            move |ctx: QueryContext| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if ctx.attempt() < 2 {
                        Err("not yet")
                    } else {
                        Ok("ready".to_string())
                    }
                }
            }
        };
        let options = QueryOptions::new()
            .retry(2)
            .retry_delay(Duration::from_millis(10));

        let started = Instant::now();
        let outcome = executor.execute(&key, &query, &options).await;

        assert!(matches!(outcome, FetchOutcome::Fetched(ref v) if v == "ready"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(decode(&executor, &key).as_deref(), Some("ready"));
        assert!(!executor.is_in_flight(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_record_error() {
        let executor = executor();
        let key = QueryKey::named("down");
        let query = |_ctx: QueryContext| async { Err::<String, _>("boom") };
        let options = QueryOptions::new()
            .retry(1)
            .retry_delay(Duration::from_millis(5));

        let outcome = executor.execute(&key, &query, &options).await;
        let FetchOutcome::Failed(err) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(err.attempts(), 2);

        let entry = executor.store().get(&key).unwrap();
        assert!(entry.value().is_none());
        assert_eq!(entry.failure_count(), 2);
        assert_eq!(entry.error().unwrap().to_string(), err.to_string());
    }

    #[tokio::test]
    async fn failure_keeps_previous_value() {
        let executor = executor();
        let key = QueryKey::named("report");
        let ok = |_ctx: QueryContext| async { Ok::<_, std::io::Error>("A".to_string()) };
        let fail = |_ctx: QueryContext| async { Err::<String, _>("unavailable") };
        let options = QueryOptions::new().retry(0);

        executor.execute(&key, &ok, &options).await;
        executor.execute(&key, &fail, &options).await;

        assert_eq!(decode(&executor, &key).as_deref(), Some("A"));
        assert!(executor.store().get(&key).unwrap().error().is_some());
    }

    #[tokio::test]
    async fn newer_attempt_wins() {
        let executor = Arc::new(executor());
        let key = QueryKey::named("race");
        let (release_slow, slow_gate) = tokio::sync::oneshot::channel::<()>();
        let slow_gate = Arc::new(tokio::sync::Mutex::new(Some(slow_gate)));

        let slow = move |_ctx: QueryContext| {
            let gate = slow_gate.clone();
            async move {
                if let Some(gate) = gate.lock().await.take() {
                    let _ = gate.await;
                }
                Ok::<_, std::io::Error>("old".to_string())
            }
        };
        let fast = |_ctx: QueryContext| async { Ok::<_, std::io::Error>("new".to_string()) };
        let options = QueryOptions::new();

        let first = executor.begin(&key);
        let second = executor.begin(&key);
        assert!(first.signal().is_cancelled());
        assert!(second.generation() > first.generation());

        let slow_run = tokio::spawn({
            let executor = executor.clone();
            let options = options.clone();
            async move { executor.run(first, &slow, &options).await }
        });
        let outcome = executor.run(second, &fast, &options).await;
        let _ = release_slow.send(());

        assert!(matches!(outcome, FetchOutcome::Fetched(ref v) if v == "new"));
        assert!(slow_run.await.unwrap().is_superseded());
        assert_eq!(decode(&executor, &key).as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn cancel_drops_result_and_notifies() {
        let executor = Arc::new(executor());
        let key = QueryKey::named("slow");
        let mut events = executor.subscribe();
        let query = |_ctx: QueryContext| async {
            std::future::pending::<()>().await;
            Ok::<_, std::io::Error>("never".to_string())
        };

        let attempt = executor.begin(&key);
        let run = tokio::spawn({
            let executor = executor.clone();
            async move { executor.run(attempt, &query, &QueryOptions::new()).await }
        });

        assert!(executor.is_in_flight(&key));
        assert!(executor.cancel(&key));
        assert!(run.await.unwrap().is_superseded());
        assert!(executor.store().get(&key).is_none());
        assert_eq!(events.recv().await.unwrap(), CacheEvent::Fetching(key.clone()));
        assert_eq!(events.recv().await.unwrap(), CacheEvent::Cancelled(key.clone()));
        assert!(!executor.cancel(&key));
    }

    #[tokio::test]
    async fn dropped_run_releases_in_flight_record() {
        let executor = executor();
        let key = QueryKey::named("dropped");
        let query = |_ctx: QueryContext| async {
            std::future::pending::<()>().await;
            Ok::<_, std::io::Error>(String::new())
        };
        let options = QueryOptions::new();

        let attempt = executor.begin(&key);
        let signal = attempt.signal().clone();
        {
            let run = executor.run(attempt, &query, &options);
            let _ = tokio::time::timeout(Duration::from_millis(1), run).await;
        }
        assert!(!executor.is_in_flight(&key));
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn stale_generation_cannot_cancel_newer_attempt() {
        let executor = executor();
        let key = QueryKey::named("gen");
        let old = executor.begin(&key);
        let new = executor.begin(&key);

        assert!(!executor.cancel_generation(&key, old.generation()));
        assert_eq!(executor.in_flight_generation(&key), Some(new.generation()));
        assert!(executor.cancel_generation(&key, new.generation()));
        assert_eq!(executor.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn callbacks_fire_for_current_attempts() {
        let executor = executor();
        let key = QueryKey::named("callbacks");
        let successes = Arc::new(AtomicU32::new(0));
        let errors = Arc::new(AtomicU32::new(0));
        let options = QueryOptions::new()
            .retry(0)
            .on_success({
                let successes = successes.clone();
                move |_: &String| {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_error({
                let errors = errors.clone();
                move |_| {
                    errors.fetch_add(1, Ordering::SeqCst);
                }
            });

        let ok = |_ctx: QueryContext| async { Ok::<_, std::io::Error>("v".to_string()) };
        let fail = |_ctx: QueryContext| async { Err::<String, _>("no") };
        executor.execute(&key, &ok, &options).await;
        executor.execute(&key, &fail, &options).await;

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
