//! Stale-while-revalidate behaviour on the clock of a paused runtime.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use pretty_assertions::assert_eq;
use querybox::{CacheEvent, QueryClient, QueryContext, QueryError, QueryKey};
use tokio::time::{Instant, advance, sleep};

const STALE: Duration = Duration::from_millis(100);
const CACHE: Duration = Duration::from_millis(200);

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

type Fetch = BoxFuture<'static, Result<String, io::Error>>;

/// Query resolving to `value` after `delay`.
fn value_after(
    delay: Duration,
    value: &'static str,
) -> impl Fn(QueryContext) -> Fetch + Send + Sync {
    move |_ctx| {
        Box::pin(async move {
            sleep(delay).await;
            Ok(value.to_string())
        })
    }
}

#[tokio::test(start_paused = true)]
async fn successful_fetch_is_stored_with_completion_time() {
    let client = QueryClient::default();
    let key = QueryKey::named("report");
    let started = Instant::now();

    let value = client
        .fetch_query(&key, &value_after(ms(25), "A"), &client.options())
        .await
        .unwrap();

    assert_eq!(value, "A");
    let entry = client.store().get(&key).unwrap();
    assert_eq!(entry.updated_at(), Some(Instant::now()));
    assert!(entry.updated_at().unwrap() >= started + ms(25));
    assert!(entry.error().is_none());
    assert_eq!(client.get_query_data::<String>(&key).unwrap().as_deref(), Some("A"));
}

#[tokio::test(start_paused = true)]
async fn stale_bind_serves_cached_value_and_refreshes() {
    let client = QueryClient::default();
    let key = QueryKey::named("scenario");
    let options = client.options().stale_time(STALE).cache_time(CACHE);
    let t0 = Instant::now();

    client
        .fetch_query(&key, &value_after(Duration::ZERO, "A"), &options)
        .await
        .unwrap();

    advance(ms(150)).await;
    let observer = client.observe(key.clone(), value_after(ms(10), "B"), options.clone());

    let state = observer.state();
    assert_eq!(state.value.as_deref(), Some("A"));
    assert!(!state.is_loading);
    assert!(state.is_fetching);
    assert!(state.is_stale);
    assert!(state.is_success);

    let mut updates = observer.subscribe();
    let flicker = tokio::spawn(async move {
        let mut saw_loading = false;
        while updates.changed().await.is_ok() {
            let state = updates.borrow_and_update();
            saw_loading |= state.is_loading;
            if !state.is_fetching {
                break;
            }
        }
        saw_loading
    });

    let state = observer.settled().await;
    assert_eq!(state.value.as_deref(), Some("B"));
    assert!(!state.is_fetching);
    assert!(state.updated_at.unwrap() >= t0 + ms(160));
    assert!(!flicker.await.unwrap());

    advance(ms(10)).await;
    assert_eq!(observer.state().value.as_deref(), Some("B"));
    assert!(!observer.state().is_stale);
}

#[tokio::test(start_paused = true)]
async fn expired_entry_forces_blocking_fetch() {
    let client = QueryClient::default();
    let key = QueryKey::named("expired");
    let options = client.options().stale_time(STALE).cache_time(CACHE);

    client
        .fetch_query(&key, &value_after(Duration::ZERO, "A"), &options)
        .await
        .unwrap();
    advance(ms(250)).await;

    let observer = client.observe(key, value_after(ms(10), "B"), options);
    let state = observer.state();
    assert!(state.is_loading);
    assert_eq!(state.value, None);

    assert_eq!(observer.settled().await.value.as_deref(), Some("B"));
}

#[tokio::test(start_paused = true)]
async fn fresh_bind_does_not_fetch() {
    let client = QueryClient::default();
    let key = QueryKey::named("fresh");
    let calls = Arc::new(AtomicU32::new(0));
    let query = {
        let calls = calls.clone();
        move |_ctx: QueryContext| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, io::Error>(1u32) }
        }
    };

    let first = client.observe(key.clone(), query.clone(), client.options());
    first.settled().await;
    let second = client.observe(key, query, client.options());

    assert!(!second.state().is_fetching);
    assert_eq!(second.state().value, Some(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_delays_double() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));
    let query = {
        let calls = calls.clone();
        move |ctx: QueryContext| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if ctx.attempt() < 2 {
                    Err(io::Error::other("flaky"))
                } else {
                    Ok("done".to_string())
                }
            }
        }
    };
    let options = client.options().retry(2).retry_delay(ms(10));
    let started = Instant::now();

    let observer = client.observe(QueryKey::named("retry"), query, options);
    let state = observer.settled().await;

    assert!(started.elapsed() >= ms(30));
    assert!(state.is_success);
    assert!(state.error.is_none());
    assert_eq!(state.failure_count, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_the_last_error() {
    let client = QueryClient::default();
    let query = |ctx: QueryContext| async move {
        Err::<String, _>(io::Error::other(format!("attempt {} failed", ctx.attempt())))
    };
    let options = client.options().retry(2).retry_delay(ms(10));

    let observer = client.observe(QueryKey::named("down"), query, options);
    let state = observer.settled().await;

    assert!(state.is_error);
    assert!(!state.is_success);
    assert_eq!(state.value, None);
    assert_eq!(state.failure_count, 3);
    let err = state.error.unwrap();
    let fetch = err.as_fetch().unwrap();
    assert_eq!(fetch.attempts(), 3);
    assert_eq!(fetch.inner().to_string(), "attempt 2 failed");
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_keeps_previous_value() {
    let client = QueryClient::default();
    let key = QueryKey::named("balance");
    client.set_query_data(&key, &"A".to_string()).unwrap();

    let query = |_ctx: QueryContext| async { Err::<String, _>(io::Error::other("offline")) };
    let observer = client.observe(key, query, client.options().retry(0));
    observer.refetch();
    let state = observer.settled().await;

    assert_eq!(state.value.as_deref(), Some("A"));
    assert!(state.is_error);
    assert!(!state.is_success);
}

/// Starts `first`, then `second` before `first` settles, and returns what
/// the cache holds once both are done plus the number of writes.
async fn race(first: Duration, second: Duration) -> (Option<String>, usize) {
    let client = QueryClient::default();
    let key = QueryKey::named("race");
    let mut events = client.events();
    let options = client.options::<String>();

    let first_fetch = tokio::spawn({
        let client = client.clone();
        let key = key.clone();
        let options = options.clone();
        async move {
            client
                .fetch_query(&key, &value_after(first, "first"), &options)
                .await
        }
    });
    while !client.executor().is_in_flight(&key) {
        tokio::task::yield_now().await;
    }
    let second_result = client
        .fetch_query(&key, &value_after(second, "second"), &options)
        .await;

    assert_eq!(second_result.unwrap(), "second");
    assert!(matches!(
        first_fetch.await.unwrap(),
        Err(QueryError::Cancelled)
    ));
    sleep(first.max(second)).await;

    let mut writes = 0;
    while let Ok(event) = events.try_recv() {
        if event == CacheEvent::Updated(key.clone()) {
            writes += 1;
        }
    }
    (client.get_query_data(&key).unwrap(), writes)
}

#[tokio::test(start_paused = true)]
async fn only_newest_fetch_is_visible_when_it_finishes_last() {
    let (value, writes) = race(ms(10), ms(50)).await;
    assert_eq!(value.as_deref(), Some("second"));
    assert_eq!(writes, 1);
}

#[tokio::test(start_paused = true)]
async fn only_newest_fetch_is_visible_when_it_finishes_first() {
    let (value, writes) = race(ms(50), ms(10)).await;
    assert_eq!(value.as_deref(), Some("second"));
    assert_eq!(writes, 1);
}

#[tokio::test(start_paused = true)]
async fn fetch_query_supersedes_an_observer_fetch() {
    let client = QueryClient::default();
    let key = QueryKey::named("report");
    let observer = client.observe(key.clone(), value_after(ms(50), "observer"), client.options());
    assert!(observer.state().is_loading);

    let value = client
        .fetch_query(&key, &value_after(ms(10), "direct"), &client.options())
        .await
        .unwrap();
    assert_eq!(value, "direct");

    let state = observer.settled().await;
    assert_eq!(state.value.as_deref(), Some("direct"));
    sleep(ms(60)).await;
    assert_eq!(observer.state().value.as_deref(), Some("direct"));
}

#[tokio::test(start_paused = true)]
async fn invalidate_then_bind_is_a_miss() {
    let client = QueryClient::default();
    let key = QueryKey::named("invalidated");
    client.set_query_data(&key, &"A".to_string()).unwrap();

    client.invalidate(&key);
    let observer = client.observe(key.clone(), value_after(ms(10), "B"), client.options());

    let state = observer.state();
    assert!(state.is_loading);
    assert_eq!(state.value, None);
    assert_eq!(observer.settled().await.value.as_deref(), Some("B"));
}

#[tokio::test(start_paused = true)]
async fn observer_invalidate_refetches() {
    let client = QueryClient::default();
    let key = QueryKey::named("inv");
    let observer = client.observe(key.clone(), value_after(ms(10), "B"), client.options());
    observer.settled().await;

    observer.invalidate();
    let state = observer.state();
    assert!(state.is_loading);
    assert_eq!(state.value, None);
    assert_eq!(observer.settled().await.value.as_deref(), Some("B"));
}

#[tokio::test(start_paused = true)]
async fn invalidate_matching_cancels_and_deletes() {
    let client = QueryClient::default();
    let page = |n: u32| QueryKey::from_params("invoices", &serde_json::json!({ "page": n }));
    client.set_query_data(&page(1), &"one".to_string()).unwrap();
    client.set_query_data(&QueryKey::named("clients"), &"c".to_string()).unwrap();

    let observer = client.observe(page(2), value_after(ms(50), "two"), client.options());
    assert!(observer.state().is_fetching);

    let status = client.invalidate_matching("invoices");
    assert_eq!(status.count(), 1);
    assert_eq!(client.executor().in_flight_count(), 0);
    assert_eq!(client.store().len(), 1);

    let state = observer.settled().await;
    assert_eq!(state.value, None);
    sleep(ms(60)).await;
    assert_eq!(client.get_query_data::<String>(&page(2)).unwrap(), None);
}
