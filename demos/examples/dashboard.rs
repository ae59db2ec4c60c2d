//! Dashboard Example
//!
//! A widget bound to a flaky, slow data source:
//! - first bind blocks on the fetch (loading)
//! - a later bind serves the cached value while revalidating
//! - regaining focus refetches once the value is stale
//!
//! Run:
//!   cargo run -p querybox-demos --example dashboard
//!
//! Set `RUST_LOG=querybox=debug` to see fetch spans and retries.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use querybox::prelude::*;
use querybox::QueryState;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Stats {
    visitors: u32,
    revision: u32,
}

fn print(label: &str, state: &QueryState<Stats>) {
    println!(
        "[{label:>10}] value={:?} loading={} fetching={} stale={} failures={}",
        state.value, state.is_loading, state.is_fetching, state.is_stale, state.failure_count,
    );
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,querybox=debug")),
        )
        .init();

    let client = QueryClient::default();
    let revision = Arc::new(AtomicU32::new(0));

    // Every other first attempt fails, so retries show up in the log.
    let stats = {
        let revision = revision.clone();
        move |ctx: QueryContext| {
            let revision = revision.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                if ctx.attempt() == 0 && revision.load(Ordering::SeqCst) % 2 == 1 {
                    revision.fetch_add(1, Ordering::SeqCst);
                    return Err(std::io::Error::other("upstream timed out"));
                }
                let revision = revision.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Stats {
                    visitors: 1_000 + revision * 17,
                    revision,
                })
            }
        }
    };
    let options = client
        .options()
        .stale_time(Duration::from_secs(1))
        .cache_time(Duration::from_secs(10))
        .retry(2)
        .retry_delay(Duration::from_millis(100))
        .refetch_on_window_focus(true);
    let key = QueryKey::named("dashboard-stats");

    let widget = client.observe(key.clone(), stats.clone(), options.clone());
    print("bind", &widget.state());
    print("settled", &widget.settled().await);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let second = client.observe(key.clone(), stats, options);
    print("stale bind", &second.state());
    print("settled", &second.settled().await);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    client.focus_manager().set_focused(false);
    client.focus_manager().set_focused(true);
    let mut updates = widget.subscribe();
    if updates.wait_for(|state| state.is_fetching).await.is_ok() {
        print("focus", &widget.state());
    }
    print("settled", &widget.settled().await);

    drop((widget, second));
    client.shutdown();
    client.offload().wait_all().await;
}
