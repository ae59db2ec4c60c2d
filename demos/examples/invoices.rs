//! Invoices Example
//!
//! Client defaults loaded from YAML, keys derived from query parameters,
//! optimistic writes and pattern invalidation. Cache events are printed as
//! they happen.
//!
//! Run:
//!   cargo run -p querybox-demos --example invoices

use std::time::Duration;

use querybox::prelude::*;
use querybox::{CacheEvent, ClientConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
defaults:
  stale_time: 30s
  cache_time: 5m
  retry: 1
  retry_delay: 200ms
event_capacity: 64
slow_task_warning: 2s
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Invoice {
    id: u32,
    amount: u64,
    paid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Page {
    page: u32,
    status: String,
}

async fn list_invoices(ctx: QueryContext) -> Result<Vec<Invoice>, serde_json::Error> {
    let page: Page = serde_json::from_value(ctx.params().clone())?;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let paid = page.status == "paid";
    Ok((0..3)
        .map(|i| Invoice {
            id: page.page * 100 + i,
            amount: 250 * u64::from(i + 1),
            paid,
        })
        .collect())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ClientConfig::from_yaml(CONFIG)?;
    config.validate()?;
    let client = QueryClient::builder().config(config).build();

    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CacheEvent::Fetching(key) => println!("  fetching  {key}"),
                CacheEvent::Updated(key) => println!("  updated   {key}"),
                CacheEvent::Removed(key) => println!("  removed   {key}"),
                CacheEvent::RemovedMatching(pattern) => println!("  removed   *{pattern}*"),
                CacheEvent::Cleared => println!("  cleared"),
                CacheEvent::Cancelled(key) => println!("  cancelled {key}"),
            }
        }
    });

    for page in 1..=2 {
        let params = Page {
            page,
            status: "paid".into(),
        };
        let key = QueryKey::from_params("invoices", &params);
        let options = client.options().params(&params);
        let invoices = client.fetch_query(&key, &list_invoices, &options).await?;
        println!("{key}: {} invoices", invoices.len());
    }

    // Field order does not matter for derived keys.
    let same = QueryKey::from_params("invoices", &json!({ "status": "paid", "page": 1 }));
    println!("{same} is {:?}", client.query_state(&same));

    let draft = QueryKey::named("invoice-draft");
    client.set_query_data(
        &draft,
        &Invoice {
            id: 0,
            amount: 999,
            paid: false,
        },
    )?;
    let cached: Option<Invoice> = client.get_query_data(&draft)?;
    println!("draft: {cached:?}");

    let removed = client.invalidate_matching("invoices");
    println!("invalidated {} invoice pages", removed.count());
    println!("{same} is {:?}", client.query_state(&same));

    tokio::time::sleep(Duration::from_millis(50)).await;
    client.shutdown();
    Ok(())
}
