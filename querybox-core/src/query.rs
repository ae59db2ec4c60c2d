//! Query functions and the context they are called with.
//!
//! A query function is the asynchronous data source behind a key. It is
//! framework-agnostic: any closure returning a future of `Result<T, E>` is a
//! query function.
//!
//! ```
//! use querybox_core::{QueryContext, QueryFn, QueryKey, CancellationSignal};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let query = |ctx: QueryContext| async move {
//!     let page = ctx.params()["page"].as_u64().unwrap_or(1);
//!     Ok::<_, std::io::Error>(format!("page {page}"))
//! };
//!
//! let ctx = QueryContext::new(
//!     QueryKey::named("invoices"),
//!     json!({"page": 3}),
//!     CancellationSignal::new(),
//!     0,
//! );
//! assert_eq!(query.call(ctx).await.unwrap(), "page 3");
//! # }
//! ```

use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::cancel::CancellationSignal;
use crate::error::BoxError;
use crate::key::QueryKey;

/// Bounds required from values stored in the cache.
pub trait QueryData: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> QueryData for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Everything a query function receives for one attempt.
#[derive(Debug, Clone)]
pub struct QueryContext {
    key: QueryKey,
    params: Value,
    signal: CancellationSignal,
    attempt: u32,
}

impl QueryContext {
    /// Creates a context for zero-based `attempt` of a fetch.
    pub fn new(key: QueryKey, params: Value, signal: CancellationSignal, attempt: u32) -> Self {
        QueryContext {
            key,
            params,
            signal,
            attempt,
        }
    }

    /// Key being fetched.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Caller-supplied parameters.
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Cancellation signal of the fetch this attempt belongs to.
    pub fn signal(&self) -> &CancellationSignal {
        &self.signal
    }

    /// Zero-based attempt number; greater than zero on retries.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Asynchronous data source of a query.
pub trait QueryFn<T>: Send + Sync {
    /// Runs one attempt.
    fn call(&self, ctx: QueryContext) -> BoxFuture<'static, Result<T, BoxError>>;
}

impl<T, F, Fut, E> QueryFn<T> for F
where
    F: Fn(QueryContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<BoxError>,
{
    fn call(&self, ctx: QueryContext) -> BoxFuture<'static, Result<T, BoxError>> {
        (self)(ctx).map(|result| result.map_err(Into::into)).boxed()
    }
}
