#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

/// The composition root.
///
/// [`QueryClient`](client::QueryClient) owns the store, the executor, focus
/// tracking and the background task manager. Observers and one-shot fetches
/// both go through it.
pub mod client;

/// Serializable configuration.
///
/// [`QueryConfig`](config::QueryConfig) holds per-query defaults,
/// [`ClientConfig`](config::ClientConfig) client-wide settings. Both load
/// from YAML with humantime durations.
pub mod config;

/// Error types.
///
/// - [`QueryError`] for client and observer operations
/// - [`ConfigError`] for configuration loading and validation
pub mod error;

/// Cache change notifications broadcast by the client.
pub mod events;

/// Retrying, cancellable fetch execution.
///
/// The [`FetchExecutor`](executor::FetchExecutor) guarantees that only the
/// newest fetch of a key writes into the store.
pub mod executor;

/// Application focus tracking for refetch-on-focus.
pub mod focus;

/// Metrics collection.
///
/// When the `metrics` feature is enabled, this module records:
/// - Observer binds by cache state (hit, stale, expired, miss)
/// - Fetches started and settled, retries, fetch duration
/// - Offloaded task lifecycle
pub mod metrics;

/// Live views of a query with stale-while-revalidate semantics.
pub mod observer;

/// Background task offloading.
///
/// Observer fetches never block the caller; the
/// [`OffloadManager`](offload::OffloadManager) runs and tracks them.
pub mod offload;

/// Per-query options.
pub mod options;

pub use client::{QueryClient, QueryClientBuilder};
pub use config::{ClientConfig, QueryConfig};
pub use error::{ConfigError, QueryError};
pub use events::CacheEvent;
pub use executor::{FetchAttempt, FetchExecutor, FetchOutcome};
pub use focus::FocusManager;
pub use observer::{QueryObserver, QueryState};
pub use options::QueryOptions;

pub use querybox_core::{
    BoxError, CacheEntry, CacheState, CancellationSignal, FetchError, Freshness, KeyPart,
    QueryContext, QueryData, QueryFn, QueryKey, Raw, RetryPolicy,
};
pub use querybox_store::{CacheStore, DeleteStatus, Format, FormatExt, JsonFormat, MemoryStore};

/// The `querybox` prelude.
///
/// ```rust
/// use querybox::prelude::*;
/// ```
///
/// This imports:
/// - [`QueryClient`] and [`QueryObserver`]
/// - [`QueryKey`], [`QueryOptions`] and [`QueryContext`]
/// - [`QueryError`]
pub mod prelude {
    pub use crate::{QueryClient, QueryContext, QueryError, QueryKey, QueryObserver, QueryOptions};
}
