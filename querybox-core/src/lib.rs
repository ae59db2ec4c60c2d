#![warn(missing_docs)]
//! # querybox-core
//!
//! Core types for the querybox stale-while-revalidate query cache.
//!
//! This crate holds the pieces that carry no runtime machinery of their own:
//!
//! - **Identify** cached queries ([`QueryKey`], [`KeyPart`])
//! - **Describe** what is cached ([`CacheEntry`], [`FetchError`])
//! - **Judge** freshness ([`Freshness`], [`CacheState`], [`RetryPolicy`])
//! - **Call** the data source ([`QueryFn`], [`QueryContext`])
//! - **Cancel** superseded work ([`CancellationSignal`])
//!
//! The store lives in `querybox-store`; the executor, client and observer
//! surface live in `querybox`.

pub mod cancel;
pub mod entry;
pub mod error;
pub mod key;
pub mod policy;
pub mod query;
pub mod state;

pub use cancel::CancellationSignal;
pub use entry::CacheEntry;
pub use error::{BoxError, FetchError};
pub use key::{KeyPart, QueryKey};
pub use policy::{Freshness, FreshnessConflict, RetryPolicy};
pub use query::{QueryContext, QueryData, QueryFn};
#[doc(hidden)]
pub use smol_str::SmolStr;
pub use state::CacheState;

/// Raw byte data type used for serialized cache values.
/// Using `Bytes` provides efficient zero-copy cloning via reference counting.
pub type Raw = bytes::Bytes;
