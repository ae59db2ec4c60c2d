//! Error types recorded in the cache.

use std::sync::Arc;

use thiserror::Error;

/// Boxed error returned by query functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure of a query after all retries were spent.
///
/// The error is cheap to clone so it can live in a cache entry, be handed to
/// every observer of the key and be passed to error callbacks.
#[derive(Debug, Clone, Error)]
#[error("query failed after {attempts} attempt(s): {source}")]
pub struct FetchError {
    attempts: u32,
    #[source]
    source: Arc<dyn std::error::Error + Send + Sync + 'static>,
}

impl FetchError {
    /// Creates a fetch error from the last underlying error and the number of
    /// attempts made.
    pub fn new(source: impl Into<BoxError>, attempts: u32) -> Self {
        FetchError {
            attempts,
            source: Arc::from(source.into()),
        }
    }

    /// Number of times the query function was invoked.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The last error returned by the query function.
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.source.as_ref()
    }
}
