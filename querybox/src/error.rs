use std::sync::Arc;

use querybox_core::{FetchError, FreshnessConflict};
use querybox_store::FormatError;
use thiserror::Error;

/// Error surfaced by client and observer operations.
///
/// Observers never report cancellation; a superseded fetch leaves their state
/// to the fetch that replaced it. Only [`QueryClient::fetch_query`], which has
/// to return something, reports [`QueryError::Cancelled`].
///
/// [`QueryClient::fetch_query`]: crate::QueryClient::fetch_query
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The query function failed on every attempt.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The cached bytes could not be decoded into the requested type.
    #[error("cached value could not be decoded: {0}")]
    Decode(Arc<FormatError>),

    /// The fetched value could not be encoded for the store.
    #[error("fetched value could not be encoded: {0}")]
    Encode(Arc<FormatError>),

    /// The fetch was superseded or cancelled before it produced a result.
    #[error("query was cancelled before it settled")]
    Cancelled,
}

impl QueryError {
    /// Returns the fetch error, if this is one.
    pub fn as_fetch(&self) -> Option<&FetchError> {
        match self {
            QueryError::Fetch(err) => Some(err),
            _ => None,
        }
    }
}

/// Error produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The YAML document could not be parsed.
    #[error("invalid configuration: {0}")]
    Parse(Box<dyn std::error::Error + Send + Sync>),

    /// `cache_time` is shorter than `stale_time`.
    #[error(transparent)]
    Freshness(#[from] FreshnessConflict),

    /// A numeric setting is out of range.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },
}
