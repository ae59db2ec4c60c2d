#![warn(missing_docs)]
//! Cache store for querybox.
//!
//! [`CacheStore`] is the keyed map the executor writes fetched values into.
//! [`MemoryStore`] is the in-process implementation. To plug in a different
//! store, implement [`CacheStore`] and hand it to the client.

pub mod format;
mod memory;
mod store;

pub use format::{Format, FormatError, FormatExt, JsonFormat};
pub use memory::{MemoryStore, MemoryStoreBuilder};
pub use store::CacheStore;

/// Status of a delete operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    /// This many records were deleted.
    Deleted(u32),
    /// Nothing matched.
    Missing,
}

impl DeleteStatus {
    /// Builds a status from a number of removed records.
    pub fn from_count(count: u32) -> Self {
        if count == 0 {
            DeleteStatus::Missing
        } else {
            DeleteStatus::Deleted(count)
        }
    }

    /// Number of removed records.
    pub fn count(&self) -> u32 {
        match self {
            DeleteStatus::Deleted(count) => *count,
            DeleteStatus::Missing => 0,
        }
    }
}
