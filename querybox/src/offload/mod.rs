//! Offload manager for background task execution.
//!
//! Fetches started by observers (initial loads, stale-while-revalidate
//! refreshes, focus refetches) run as offloaded tasks so that binding an
//! observer never blocks the caller. The manager tracks the tasks so they can
//! be awaited in tests and cancelled on shutdown.
//!
//! ```
//! use querybox::offload::{OffloadConfig, OffloadManager};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let manager = OffloadManager::new(OffloadConfig::default());
//! let key = manager.spawn("revalidate", async {});
//! assert_eq!(key.kind(), "revalidate");
//! manager.wait_all().await;
//! assert_eq!(manager.active_task_count(), 0);
//! # }
//! ```

mod manager;
mod policy;

pub use manager::{OffloadHandle, OffloadKey, OffloadManager};
pub use policy::{OffloadConfig, OffloadConfigBuilder, TimeoutPolicy};
