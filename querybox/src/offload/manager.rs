//! OffloadManager implementation for background task execution.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use smol_str::SmolStr;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span, warn};

use super::policy::{OffloadConfig, TimeoutPolicy};
use crate::metrics;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Identifies one offloaded task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OffloadKey {
    kind: SmolStr,
    id: u64,
}

impl OffloadKey {
    /// Kind of the task (e.g. "fetch", "revalidate", "focus").
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Unique identifier within the manager.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for OffloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Handle to a spawned offload task.
#[derive(Debug)]
pub struct OffloadHandle {
    handle: JoinHandle<()>,
}

impl OffloadHandle {
    /// Check if the task is finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Abort the task.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[derive(Debug)]
struct OffloadManagerInner {
    config: OffloadConfig,
    tasks: DashMap<OffloadKey, OffloadHandle>,
    key_counter: AtomicU64,
    finished: Notify,
}

/// Removes the task record when the task completes or is aborted.
struct TaskGuard {
    inner: Arc<OffloadManagerInner>,
    key: OffloadKey,
    completed: bool,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.inner.tasks.remove(&self.key);
        self.inner.finished.notify_waiters();
        metrics::record_offload_finished(self.key.kind(), self.completed);
    }
}

/// Manager for offloading tasks to background execution.
///
/// Cheap to clone; clones share the task registry.
#[derive(Clone, Debug)]
pub struct OffloadManager {
    inner: Arc<OffloadManagerInner>,
}

impl OffloadManager {
    /// Create a new OffloadManager with the given configuration.
    pub fn new(config: OffloadConfig) -> Self {
        Self {
            inner: Arc::new(OffloadManagerInner {
                config,
                tasks: DashMap::new(),
                key_counter: AtomicU64::new(0),
                finished: Notify::new(),
            }),
        }
    }

    /// Create a new OffloadManager with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(OffloadConfig::default())
    }

    fn next_key(&self, kind: impl Into<SmolStr>) -> OffloadKey {
        let id = self.inner.key_counter.fetch_add(1, Ordering::Relaxed);
        OffloadKey {
            kind: kind.into(),
            id,
        }
    }

    /// Spawn a task of the given kind onto the current Tokio runtime.
    ///
    /// The kind is used for metrics labels and tracing.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn spawn<F>(&self, kind: impl Into<SmolStr>, task: F) -> OffloadKey
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = self.next_key(kind);
        metrics::record_offload_spawned(key.kind());

        let handle = self.spawn_inner(task, key.clone());
        self.inner.tasks.insert(key.clone(), handle);
        // The task may have finished before it was registered.
        self.inner
            .tasks
            .remove_if(&key, |_, handle| handle.is_finished());

        debug!(%key, "offload task spawned");
        key
    }

    /// Get the number of currently active tasks.
    pub fn active_task_count(&self) -> usize {
        self.inner.tasks.iter().filter(|e| !e.is_finished()).count()
    }

    /// Clean up finished task handles.
    pub fn cleanup_finished(&self) {
        self.inner.tasks.retain(|_, handle| !handle.is_finished());
    }

    /// Cancel all running tasks.
    pub fn cancel_all(&self) {
        for entry in self.inner.tasks.iter() {
            entry.abort();
        }
    }

    /// Cancel a specific task by key.
    pub fn cancel(&self, key: &OffloadKey) -> bool {
        if let Some(entry) = self.inner.tasks.get(key) {
            entry.abort();
            true
        } else {
            false
        }
    }

    /// Check if the task with the given key is still running.
    pub fn is_in_flight(&self, key: &OffloadKey) -> bool {
        self.inner.tasks.get(key).is_some_and(|h| !h.is_finished())
    }

    /// Wait for all currently tracked tasks to complete, including tasks
    /// spawned by the tasks being waited for.
    pub async fn wait_all(&self) {
        loop {
            let finished = self.inner.finished.notified();
            tokio::pin!(finished);
            finished.as_mut().enable();

            self.cleanup_finished();
            if self.inner.tasks.is_empty() {
                break;
            }

            // A handle can report unfinished for a moment after its guard ran.
            tokio::select! {
                _ = finished => {}
                _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
            }
        }
    }

    /// Wait for all tasks with a timeout.
    ///
    /// Returns `true` if all tasks completed within the timeout,
    /// `false` if the timeout was reached.
    pub async fn wait_all_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_all()).await.is_ok()
    }

    fn spawn_inner<F>(&self, task: F, key: OffloadKey) -> OffloadHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let timeout_policy = self.inner.config.timeout_policy;
        // Built outside the task so an abort before the first poll still cleans up.
        let mut guard = TaskGuard {
            inner: self.inner.clone(),
            key,
            completed: false,
        };

        let span = info_span!(
            "offload_task",
            kind = %guard.key.kind(),
            id = guard.key.id(),
        );

        let handle = tokio::spawn(
            async move {
                let start = Instant::now();
                task.await;
                if let TimeoutPolicy::Warn(threshold) = timeout_policy {
                    let elapsed = start.elapsed();
                    if elapsed > threshold {
                        warn!(
                            key = %guard.key,
                            elapsed_ms = elapsed.as_millis(),
                            threshold_ms = threshold.as_millis(),
                            "Offload task exceeded slow-task threshold"
                        );
                        metrics::record_offload_slow(guard.key.kind());
                    }
                }
                guard.completed = true;
            }
            .instrument(span),
        );

        OffloadHandle { handle }
    }
}

impl Default for OffloadManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}
