//! Metrics declaration and recording helpers.
//!
//! Every helper is a no-op unless the `metrics` feature is enabled. Labels
//! use the query's logical name (not the full key) to keep cardinality low.

use std::time::Duration;

use querybox_core::CacheState;

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
lazy_static! {
    // Observer metrics

    /// Track observer binds by cache state.
    pub static ref QUERY_BIND_COUNTER: &'static str = {
        metrics::describe_counter!(
            "querybox_bind_total",
            "Total number of observer binds, labelled by cache state."
        );
        "querybox_bind_total"
    };

    // Fetch metrics

    /// Track number of fetches started.
    pub static ref FETCH_STARTED_COUNTER: &'static str = {
        metrics::describe_counter!(
            "querybox_fetch_started_total",
            "Total number of fetches started."
        );
        "querybox_fetch_started_total"
    };
    /// Track number of settled fetches by outcome.
    pub static ref FETCH_SETTLED_COUNTER: &'static str = {
        metrics::describe_counter!(
            "querybox_fetch_settled_total",
            "Total number of fetches settled, labelled by outcome."
        );
        "querybox_fetch_settled_total"
    };
    /// Track number of retries.
    pub static ref FETCH_RETRY_COUNTER: &'static str = {
        metrics::describe_counter!(
            "querybox_fetch_retry_total",
            "Total number of retried query attempts."
        );
        "querybox_fetch_retry_total"
    };
    /// Histogram of fetch duration, retries and backoff included.
    pub static ref FETCH_DURATION: &'static str = {
        metrics::describe_histogram!(
            "querybox_fetch_duration_seconds",
            metrics::Unit::Seconds,
            "Duration of fetches in seconds, retries included."
        );
        "querybox_fetch_duration_seconds"
    };

    // Offload manager metrics

    /// Track number of offload tasks spawned.
    pub static ref OFFLOAD_TASKS_SPAWNED: &'static str = {
        metrics::describe_counter!(
            "querybox_offload_tasks_spawned_total",
            "Total number of offload tasks spawned."
        );
        "querybox_offload_tasks_spawned_total"
    };
    /// Track number of offload tasks completed.
    pub static ref OFFLOAD_TASKS_COMPLETED: &'static str = {
        metrics::describe_counter!(
            "querybox_offload_tasks_completed_total",
            "Total number of offload tasks completed."
        );
        "querybox_offload_tasks_completed_total"
    };
    /// Track number of offload tasks exceeding the slow-task threshold.
    pub static ref OFFLOAD_TASKS_SLOW: &'static str = {
        metrics::describe_counter!(
            "querybox_offload_tasks_slow_total",
            "Total number of offload tasks that exceeded the slow-task threshold."
        );
        "querybox_offload_tasks_slow_total"
    };
    /// Gauge of currently active offload tasks.
    pub static ref OFFLOAD_TASKS_ACTIVE: &'static str = {
        metrics::describe_gauge!(
            "querybox_offload_tasks_active",
            "Number of currently active offload tasks."
        );
        "querybox_offload_tasks_active"
    };
}

/// Outcome label of a settled fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettledAs {
    /// Value written.
    Fetched,
    /// Retries exhausted, error written.
    Failed,
    /// Discarded in favour of a newer attempt or cancelled.
    Superseded,
}

impl SettledAs {
    /// Label value.
    pub fn as_str(self) -> &'static str {
        match self {
            SettledAs::Fetched => "fetched",
            SettledAs::Failed => "failed",
            SettledAs::Superseded => "superseded",
        }
    }
}

/// Record an observer bind.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_bind(query: &str, state: CacheState) {
    metrics::counter!(
        *QUERY_BIND_COUNTER,
        "query" => query.to_string(),
        "state" => state.as_str()
    )
    .increment(1);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_bind(_query: &str, _state: CacheState) {}

/// Record the start of a fetch.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_fetch_started(query: &str) {
    metrics::counter!(*FETCH_STARTED_COUNTER, "query" => query.to_string()).increment(1);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_fetch_started(_query: &str) {}

/// Record a retry.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_retry(query: &str) {
    metrics::counter!(*FETCH_RETRY_COUNTER, "query" => query.to_string()).increment(1);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_retry(_query: &str) {}

/// Record how a fetch settled and how long it took.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_fetch_settled(query: &str, outcome: SettledAs, duration: Duration) {
    metrics::counter!(
        *FETCH_SETTLED_COUNTER,
        "query" => query.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    metrics::histogram!(
        *FETCH_DURATION,
        "query" => query.to_string(),
        "outcome" => outcome.as_str()
    )
    .record(duration.as_secs_f64());
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_fetch_settled(_query: &str, _outcome: SettledAs, _duration: Duration) {}

/// Record a spawned offload task.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_offload_spawned(kind: &str) {
    metrics::counter!(*OFFLOAD_TASKS_SPAWNED, "kind" => kind.to_string()).increment(1);
    metrics::gauge!(*OFFLOAD_TASKS_ACTIVE, "kind" => kind.to_string()).increment(1.0);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_offload_spawned(_kind: &str) {}

/// Record an offload task that finished, completed or aborted.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_offload_finished(kind: &str, completed: bool) {
    if completed {
        metrics::counter!(*OFFLOAD_TASKS_COMPLETED, "kind" => kind.to_string()).increment(1);
    }
    metrics::gauge!(*OFFLOAD_TASKS_ACTIVE, "kind" => kind.to_string()).decrement(1.0);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_offload_finished(_kind: &str, _completed: bool) {}

/// Record an offload task that ran past the slow-task threshold.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_offload_slow(kind: &str) {
    metrics::counter!(*OFFLOAD_TASKS_SLOW, "kind" => kind.to_string()).increment(1);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_offload_slow(_kind: &str) {}
