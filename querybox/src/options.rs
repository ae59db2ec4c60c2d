//! Per-query options.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use querybox_core::{FetchError, Freshness, RetryPolicy};
use serde::Serialize;
use serde_json::Value;

use crate::config::QueryConfig;

/// Callback invoked with a freshly fetched value.
pub type SuccessCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
/// Callback invoked when a fetch exhausted its retries.
pub type ErrorCallback = Arc<dyn Fn(&FetchError) + Send + Sync>;

/// Options of one query.
///
/// State returned by an observer and the two callbacks are independent
/// notification channels: the callbacks fire once per settled fetch that was
/// still current, the state can be read or watched at any time. Either is
/// enough to follow a query.
///
/// ```
/// use querybox::QueryOptions;
/// use serde_json::json;
/// use std::time::Duration;
///
/// let options = QueryOptions::<Vec<String>>::new()
///     .stale_time(Duration::from_secs(30))
///     .retry(1)
///     .params(json!({"status": "overdue"}))
///     .on_error(|err| eprintln!("overdue invoices unavailable: {err}"));
///
/// assert_eq!(options.config().retry, 1);
/// assert_eq!(options.params_value()["status"], "overdue");
/// ```
pub struct QueryOptions<T> {
    config: QueryConfig,
    params: Value,
    on_success: Option<SuccessCallback<T>>,
    on_error: Option<ErrorCallback>,
}

impl<T> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config,
            params: self.params.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<T> fmt::Debug for QueryOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("config", &self.config)
            .field("params", &self.params)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl<T> Default for QueryOptions<T> {
    fn default() -> Self {
        Self::from_config(QueryConfig::default())
    }
}

impl<T> QueryOptions<T> {
    /// Options with library defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options starting from the given plain-data config.
    pub fn from_config(config: QueryConfig) -> Self {
        Self {
            config,
            params: Value::Null,
            on_success: None,
            on_error: None,
        }
    }

    /// Whether observers fetch automatically.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Age after which the value is refreshed in the background.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.config.stale_time = stale_time;
        self
    }

    /// Age after which the value is no longer served.
    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.config.cache_time = cache_time;
        self
    }

    /// Retries after the first failed attempt.
    pub fn retry(mut self, retry: u32) -> Self {
        self.config.retry = retry;
        self
    }

    /// Base delay between retries.
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.config.retry_delay = retry_delay;
        self
    }

    /// Whether regaining focus refetches the query when stale.
    pub fn refetch_on_window_focus(mut self, refetch: bool) -> Self {
        self.config.refetch_on_window_focus = refetch;
        self
    }

    /// Parameters handed to the query function. Parameters that fail to
    /// serialize are replaced by `null`.
    pub fn params<P: Serialize>(mut self, params: P) -> Self {
        self.params = serde_json::to_value(params).unwrap_or(Value::Null);
        self
    }

    /// Called with every value fetched by a current attempt.
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    /// Called when a current attempt exhausted its retries.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FetchError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Plain-data part.
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Parameters as JSON.
    pub fn params_value(&self) -> &Value {
        &self.params
    }

    /// Staleness and expiry windows.
    pub fn freshness(&self) -> Freshness {
        self.config.freshness()
    }

    /// Retry bound and backoff.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.retry_policy()
    }

    pub(crate) fn notify_success(&self, value: &T) {
        if let Some(callback) = &self.on_success {
            callback(value);
        }
    }

    pub(crate) fn notify_error(&self, error: &FetchError) {
        if let Some(callback) = &self.on_error {
            callback(error);
        }
    }
}
