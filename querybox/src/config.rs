//! Serializable configuration.
//!
//! [`QueryConfig`] holds the plain-data part of query options and is what a
//! client uses as defaults for every observer. [`ClientConfig`] wraps it with
//! client-wide settings and can be loaded from YAML:
//!
//! ```
//! use querybox::config::ClientConfig;
//! use std::time::Duration;
//!
//! let config = ClientConfig::from_yaml(r#"
//! defaults:
//!   stale_time: 30s
//!   cache_time: 5m
//!   retry: 2
//!   retry_delay: 250ms
//!   refetch_on_window_focus: true
//! event_capacity: 512
//! "#).unwrap();
//!
//! assert_eq!(config.defaults.stale_time, Duration::from_secs(30));
//! assert_eq!(config.defaults.retry, 2);
//! assert!(config.defaults.enabled);
//! assert_eq!(config.event_capacity, 512);
//! ```

use std::time::Duration;

use querybox_core::policy::{
    DEFAULT_CACHE_TIME, DEFAULT_RETRY, DEFAULT_RETRY_DELAY, DEFAULT_STALE_TIME,
};
use querybox_core::{Freshness, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default capacity of the client's cache event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Plain-data query options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct QueryConfig {
    /// Whether observers fetch automatically.
    pub enabled: bool,
    /// Age after which a value is refreshed in the background (e.g. "2m").
    #[serde(with = "humantime_serde")]
    pub stale_time: Duration,
    /// Age after which a value is no longer served (e.g. "5m").
    #[serde(with = "humantime_serde")]
    pub cache_time: Duration,
    /// Retries after the first failed attempt.
    pub retry: u32,
    /// Base delay between retries, doubled on each retry (e.g. "1s").
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Whether regaining focus refetches stale entries.
    pub refetch_on_window_focus: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_time: DEFAULT_STALE_TIME,
            cache_time: DEFAULT_CACHE_TIME,
            retry: DEFAULT_RETRY,
            retry_delay: DEFAULT_RETRY_DELAY,
            refetch_on_window_focus: false,
        }
    }
}

impl QueryConfig {
    /// Staleness and expiry windows.
    pub fn freshness(&self) -> Freshness {
        Freshness::new(self.stale_time, self.cache_time)
    }

    /// Retry bound and backoff.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry, self.retry_delay)
    }

    /// Reports `cache_time < stale_time`. Nothing is adjusted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.freshness().validate()?;
        Ok(())
    }
}

/// Client-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClientConfig {
    /// Defaults applied to every query.
    #[serde(default)]
    pub defaults: QueryConfig,
    /// Capacity of the cache event channel. Slow observers that fall further
    /// behind than this resynchronise from the store.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Log a warning for background tasks running longer than this.
    #[serde(default, with = "humantime_serde")]
    pub slow_task_warning: Option<Duration>,
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            defaults: QueryConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            slow_task_warning: None,
        }
    }
}

impl ClientConfig {
    /// Parses a YAML document. Missing fields take their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_saphyr::from_str(yaml).map_err(|e| ConfigError::Parse(Box::new(e)))
    }

    /// Checks the configuration.
    ///
    /// Validation is opt-in: the client accepts any configuration and only
    /// logs a warning for conflicting freshness windows.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_capacity",
                reason: "must be greater than zero",
            });
        }
        self.defaults.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ClientConfig::from_yaml("{}").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.defaults.stale_time, Duration::from_secs(120));
        assert_eq!(config.defaults.cache_time, Duration::from_secs(300));
        assert_eq!(config.defaults.retry, 3);
        assert_eq!(config.defaults.retry_delay, Duration::from_secs(1));
        assert!(!config.defaults.refetch_on_window_focus);
    }

    #[test]
    fn partial_defaults_keep_other_fields() {
        let config = ClientConfig::from_yaml(
            r#"
defaults:
  enabled: false
  retry_delay: 10ms
slow_task_warning: 2s
"#,
        )
        .unwrap();
        assert!(!config.defaults.enabled);
        assert_eq!(config.defaults.retry_delay, Duration::from_millis(10));
        assert_eq!(config.defaults.retry, 3);
        assert_eq!(config.slow_task_warning, Some(Duration::from_secs(2)));
    }

    #[test]
    fn inverted_windows_are_reported() {
        let config = ClientConfig::from_yaml(
            r#"
defaults:
  stale_time: 10m
  cache_time: 1m
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Freshness(_)), "{err}");
    }

    #[test]
    fn zero_event_capacity_is_rejected() {
        let config = ClientConfig {
            event_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "event_capacity",
                ..
            })
        ));
    }

    #[test]
    fn malformed_duration_is_a_parse_error() {
        let err = ClientConfig::from_yaml("defaults:\n  stale_time: soon\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn policies_follow_config() {
        let config = QueryConfig {
            stale_time: Duration::from_millis(100),
            cache_time: Duration::from_millis(200),
            retry: 2,
            retry_delay: Duration::from_millis(10),
            ..Default::default()
        };
        assert_eq!(
            config.freshness(),
            Freshness::new(Duration::from_millis(100), Duration::from_millis(200))
        );
        assert_eq!(config.retry_policy().delay(1), Duration::from_millis(20));
    }
}
