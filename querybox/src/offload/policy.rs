//! Offload task policies and configuration.

use std::time::Duration;

/// What to do about long-running background tasks.
///
/// Tasks are never cut short: a fetch owns its own timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// No check - task runs until completion.
    #[default]
    None,
    /// Log warning after duration but let task continue.
    Warn(Duration),
}

/// Configuration for the OffloadManager.
#[derive(Debug, Clone, Default)]
pub struct OffloadConfig {
    /// Slow-task policy for spawned tasks.
    pub timeout_policy: TimeoutPolicy,
}

impl OffloadConfig {
    /// Create a new builder for OffloadConfig.
    pub fn builder() -> OffloadConfigBuilder {
        OffloadConfigBuilder::default()
    }
}

/// Builder for OffloadConfig.
#[derive(Debug, Clone, Default)]
pub struct OffloadConfigBuilder {
    timeout_policy: TimeoutPolicy,
}

impl OffloadConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set timeout policy.
    pub fn timeout_policy(self, policy: TimeoutPolicy) -> Self {
        Self {
            timeout_policy: policy,
        }
    }

    /// Warn about tasks running longer than `duration`.
    pub fn warn_after(self, duration: Duration) -> Self {
        self.timeout_policy(TimeoutPolicy::Warn(duration))
    }

    /// Build the OffloadConfig.
    pub fn build(self) -> OffloadConfig {
        OffloadConfig {
            timeout_policy: self.timeout_policy,
        }
    }
}
