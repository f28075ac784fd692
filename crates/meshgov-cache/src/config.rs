//! Cache manager configuration.

use std::time::Duration;

use chrono::TimeDelta;
use meshgov_core::{RegistryError, RegistryResult};
use serde::{Deserialize, Serialize};

/// Configuration for the [`CacheManager`](crate::CacheManager).
///
/// Deserializes from a partial document; missing fields take their
/// defaults.
///
/// # Example
///
/// ```rust
/// use meshgov_cache::ManagerConfig;
///
/// let config: ManagerConfig =
///     serde_json::from_str(r#"{"update_interval_ms": 500}"#).unwrap();
/// assert_eq!(config.update_interval().as_millis(), 500);
/// assert_eq!(config.mtime_skew_secs, -5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Period of each cache's background refresh, in milliseconds.
    pub update_interval_ms: u64,
    /// Period of statistics reporting, in milliseconds.
    pub report_interval_ms: u64,
    /// Backward offset applied to the watermark before each pull, in
    /// seconds. Must be negative.
    pub mtime_skew_secs: i64,
    /// Per-cache limit on the warm-up load, in milliseconds.
    pub warmup_timeout_ms: u64,
    /// Per-subscriber event channel depth.
    pub event_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 1_000,
            report_interval_ms: 1_000,
            mtime_skew_secs: -5,
            warmup_timeout_ms: 30_000,
            event_buffer: 64,
        }
    }
}

impl ManagerConfig {
    /// Start building a configuration.
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::new()
    }

    /// Background refresh period.
    #[inline]
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Statistics reporting period.
    #[inline]
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    /// Skew tolerance as a signed offset.
    #[inline]
    pub fn mtime_skew(&self) -> TimeDelta {
        TimeDelta::seconds(self.mtime_skew_secs)
    }

    /// Per-cache warm-up timeout.
    #[inline]
    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.warmup_timeout_ms)
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Configuration`] if:
    /// - the skew tolerance is not strictly negative
    /// - an interval or the warm-up timeout is zero
    /// - the event buffer is zero
    pub fn validate(&self) -> RegistryResult<()> {
        if self.mtime_skew_secs >= 0 {
            return Err(RegistryError::Configuration(format!(
                "mtime skew must be negative, got {}s",
                self.mtime_skew_secs
            )));
        }
        if self.update_interval_ms == 0 || self.report_interval_ms == 0 {
            return Err(RegistryError::Configuration(
                "update and report intervals must be positive".into(),
            ));
        }
        if self.warmup_timeout_ms == 0 {
            return Err(RegistryError::Configuration(
                "warm-up timeout must be positive".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(RegistryError::Configuration(
                "event buffer must hold at least one event".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`ManagerConfig`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use meshgov_cache::ManagerConfig;
///
/// let config = ManagerConfig::builder()
///     .update_interval(Duration::from_millis(200))
///     .mtime_skew_secs(-2)
///     .build()
///     .unwrap();
/// assert_eq!(config.update_interval_ms, 200);
///
/// assert!(ManagerConfig::builder().mtime_skew_secs(0).build().is_err());
/// ```
#[derive(Debug, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Create a builder holding the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the background refresh period.
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.config.update_interval_ms = duration_ms(interval);
        self
    }

    /// Set the statistics reporting period.
    pub fn report_interval(mut self, interval: Duration) -> Self {
        self.config.report_interval_ms = duration_ms(interval);
        self
    }

    /// Set the skew tolerance in seconds (must be negative).
    pub fn mtime_skew_secs(mut self, secs: i64) -> Self {
        self.config.mtime_skew_secs = secs;
        self
    }

    /// Set the per-cache warm-up timeout.
    pub fn warmup_timeout(mut self, timeout: Duration) -> Self {
        self.config.warmup_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the per-subscriber event channel depth.
    pub fn event_buffer(mut self, depth: usize) -> Self {
        self.config.event_buffer = depth;
        self
    }

    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first [`ManagerConfig::validate`] failure.
    pub fn build(self) -> RegistryResult<ManagerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
