//! Configuration knobs for the publishing subsystem.
//!
//! Everything is optional in serialized form; absent fields take the
//! documented defaults. `validate()` runs once at service construction.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

fn default_worker_count() -> usize {
    10
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base() -> Duration {
    Duration::from_secs(2)
}
fn default_retry_ceiling() -> Duration {
    Duration::from_secs(30)
}
fn default_retry_jitter() -> bool {
    true
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_open_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_correlation_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(60 * 60)
}
fn default_fanout_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_chat_rate() -> f64 {
    1.0
}
fn default_pager_rate_per_minute() -> f64 {
    120.0
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_max_payload_bytes() -> usize {
    1024 * 1024
}
fn default_mode_recheck_interval() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishingConfig {
    /// Size of the worker pool draining the queue.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Capacity of each priority buffer.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base of the exponential backoff.
    #[serde(default = "default_retry_base", with = "duration_secs")]
    pub retry_base: Duration,

    /// Cap on any single backoff delay.
    #[serde(default = "default_retry_ceiling", with = "duration_secs")]
    pub retry_ceiling: Duration,

    /// Apply full jitter to computed backoff delays. `Retry-After`
    /// hints are honored verbatim either way.
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: bool,

    /// Consecutive failures before a target's breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub breaker_failure_threshold: u32,

    /// Consecutive half-open successes before the breaker closes.
    #[serde(default = "default_success_threshold")]
    pub breaker_success_threshold: u32,

    /// How long an open breaker refuses attempts.
    #[serde(default = "default_open_timeout", with = "duration_secs")]
    pub breaker_open_timeout: Duration,

    /// Period of the registry refresh loop.
    #[serde(default = "default_refresh_interval", with = "duration_secs")]
    pub refresh_interval: Duration,

    /// Lifetime of correlation entries.
    #[serde(default = "default_correlation_ttl", with = "duration_secs")]
    pub correlation_ttl: Duration,

    /// Period of the correlation cache sweep.
    #[serde(default = "default_sweep_interval", with = "duration_secs")]
    pub sweep_interval: Duration,

    /// Wall-clock bound on a parallel fan-out.
    #[serde(default = "default_fanout_timeout", with = "duration_secs")]
    pub fanout_timeout: Duration,

    /// Chat messages per second per webhook.
    #[serde(default = "default_chat_rate")]
    pub chat_rate_per_second: f64,

    /// Pager events per minute.
    #[serde(default = "default_pager_rate_per_minute")]
    pub pager_rate_per_minute: f64,

    /// TCP connect timeout for outbound HTTP.
    #[serde(default = "default_connect_timeout", with = "duration_secs")]
    pub http_connect_timeout: Duration,

    /// Overall per-attempt HTTP timeout.
    #[serde(default = "default_request_timeout", with = "duration_secs")]
    pub http_request_timeout: Duration,

    /// Upper bound on a rendered payload.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Period of the mode manager's safety-net recheck.
    #[serde(default = "default_mode_recheck_interval", with = "duration_secs")]
    pub mode_recheck_interval: Duration,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            retry_base: default_retry_base(),
            retry_ceiling: default_retry_ceiling(),
            retry_jitter: default_retry_jitter(),
            breaker_failure_threshold: default_failure_threshold(),
            breaker_success_threshold: default_success_threshold(),
            breaker_open_timeout: default_open_timeout(),
            refresh_interval: default_refresh_interval(),
            correlation_ttl: default_correlation_ttl(),
            sweep_interval: default_sweep_interval(),
            fanout_timeout: default_fanout_timeout(),
            chat_rate_per_second: default_chat_rate(),
            pager_rate_per_minute: default_pager_rate_per_minute(),
            http_connect_timeout: default_connect_timeout(),
            http_request_timeout: default_request_timeout(),
            max_payload_bytes: default_max_payload_bytes(),
            mode_recheck_interval: default_mode_recheck_interval(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker_count must be > 0")]
    ZeroWorkers,
    #[error("queue_capacity must be > 0")]
    ZeroCapacity,
    #[error("retry_ceiling {ceiling:?} must be >= retry_base {base:?}")]
    CeilingBelowBase { base: Duration, ceiling: Duration },
    #[error("rates must be positive")]
    NonPositiveRate,
}

impl PublishingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.retry_ceiling < self.retry_base {
            return Err(ConfigError::CeilingBelowBase {
                base: self.retry_base,
                ceiling: self.retry_ceiling,
            });
        }
        if self.chat_rate_per_second <= 0.0 || self.pager_rate_per_minute <= 0.0 {
            return Err(ConfigError::NonPositiveRate);
        }
        Ok(())
    }

    pub fn breaker(&self) -> crate::breaker::BreakerConfig {
        crate::breaker::BreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            open_timeout: self.breaker_open_timeout,
            success_threshold: self.breaker_success_threshold,
        }
    }
}

/// Durations serialize as whole seconds in config files.
mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
