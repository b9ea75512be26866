//! Configuration Module
//!
//! Provides the bus configuration with support for:
//! - Delivery settings (default/max QoS, retry ladder, deadlines)
//! - Queue sizing and back-pressure policy
//! - Shutdown drain behaviour
//!
//! The embedding application owns file/environment loading; this module
//! exposes `Config::parse` for TOML fragments and validates every option
//! at construction.

use std::time::Duration;

use serde::Deserialize;

use crate::message::QoS;

#[cfg(test)]
mod tests;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Back-pressure policy applied when the route queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackPressure {
    /// Block the publisher up to `enqueue_timeout`, then fail with `Timeout`
    BlockWithTimeout,
    /// Fail immediately with `QueueFull`
    DropAndError,
}

/// Bus configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// QoS used by `publish` when the caller does not specify one (0, 1, or 2)
    pub default_qos: u8,
    /// Maximum QoS granted to subscriptions (0, 1, or 2)
    pub max_qos: u8,
    /// Total route queue capacity, split across router workers
    pub queue_capacity: usize,
    /// Number of router workers (0 = CPU count, minimum 2)
    pub worker_count: usize,
    /// Back-pressure policy for a full route queue
    pub back_pressure: BackPressure,
    /// How long a blocking publish waits for queue space
    #[serde(with = "humantime_serde")]
    pub enqueue_timeout: Duration,
    /// Per-attempt handler deadline for QoS 0/1 deliveries
    #[serde(with = "humantime_serde")]
    pub qos1_deadline: Duration,
    /// Per-phase handler deadline for QoS 2 deliveries
    #[serde(with = "humantime_serde")]
    pub qos2_phase_deadline: Duration,
    /// Delivery attempts before a QoS >= 1 message is abandoned
    pub max_attempts: u32,
    /// Initial retry backoff (doubles per attempt)
    #[serde(with = "humantime_serde")]
    pub retry_initial: Duration,
    /// Retry backoff cap
    #[serde(with = "humantime_serde")]
    pub retry_cap: Duration,
    /// How long `stop` waits for in-flight QoS >= 1 messages to drain
    #[serde(with = "humantime_serde")]
    pub shutdown_drain: Duration,
    /// Retained payloads above this size are routed but not stored
    pub retained_payload_max_bytes: usize,
    /// Per-subscriber dispatch queue capacity
    pub subscriber_queue_capacity: usize,
    /// Poll interval for `wait_for_connection` and shutdown drain
    #[serde(with = "humantime_serde")]
    pub wait_poll_interval: Duration,
}

fn default_default_qos() -> u8 {
    1
}
fn default_max_qos() -> u8 {
    2
}
fn default_queue_capacity() -> usize {
    10_000
}
fn default_enqueue_timeout() -> Duration {
    Duration::from_secs(1)
}
fn default_qos_deadline() -> Duration {
    Duration::from_secs(10)
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_initial() -> Duration {
    Duration::from_secs(1)
}
fn default_retry_cap() -> Duration {
    Duration::from_secs(30)
}
fn default_shutdown_drain() -> Duration {
    Duration::from_secs(30)
}
fn default_retained_payload_max_bytes() -> usize {
    1024 * 1024
}
fn default_subscriber_queue_capacity() -> usize {
    1024
}
fn default_wait_poll_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_qos: default_default_qos(),
            max_qos: default_max_qos(),
            queue_capacity: default_queue_capacity(),
            worker_count: 0,
            back_pressure: BackPressure::BlockWithTimeout,
            enqueue_timeout: default_enqueue_timeout(),
            qos1_deadline: default_qos_deadline(),
            qos2_phase_deadline: default_qos_deadline(),
            max_attempts: default_max_attempts(),
            retry_initial: default_retry_initial(),
            retry_cap: default_retry_cap(),
            shutdown_drain: default_shutdown_drain(),
            retained_payload_max_bytes: default_retained_payload_max_bytes(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            wait_poll_interval: default_wait_poll_interval(),
        }
    }
}

impl Config {
    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }

        if self.default_qos > 2 {
            return Err(ConfigError::Validation(
                "default_qos must be 0, 1, or 2".to_string(),
            ));
        }

        if self.default_qos > self.max_qos {
            return Err(ConfigError::Validation(format!(
                "default_qos ({}) cannot exceed max_qos ({})",
                self.default_qos, self.max_qos
            )));
        }

        if self.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "queue_capacity must be positive".to_string(),
            ));
        }

        if self.subscriber_queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "subscriber_queue_capacity must be positive".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "max_attempts must be positive".to_string(),
            ));
        }

        if self.retained_payload_max_bytes == 0 {
            return Err(ConfigError::Validation(
                "retained_payload_max_bytes must be positive".to_string(),
            ));
        }

        if self.retry_initial.is_zero() {
            return Err(ConfigError::Validation(
                "retry_initial must be positive".to_string(),
            ));
        }

        if self.retry_cap < self.retry_initial {
            return Err(ConfigError::Validation(
                "retry_cap cannot be smaller than retry_initial".to_string(),
            ));
        }

        if self.wait_poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "wait_poll_interval must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Default publish QoS as an enum value
    pub fn default_qos_level(&self) -> QoS {
        QoS::from_u8(self.default_qos).unwrap_or(QoS::AtLeastOnce)
    }

    /// Maximum granted QoS as an enum value
    pub fn max_qos_level(&self) -> QoS {
        QoS::from_u8(self.max_qos).unwrap_or(QoS::ExactlyOnce)
    }

    /// Resolved router worker count (0 = CPU count, minimum 2)
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .max(2)
        } else {
            self.worker_count
        }
    }

    /// Per-shard route queue capacity
    pub fn route_shard_capacity(&self) -> usize {
        (self.queue_capacity / self.effective_worker_count()).max(1)
    }
}
