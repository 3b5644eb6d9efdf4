//! Environment-driven configuration. Every knob has a default; setting the
//! corresponding variable overrides it.

use std::time::Duration;

use crate::bulkhead::BulkheadConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {details}")]
    Parse { key: &'static str, details: String },
}

fn env_or_default(key: &'static str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_u64(key: &'static str, default: &str) -> Result<u64, ConfigError> {
    env_or_default(key, default)
        .parse()
        .map_err(|e| ConfigError::Parse { key, details: format!("{e}") })
}

fn parse_usize(key: &'static str, default: &str) -> Result<usize, ConfigError> {
    env_or_default(key, default)
        .parse()
        .map_err(|e| ConfigError::Parse { key, details: format!("{e}") })
}

fn parse_millis(key: &'static str, default: &str) -> Result<Duration, ConfigError> {
    parse_u64(key, default).map(Duration::from_millis)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_concurrent_jobs: usize,
    pub quick_threshold: Duration,
    pub processing_timeout: Duration,
    pub breaker_failure_threshold: usize,
    pub breaker_recovery_timeout: Duration,
    pub breaker_monitoring_period: Duration,
    pub bulkhead_max_concurrent: usize,
    pub bulkhead_max_wait: Duration,
    pub bulkhead_queue_size: usize,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub health_check_retries: usize,
    pub event_history_size: usize,
    pub dead_letter_size: usize,
    pub resource_reap_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub metrics_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = env_or_default("PORT", "8080")
            .parse()
            .map_err(|e| ConfigError::Parse { key: "PORT", details: format!("{e}") })?;

        Ok(Config {
            host: env_or_default("HOST", "0.0.0.0"),
            port,
            max_concurrent_jobs: parse_usize("MAX_CONCURRENT_JOBS", "2")?,
            quick_threshold: parse_millis("QUICK_THRESHOLD_MS", "30000")?,
            processing_timeout: parse_millis("PROCESSING_TIMEOUT_MS", "600000")?,
            breaker_failure_threshold: parse_usize("CIRCUIT_BREAKER_FAILURE_THRESHOLD", "5")?,
            breaker_recovery_timeout: parse_millis("CIRCUIT_BREAKER_RECOVERY_TIMEOUT_MS", "60000")?,
            breaker_monitoring_period: parse_millis(
                "CIRCUIT_BREAKER_MONITORING_PERIOD_MS",
                "300000",
            )?,
            bulkhead_max_concurrent: parse_usize("BULKHEAD_MAX_CONCURRENT_CALLS", "10")?,
            bulkhead_max_wait: parse_millis("BULKHEAD_MAX_WAIT_MS", "5000")?,
            bulkhead_queue_size: parse_usize("BULKHEAD_QUEUE_SIZE", "20")?,
            health_check_interval: parse_millis("HEALTH_CHECK_INTERVAL_MS", "30000")?,
            health_check_timeout: parse_millis("HEALTH_CHECK_TIMEOUT_MS", "5000")?,
            health_check_retries: parse_usize("HEALTH_CHECK_RETRIES", "2")?,
            event_history_size: parse_usize("EVENT_HISTORY_SIZE", "1000")?,
            dead_letter_size: parse_usize("DEAD_LETTER_QUEUE_SIZE", "100")?,
            resource_reap_interval: parse_millis("RESOURCE_REAP_INTERVAL_MS", "30000")?,
            heartbeat_timeout: parse_millis("NODE_HEARTBEAT_TIMEOUT_MS", "120000")?,
            metrics_interval: parse_millis("METRICS_INTERVAL_MS", "60000")?,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Breaker defaults: only upstream failures and deadlines count toward
    /// opening; validation mistakes and cancellations never trip a breaker.
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            recovery_timeout: self.breaker_recovery_timeout,
            monitoring_period: self.breaker_monitoring_period,
            expected_errors: vec![
                ErrorKind::TransientExternal,
                ErrorKind::Timeout,
                ErrorKind::FatalExternal,
            ],
        }
    }

    pub fn bulkhead_config(&self) -> BulkheadConfig {
        BulkheadConfig {
            max_concurrent: self.bulkhead_max_concurrent,
            max_wait: self.bulkhead_max_wait,
            queue_size: self.bulkhead_queue_size,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".into(),
            port: 8080,
            max_concurrent_jobs: 2,
            quick_threshold: Duration::from_secs(30),
            processing_timeout: Duration::from_secs(600),
            breaker_failure_threshold: 5,
            breaker_recovery_timeout: Duration::from_secs(60),
            breaker_monitoring_period: Duration::from_secs(300),
            bulkhead_max_concurrent: 10,
            bulkhead_max_wait: Duration::from_secs(5),
            bulkhead_queue_size: 20,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            health_check_retries: 2,
            event_history_size: 1000,
            dead_letter_size: 100,
            resource_reap_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(120),
            metrics_interval: Duration::from_secs(60),
        }
    }
}
