//! Backoff schedule for retries: exponential growth with a cap and
//! additive jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, RetryableKinds};

/// Upper bound on the random component added per delay.
pub const DEFAULT_JITTER_CAP: Duration = Duration::from_millis(1000);

/// Computes `min(base * multiplier^(attempt-1), max)` for 1-indexed attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Backoff { base, multiplier: multiplier.max(1.0), max }
    }

    /// Constant delay (multiplier 1).
    pub fn constant(delay: Duration) -> Self {
        Backoff::new(delay, 1.0, delay)
    }

    /// Doubling delay capped at `max`.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::new(base, 2.0, max)
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry `attempt` (1-indexed), jitter not applied.
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.multiplier.powi(exponent);
        let millis = (self.base.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Random component layered on top of a backoff delay.
#[derive(Debug, Clone, PartialEq)]
pub enum Jitter {
    None,
    /// Adds `U(0, cap)` to every delay.
    Additive { cap: Duration },
}

impl Jitter {
    pub fn additive() -> Self {
        Jitter::Additive { cap: DEFAULT_JITTER_CAP }
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Additive { cap } => {
                let cap_millis = cap.as_millis() as u64;
                if cap_millis == 0 {
                    return delay;
                }
                delay + Duration::from_millis(rng.random_range(0..=cap_millis))
            }
        }
    }

    /// Largest amount `apply` can add to a delay.
    pub fn ceiling(&self) -> Duration {
        match self {
            Jitter::None => Duration::ZERO,
            Jitter::Additive { cap } => *cap,
        }
    }
}

/// Declarative retry configuration carried by workflow steps, event
/// subscriptions, and resilience compositions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub backoff_ms: u64,
    #[serde(default = "RetryConfig::default_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_errors: Option<Vec<ErrorKind>>,
    #[serde(default)]
    pub jitter: bool,
}

impl RetryConfig {
    fn default_multiplier() -> f64 {
        2.0
    }

    pub fn new(max_retries: usize, backoff_ms: u64) -> Self {
        RetryConfig {
            max_retries,
            backoff_ms,
            backoff_multiplier: 2.0,
            max_backoff_ms: None,
            retryable_errors: None,
            jitter: false,
        }
    }

    pub fn with_max_backoff(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = Some(max_backoff_ms);
        self
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_errors = Some(kinds.into_iter().collect());
        self
    }

    pub fn backoff(&self) -> Backoff {
        let base = Duration::from_millis(self.backoff_ms);
        let max = self
            .max_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| base.saturating_mul(32));
        Backoff::new(base, self.backoff_multiplier, max)
    }

    pub fn jitter(&self) -> Jitter {
        if self.jitter {
            Jitter::additive()
        } else {
            Jitter::None
        }
    }

    pub fn retryable(&self) -> RetryableKinds {
        match &self.retryable_errors {
            None => RetryableKinds::any(),
            Some(kinds) => RetryableKinds::of(kinds.iter().copied()),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::new(3, 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn constant_backoff_is_flat() {
        let backoff = Backoff::constant(Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(7), Duration::from_millis(250));
    }

    #[test]
    fn exponential_backoff_doubles_until_the_cap() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
        assert_eq!(backoff.delay(10), Duration::from_millis(500));
    }

    #[test]
    fn custom_multiplier_is_honored() {
        let backoff = Backoff::new(Duration::from_millis(100), 3.0, Duration::from_secs(60));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(300));
        assert_eq!(backoff.delay(3), Duration::from_millis(900));
    }

    #[test]
    fn sub_one_multiplier_is_clamped() {
        let backoff = Backoff::new(Duration::from_millis(100), 0.5, Duration::from_secs(1));
        assert_eq!(backoff.delay(5), Duration::from_millis(100));
    }

    #[test]
    fn jitter_never_exceeds_backoff_cap_plus_ceiling() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_millis(800));
        let jitter = Jitter::additive();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=20 {
            let delay = jitter.apply_with_rng(backoff.delay(attempt), &mut rng);
            assert!(delay <= backoff.max() + jitter.ceiling());
        }
    }

    #[test]
    fn no_jitter_passes_delay_through() {
        assert_eq!(
            Jitter::None.apply(Duration::from_millis(123)),
            Duration::from_millis(123)
        );
    }

    #[test]
    fn retry_config_builds_matching_backoff() {
        let config = RetryConfig::new(3, 200).with_max_backoff(1000);
        let backoff = config.backoff();
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(1000));
    }

    #[test]
    fn retry_config_serde_defaults() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"max_retries":2,"backoff_ms":50}"#).unwrap();
        assert_eq!(config.backoff_multiplier, 2.0);
        assert!(config.retryable_errors.is_none());
        assert!(!config.jitter);
    }
}
