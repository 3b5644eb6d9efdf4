//! Retry policy: kind-filtered retries with backoff, jitter, and a
//! pluggable sleeper.

use std::future::Future;
use std::sync::Arc;

use crate::backoff::{Backoff, Jitter, RetryConfig};
use crate::clock::{Sleeper, WallTime};
use crate::error::{Error, RetryableKinds};

#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    backoff: Backoff,
    jitter: Jitter,
    retryable: RetryableKinds,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_retries: config.max_retries,
            backoff: config.backoff(),
            jitter: config.jitter(),
            retryable: config.retryable(),
            sleeper: Arc::new(WallTime),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Total invocations is `max_retries + 1`: the first attempt plus the
    /// configured number of retries.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, Error>
    where
        Fut: Future<Output = Result<T, Error>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut last_error: Option<Error> = None;

        for attempt in 0..=self.max_retries {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !self.retryable.matches(&error) {
                        return Err(error);
                    }
                    if attempt == self.max_retries {
                        return Err(error);
                    }
                    let delay = self.jitter.apply(self.backoff.delay(attempt + 1));
                    tracing::debug!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after failure"
                    );
                    last_error = Some(error);
                    self.sleeper.sleep(delay).await;
                }
            }
        }

        // Loop always returns from its final iteration.
        Err(last_error.unwrap_or_else(|| Error::internal("retry loop exited without a result")))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from_config(&RetryConfig::default())
    }
}
