//! Timeout policy bounding async operation duration.
//!
//! On expiry the inner future is dropped (tokio does not forcibly abort), so
//! cancellation-unsafe work may leave partial state; pair with a
//! compensating action where that matters.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::Error;

#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    pub fn new(duration: Duration) -> Result<Self, Error> {
        if duration.is_zero() {
            return Err(Error::validation("timeout duration must be greater than zero"));
        }
        Ok(TimeoutPolicy { duration })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn execute<T, Fut, Op>(&self, operation_name: &str, operation: Op) -> Result<T, Error>
    where
        Fut: Future<Output = Result<T, Error>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: operation_name.to_string(),
                elapsed: start.elapsed(),
                limit: self.duration,
            }),
        }
    }

    /// Like [`execute`](Self::execute), but runs `compensate` before
    /// surfacing the timeout. Compensation failures are logged, never raised.
    pub async fn execute_with_compensation<T, Fut, Op, CompFut, Comp>(
        &self,
        operation_name: &str,
        operation: Op,
        compensate: Comp,
    ) -> Result<T, Error>
    where
        Fut: Future<Output = Result<T, Error>> + Send,
        Op: FnOnce() -> Fut + Send,
        CompFut: Future<Output = Result<(), Error>> + Send,
        Comp: FnOnce() -> CompFut + Send,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_) => {
                if let Err(comp_err) = compensate().await {
                    tracing::warn!(
                        operation = operation_name,
                        error = %comp_err,
                        "compensating action after timeout failed"
                    );
                }
                Err(Error::Timeout {
                    operation: operation_name.to_string(),
                    elapsed: start.elapsed(),
                    limit: self.duration,
                })
            }
        }
    }
}
