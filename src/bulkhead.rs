//! Bulkhead: a bounded-concurrency gate with a bounded FIFO wait queue.
//!
//! Up to `max_concurrent` calls run at once. Arrivals beyond that take a
//! queue slot (up to `queue_size`) and wait for a permit for at most
//! `max_wait`. Queue overflow and expired waits both reject with
//! `BulkheadFull`; permits hand off to waiters in FIFO order.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    pub max_wait: Duration,
    pub queue_size: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        BulkheadConfig {
            max_concurrent: 10,
            max_wait: Duration::from_secs(5),
            queue_size: 20,
        }
    }
}

/// Occupancy view exposed via health/metrics surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct BulkheadStats {
    pub name: String,
    pub max_concurrent: usize,
    pub active: usize,
    pub queued: usize,
    pub queue_size: usize,
}

#[derive(Clone)]
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        let permits = config.max_concurrent.max(1);
        Bulkhead {
            name: name.into(),
            config: BulkheadConfig { max_concurrent: permits, ..config },
            semaphore: Arc::new(Semaphore::new(permits)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn active_calls(&self) -> usize {
        self.config.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    pub fn queued_calls(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            name: self.name.clone(),
            max_concurrent: self.config.max_concurrent,
            active: self.active_calls(),
            queued: self.queued_calls(),
            queue_size: self.config.queue_size,
        }
    }

    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, Error>
    where
        Fut: Future<Output = Result<T, Error>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        // Fast path: a permit is free right now.
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            let result = operation().await;
            drop(permit);
            return Ok(result?);
        }

        // Count-and-enter on the queue: the slot is taken atomically or the
        // call is rejected, never half-admitted.
        loop {
            let current = self.queued.load(Ordering::Acquire);
            if current >= self.config.queue_size {
                return Err(self.full_error());
            }
            if self
                .queued
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let acquired =
            tokio::time::timeout(self.config.max_wait, self.semaphore.clone().acquire_owned())
                .await;
        self.queued.fetch_sub(1, Ordering::AcqRel);

        match acquired {
            Ok(Ok(permit)) => {
                let result = operation().await;
                drop(permit);
                Ok(result?)
            }
            Ok(Err(_)) => Err(Error::internal(format!(
                "bulkhead '{}' semaphore closed",
                self.name
            ))),
            Err(_) => {
                tracing::warn!(
                    bulkhead = %self.name,
                    max_wait_ms = self.config.max_wait.as_millis() as u64,
                    "queued call abandoned after wait deadline"
                );
                Err(self.full_error())
            }
        }
    }

    fn full_error(&self) -> Error {
        Error::BulkheadFull {
            name: self.name.clone(),
            in_flight: self.active_calls(),
            queued: self.queued_calls(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn bulkhead(max_concurrent: usize, queue_size: usize, max_wait_ms: u64) -> Bulkhead {
        Bulkhead::new(
            "test",
            BulkheadConfig {
                max_concurrent,
                queue_size,
                max_wait: Duration::from_millis(max_wait_ms),
            },
        )
    }

    #[tokio::test]
    async fn runs_within_the_limit() {
        let b = bulkhead(3, 0, 10);
        for _ in 0..3 {
            let result = b.execute(|| async { Ok::<_, Error>(1) }).await;
            assert_eq!(result.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn rejects_when_full_with_no_queue() {
        let b = bulkhead(1, 0, 10);
        let gate = Arc::new(tokio::sync::Barrier::new(2));

        let holder = {
            let b = b.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                b.execute(|| async move {
                    gate.wait().await;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, Error>(())
                })
                .await
            })
        };

        gate.wait().await;
        let err = b.execute(|| async { Ok::<_, Error>(()) }).await.unwrap_err();
        assert!(err.is_bulkhead());
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn queued_call_runs_after_permit_frees() {
        let b = bulkhead(1, 1, 1000);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = {
            let b = b.clone();
            let order = order.clone();
            tokio::spawn(async move {
                b.execute(|| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    order.lock().unwrap().push("first");
                    Ok::<_, Error>(())
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let b = b.clone();
            let order = order.clone();
            tokio::spawn(async move {
                b.execute(|| async move {
                    order.lock().unwrap().push("second");
                    Ok::<_, Error>(())
                })
                .await
            })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn queue_overflow_rejects_immediately() {
        let b = bulkhead(1, 1, 1000);
        let gate = Arc::new(tokio::sync::Barrier::new(2));

        let holder = {
            let b = b.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                b.execute(|| async move {
                    gate.wait().await;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, Error>(())
                })
                .await
            })
        };
        gate.wait().await;

        // Fill the single queue slot.
        let queued = {
            let b = b.clone();
            tokio::spawn(async move { b.execute(|| async { Ok::<_, Error>(()) }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(b.queued_calls(), 1);

        // Third arrival overflows.
        let start = std::time::Instant::now();
        let err = b.execute(|| async { Ok::<_, Error>(()) }).await.unwrap_err();
        assert!(err.is_bulkhead());
        assert!(start.elapsed() < Duration::from_millis(50), "overflow must not wait");

        holder.await.unwrap().unwrap();
        queued.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn queued_call_gives_up_after_the_wait_deadline() {
        let b = bulkhead(1, 1, 30);
        let gate = Arc::new(tokio::sync::Barrier::new(2));

        let holder = {
            let b = b.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                b.execute(|| async move {
                    gate.wait().await;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, Error>(())
                })
                .await
            })
        };
        gate.wait().await;

        let err = b.execute(|| async { Ok::<_, Error>(()) }).await.unwrap_err();
        assert!(err.is_bulkhead());
        assert_eq!(b.queued_calls(), 0, "abandoned waiter must release its slot");
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_limit() {
        let b = bulkhead(4, 16, 1000);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let b = b.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                b.execute(|| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Error>(())
                })
                .await
            }));
        }
        for handle in handles {
            let _ = handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn propagates_operation_errors() {
        let b = bulkhead(2, 0, 10);
        let err = b
            .execute(|| async { Err::<(), _>(Error::TransientExternal("inner".into())) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "transient upstream failure: inner");
    }
}
