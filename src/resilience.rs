//! Factory and registry for named resilience primitives, plus the
//! composition entry point that wraps external calls.
//!
//! Composition order is fixed: circuit breaker outermost, then bulkhead,
//! then retry, with the timeout innermost so every attempt gets its own
//! deadline and the breaker observes the aggregate outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::backoff::RetryConfig;
use crate::bulkhead::{Bulkhead, BulkheadConfig, BulkheadStats};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};
use crate::clock::{Clock, Sleeper, WallTime};
use crate::error::Error;
use crate::event_bus::{topics, Event, EventBus, EventData, ResilienceMetricsData};
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutPolicy;

/// Names registered by default.
pub mod targets {
    pub const DATABASE: &str = "database";
    pub const S3: &str = "s3";
    pub const FFMPEG: &str = "ffmpeg";
    pub const EXTERNAL_API: &str = "external_api";
    pub const VIDEO_PROCESSING: &str = "video_processing";
    pub const DATABASE_OPS: &str = "database_ops";
    pub const FILE_UPLOAD: &str = "file_upload";
}

/// Which primitives to apply around one call.
#[derive(Debug, Clone, Default)]
pub struct ResilienceOptions {
    pub circuit_breaker: Option<String>,
    pub bulkhead: Option<String>,
    pub retry: Option<RetryConfig>,
    pub timeout: Option<Duration>,
}

impl ResilienceOptions {
    pub fn with_circuit_breaker(mut self, name: impl Into<String>) -> Self {
        self.circuit_breaker = Some(name.into());
        self
    }

    pub fn with_bulkhead(mut self, name: impl Into<String>) -> Self {
        self.bulkhead = Some(name.into());
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct ResilienceManager {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    bulkheads: Mutex<HashMap<String, Arc<Bulkhead>>>,
    breaker_defaults: CircuitBreakerConfig,
    bulkhead_defaults: BulkheadConfig,
    bus: Arc<EventBus>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    metrics_task: Mutex<Option<JoinHandle<()>>>,
}

impl ResilienceManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        ResilienceManager {
            breakers: Mutex::new(HashMap::new()),
            bulkheads: Mutex::new(HashMap::new()),
            breaker_defaults: CircuitBreakerConfig::default(),
            bulkhead_defaults: BulkheadConfig::default(),
            bus,
            sleeper: Arc::new(WallTime),
            clock: Arc::new(WallTime),
            metrics_task: Mutex::new(None),
        }
    }

    pub fn with_defaults(
        mut self,
        breaker: CircuitBreakerConfig,
        bulkhead: BulkheadConfig,
    ) -> Self {
        self.breaker_defaults = breaker;
        self.bulkhead_defaults = bulkhead;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register the default breaker and bulkhead set used by the
    /// orchestration core.
    pub fn register_defaults(&self) {
        for name in [targets::DATABASE, targets::S3, targets::FFMPEG, targets::EXTERNAL_API] {
            self.circuit_breaker(name);
        }
        for name in [targets::VIDEO_PROCESSING, targets::DATABASE_OPS, targets::FILE_UPLOAD] {
            self.bulkhead(name);
        }
    }

    /// Get or create a breaker under the manager's default config.
    pub fn circuit_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.circuit_breaker_with(name, self.breaker_defaults.clone())
    }

    /// Get or create a breaker; the config applies only on first creation.
    pub fn circuit_breaker_with(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, config).with_clock(self.clock.clone()))
            })
            .clone()
    }

    pub fn bulkhead(&self, name: &str) -> Arc<Bulkhead> {
        self.bulkhead_with(name, self.bulkhead_defaults.clone())
    }

    pub fn bulkhead_with(&self, name: &str, config: BulkheadConfig) -> Arc<Bulkhead> {
        let mut bulkheads = self.bulkheads.lock().unwrap_or_else(|p| p.into_inner());
        bulkheads
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Bulkhead::new(name, config)))
            .clone()
    }

    pub fn breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        let mut snapshots: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn bulkhead_stats(&self) -> Vec<BulkheadStats> {
        let bulkheads = self.bulkheads.lock().unwrap_or_else(|p| p.into_inner());
        let mut stats: Vec<_> = bulkheads.values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Run `operation` wrapped in the primitives named by `opts`.
    pub async fn execute<T, Fut, Op>(
        &self,
        operation_name: &str,
        opts: &ResilienceOptions,
        operation: Op,
    ) -> Result<T, Error>
    where
        T: Send + 'static,
        Fut: std::future::Future<Output = Result<T, Error>> + Send + 'static,
        Op: FnMut() -> Fut + Send + 'static,
    {
        type Layer<T> = Box<dyn FnMut() -> BoxFuture<'static, Result<T, Error>> + Send>;

        // Innermost layer: one attempt, optionally bounded by a timeout.
        let op_cell = Arc::new(Mutex::new(operation));
        let mut layer: Layer<T> = match opts.timeout {
            Some(duration) => {
                let policy = TimeoutPolicy::new(duration)?;
                let name = operation_name.to_string();
                let op_cell = op_cell.clone();
                Box::new(move || {
                    let fut = (op_cell.lock().unwrap_or_else(|p| p.into_inner()))();
                    let name = name.clone();
                    Box::pin(async move { policy.execute(&name, move || fut).await })
                })
            }
            None => Box::new(move || {
                let fut = (op_cell.lock().unwrap_or_else(|p| p.into_inner()))();
                Box::pin(fut)
            }),
        };

        if let Some(config) = &opts.retry {
            let policy = RetryPolicy::from_config(config).with_sleeper(self.sleeper.clone());
            let inner = Arc::new(Mutex::new(layer));
            layer = Box::new(move || {
                let policy = policy.clone();
                let inner = inner.clone();
                Box::pin(async move {
                    policy
                        .execute(move || (inner.lock().unwrap_or_else(|p| p.into_inner()))())
                        .await
                })
            });
        }

        if let Some(name) = &opts.bulkhead {
            let bulkhead = self.bulkhead(name);
            let inner = Arc::new(Mutex::new(layer));
            layer = Box::new(move || {
                let bulkhead = bulkhead.clone();
                let inner = inner.clone();
                Box::pin(async move {
                    bulkhead
                        .execute(move || (inner.lock().unwrap_or_else(|p| p.into_inner()))())
                        .await
                })
            });
        }

        if let Some(name) = &opts.circuit_breaker {
            let breaker = self.circuit_breaker(name);
            let inner = Arc::new(Mutex::new(layer));
            layer = Box::new(move || {
                let breaker = breaker.clone();
                let inner = inner.clone();
                Box::pin(async move {
                    breaker
                        .execute(move || (inner.lock().unwrap_or_else(|p| p.into_inner()))())
                        .await
                })
            });
        }

        layer().await
    }

    /// Periodically publish a `resilience.metrics` event with all breaker
    /// and bulkhead states.
    pub fn start_metrics_task(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                let data = ResilienceMetricsData {
                    breakers: manager.breaker_snapshots(),
                    bulkheads: manager.bulkhead_stats(),
                };
                manager
                    .bus
                    .publish(Event::new(
                        topics::RESILIENCE_METRICS,
                        "resilience_manager",
                        EventData::Resilience(data),
                    ))
                    .await;
            }
        });
        let mut slot = self.metrics_task.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self
            .metrics_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for ResilienceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::clock::VirtualTime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> Arc<ResilienceManager> {
        Arc::new(
            ResilienceManager::new(Arc::new(EventBus::default()))
                .with_sleeper(Arc::new(VirtualTime::new())),
        )
    }

    #[tokio::test]
    async fn bare_execution_passes_through() {
        let manager = manager();
        let result = manager
            .execute("noop", &ResilienceOptions::default(), || async {
                Ok::<_, Error>(5)
            })
            .await;
        assert_eq!(result.unwrap(), 5);
    }

    #[tokio::test]
    async fn registry_returns_the_same_instance_per_name() {
        let manager = manager();
        let a = manager.circuit_breaker("s3");
        let b = manager.circuit_breaker("s3");
        assert!(Arc::ptr_eq(&a, &b));

        let x = manager.bulkhead("uploads");
        let y = manager.bulkhead("uploads");
        assert!(Arc::ptr_eq(&x, &y));
    }

    #[tokio::test]
    async fn default_registrations_are_present() {
        let manager = manager();
        manager.register_defaults();
        let breaker_names: Vec<String> = manager
            .breaker_snapshots()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(breaker_names, vec!["database", "external_api", "ffmpeg", "s3"]);

        let bulkhead_names: Vec<String> = manager
            .bulkhead_stats()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(bulkhead_names, vec!["database_ops", "file_upload", "video_processing"]);
    }

    #[tokio::test]
    async fn retry_layer_reruns_failed_attempts() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let opts = ResilienceOptions::default().with_retry(RetryConfig::new(3, 1));
        let result = manager
            .execute("flaky", &opts, move || {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::TransientExternal("flaky".into()))
                    } else {
                        Ok(9)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn breaker_observes_the_aggregate_outcome() {
        let clock = VirtualTime::new();
        let manager = Arc::new(
            ResilienceManager::new(Arc::new(EventBus::default()))
                .with_sleeper(Arc::new(VirtualTime::new()))
                .with_clock(Arc::new(clock.clone()))
                .with_defaults(
                    CircuitBreakerConfig {
                        failure_threshold: 1,
                        recovery_timeout: Duration::from_secs(60),
                        ..Default::default()
                    },
                    BulkheadConfig::default(),
                ),
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let opts = ResilienceOptions::default()
            .with_circuit_breaker("upstream")
            .with_retry(RetryConfig::new(2, 1));

        let result: Result<(), Error> = manager
            .execute("doomed", &opts, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::TransientExternal("down".into()))
                }
            })
            .await;
        assert!(result.is_err());

        // Retries happen inside the breaker: one aggregate failure, three
        // underlying attempts.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            manager.circuit_breaker("upstream").current_state(),
            CircuitState::Open
        );

        // Next call is short-circuited without touching the operation.
        let calls_clone = calls.clone();
        let err = manager
            .execute("doomed", &opts, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Error>(())
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeout_applies_per_attempt() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let opts = ResilienceOptions::default()
            .with_retry(RetryConfig::new(1, 1))
            .with_timeout(Duration::from_millis(20));

        let result: Result<(), Error> = manager
            .execute("slow", &opts, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                }
            })
            .await;

        // Both the first attempt and the retry timed out independently.
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn bulkhead_layer_limits_concurrency() {
        let manager = Arc::new(
            ResilienceManager::new(Arc::new(EventBus::default()))
                .with_sleeper(Arc::new(VirtualTime::new()))
                .with_defaults(
                    CircuitBreakerConfig::default(),
                    BulkheadConfig {
                        max_concurrent: 1,
                        queue_size: 0,
                        max_wait: Duration::from_millis(10),
                    },
                ),
        );

        let gate = Arc::new(tokio::sync::Barrier::new(2));
        let opts = ResilienceOptions::default().with_bulkhead("narrow");

        let holder = {
            let manager = manager.clone();
            let gate = gate.clone();
            let opts = opts.clone();
            tokio::spawn(async move {
                manager
                    .execute("hold", &opts, move || {
                        let gate = gate.clone();
                        async move {
                            gate.wait().await;
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok::<_, Error>(())
                        }
                    })
                    .await
            })
        };
        gate.wait().await;

        let err = manager
            .execute("rejected", &opts, || async { Ok::<_, Error>(()) })
            .await
            .unwrap_err();
        assert!(err.is_bulkhead());
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn metrics_task_publishes_snapshots() {
        let bus = Arc::new(EventBus::default());
        let manager = Arc::new(
            ResilienceManager::new(bus.clone()).with_sleeper(Arc::new(VirtualTime::new())),
        );
        manager.register_defaults();
        manager.start_metrics_task(Duration::from_millis(10));

        let event = bus
            .wait_for_event(topics::RESILIENCE_METRICS, Duration::from_secs(2), None)
            .await
            .unwrap();
        assert_eq!(event.source, "resilience_manager");
        manager.shutdown();
    }
}
