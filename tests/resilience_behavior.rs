//! Fault-tolerance behavior under injected failures: circuit breaker
//! open/recover and bulkhead saturation on the sync path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use renderflow::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use renderflow::clock::VirtualTime;
use renderflow::config::Config;
use renderflow::error::{Error, ErrorKind};
use renderflow::event_bus::EventBus;
use renderflow::model::{
    ElementKind, FitMode, OutputFormat, Percent, Priority, VideoElement, VideoJobRequest,
};
use renderflow::orchestrator::{Collaborators, Orchestrator};
use renderflow::resilience::{targets, ResilienceManager, ResilienceOptions};
use renderflow::services::{
    InMemoryJobDatabase, ProgressSink, RenderedArtifact, SimulatedBlobStore, Transcoder,
};
use tokio_util::sync::CancellationToken;

fn simple_request() -> VideoJobRequest {
    VideoJobRequest {
        id: None,
        output_format: OutputFormat::Mp4,
        width: 1280,
        height: 720,
        elements: vec![VideoElement {
            id: "e1".into(),
            kind: ElementKind::Image,
            source: "https://x/y.jpg".into(),
            track: 1,
            x: Percent::zero(),
            y: Percent::zero(),
            width: Percent::full(),
            height: Percent::full(),
            fit_mode: FitMode::Auto,
            start_time: None,
            duration: None,
        }],
        priority: Priority::Normal,
        callback_url: None,
    }
}

#[tokio::test]
async fn s3_breaker_opens_after_three_failures_and_recovers() {
    let clock = VirtualTime::new();
    let manager = Arc::new(
        ResilienceManager::new(Arc::new(EventBus::default())).with_clock(Arc::new(clock.clone())),
    );
    manager.circuit_breaker_with(
        targets::S3,
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(1000),
            monitoring_period: Duration::from_secs(300),
            expected_errors: vec![ErrorKind::TransientExternal],
        },
    );

    let uploads = Arc::new(AtomicUsize::new(0));
    let opts = ResilienceOptions::default().with_circuit_breaker(targets::S3);

    // Three consecutive upload failures open the breaker.
    for _ in 0..3 {
        let uploads = uploads.clone();
        let result: Result<(), Error> = manager
            .execute("upload", &opts, move || {
                let uploads = uploads.clone();
                async move {
                    uploads.fetch_add(1, Ordering::SeqCst);
                    Err(Error::TransientExternal("bucket unreachable".into()))
                }
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(uploads.load(Ordering::SeqCst), 3);
    assert_eq!(
        manager.circuit_breaker(targets::S3).current_state(),
        CircuitState::Open
    );

    // A fourth call inside the recovery window fails fast without invoking
    // the operation.
    clock.advance(500);
    let attempted = uploads.clone();
    let err = manager
        .execute("upload", &opts, move || {
            let attempted = attempted.clone();
            async move {
                attempted.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(())
            }
        })
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(uploads.load(Ordering::SeqCst), 3);

    // Past the recovery timeout the probe is admitted; success closes the
    // breaker again.
    clock.advance(501);
    let attempted = uploads.clone();
    manager
        .execute("upload", &opts, move || {
            let attempted = attempted.clone();
            async move {
                attempted.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(())
            }
        })
        .await
        .unwrap();
    assert_eq!(uploads.load(Ordering::SeqCst), 4);
    assert_eq!(
        manager.circuit_breaker(targets::S3).current_state(),
        CircuitState::Closed
    );
}

/// Transcoder that blocks long enough to saturate a one-slot bulkhead.
struct HoldingTranscoder {
    hold: Duration,
}

#[async_trait::async_trait]
impl Transcoder for HoldingTranscoder {
    async fn render(
        &self,
        job_id: &str,
        _request: &VideoJobRequest,
        _progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RenderedArtifact, Error> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(self.hold) => Ok(RenderedArtifact {
                path: format!("/tmp/renderflow/{job_id}.mp4"),
                size_bytes: 2048,
                media_duration: Duration::from_secs(5),
            }),
        }
    }
}

#[tokio::test]
async fn video_processing_bulkhead_sheds_the_third_sync_job() {
    let mut config = Config::default();
    config.bulkhead_max_concurrent = 1;
    config.bulkhead_queue_size = 1;
    config.bulkhead_max_wait = Duration::from_millis(400);

    let orchestrator = Orchestrator::new(
        config,
        Collaborators {
            transcoder: Arc::new(HoldingTranscoder { hold: Duration::from_millis(200) }),
            blob_store: Arc::new(SimulatedBlobStore::default()),
            database: Arc::new(InMemoryJobDatabase::new()),
        },
    );

    let (first, second, third) = tokio::join!(
        orchestrator.orchestrate(simple_request(), None),
        orchestrator.orchestrate(simple_request(), None),
        orchestrator.orchestrate(simple_request(), None),
    );

    let outcomes = [first, second, third];
    let successes = outcomes.iter().filter(|o| o.is_ok()).count();
    let rejections: Vec<&Error> = outcomes
        .iter()
        .filter_map(|o| o.as_ref().err())
        .collect();

    assert_eq!(successes, 2, "one job runs, one queues then runs");
    assert_eq!(rejections.len(), 1, "the overflow job is shed");
    assert!(
        rejections[0].is_bulkhead(),
        "expected BulkheadFull, got: {}",
        rejections[0]
    );
}

#[tokio::test]
async fn bulkhead_rejection_is_recoverable_for_clients() {
    let error = Error::BulkheadFull { name: "video_processing".into(), in_flight: 1, queued: 1 };
    assert!(error.is_recoverable());
    assert_eq!(error.kind(), ErrorKind::BulkheadFull);
}
