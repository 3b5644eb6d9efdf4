//! Composition root and request pipeline: classify, allocate, materialize,
//! pick an endpoint, then run inline or hand off to the queue.
//!
//! The orchestrator owns every collaborator and shuts them down in reverse
//! dependency order. Allocations are released on every exit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analyzer;
use crate::balancer::{LoadBalancer, SelectedEndpoint};
use crate::clock::{Clock, WallTime};
use crate::config::Config;
use crate::error::Error;
use crate::event_bus::{
    topics, Event, EventBus, EventData, OrchestrationEventData,
};
use crate::health::{CheckKind, CheckSpec, CustomCheck, HealthChecker};
use crate::job_store::JobStore;
use crate::model::{
    Complexity, JobAnalysis, JobResult, JobSnapshot, Strategy, VideoJobRequest,
};
use crate::queue::{JobQueue, WorkerDeps};
use crate::resilience::ResilienceManager;
use crate::resource::{Allocation, AllocationRequest, ResourceManager};
use crate::services::{
    BlobStore, InMemoryJobDatabase, JobDatabase, JobDetails, SimulatedBlobStore,
    SimulatedTranscoder, Transcoder,
};
use crate::workflow::{
    default_executors, ExecutorDeps, RollbackHooks, WorkflowContext, WorkflowEngine,
};

/// External collaborators injected at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub transcoder: Arc<dyn Transcoder>,
    pub blob_store: Arc<dyn BlobStore>,
    pub database: Arc<dyn JobDatabase>,
}

impl Collaborators {
    /// Deterministic in-process stand-ins; the binary's default wiring.
    pub fn simulated() -> Self {
        Collaborators {
            transcoder: Arc::new(SimulatedTranscoder::default()),
            blob_store: Arc::new(SimulatedBlobStore::default()),
            database: Arc::new(InMemoryJobDatabase::new()),
        }
    }
}

/// What `orchestrate` hands back on success.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OrchestrationOutcome {
    /// Sync path: the artifact is ready.
    Immediate {
        job_id: String,
        result: JobResult,
        processing_time_ms: u64,
    },
    /// Async path: poll or subscribe for progress.
    Queued {
        job_id: String,
        estimated_completion: DateTime<Utc>,
        status_check_endpoint: String,
    },
}

/// Job details joined with the advisory endpoint selection.
#[derive(Debug, Clone, Serialize)]
pub struct JobDetailsView {
    #[serde(flatten)]
    pub details: JobDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_endpoint: Option<SelectedEndpoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<JobSnapshot>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
}

struct DatabaseCheck(Arc<dyn JobDatabase>);

#[async_trait]
impl CustomCheck for DatabaseCheck {
    async fn check(&self) -> Result<(), Error> {
        self.0.health_check().await
    }
}

struct BlobStoreCheck(Arc<dyn BlobStore>);

#[async_trait]
impl CustomCheck for BlobStoreCheck {
    async fn check(&self) -> Result<(), Error> {
        self.0.health_check().await
    }
}

pub struct Orchestrator {
    config: Config,
    bus: Arc<EventBus>,
    resilience: Arc<ResilienceManager>,
    resources: Arc<ResourceManager>,
    balancer: Arc<LoadBalancer>,
    health: Arc<HealthChecker>,
    engine: WorkflowEngine,
    queue: Arc<JobQueue>,
    store: Arc<JobStore>,
    database: Arc<dyn JobDatabase>,
    clock: Arc<dyn Clock>,
    selections: Mutex<HashMap<String, SelectedEndpoint>>,
}

impl Orchestrator {
    pub fn new(config: Config, collaborators: Collaborators) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(
            config.event_history_size,
            config.dead_letter_size,
        ));

        let resilience = Arc::new(
            ResilienceManager::new(bus.clone())
                .with_defaults(config.breaker_config(), config.bulkhead_config()),
        );
        resilience.register_defaults();

        let resources = Arc::new(
            ResourceManager::new(bus.clone()).with_heartbeat_timeout(config.heartbeat_timeout),
        );
        resources.seed_default_fleet();

        let balancer = Arc::new(LoadBalancer::new(bus.clone()));
        balancer.seed_default_endpoints();

        let health = Arc::new(HealthChecker::new(bus.clone()));
        health.register(
            CheckSpec::new(
                "database",
                CheckKind::Custom(Arc::new(DatabaseCheck(collaborators.database.clone()))),
            )
            .every(config.health_check_interval)
            .with_timeout(config.health_check_timeout)
            .with_retries(config.health_check_retries),
        );
        health.register(
            CheckSpec::new(
                "blob_store",
                CheckKind::Custom(Arc::new(BlobStoreCheck(collaborators.blob_store.clone()))),
            )
            .every(config.health_check_interval)
            .with_timeout(config.health_check_timeout)
            .with_retries(config.health_check_retries),
        );

        let store = Arc::new(JobStore::new());
        let queue = Arc::new(JobQueue::new(
            store.clone(),
            bus.clone(),
            WorkerDeps {
                transcoder: collaborators.transcoder.clone(),
                blob_store: collaborators.blob_store.clone(),
                resilience: resilience.clone(),
            },
            config.max_concurrent_jobs,
        ));

        let engine = WorkflowEngine::new(
            bus.clone(),
            RollbackHooks {
                resources: resources.clone(),
                database: collaborators.database.clone(),
            },
            default_executors(ExecutorDeps::new(
                collaborators.transcoder,
                collaborators.blob_store,
                collaborators.database.clone(),
                resilience.clone(),
            )),
        );

        Arc::new(Orchestrator {
            config,
            bus,
            resilience,
            resources,
            balancer,
            health,
            engine,
            queue,
            store,
            database: collaborators.database,
            clock: Arc::new(WallTime),
            selections: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the background machinery: queue scheduler, reapers, health
    /// loops, metrics.
    pub fn start(self: &Arc<Self>) {
        self.queue.start();
        self.resources.start_reaper(self.config.resource_reap_interval);
        self.resources
            .start_local_heartbeats(self.config.resource_reap_interval);
        self.resilience.start_metrics_task(self.config.metrics_interval);
        self.health.start();
        tracing::info!("orchestrator started");
    }

    /// Reverse dependency order: stop intake and workers first, then the
    /// background maintainers.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        self.health.shutdown();
        self.resources.shutdown();
        self.resilience.shutdown();
        tracing::info!("orchestrator stopped");
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn store(&self) -> Arc<JobStore> {
        self.store.clone()
    }

    pub fn health(&self) -> Arc<HealthChecker> {
        self.health.clone()
    }

    pub fn resilience(&self) -> Arc<ResilienceManager> {
        self.resilience.clone()
    }

    pub fn resources(&self) -> Arc<ResourceManager> {
        self.resources.clone()
    }

    pub async fn orchestrate(
        &self,
        request: VideoJobRequest,
        correlation_id: Option<String>,
    ) -> Result<OrchestrationOutcome, Error> {
        let result = self.orchestrate_inner(request, correlation_id.clone()).await;
        if let Err(error) = &result {
            self.publish_orchestration_error(error, correlation_id).await;
        }
        result
    }

    async fn orchestrate_inner(
        &self,
        mut request: VideoJobRequest,
        correlation_id: Option<String>,
    ) -> Result<OrchestrationOutcome, Error> {
        request.validate()?;

        let job_id = request
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        request.id = Some(job_id.clone());

        let analysis = analyzer::analyze(&request);
        tracing::info!(
            job_id = %job_id,
            complexity = %analysis.complexity,
            strategy = %analysis.strategy,
            estimated_s = analysis.estimated_duration.as_secs(),
            "request classified"
        );

        // Allocations are advisory admission control and expire on their own
        // even if this process forgets them.
        let allocation = self
            .resources
            .allocate(
                &AllocationRequest::new(analysis.resource_requirements.clone(), analysis.priority)
                    .expiring_after(analysis.estimated_duration * 2 + self.config.quick_threshold),
            )
            .await?;
        let allocation_id = allocation.id.clone();

        let outcome = self
            .run_with_allocation(&job_id, request, &analysis, allocation, correlation_id)
            .await;

        // Release on every exit path; rollback may have beaten us to it, in
        // which case this is a warned no-op.
        self.resources.release(&allocation_id).await;
        outcome
    }

    async fn run_with_allocation(
        &self,
        job_id: &str,
        request: VideoJobRequest,
        analysis: &JobAnalysis,
        allocation: Allocation,
        correlation_id: Option<String>,
    ) -> Result<OrchestrationOutcome, Error> {
        let definition = self.engine.materialize(&request)?;

        // Advisory endpoint selection; failure is logged, not fatal.
        match self.balancer.select(analysis) {
            Ok(selected) => {
                tracing::debug!(
                    job_id,
                    endpoint = %selected.endpoint_id,
                    strategy = ?selected.strategy,
                    "downstream endpoint selected"
                );
                self.selections
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(job_id.to_string(), selected);
            }
            Err(error) => {
                tracing::warn!(job_id, error = %error, "endpoint selection failed");
            }
        }

        // The threshold is exclusive on the sync side: an estimate equal to
        // it routes async.
        let sync = analysis.estimated_duration < self.config.quick_threshold
            && analysis.complexity == Complexity::Simple
            && analysis.strategy == Strategy::QuickSync;

        if sync {
            self.run_sync(job_id, request, analysis, allocation, definition, correlation_id)
                .await
        } else {
            self.run_async(job_id, request, analysis).await
        }
    }

    async fn run_sync(
        &self,
        job_id: &str,
        request: VideoJobRequest,
        analysis: &JobAnalysis,
        allocation: Allocation,
        definition: crate::workflow::WorkflowDefinition,
        correlation_id: Option<String>,
    ) -> Result<OrchestrationOutcome, Error> {
        let mut context = WorkflowContext::new(job_id.to_string(), request.clone(), analysis.clone())
            .with_allocation(allocation);
        if let Some(correlation) = &correlation_id {
            context = context.with_correlation(correlation.clone());
        }

        let cancel = CancellationToken::new();
        let started = self.clock.now_millis();
        let execution = self.engine.execute(definition, context, &cancel).await;
        let elapsed = self.clock.now_millis().saturating_sub(started);

        if execution.succeeded() {
            let result = execution.context.result.clone().ok_or_else(|| {
                Error::internal("workflow completed without producing an artifact")
            })?;
            self.queue
                .record_completed(job_id.to_string(), request, &result, elapsed);
            if let Some(snapshot) = self.store.get(job_id) {
                if let Err(error) = self.database.save_job(&snapshot).await {
                    tracing::warn!(job_id, error = %error, "failed to persist sync job record");
                }
            }
            Ok(OrchestrationOutcome::Immediate {
                job_id: job_id.to_string(),
                result,
                processing_time_ms: elapsed,
            })
        } else {
            Err(execution
                .error
                .unwrap_or_else(|| Error::internal("workflow failed without an error")))
        }
    }

    async fn run_async(
        &self,
        job_id: &str,
        request: VideoJobRequest,
        analysis: &JobAnalysis,
    ) -> Result<OrchestrationOutcome, Error> {
        let ticket = self.queue.enqueue(job_id.to_string(), request);
        if let Some(snapshot) = self.store.get(&ticket.job_id) {
            if let Err(error) = self.database.save_job(&snapshot).await {
                tracing::warn!(job_id, error = %error, "failed to persist queued job record");
            }
        }

        let estimated_completion = Utc::now()
            + chrono::Duration::from_std(analysis.estimated_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        Ok(OrchestrationOutcome::Queued {
            job_id: ticket.job_id.clone(),
            estimated_completion,
            status_check_endpoint: format!("/api/v1/video/result/{}", ticket.job_id),
        })
    }

    async fn publish_orchestration_error(&self, error: &Error, correlation_id: Option<String>) {
        let mut event = Event::new(
            topics::ORCHESTRATION_ERROR,
            "orchestrator",
            EventData::Orchestration(OrchestrationEventData {
                job_id: String::new(),
                error: Some(error.to_string()),
                recoverable: Some(error.is_recoverable()),
            }),
        );
        if let Some(correlation) = correlation_id {
            event = event.with_correlation(correlation);
        }
        self.bus.publish(event).await;
    }

    /// Queue first, then the persistent store.
    pub async fn status(&self, job_id: &str) -> Result<JobSnapshot, Error> {
        if let Some(snapshot) = self.queue.get_job(job_id) {
            return Ok(snapshot);
        }
        self.database
            .get_job(job_id)
            .await?
            .ok_or_else(|| Error::not_found("job", job_id))
    }

    pub fn cancel(&self, job_id: &str) -> Result<JobSnapshot, Error> {
        self.queue.cancel(job_id)
    }

    pub fn list(&self, page: usize, limit: usize) -> JobPage {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);
        let all = self.store.list(page * limit);
        let jobs = all
            .into_iter()
            .skip((page - 1) * limit)
            .take(limit)
            .collect();
        JobPage {
            jobs,
            page,
            limit,
            total: self.store.len(),
        }
    }

    pub async fn details(&self, job_id: &str) -> Result<JobDetailsView, Error> {
        let from_database = self.database.job_details(job_id).await?;
        let details = match (from_database, self.store.get(job_id)) {
            (Some(mut details), Some(live)) => {
                // The in-memory record is fresher than the persisted copy.
                details.job = live;
                details
            }
            (Some(details), None) => details,
            (None, Some(live)) => JobDetails {
                elements: live.request.elements.clone(),
                job: live,
                timeline: Vec::new(),
                storage_operations: Vec::new(),
            },
            (None, None) => return Err(Error::not_found("job", job_id)),
        };

        let selected_endpoint = self
            .selections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(job_id)
            .cloned();
        Ok(JobDetailsView { details, selected_endpoint })
    }

    /// Readiness gate: the persistent store must answer.
    pub async fn ready(&self) -> bool {
        self.database.health_check().await.is_ok()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualTime;
    use crate::event_bus::EventFilter;
    use crate::model::{
        ElementKind, FitMode, JobStatus, OutputFormat, Percent, Priority, VideoElement,
    };
    use std::time::Duration;

    fn element(id: &str, kind: ElementKind) -> VideoElement {
        VideoElement {
            id: id.into(),
            kind,
            source: format!("https://cdn.example/{id}"),
            track: 1,
            x: Percent::zero(),
            y: Percent::zero(),
            width: Percent::full(),
            height: Percent::full(),
            fit_mode: FitMode::Auto,
            start_time: None,
            duration: None,
        }
    }

    fn simple_request() -> VideoJobRequest {
        VideoJobRequest {
            id: None,
            output_format: OutputFormat::Mp4,
            width: 1280,
            height: 720,
            elements: vec![element("e1", ElementKind::Image)],
            priority: Priority::Normal,
            callback_url: None,
        }
    }

    fn busy_request() -> VideoJobRequest {
        VideoJobRequest {
            id: None,
            output_format: OutputFormat::Mp4,
            width: 1920,
            height: 1080,
            elements: (0..6)
                .map(|i| element(&format!("e{i}"), ElementKind::Image))
                .collect(),
            priority: Priority::Normal,
            callback_url: None,
        }
    }

    fn fast_collaborators() -> Collaborators {
        let sleeper = Arc::new(VirtualTime::new());
        Collaborators {
            transcoder: Arc::new(SimulatedTranscoder::default().with_sleeper(sleeper.clone())),
            blob_store: Arc::new(SimulatedBlobStore::default().with_sleeper(sleeper)),
            database: Arc::new(InMemoryJobDatabase::new()),
        }
    }

    fn orchestrator() -> Arc<Orchestrator> {
        Orchestrator::new(Config::default(), fast_collaborators())
    }

    #[tokio::test]
    async fn simple_request_completes_synchronously() {
        let orchestrator = orchestrator();
        let outcome = orchestrator
            .orchestrate(simple_request(), None)
            .await
            .unwrap();

        let OrchestrationOutcome::Immediate { job_id, result, processing_time_ms } = outcome
        else {
            panic!("expected the sync path");
        };
        assert!(result.url.starts_with("https://"));
        assert!(processing_time_ms <= 30_000);

        // The job is resolvable through the status endpoint afterwards.
        let snapshot = orchestrator.status(&job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.progress_percent, 100);
    }

    #[tokio::test]
    async fn busy_request_routes_async() {
        let orchestrator = orchestrator();
        let outcome = orchestrator.orchestrate(busy_request(), None).await.unwrap();

        let OrchestrationOutcome::Queued { job_id, status_check_endpoint, estimated_completion } =
            outcome
        else {
            panic!("expected the async path");
        };
        assert_eq!(
            status_check_endpoint,
            format!("/api/v1/video/result/{job_id}")
        );
        assert!(estimated_completion > Utc::now());

        let snapshot = orchestrator.status(&job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn estimate_equal_to_threshold_routes_async() {
        // A single image estimates to 8 seconds; with the threshold set to
        // exactly that, the boundary must fall on the async side.
        let mut config = Config::default();
        config.quick_threshold = Duration::from_secs(8);
        let orchestrator = Orchestrator::new(config, fast_collaborators());

        let outcome = orchestrator
            .orchestrate(simple_request(), None)
            .await
            .unwrap();
        assert!(matches!(outcome, OrchestrationOutcome::Queued { .. }));
    }

    #[tokio::test]
    async fn invalid_request_fails_validation() {
        let orchestrator = orchestrator();
        let mut request = simple_request();
        request.elements.clear();
        let err = orchestrator.orchestrate(request, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn allocation_failure_is_recoverable_and_published() {
        // An empty inventory cannot satisfy anything.
        let collaborators = fast_collaborators();
        let orchestrator = Orchestrator::new(Config::default(), collaborators);
        // Drain the default fleet by registering over it with zero capacity.
        for id in ["compute-01", "compute-02", "gpu-01", "storage-01"] {
            orchestrator.resources().register_node(crate::resource::ResourceNode::new(
                id,
                crate::resource::NodeType::Compute,
                crate::resource::NodeCapacity {
                    cpu: 0.0,
                    memory_gb: 0.0,
                    storage_gb: 0.0,
                    bandwidth_mbps: 0.0,
                    gpu_units: 0,
                },
            ));
        }

        let err = orchestrator
            .orchestrate(simple_request(), Some("corr-1".into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NoSuitableNode);
        assert!(err.is_recoverable());

        let events = orchestrator.bus().event_history(Some(&EventFilter::for_types([
            topics::ORCHESTRATION_ERROR,
        ])));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].correlation_id.as_deref(), Some("corr-1"));
    }

    #[tokio::test]
    async fn allocations_are_released_on_success_and_failure() {
        let orchestrator = orchestrator();
        let before = orchestrator.resources().get_resource_stats();

        let _ = orchestrator.orchestrate(simple_request(), None).await.unwrap();
        let after_success = orchestrator.resources().get_resource_stats();
        assert_eq!(after_success.active_allocations, 0);
        assert!((after_success.average_utilization - before.average_utilization).abs() < 1e-9);

        let mut bad = simple_request();
        bad.elements.clear();
        let _ = orchestrator.orchestrate(bad, None).await;
        assert_eq!(orchestrator.resources().get_resource_stats().active_allocations, 0);
    }

    #[tokio::test]
    async fn sync_jobs_appear_in_listings() {
        let orchestrator = orchestrator();
        let _ = orchestrator.orchestrate(simple_request(), None).await.unwrap();

        let page = orchestrator.list(1, 10);
        assert_eq!(page.total, 1);
        assert_eq!(page.jobs[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn listing_paginates_newest_first() {
        let orchestrator = orchestrator();
        for _ in 0..5 {
            let _ = orchestrator.orchestrate(simple_request(), None).await.unwrap();
        }

        let first = orchestrator.list(1, 2);
        assert_eq!(first.jobs.len(), 2);
        assert_eq!(first.total, 5);
        let third = orchestrator.list(3, 2);
        assert_eq!(third.jobs.len(), 1);

        // Limit is capped at 100.
        let capped = orchestrator.list(1, 10_000);
        assert_eq!(capped.limit, 100);
    }

    #[tokio::test]
    async fn status_falls_back_to_the_database() {
        let collaborators = fast_collaborators();
        let database = collaborators.database.clone();
        let orchestrator = Orchestrator::new(Config::default(), collaborators);

        let snapshot = JobSnapshot::new("archived".into(), simple_request());
        database.save_job(&snapshot).await.unwrap();

        let found = orchestrator.status("archived").await.unwrap();
        assert_eq!(found.id, "archived");

        let err = orchestrator.status("missing").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn details_include_the_endpoint_selection() {
        let orchestrator = orchestrator();
        let outcome = orchestrator.orchestrate(simple_request(), None).await.unwrap();
        let OrchestrationOutcome::Immediate { job_id, .. } = outcome else {
            panic!("expected sync completion");
        };

        let details = orchestrator.details(&job_id).await.unwrap();
        assert_eq!(details.details.job.id, job_id);
        assert_eq!(details.details.elements.len(), 1);
        assert!(details.selected_endpoint.is_some());
    }

    #[tokio::test]
    async fn cancel_round_trip_for_a_pending_job() {
        let orchestrator = orchestrator();
        let outcome = orchestrator.orchestrate(busy_request(), None).await.unwrap();
        let OrchestrationOutcome::Queued { job_id, .. } = outcome else {
            panic!("expected async enqueue");
        };

        // The queue has not been started, so the job is still pending.
        let cancelled = orchestrator.cancel(&job_id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(orchestrator.cancel(&job_id).is_err());
    }

    #[tokio::test]
    async fn readiness_follows_the_database() {
        let orchestrator = orchestrator();
        assert!(orchestrator.ready().await);
    }
}
