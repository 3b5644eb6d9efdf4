//! Store-backed FIFO job queue drained by a cooperative worker pool.
//!
//! One scheduler task admits pending jobs while capacity remains; each
//! admission spawns an independent worker. Workers patch the job store at
//! every transition and the store's broadcast is bridged onto the event bus
//! as `job:update`, which is what SSE subscribers fan out from.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryConfig;
use crate::clock::{Clock, WallTime};
use crate::error::{Error, ErrorKind};
use crate::event_bus::{topics, Event, EventBus, EventData};
use crate::job_store::JobStore;
use crate::model::{JobPatch, JobResult, JobSnapshot, JobStatus, VideoJobRequest};
use crate::resilience::{targets, ResilienceManager, ResilienceOptions};
use crate::services::{BlobStore, ProgressSink, Transcoder};

/// Collaborators a worker needs for one job.
#[derive(Clone)]
pub struct WorkerDeps {
    pub transcoder: Arc<dyn Transcoder>,
    pub blob_store: Arc<dyn BlobStore>,
    pub resilience: Arc<ResilienceManager>,
}

#[derive(Debug, Clone)]
pub struct JobTicket {
    pub job_id: String,
    pub status: JobStatus,
}

struct QueueState {
    pending: VecDeque<String>,
    processing: HashMap<String, CancellationToken>,
}

pub struct JobQueue {
    store: Arc<JobStore>,
    bus: Arc<EventBus>,
    deps: WorkerDeps,
    state: Mutex<QueueState>,
    wakeup: Notify,
    max_concurrent: usize,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    pub fn new(
        store: Arc<JobStore>,
        bus: Arc<EventBus>,
        deps: WorkerDeps,
        max_concurrent: usize,
    ) -> Self {
        JobQueue {
            store,
            bus,
            deps,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                processing: HashMap::new(),
            }),
            wakeup: Notify::new(),
            max_concurrent: max_concurrent.max(1),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            clock: Arc::new(WallTime),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Spawn the scheduler and the store-to-bus bridge.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());

        // Bridge: every patched snapshot becomes a job:update event.
        let bus = self.bus.clone();
        let mut updates = self.store.subscribe();
        let shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = updates.recv() => match received {
                        Ok(snapshot) => {
                            bus.publish(Event::new(
                                topics::JOB_UPDATE,
                                "job_queue",
                                EventData::Job(snapshot),
                            ))
                            .await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "job update bridge lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }));

        // Scheduler: admit while capacity remains, then wait for a wakeup.
        let queue = self.clone();
        let shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                queue.drain();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = queue.wakeup.notified() => {}
                }
            }
        }));
    }

    /// Admit jobs until the pool is full or the queue is empty.
    fn drain(self: &Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let admitted = {
                let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
                if state.processing.len() >= self.max_concurrent {
                    None
                } else {
                    match state.pending.pop_front() {
                        None => None,
                        Some(job_id) => {
                            // A job cancelled while pending is skipped, not run.
                            match self.store.get(&job_id) {
                                Some(snapshot) if snapshot.status == JobStatus::Pending => {
                                    let token = self.shutdown.child_token();
                                    state.processing.insert(job_id.clone(), token.clone());
                                    Some((job_id, token))
                                }
                                _ => continue,
                            }
                        }
                    }
                }
            };

            match admitted {
                None => return,
                Some((job_id, token)) => self.spawn_worker(job_id, token),
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, job_id: String, token: CancellationToken) {
        let queue = self.clone();
        tokio::spawn(async move {
            let started = queue.clock.now_millis();
            let outcome = queue.process(&job_id, &token).await;
            let elapsed = queue.clock.now_millis().saturating_sub(started);

            match outcome {
                Ok(result) => {
                    queue.store.update(&job_id, JobPatch::completed(&result, elapsed));
                    tracing::info!(job_id = %job_id, url = %result.url, elapsed_ms = elapsed, "job completed");
                }
                Err(error) if error.is_cancelled() => {
                    queue.store.update(&job_id, JobPatch::status(JobStatus::Cancelled));
                    tracing::info!(job_id = %job_id, "job cancelled in flight");
                }
                Err(error) => {
                    queue.store.update(&job_id, JobPatch::failed(error.to_string()));
                    tracing::warn!(job_id = %job_id, error = %error, "job failed");
                }
            }

            let mut state = queue.state.lock().unwrap_or_else(|p| p.into_inner());
            state.processing.remove(&job_id);
            drop(state);
            queue.wakeup.notify_one();
        });
    }

    async fn process(&self, job_id: &str, token: &CancellationToken) -> Result<JobResult, Error> {
        let snapshot = self.store.require(job_id)?;
        self.store.update(
            job_id,
            JobPatch::status(JobStatus::Processing)
                .with_progress(1)
                .with_step("downloading"),
        );

        // Transcoder progress (0-100) maps into the 5-89 band; the terminal
        // patches own 90+.
        let store = self.store.clone();
        let progress_job = job_id.to_string();
        let progress: ProgressSink = Arc::new(move |percent, step| {
            let mapped = 5 + (u32::from(percent.min(100)) * 84 / 100) as u8;
            store.update(&progress_job, JobPatch::progress(mapped, step));
        });

        let artifact = {
            let opts = ResilienceOptions::default()
                .with_circuit_breaker(targets::FFMPEG)
                .with_bulkhead(targets::VIDEO_PROCESSING)
                .with_retry(
                    RetryConfig::new(1, 500).retry_on([ErrorKind::TransientExternal]),
                );
            let transcoder = self.deps.transcoder.clone();
            let job_id = job_id.to_string();
            let request = snapshot.request.clone();
            let token = token.clone();
            let progress = progress.clone();
            self.deps
                .resilience
                .execute("queued transcode", &opts, move || {
                    let transcoder = transcoder.clone();
                    let job_id = job_id.clone();
                    let request = request.clone();
                    let progress = progress.clone();
                    let token = token.clone();
                    async move { transcoder.render(&job_id, &request, progress, &token).await }
                })
                .await?
        };

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.store.update(job_id, JobPatch::progress(90, "uploading"));

        let stored = {
            let opts = ResilienceOptions::default()
                .with_circuit_breaker(targets::S3)
                .with_bulkhead(targets::FILE_UPLOAD)
                .with_retry(
                    RetryConfig::new(2, 500).retry_on([ErrorKind::TransientExternal]),
                );
            let blob_store = self.deps.blob_store.clone();
            let path = artifact.path.clone();
            self.deps
                .resilience
                .execute("queued upload", &opts, move || {
                    let blob_store = blob_store.clone();
                    let path = path.clone();
                    async move { blob_store.upload_video(&path).await }
                })
                .await?
        };

        Ok(JobResult {
            url: stored.url,
            bucket: Some(stored.bucket),
            key: Some(stored.key),
            size_bytes: artifact.size_bytes,
        })
    }

    /// Admit a new request; returns its pending ticket.
    pub fn enqueue(&self, job_id: String, request: VideoJobRequest) -> JobTicket {
        self.store.save(job_id.clone(), request);
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.pending.push_back(job_id.clone());
        }
        self.wakeup.notify_one();
        tracing::info!(job_id = %job_id, "job enqueued");
        JobTicket { job_id, status: JobStatus::Pending }
    }

    /// Record a job that already ran to completion on the sync path, so
    /// listings and status lookups stay consistent.
    pub fn record_completed(
        &self,
        job_id: String,
        request: VideoJobRequest,
        result: &JobResult,
        processing_time_ms: u64,
    ) -> String {
        let mut snapshot = JobSnapshot::new(job_id.clone(), request);
        snapshot.status = JobStatus::Completed;
        snapshot.progress_percent = 100;
        snapshot.current_step = Some("completed".into());
        snapshot.result_url = Some(result.url.clone());
        snapshot.file_size_bytes = Some(result.size_bytes);
        snapshot.processing_time_ms = Some(processing_time_ms);
        self.store.save_snapshot(snapshot);
        job_id
    }

    pub fn get_job(&self, job_id: &str) -> Option<JobSnapshot> {
        self.store.get(job_id)
    }

    pub fn list(&self, limit: usize) -> Vec<JobSnapshot> {
        self.store.list(limit)
    }

    /// Cancel a pending or processing job. Terminal and unknown jobs fail
    /// with `NotFound` (the API maps both to 404).
    pub fn cancel(&self, job_id: &str) -> Result<JobSnapshot, Error> {
        let snapshot = self.store.require(job_id)?;
        if snapshot.status.is_terminal() {
            return Err(Error::not_found("cancellable job", job_id));
        }

        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.pending.retain(|id| id != job_id);
            if let Some(token) = state.processing.get(job_id) {
                token.cancel();
            }
        }

        self.store
            .update(job_id, JobPatch::status(JobStatus::Cancelled))
            .ok_or_else(|| Error::not_found("cancellable job", job_id))
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).processing.len()
    }

    /// Stop admitting, cancel in-flight workers, and tear down tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
