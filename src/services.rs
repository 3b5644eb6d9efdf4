//! Seams for the external collaborators: the transcoder, the blob store,
//! and the persistent job database.
//!
//! Only the interfaces matter to the orchestration core. The simulated
//! implementations here are deterministic stand-ins that let the binary run
//! end-to-end without external services; tests swap in doubles that block,
//! fail, or count calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::{Sleeper, WallTime};
use crate::error::Error;
use crate::model::{JobSnapshot, VideoElement, VideoJobRequest};

/// Progress callback: percentage (0-100) and the human-readable step name.
pub type ProgressSink = Arc<dyn Fn(u8, &str) + Send + Sync>;

/// No-op progress sink.
pub fn discard_progress() -> ProgressSink {
    Arc::new(|_, _| {})
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedArtifact {
    pub path: String,
    pub size_bytes: u64,
    pub media_duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    pub step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TimelineEntry {
    pub fn now(step: impl Into<String>) -> Self {
        TimelineEntry { at: Utc::now(), step: step.into(), detail: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageOperation {
    pub at: DateTime<Utc>,
    pub operation: String,
    pub bucket: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Job plus its elements, timeline, and storage operations, as served by
/// the details endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct JobDetails {
    pub job: JobSnapshot,
    pub elements: Vec<VideoElement>,
    pub timeline: Vec<TimelineEntry>,
    pub storage_operations: Vec<StorageOperation>,
}

/// FFmpeg-like renderer invoked as a black box.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Render the composition. Implementations must observe `cancel`
    /// between units of work and report progress through `progress`.
    async fn render(
        &self,
        job_id: &str,
        request: &VideoJobRequest,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RenderedArtifact, Error>;
}

/// Object store for finished artifacts.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload_video(&self, path: &str) -> Result<StoredObject, Error>;
    async fn health_check(&self) -> Result<(), Error>;
}

/// Persistent job/element/timeline records.
#[async_trait]
pub trait JobDatabase: Send + Sync {
    async fn save_job(&self, snapshot: &JobSnapshot) -> Result<(), Error>;
    async fn get_job(&self, id: &str) -> Result<Option<JobSnapshot>, Error>;
    async fn record_timeline(&self, job_id: &str, entry: TimelineEntry) -> Result<(), Error>;
    async fn record_storage_operation(
        &self,
        job_id: &str,
        operation: StorageOperation,
    ) -> Result<(), Error>;
    async fn job_details(&self, id: &str) -> Result<Option<JobDetails>, Error>;
    async fn health_check(&self) -> Result<(), Error>;
}

/// Deterministic in-process renderer: ticks through a fixed number of
/// progress updates, sleeping between them, and derives the artifact size
/// from the composition.
pub struct SimulatedTranscoder {
    sleeper: Arc<dyn Sleeper>,
    tick: Duration,
    ticks: u8,
}

impl SimulatedTranscoder {
    pub fn new(tick: Duration, ticks: u8) -> Self {
        SimulatedTranscoder {
            sleeper: Arc::new(WallTime),
            tick,
            ticks: ticks.max(1),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }
}

impl Default for SimulatedTranscoder {
    fn default() -> Self {
        SimulatedTranscoder::new(Duration::from_millis(25), 8)
    }
}

#[async_trait]
impl Transcoder for SimulatedTranscoder {
    async fn render(
        &self,
        job_id: &str,
        request: &VideoJobRequest,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RenderedArtifact, Error> {
        for tick in 1..=self.ticks {
            if cancel.is_cancelled() {
                tracing::info!(job_id, "transcode aborted by cancellation");
                return Err(Error::Cancelled);
            }
            self.sleeper.sleep(self.tick).await;
            let percent = (u32::from(tick) * 100 / u32::from(self.ticks)) as u8;
            progress(percent, "transcoding");
        }

        // Size scales with canvas area and element count; bitrate-ish
        // constant keeps numbers plausible.
        let size_bytes = (request.pixels() / 256) * request.elements.len() as u64 + 64 * 1024;
        let media_duration = request
            .elements
            .iter()
            .filter_map(|e| e.duration)
            .fold(5.0_f64, f64::max);

        Ok(RenderedArtifact {
            path: format!("/tmp/renderflow/{job_id}.{}", request.output_format),
            size_bytes,
            media_duration: Duration::from_secs_f64(media_duration),
        })
    }
}

/// In-process blob store producing stable URLs.
pub struct SimulatedBlobStore {
    sleeper: Arc<dyn Sleeper>,
    latency: Duration,
    bucket: String,
}

impl SimulatedBlobStore {
    pub fn new(bucket: impl Into<String>, latency: Duration) -> Self {
        SimulatedBlobStore {
            sleeper: Arc::new(WallTime),
            latency,
            bucket: bucket.into(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }
}

impl Default for SimulatedBlobStore {
    fn default() -> Self {
        SimulatedBlobStore::new("renderflow-artifacts", Duration::from_millis(15))
    }
}

#[async_trait]
impl BlobStore for SimulatedBlobStore {
    async fn upload_video(&self, path: &str) -> Result<StoredObject, Error> {
        self.sleeper.sleep(self.latency).await;
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let key = format!("videos/{}-{file_name}", Uuid::new_v4());
        Ok(StoredObject {
            url: format!("https://storage.example.com/{}/{key}", self.bucket),
            bucket: self.bucket.clone(),
            key,
        })
    }

    async fn health_check(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Default)]
struct DatabaseTables {
    jobs: HashMap<String, JobSnapshot>,
    timeline: HashMap<String, Vec<TimelineEntry>>,
    storage_operations: HashMap<String, Vec<StorageOperation>>,
}

/// In-memory job database.
#[derive(Default)]
pub struct InMemoryJobDatabase {
    tables: Mutex<DatabaseTables>,
}

impl InMemoryJobDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobDatabase for InMemoryJobDatabase {
    async fn save_job(&self, snapshot: &JobSnapshot) -> Result<(), Error> {
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        tables.jobs.insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobSnapshot>, Error> {
        let tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        Ok(tables.jobs.get(id).cloned())
    }

    async fn record_timeline(&self, job_id: &str, entry: TimelineEntry) -> Result<(), Error> {
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        tables.timeline.entry(job_id.to_string()).or_default().push(entry);
        Ok(())
    }

    async fn record_storage_operation(
        &self,
        job_id: &str,
        operation: StorageOperation,
    ) -> Result<(), Error> {
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        tables
            .storage_operations
            .entry(job_id.to_string())
            .or_default()
            .push(operation);
        Ok(())
    }

    async fn job_details(&self, id: &str) -> Result<Option<JobDetails>, Error> {
        let tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        Ok(tables.jobs.get(id).map(|job| JobDetails {
            job: job.clone(),
            elements: job.request.elements.clone(),
            timeline: tables.timeline.get(id).cloned().unwrap_or_default(),
            storage_operations: tables.storage_operations.get(id).cloned().unwrap_or_default(),
        }))
    }

    async fn health_check(&self) -> Result<(), Error> {
        Ok(())
    }
}
