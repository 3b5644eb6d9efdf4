//! Step executors: the dispatch table mapping each [`StepKind`] to its
//! behavior. External calls go through the resilience manager under the
//! breaker/bulkhead named for that dependency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::clock::{Sleeper, WallTime};
use crate::error::Error;
use crate::resilience::{targets, ResilienceManager, ResilienceOptions};
use crate::services::{
    BlobStore, JobDatabase, ProgressSink, StorageOperation, TimelineEntry, Transcoder,
};

use super::{StepExecutor, StepKind, StepSpec, WorkflowContext};

/// Collaborators shared by the built-in executors.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub transcoder: Arc<dyn Transcoder>,
    pub blob_store: Arc<dyn BlobStore>,
    pub database: Arc<dyn JobDatabase>,
    pub resilience: Arc<ResilienceManager>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl ExecutorDeps {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        blob_store: Arc<dyn BlobStore>,
        database: Arc<dyn JobDatabase>,
        resilience: Arc<ResilienceManager>,
    ) -> Self {
        ExecutorDeps {
            transcoder,
            blob_store,
            database,
            resilience,
            sleeper: Arc::new(WallTime),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }
}

/// Build the default dispatch table.
pub fn default_executors(deps: ExecutorDeps) -> HashMap<StepKind, Arc<dyn StepExecutor>> {
    let mut table: HashMap<StepKind, Arc<dyn StepExecutor>> = HashMap::new();
    table.insert(StepKind::Validation, Arc::new(ValidationExecutor));
    table.insert(StepKind::ResourceAllocation, Arc::new(ResourceAllocationExecutor));
    table.insert(
        StepKind::MediaDownload,
        Arc::new(MediaDownloadExecutor {
            sleeper: deps.sleeper.clone(),
            per_element: Duration::from_millis(20),
        }),
    );
    table.insert(
        StepKind::VideoProcessing,
        Arc::new(VideoProcessingExecutor {
            transcoder: deps.transcoder.clone(),
            resilience: deps.resilience.clone(),
        }),
    );
    table.insert(
        StepKind::S3Upload,
        Arc::new(S3UploadExecutor {
            blob_store: deps.blob_store.clone(),
            resilience: deps.resilience.clone(),
        }),
    );
    table.insert(
        StepKind::DatabaseUpdate,
        Arc::new(DatabaseUpdateExecutor {
            database: deps.database.clone(),
            resilience: deps.resilience.clone(),
        }),
    );
    table.insert(StepKind::Cleanup, Arc::new(CleanupExecutor));
    table.insert(
        StepKind::DistributedSplit,
        Arc::new(DistributedSplitExecutor { sleeper: deps.sleeper.clone() }),
    );
    table.insert(
        StepKind::DistributedMerge,
        Arc::new(DistributedMergeExecutor { sleeper: deps.sleeper }),
    );
    table
}

struct ValidationExecutor;

#[async_trait]
impl StepExecutor for ValidationExecutor {
    async fn run(
        &self,
        _step: &StepSpec,
        ctx: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, Error> {
        ctx.request.validate()?;
        ctx.report_progress(1, "validating");
        Ok(json!({
            "elements": ctx.request.elements.len(),
            "canvas": format!("{}x{}", ctx.request.width, ctx.request.height),
            "output_format": ctx.request.output_format.to_string(),
        }))
    }
}

struct ResourceAllocationExecutor;

#[async_trait]
impl StepExecutor for ResourceAllocationExecutor {
    async fn run(
        &self,
        _step: &StepSpec,
        ctx: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, Error> {
        match &ctx.allocation {
            Some(allocation) => Ok(json!({
                "allocation_id": allocation.id,
                "node_id": allocation.node_id,
                "gpu": allocation.gpu,
            })),
            None => Err(Error::NoSuitableNode {
                reason: "workflow started without an attached allocation".into(),
            }),
        }
    }
}

struct MediaDownloadExecutor {
    sleeper: Arc<dyn Sleeper>,
    per_element: Duration,
}

#[async_trait]
impl StepExecutor for MediaDownloadExecutor {
    async fn run(
        &self,
        _step: &StepSpec,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, Error> {
        let elements = ctx.request.elements.clone();
        let total = elements.len();
        let mut fetched = Vec::with_capacity(total);
        for (index, element) in elements.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.sleeper.sleep(self.per_element).await;
            let path = format!("/tmp/renderflow/{}/{}.src", ctx.job_id, element.id);
            ctx.artifacts.push(path.clone());
            fetched.push(path);
            let percent = 2 + ((index + 1) * 18 / total.max(1)) as u8;
            ctx.report_progress(percent, "downloading");
        }
        Ok(json!({ "downloaded": fetched.len(), "paths": fetched }))
    }
}

struct VideoProcessingExecutor {
    transcoder: Arc<dyn Transcoder>,
    resilience: Arc<ResilienceManager>,
}

#[async_trait]
impl StepExecutor for VideoProcessingExecutor {
    async fn run(
        &self,
        _step: &StepSpec,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, Error> {
        // Transcoder progress (0-100) lands in the 20-90 band of the job.
        let outer = ctx.progress.clone();
        let sink: ProgressSink = Arc::new(move |percent, _| {
            if let Some(progress) = &outer {
                let mapped = 20 + (u32::from(percent) * 70 / 100) as u8;
                progress(mapped, "transcoding");
            }
        });

        let opts = ResilienceOptions::default()
            .with_circuit_breaker(targets::FFMPEG)
            .with_bulkhead(targets::VIDEO_PROCESSING);

        let transcoder = self.transcoder.clone();
        let job_id = ctx.job_id.clone();
        let request = ctx.request.clone();
        let cancel = cancel.clone();
        let artifact = self
            .resilience
            .execute("video transcode", &opts, move || {
                let transcoder = transcoder.clone();
                let job_id = job_id.clone();
                let request = request.clone();
                let sink = sink.clone();
                let cancel = cancel.clone();
                async move { transcoder.render(&job_id, &request, sink, &cancel).await }
            })
            .await?;

        ctx.variables
            .insert("artifact_path".into(), json!(artifact.path));
        ctx.variables
            .insert("artifact_size".into(), json!(artifact.size_bytes));
        ctx.artifacts.push(artifact.path.clone());

        Ok(json!({
            "path": artifact.path,
            "size_bytes": artifact.size_bytes,
            "media_duration_s": artifact.media_duration.as_secs_f64(),
        }))
    }
}

struct S3UploadExecutor {
    blob_store: Arc<dyn BlobStore>,
    resilience: Arc<ResilienceManager>,
}

#[async_trait]
impl StepExecutor for S3UploadExecutor {
    async fn run(
        &self,
        _step: &StepSpec,
        ctx: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, Error> {
        let path = ctx
            .variables
            .get("artifact_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::internal("upload requested before any artifact was rendered"))?
            .to_string();
        let size_bytes = ctx
            .variables
            .get("artifact_size")
            .and_then(|v| v.as_u64())
            .unwrap_or_default();

        ctx.report_progress(92, "uploading");

        let opts = ResilienceOptions::default()
            .with_circuit_breaker(targets::S3)
            .with_bulkhead(targets::FILE_UPLOAD);
        let blob_store = self.blob_store.clone();
        let stored = self
            .resilience
            .execute("artifact upload", &opts, move || {
                let blob_store = blob_store.clone();
                let path = path.clone();
                async move { blob_store.upload_video(&path).await }
            })
            .await?;

        ctx.result = Some(crate::model::JobResult {
            url: stored.url.clone(),
            bucket: Some(stored.bucket.clone()),
            key: Some(stored.key.clone()),
            size_bytes,
        });
        ctx.report_progress(97, "uploaded");

        Ok(json!(stored))
    }
}

struct DatabaseUpdateExecutor {
    database: Arc<dyn JobDatabase>,
    resilience: Arc<ResilienceManager>,
}

#[async_trait]
impl StepExecutor for DatabaseUpdateExecutor {
    async fn run(
        &self,
        _step: &StepSpec,
        ctx: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, Error> {
        let opts = ResilienceOptions::default()
            .with_circuit_breaker(targets::DATABASE)
            .with_bulkhead(targets::DATABASE_OPS);

        let database = self.database.clone();
        let job_id = ctx.job_id.clone();
        let result = ctx.result.clone();
        self.resilience
            .execute("persist job records", &opts, move || {
                let database = database.clone();
                let job_id = job_id.clone();
                let result = result.clone();
                async move {
                    database
                        .record_timeline(&job_id, TimelineEntry::now("artifact_stored"))
                        .await?;
                    if let Some(result) = &result {
                        database
                            .record_storage_operation(
                                &job_id,
                                StorageOperation {
                                    at: chrono::Utc::now(),
                                    operation: "upload".into(),
                                    bucket: result.bucket.clone().unwrap_or_default(),
                                    key: result.key.clone().unwrap_or_default(),
                                    size_bytes: Some(result.size_bytes),
                                },
                            )
                            .await?;
                    }
                    Ok(())
                }
            })
            .await?;

        Ok(json!({ "recorded": true }))
    }
}

struct CleanupExecutor;

#[async_trait]
impl StepExecutor for CleanupExecutor {
    async fn run(
        &self,
        _step: &StepSpec,
        ctx: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, Error> {
        let removed = ctx.artifacts.len();
        ctx.artifacts.clear();
        ctx.variables.remove("artifact_path");
        ctx.variables.remove("artifact_size");
        ctx.report_progress(99, "cleaning up");
        Ok(json!({ "removed": removed }))
    }
}

struct DistributedSplitExecutor {
    sleeper: Arc<dyn Sleeper>,
}

#[async_trait]
impl StepExecutor for DistributedSplitExecutor {
    async fn run(
        &self,
        _step: &StepSpec,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.sleeper.sleep(Duration::from_millis(10)).await;
        let chunks = ctx.request.elements.len().max(2);
        ctx.variables.insert("chunks".into(), json!(chunks));
        Ok(json!({ "chunks": chunks }))
    }
}

struct DistributedMergeExecutor {
    sleeper: Arc<dyn Sleeper>,
}

#[async_trait]
impl StepExecutor for DistributedMergeExecutor {
    async fn run(
        &self,
        _step: &StepSpec,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.sleeper.sleep(Duration::from_millis(10)).await;
        let chunks = ctx
            .variables
            .get("chunks")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::internal("merge requested before any split"))?;
        Ok(json!({ "merged": chunks }))
    }
}
