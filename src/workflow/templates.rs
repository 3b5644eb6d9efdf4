//! Built-in workflow templates.
//!
//! Retry policies only cover kinds worth another attempt; validation and
//! fatal upstream failures fail the step on the first try.

use std::time::Duration;

use crate::backoff::RetryConfig;
use crate::error::ErrorKind;

use super::{
    RollbackAction, RollbackStrategy, RollbackTrigger, StepKind, StepSpec, Timeouts,
    WorkflowTemplate,
};

pub const QUICK_SYNC: &str = "quick_sync";
pub const BALANCED_ASYNC: &str = "balanced_async";
pub const RESOURCE_INTENSIVE: &str = "resource_intensive";
pub const DISTRIBUTED: &str = "distributed";

fn transient_retry(max_retries: usize, backoff_ms: u64) -> RetryConfig {
    RetryConfig::new(max_retries, backoff_ms)
        .with_max_backoff(backoff_ms * 8)
        .retry_on([
            ErrorKind::TransientExternal,
            ErrorKind::Timeout,
            ErrorKind::CircuitOpen,
        ])
}

fn standard_rollback() -> Vec<RollbackStrategy> {
    vec![
        RollbackStrategy {
            trigger: RollbackTrigger::StepFailure,
            actions: vec![
                RollbackAction::CleanupResources,
                RollbackAction::DeleteFiles,
                RollbackAction::UpdateDatabase,
            ],
        },
        RollbackStrategy {
            trigger: RollbackTrigger::Timeout,
            actions: vec![RollbackAction::CleanupResources, RollbackAction::DeleteFiles],
        },
        RollbackStrategy {
            trigger: RollbackTrigger::ResourceExhaustion,
            actions: vec![
                RollbackAction::CleanupResources,
                RollbackAction::SendNotification,
            ],
        },
        RollbackStrategy {
            trigger: RollbackTrigger::Manual,
            actions: vec![RollbackAction::CleanupResources, RollbackAction::DeleteFiles],
        },
    ]
}

pub fn builtin_templates() -> Vec<WorkflowTemplate> {
    vec![
        WorkflowTemplate {
            name: QUICK_SYNC,
            steps: vec![
                StepSpec::new("validate_request", StepKind::Validation, Duration::from_secs(5))
                    .critical(),
                StepSpec::new("download_media", StepKind::MediaDownload, Duration::from_secs(30))
                    .critical()
                    .with_retry(transient_retry(2, 250)),
                StepSpec::new(
                    "transcode_composition",
                    StepKind::VideoProcessing,
                    Duration::from_secs(60),
                )
                .critical()
                .with_retry(transient_retry(1, 500)),
                StepSpec::new("upload_artifact", StepKind::S3Upload, Duration::from_secs(30))
                    .critical()
                    .with_retry(transient_retry(2, 500)),
                StepSpec::new("cleanup_workspace", StepKind::Cleanup, Duration::from_secs(10)),
            ],
            timeouts: Timeouts {
                total: Duration::from_secs(120),
                step: Duration::from_secs(60),
                idle: Duration::from_secs(30),
                heartbeat: Duration::from_secs(10),
            },
            rollback: standard_rollback(),
        },
        WorkflowTemplate {
            name: BALANCED_ASYNC,
            steps: vec![
                StepSpec::new("validate_request", StepKind::Validation, Duration::from_secs(5))
                    .critical(),
                StepSpec::new(
                    "confirm_allocation",
                    StepKind::ResourceAllocation,
                    Duration::from_secs(10),
                )
                .critical(),
                StepSpec::new("download_media", StepKind::MediaDownload, Duration::from_secs(120))
                    .critical()
                    .with_retry(transient_retry(3, 500)),
                StepSpec::new(
                    "transcode_composition",
                    StepKind::VideoProcessing,
                    Duration::from_secs(300),
                )
                .critical()
                .with_retry(transient_retry(2, 1000)),
                StepSpec::new("upload_artifact", StepKind::S3Upload, Duration::from_secs(120))
                    .critical()
                    .with_retry(transient_retry(3, 1000)),
                StepSpec::new(
                    "persist_records",
                    StepKind::DatabaseUpdate,
                    Duration::from_secs(30),
                )
                .with_retry(transient_retry(2, 500)),
                StepSpec::new("cleanup_workspace", StepKind::Cleanup, Duration::from_secs(15)),
            ],
            timeouts: Timeouts {
                total: Duration::from_secs(600),
                step: Duration::from_secs(300),
                idle: Duration::from_secs(60),
                heartbeat: Duration::from_secs(15),
            },
            rollback: standard_rollback(),
        },
        WorkflowTemplate {
            name: RESOURCE_INTENSIVE,
            steps: vec![
                StepSpec::new("validate_request", StepKind::Validation, Duration::from_secs(5))
                    .critical(),
                StepSpec::new(
                    "confirm_allocation",
                    StepKind::ResourceAllocation,
                    Duration::from_secs(30),
                )
                .critical(),
                StepSpec::new("download_media", StepKind::MediaDownload, Duration::from_secs(300))
                    .critical()
                    .with_retry(transient_retry(3, 1000)),
                StepSpec::new(
                    "transcode_composition",
                    StepKind::VideoProcessing,
                    Duration::from_secs(900),
                )
                .critical()
                .with_retry(transient_retry(2, 2000)),
                StepSpec::new("upload_artifact", StepKind::S3Upload, Duration::from_secs(300))
                    .critical()
                    .with_retry(transient_retry(3, 1000)),
                StepSpec::new(
                    "persist_records",
                    StepKind::DatabaseUpdate,
                    Duration::from_secs(60),
                )
                .with_retry(transient_retry(2, 500)),
                StepSpec::new("cleanup_workspace", StepKind::Cleanup, Duration::from_secs(30)),
            ],
            timeouts: Timeouts {
                total: Duration::from_secs(1800),
                step: Duration::from_secs(900),
                idle: Duration::from_secs(120),
                heartbeat: Duration::from_secs(30),
            },
            rollback: standard_rollback(),
        },
        WorkflowTemplate {
            name: DISTRIBUTED,
            steps: vec![
                StepSpec::new("validate_request", StepKind::Validation, Duration::from_secs(5))
                    .critical(),
                StepSpec::new(
                    "confirm_allocation",
                    StepKind::ResourceAllocation,
                    Duration::from_secs(60),
                )
                .critical(),
                StepSpec::new("download_media", StepKind::MediaDownload, Duration::from_secs(600))
                    .critical()
                    .with_retry(transient_retry(3, 2000)),
                StepSpec::new(
                    "split_into_chunks",
                    StepKind::DistributedSplit,
                    Duration::from_secs(120),
                )
                .critical(),
                StepSpec::new(
                    "transcode_composition",
                    StepKind::VideoProcessing,
                    Duration::from_secs(1800),
                )
                .critical()
                .with_retry(transient_retry(2, 5000)),
                StepSpec::new(
                    "merge_chunks",
                    StepKind::DistributedMerge,
                    Duration::from_secs(300),
                )
                .critical(),
                StepSpec::new("upload_artifact", StepKind::S3Upload, Duration::from_secs(600))
                    .critical()
                    .with_retry(transient_retry(3, 2000)),
                StepSpec::new(
                    "persist_records",
                    StepKind::DatabaseUpdate,
                    Duration::from_secs(60),
                )
                .with_retry(transient_retry(2, 500)),
                StepSpec::new("cleanup_workspace", StepKind::Cleanup, Duration::from_secs(60)),
            ],
            timeouts: Timeouts {
                total: Duration::from_secs(3600),
                step: Duration::from_secs(1800),
                idle: Duration::from_secs(300),
                heartbeat: Duration::from_secs(60),
            },
            rollback: standard_rollback(),
        },
    ]
}
