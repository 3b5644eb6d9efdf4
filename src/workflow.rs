//! Workflow engine: immutable template catalog, per-job materialization,
//! step execution with retry and rollback, and execution metrics.
//!
//! Step behavior is data, not inheritance: each step carries a [`StepKind`]
//! tag and the engine resolves it through a dispatch table of executors.
//! Retries and rollback strategies are attributes on the step/template.

mod executors;
mod templates;

pub use executors::{default_executors, ExecutorDeps};
pub use templates::builtin_templates;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backoff::RetryConfig;
use crate::clock::{Clock, Sleeper, WallTime};
use crate::error::{Error, ErrorKind};
use crate::event_bus::{
    topics, Event, EventBus, EventData, StepEventData, WorkflowEventData,
};
use crate::model::{JobAnalysis, JobResult, VideoJobRequest, REFERENCE_PIXELS};
use crate::resource::{Allocation, ResourceManager};
use crate::services::{JobDatabase, ProgressSink, TimelineEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Validation,
    ResourceAllocation,
    MediaDownload,
    VideoProcessing,
    S3Upload,
    DatabaseUpdate,
    Cleanup,
    DistributedSplit,
    DistributedMerge,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Validation => "validation",
            StepKind::ResourceAllocation => "resource_allocation",
            StepKind::MediaDownload => "media_download",
            StepKind::VideoProcessing => "video_processing",
            StepKind::S3Upload => "s3_upload",
            StepKind::DatabaseUpdate => "database_update",
            StepKind::Cleanup => "cleanup",
            StepKind::DistributedSplit => "distributed_split",
            StepKind::DistributedMerge => "distributed_merge",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: String,
    pub kind: StepKind,
    pub timeout: Duration,
    pub retry: Option<RetryConfig>,
    pub critical: bool,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, kind: StepKind, timeout: Duration) -> Self {
        StepSpec { name: name.into(), kind, timeout, retry: None, critical: false }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub total: Duration,
    pub step: Duration,
    pub idle: Duration,
    pub heartbeat: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    StepFailure,
    Timeout,
    ResourceExhaustion,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackAction {
    CleanupResources,
    DeleteFiles,
    UpdateDatabase,
    SendNotification,
}

#[derive(Debug, Clone)]
pub struct RollbackStrategy {
    pub trigger: RollbackTrigger,
    pub actions: Vec<RollbackAction>,
}

/// Immutable catalog entry.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    pub name: &'static str,
    pub steps: Vec<StepSpec>,
    pub timeouts: Timeouts,
    pub rollback: Vec<RollbackStrategy>,
}

/// One job's concrete workflow, copied from a template.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub id: String,
    pub template: String,
    pub steps: Vec<StepSpec>,
    pub timeouts: Timeouts,
    pub rollback: Vec<RollbackStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Initialized,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    RollingBack,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Initialized => "initialized",
            WorkflowState::Running => "running",
            WorkflowState::Paused => "paused",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
            WorkflowState::RollingBack => "rolling_back",
        }
    }
}

/// Mutable state threaded through the executors of one run.
pub struct WorkflowContext {
    pub job_id: String,
    pub request: VideoJobRequest,
    pub analysis: JobAnalysis,
    pub allocation: Option<Allocation>,
    pub step_results: HashMap<String, serde_json::Value>,
    pub variables: HashMap<String, serde_json::Value>,
    pub artifacts: Vec<String>,
    pub result: Option<JobResult>,
    pub progress: Option<ProgressSink>,
    pub correlation_id: Option<String>,
}

impl WorkflowContext {
    pub fn new(job_id: String, request: VideoJobRequest, analysis: JobAnalysis) -> Self {
        WorkflowContext {
            job_id,
            request,
            analysis,
            allocation: None,
            step_results: HashMap::new(),
            variables: HashMap::new(),
            artifacts: Vec::new(),
            result: None,
            progress: None,
            correlation_id: None,
        }
    }

    pub fn with_allocation(mut self, allocation: Allocation) -> Self {
        self.allocation = Some(allocation);
        self
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn report_progress(&self, percent: u8, step: &str) {
        if let Some(progress) = &self.progress {
            progress(percent, step);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowMetrics {
    pub step_durations_ms: HashMap<String, u64>,
    pub retry_count: usize,
    pub error_count: usize,
    pub total_duration_ms: Option<u64>,
}

pub struct WorkflowExecution {
    pub definition: WorkflowDefinition,
    pub state: WorkflowState,
    pub current_step: usize,
    pub context: WorkflowContext,
    pub metrics: WorkflowMetrics,
    pub error: Option<Error>,
    pub rollback_executed: bool,
}

impl WorkflowExecution {
    pub fn succeeded(&self) -> bool {
        self.state == WorkflowState::Completed
    }
}

#[async_trait::async_trait]
pub trait StepExecutor: Send + Sync {
    async fn run(
        &self,
        step: &StepSpec,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, Error>;
}

/// Collaborators needed by rollback actions.
#[derive(Clone)]
pub struct RollbackHooks {
    pub resources: Arc<ResourceManager>,
    pub database: Arc<dyn JobDatabase>,
}

pub struct WorkflowEngine {
    templates: HashMap<String, WorkflowTemplate>,
    executors: HashMap<StepKind, Arc<dyn StepExecutor>>,
    hooks: RollbackHooks,
    bus: Arc<EventBus>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl WorkflowEngine {
    pub fn new(
        bus: Arc<EventBus>,
        hooks: RollbackHooks,
        executors: HashMap<StepKind, Arc<dyn StepExecutor>>,
    ) -> Self {
        let templates = builtin_templates()
            .into_iter()
            .map(|t| (t.name.to_string(), t))
            .collect();
        WorkflowEngine {
            templates,
            executors,
            hooks,
            bus,
            sleeper: Arc::new(WallTime),
            clock: Arc::new(WallTime),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn template(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.templates.get(name)
    }

    /// Template selection is a pure function of the request shape.
    pub fn select_template(request: &VideoJobRequest) -> &'static str {
        let elements = request.elements.len();
        let pixels = request.pixels();
        if elements <= 2 && pixels <= REFERENCE_PIXELS && !request.has_video() {
            templates::QUICK_SYNC
        } else if elements <= 5 && pixels <= 2560 * 1440 {
            templates::BALANCED_ASYNC
        } else if elements <= 10 && pixels <= 3840 * 2160 {
            templates::RESOURCE_INTENSIVE
        } else {
            templates::DISTRIBUTED
        }
    }

    /// Copy the selected template into a per-job definition.
    pub fn materialize(&self, request: &VideoJobRequest) -> Result<WorkflowDefinition, Error> {
        let name = Self::select_template(request);
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| Error::internal(format!("template '{name}' missing from catalog")))?;
        Ok(WorkflowDefinition {
            id: Uuid::new_v4().to_string(),
            template: template.name.to_string(),
            steps: template.steps.clone(),
            timeouts: template.timeouts.clone(),
            rollback: template.rollback.clone(),
        })
    }

    /// Run a materialized workflow to a terminal state. Failures are
    /// captured on the returned execution, never thrown.
    pub async fn execute(
        &self,
        definition: WorkflowDefinition,
        context: WorkflowContext,
        cancel: &CancellationToken,
    ) -> WorkflowExecution {
        let started = self.clock.now_millis();
        let deadline = started + definition.timeouts.total.as_millis() as u64;

        let mut execution = WorkflowExecution {
            definition,
            state: WorkflowState::Running,
            current_step: 0,
            context,
            metrics: WorkflowMetrics::default(),
            error: None,
            rollback_executed: false,
        };
        tracing::info!(
            workflow_id = %execution.definition.id,
            template = %execution.definition.template,
            job_id = %execution.context.job_id,
            "workflow started"
        );

        let steps = execution.definition.steps.clone();
        for (index, step) in steps.iter().enumerate() {
            execution.current_step = index;

            if cancel.is_cancelled() {
                return self.finish_cancelled(execution, started).await;
            }

            let now = self.clock.now_millis();
            if now >= deadline {
                let error = Error::Timeout {
                    operation: format!("workflow {}", execution.definition.template),
                    elapsed: Duration::from_millis(now - started),
                    limit: execution.definition.timeouts.total,
                };
                return self.finish_failed(execution, error, started).await;
            }

            match self.run_step(&mut execution, step, index, deadline, cancel).await {
                StepOutcome::Completed => {}
                StepOutcome::SkippedAfterFailure => {}
                StepOutcome::Cancelled => {
                    return self.finish_cancelled(execution, started).await;
                }
                StepOutcome::Fatal(error) => {
                    return self.finish_failed(execution, error, started).await;
                }
            }
        }

        execution.state = WorkflowState::Completed;
        execution.metrics.total_duration_ms =
            Some(self.clock.now_millis().saturating_sub(started));
        self.publish_workflow_event(
            topics::WORKFLOW_COMPLETED,
            &execution,
            execution.metrics.total_duration_ms,
        )
        .await;
        tracing::info!(
            workflow_id = %execution.definition.id,
            total_ms = execution.metrics.total_duration_ms,
            "workflow completed"
        );
        execution
    }

    async fn run_step(
        &self,
        execution: &mut WorkflowExecution,
        step: &StepSpec,
        index: usize,
        deadline: u64,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        self.publish_step_event(topics::STEP_STARTED, execution, step, 1, None, None)
            .await;

        let Some(executor) = self.executors.get(&step.kind).cloned() else {
            // A step the engine cannot dispatch is a configuration bug.
            return StepOutcome::Fatal(Error::internal(format!(
                "no executor registered for step type '{}'",
                step.kind
            )));
        };

        let retry = step.retry.clone().unwrap_or(RetryConfig::new(0, 0));
        let retryable = retry.retryable();
        let backoff = retry.backoff();
        let max_retries = retry.max_retries;

        let mut attempt = 0usize;
        loop {
            attempt += 1;

            let now = self.clock.now_millis();
            let remaining_total = Duration::from_millis(deadline.saturating_sub(now));
            let step_timeout = step.timeout.min(remaining_total).max(Duration::from_millis(1));

            let step_started = self.clock.now_millis();
            let result = match tokio::time::timeout(
                step_timeout,
                executor.run(step, &mut execution.context, cancel),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    operation: format!("step {}", step.name),
                    elapsed: step_timeout,
                    limit: step.timeout,
                }),
            };
            let duration_ms = self.clock.now_millis().saturating_sub(step_started);

            match result {
                Ok(value) => {
                    *execution
                        .metrics
                        .step_durations_ms
                        .entry(step.name.clone())
                        .or_default() += duration_ms;
                    execution.context.step_results.insert(step.name.clone(), value);
                    self.publish_step_event(
                        topics::STEP_COMPLETED,
                        execution,
                        step,
                        attempt,
                        Some(duration_ms),
                        None,
                    )
                    .await;
                    return StepOutcome::Completed;
                }
                Err(error) => {
                    *execution
                        .metrics
                        .step_durations_ms
                        .entry(step.name.clone())
                        .or_default() += duration_ms;
                    execution.metrics.error_count += 1;

                    if error.is_cancelled() || cancel.is_cancelled() {
                        return StepOutcome::Cancelled;
                    }

                    let may_retry = attempt <= max_retries && retryable.matches(&error);
                    if may_retry {
                        execution.metrics.retry_count += 1;
                        let delay = retry.jitter().apply(backoff.delay(attempt));
                        tracing::warn!(
                            step = %step.name,
                            attempt,
                            error = %error,
                            delay_ms = delay.as_millis() as u64,
                            "step failed; retrying"
                        );
                        self.sleeper.sleep(delay).await;
                        continue;
                    }

                    self.publish_step_event(
                        topics::STEP_FAILED,
                        execution,
                        step,
                        attempt,
                        Some(duration_ms),
                        Some(error.to_string()),
                    )
                    .await;

                    if step.critical {
                        return StepOutcome::Fatal(error);
                    }
                    tracing::warn!(
                        step = %step.name,
                        index,
                        error = %error,
                        "non-critical step failed; continuing"
                    );
                    return StepOutcome::SkippedAfterFailure;
                }
            }
        }
    }

    async fn finish_failed(
        &self,
        mut execution: WorkflowExecution,
        error: Error,
        started: u64,
    ) -> WorkflowExecution {
        execution.state = WorkflowState::RollingBack;
        let trigger = Self::categorize(&error);
        execution.rollback_executed = self.rollback(&mut execution, trigger).await;
        execution.state = WorkflowState::Failed;
        execution.error = Some(error.clone());
        execution.metrics.total_duration_ms =
            Some(self.clock.now_millis().saturating_sub(started));
        self.publish_workflow_event(
            topics::WORKFLOW_FAILED,
            &execution,
            execution.metrics.total_duration_ms,
        )
        .await;
        tracing::warn!(
            workflow_id = %execution.definition.id,
            error = %error,
            trigger = ?trigger,
            rollback = execution.rollback_executed,
            "workflow failed"
        );
        execution
    }

    async fn finish_cancelled(
        &self,
        mut execution: WorkflowExecution,
        started: u64,
    ) -> WorkflowExecution {
        execution.rollback_executed = self.rollback(&mut execution, RollbackTrigger::Manual).await;
        execution.state = WorkflowState::Cancelled;
        execution.error = Some(Error::Cancelled);
        execution.metrics.total_duration_ms =
            Some(self.clock.now_millis().saturating_sub(started));
        self.publish_workflow_event(
            topics::WORKFLOW_CANCELLED,
            &execution,
            execution.metrics.total_duration_ms,
        )
        .await;
        execution
    }

    /// Map an error to the rollback trigger category it matches.
    fn categorize(error: &Error) -> RollbackTrigger {
        let message = error.to_string().to_lowercase();
        if error.kind() == ErrorKind::Timeout || message.contains("timed out") {
            RollbackTrigger::Timeout
        } else if error.kind() == ErrorKind::NoSuitableNode
            || message.contains("resource")
            || message.contains("memory")
        {
            RollbackTrigger::ResourceExhaustion
        } else {
            RollbackTrigger::StepFailure
        }
    }

    /// Execute every strategy whose trigger matches. Rollback failures are
    /// logged and swallowed.
    async fn rollback(&self, execution: &mut WorkflowExecution, trigger: RollbackTrigger) -> bool {
        let strategies: Vec<RollbackStrategy> = execution
            .definition
            .rollback
            .iter()
            .filter(|s| s.trigger == trigger)
            .cloned()
            .collect();
        if strategies.is_empty() {
            return false;
        }

        for strategy in &strategies {
            for action in &strategy.actions {
                if let Err(error) = self.run_rollback_action(execution, *action).await {
                    tracing::warn!(
                        workflow_id = %execution.definition.id,
                        action = ?action,
                        error = %error,
                        "rollback action failed"
                    );
                }
            }
        }
        true
    }

    async fn run_rollback_action(
        &self,
        execution: &mut WorkflowExecution,
        action: RollbackAction,
    ) -> Result<(), Error> {
        match action {
            RollbackAction::CleanupResources => {
                if let Some(allocation) = execution.context.allocation.take() {
                    self.hooks.resources.release(&allocation.id).await;
                }
                Ok(())
            }
            RollbackAction::DeleteFiles => {
                let removed = execution.context.artifacts.len();
                execution.context.artifacts.clear();
                tracing::debug!(removed, "rollback removed intermediate artifacts");
                Ok(())
            }
            RollbackAction::UpdateDatabase => {
                self.hooks
                    .database
                    .record_timeline(
                        &execution.context.job_id,
                        TimelineEntry::now("rollback").with_detail(format!(
                            "workflow {} rolled back",
                            execution.definition.id
                        )),
                    )
                    .await
            }
            RollbackAction::SendNotification => {
                self.bus
                    .publish(Event::new(
                        "notification:rollback",
                        "workflow_engine",
                        EventData::Opaque(serde_json::json!({
                            "job_id": execution.context.job_id,
                            "workflow_id": execution.definition.id,
                        })),
                    ))
                    .await;
                Ok(())
            }
        }
    }

    async fn publish_step_event(
        &self,
        topic: &str,
        execution: &WorkflowExecution,
        step: &StepSpec,
        attempt: usize,
        duration_ms: Option<u64>,
        error: Option<String>,
    ) {
        let mut event = Event::new(
            topic,
            "workflow_engine",
            EventData::Step(StepEventData {
                workflow_id: execution.definition.id.clone(),
                job_id: execution.context.job_id.clone(),
                step: step.name.clone(),
                step_type: step.kind.as_str().to_string(),
                attempt,
                duration_ms,
                error,
            }),
        )
        .with_causation(execution.definition.id.clone());
        if let Some(correlation) = &execution.context.correlation_id {
            event = event.with_correlation(correlation.clone());
        }
        self.bus.publish(event).await;
    }

    async fn publish_workflow_event(
        &self,
        topic: &str,
        execution: &WorkflowExecution,
        duration_ms: Option<u64>,
    ) {
        let mut event = Event::new(
            topic,
            "workflow_engine",
            EventData::Workflow(WorkflowEventData {
                workflow_id: execution.definition.id.clone(),
                job_id: execution.context.job_id.clone(),
                state: execution.state.as_str().to_string(),
                duration_ms,
                error: execution.error.as_ref().map(|e| e.to_string()),
            }),
        )
        .with_causation(execution.definition.id.clone());
        if let Some(correlation) = &execution.context.correlation_id {
            event = event.with_correlation(correlation.clone());
        }
        self.bus.publish(event).await;
    }
}

enum StepOutcome {
    Completed,
    SkippedAfterFailure,
    Cancelled,
    Fatal(Error),
}
