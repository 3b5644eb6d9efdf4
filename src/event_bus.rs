//! In-process pub/sub broker.
//!
//! Dispatch is synchronous from the publisher's perspective: `publish`
//! returns once every matching subscription has seen the event (or exhausted
//! its retry budget). The live subscription set is an immutable snapshot
//! behind `ArcSwap`, so publishing never observes a half-updated registry.
//!
//! Handlers must not block for unbounded time; long work belongs on a task,
//! not inside a handler.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::backoff::RetryConfig;
use crate::circuit_breaker::CircuitBreakerSnapshot;
use crate::clock::{Sleeper, WallTime};
use crate::error::Error;
use crate::model::JobSnapshot;
use crate::retry::RetryPolicy;

/// Well-known event type names.
pub mod topics {
    pub const JOB_UPDATE: &str = "job:update";
    pub const STEP_STARTED: &str = "workflow:step_started";
    pub const STEP_COMPLETED: &str = "workflow:step_completed";
    pub const STEP_FAILED: &str = "workflow:step_failed";
    pub const WORKFLOW_COMPLETED: &str = "workflow:completed";
    pub const WORKFLOW_FAILED: &str = "workflow:failed";
    pub const WORKFLOW_CANCELLED: &str = "workflow:cancelled";
    pub const RESOURCE_ALLOCATED: &str = "resource:allocated";
    pub const RESOURCE_RELEASED: &str = "resource:released";
    pub const NODE_FAILED: &str = "resource:node_failed";
    pub const NODE_RECOVERED: &str = "resource:node_recovered";
    pub const HIGH_UTILIZATION: &str = "resource:high_utilization";
    pub const ENDPOINT_STATUS_CHANGED: &str = "endpoint:status_changed";
    pub const HEALTH_STATUS_CHANGED: &str = "health:status_changed";
    pub const RESILIENCE_METRICS: &str = "resilience.metrics";
    pub const ORCHESTRATION_ERROR: &str = "orchestration:error";
    pub const DEAD_LETTER: &str = "dead_letter";
}

/// Typed payloads for the closed set of event kinds. Anything outside the
/// closed set travels as an opaque JSON bag.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventData {
    Job(JobSnapshot),
    Step(StepEventData),
    Workflow(WorkflowEventData),
    Node(NodeEventData),
    Allocation(AllocationEventData),
    Endpoint(EndpointEventData),
    Health(HealthEventData),
    Resilience(ResilienceMetricsData),
    DeadLetter(DeadLetterData),
    Orchestration(OrchestrationEventData),
    Opaque(serde_json::Value),
}

impl EventData {
    /// JSON view used for filter field equality.
    pub fn as_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepEventData {
    pub workflow_id: String,
    pub job_id: String,
    pub step: String,
    pub step_type: String,
    pub attempt: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowEventData {
    pub workflow_id: String,
    pub job_id: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeEventData {
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_utilization: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationEventData {
    pub allocation_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointEventData {
    pub endpoint_id: String,
    pub previous: String,
    pub current: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthEventData {
    pub previous: String,
    pub current: String,
    pub failing: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResilienceMetricsData {
    pub breakers: Vec<CircuitBreakerSnapshot>,
    pub bulkheads: Vec<crate::bulkhead::BulkheadStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterData {
    pub original_type: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationEventData {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: String,
    pub event_type: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: EventData) -> Self {
        Event {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now(),
            data,
            metadata: HashMap::new(),
            correlation_id: None,
            causation_id: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

/// Predicate over events: source membership, a time window, and exact
/// equality on selected data/metadata fields.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub sources: Option<Vec<String>>,
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub data_equals: HashMap<String, serde_json::Value>,
    pub metadata_equals: HashMap<String, String>,
}

impl EventFilter {
    pub fn for_types(types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        EventFilter {
            event_types: Some(types.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn from_sources(mut self, sources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.sources = Some(sources.into_iter().map(Into::into).collect());
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.time_range = Some((start, end));
        self
    }

    pub fn data_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data_equals.insert(key.into(), value);
        self
    }

    pub fn metadata_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata_equals.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == &event.event_type) {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            if !sources.iter().any(|s| s == &event.source) {
                return false;
            }
        }
        if let Some((start, end)) = &self.time_range {
            if event.timestamp < *start || event.timestamp > *end {
                return false;
            }
        }
        if !self.data_equals.is_empty() {
            let value = event.data.as_value();
            for (key, expected) in &self.data_equals {
                if value.get(key) != Some(expected) {
                    return false;
                }
            }
        }
        for (key, expected) in &self.metadata_equals {
            if event.metadata.get(key) != Some(expected) {
                return false;
            }
        }
        true
    }
}

/// What a subscription listens to.
#[derive(Debug, Clone)]
pub enum Topics {
    All,
    Types(Vec<String>),
}

impl Topics {
    pub fn of(types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Topics::Types(types.into_iter().map(Into::into).collect())
    }

    fn matches(&self, event_type: &str) -> bool {
        match self {
            Topics::All => true,
            Topics::Types(types) => types.iter().any(|t| t == event_type),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub filter: Option<EventFilter>,
    /// Higher priorities are invoked first within a publish.
    pub priority: i32,
    pub retry: Option<RetryConfig>,
    /// Copy the event to the dead-letter ring when the retry budget is
    /// exhausted.
    pub dead_letter: bool,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), Error>;
}

type HandlerFn = dyn Fn(Event) -> BoxFuture<'static, Result<(), Error>> + Send + Sync;

struct FnHandler(Box<HandlerFn>);

#[async_trait]
impl EventHandler for FnHandler {
    async fn handle(&self, event: &Event) -> Result<(), Error> {
        (self.0)(event.clone()).await
    }
}

struct SubscriptionEntry {
    id: String,
    topics: Topics,
    options: SubscribeOptions,
    handler: Arc<dyn EventHandler>,
    seq: u64,
}

/// Entry in the dead-letter ring: the annotated copy plus the original for
/// reprocessing.
#[derive(Clone)]
pub struct DeadLetterEntry {
    pub id: String,
    pub event: Event,
    original: Event,
}

pub struct EventBus {
    subscriptions: ArcSwap<Vec<Arc<SubscriptionEntry>>>,
    seq: AtomicU64,
    history: Mutex<VecDeque<Event>>,
    history_cap: usize,
    dead_letters: Mutex<VecDeque<DeadLetterEntry>>,
    dead_letter_cap: usize,
    notifications: broadcast::Sender<Event>,
    sleeper: Arc<dyn Sleeper>,
}

impl EventBus {
    pub fn new(history_cap: usize, dead_letter_cap: usize) -> Self {
        let (notifications, _) = broadcast::channel(256);
        EventBus {
            subscriptions: ArcSwap::from_pointee(Vec::new()),
            seq: AtomicU64::new(0),
            history: Mutex::new(VecDeque::new()),
            history_cap,
            dead_letters: Mutex::new(VecDeque::new()),
            dead_letter_cap,
            notifications,
            sleeper: Arc::new(WallTime),
        }
    }

    /// Override the sleeper used between handler retries (tests).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn subscribe(
        &self,
        topics: Topics,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let entry = Arc::new(SubscriptionEntry {
            id: id.clone(),
            topics,
            options,
            handler,
            seq: self.seq.fetch_add(1, Ordering::AcqRel),
        });

        self.subscriptions.rcu(|current| {
            let mut next: Vec<Arc<SubscriptionEntry>> = current.iter().cloned().collect();
            next.push(entry.clone());
            next.sort_by(|a, b| {
                b.options
                    .priority
                    .cmp(&a.options.priority)
                    .then(a.seq.cmp(&b.seq))
            });
            next
        });
        id
    }

    /// Convenience wrapper for closure handlers.
    pub fn subscribe_fn<F, Fut>(&self, topics: Topics, options: SubscribeOptions, f: F) -> String
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Error>> + Send + 'static,
    {
        let handler = FnHandler(Box::new(move |event| Box::pin(f(event))));
        self.subscribe(topics, Arc::new(handler), options)
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut removed = false;
        self.subscriptions.rcu(|current| {
            let next: Vec<Arc<SubscriptionEntry>> =
                current.iter().filter(|e| e.id != id).cloned().collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load().len()
    }

    /// Publish one event: record it, then invoke matching handlers in
    /// priority-then-subscription order. A handler failure never prevents
    /// later handlers from running.
    pub async fn publish(&self, event: Event) {
        self.record(&event);
        let _ = self.notifications.send(event.clone());
        self.dispatch(&event).await;
    }

    pub async fn publish_batch(&self, events: Vec<Event>) {
        for event in events {
            self.publish(event).await;
        }
    }

    /// Deliver an event that originated on another node. Externally-sourced
    /// events go through the same local dispatch but are never forwarded
    /// anywhere else, so a transport wired to `publish` cannot loop.
    pub async fn dispatch_external(&self, event: Event) {
        self.record(&event);
        let _ = self.notifications.send(event.clone());
        self.dispatch(&event).await;
    }

    /// Wait until an event of `event_type` matching `filter` is published.
    pub async fn wait_for_event(
        &self,
        event_type: &str,
        timeout: Duration,
        filter: Option<EventFilter>,
    ) -> Result<Event, Error> {
        let mut rx = self.notifications.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout {
                    operation: format!("wait for event '{event_type}'"),
                    elapsed: timeout,
                    limit: timeout,
                });
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(event)) => {
                    if event.event_type == event_type
                        && filter.as_ref().map_or(true, |f| f.matches(&event))
                    {
                        return Ok(event);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(Error::internal("event bus notification channel closed"));
                }
                Err(_) => {
                    return Err(Error::Timeout {
                        operation: format!("wait for event '{event_type}'"),
                        elapsed: timeout,
                        limit: timeout,
                    });
                }
            }
        }
    }

    pub fn event_history(&self, filter: Option<&EventFilter>) -> Vec<Event> {
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history
            .iter()
            .filter(|e| filter.map_or(true, |f| f.matches(e)))
            .cloned()
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Replay a dead-lettered event through normal dispatch. Removes the
    /// entry; a second failure will dead-letter it again.
    pub async fn reprocess_dead_letter(&self, id: &str) -> Result<(), Error> {
        let original = {
            let mut ring = self.dead_letters.lock().unwrap_or_else(|p| p.into_inner());
            let index = ring
                .iter()
                .position(|entry| entry.id == id)
                .ok_or_else(|| Error::not_found("dead letter", id))?;
            ring.remove(index).map(|entry| entry.original)
        };
        if let Some(original) = original {
            self.publish(original).await;
        }
        Ok(())
    }

    fn record(&self, event: &Event) {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.push_back(event.clone());
        while history.len() > self.history_cap {
            history.pop_front();
        }
    }

    async fn dispatch(&self, event: &Event) {
        let subscriptions = self.subscriptions.load_full();
        for entry in subscriptions.iter() {
            if !entry.topics.matches(&event.event_type) {
                continue;
            }
            if let Some(filter) = &entry.options.filter {
                if !filter.matches(event) {
                    continue;
                }
            }
            self.deliver(entry, event).await;
        }
    }

    async fn deliver(&self, entry: &SubscriptionEntry, event: &Event) {
        let result = match &entry.options.retry {
            None => entry.handler.handle(event).await,
            Some(config) => {
                let policy =
                    RetryPolicy::from_config(config).with_sleeper(self.sleeper.clone());
                let handler = entry.handler.clone();
                let event = event.clone();
                policy.execute(move || {
                    let handler = handler.clone();
                    let event = event.clone();
                    async move { handler.handle(&event).await }
                })
                .await
            }
        };

        if let Err(error) = result {
            tracing::warn!(
                subscription = %entry.id,
                event_type = %event.event_type,
                error = %error,
                "event handler failed"
            );
            if entry.options.dead_letter {
                self.push_dead_letter(event, &error);
            }
        }
    }

    fn push_dead_letter(&self, event: &Event, error: &Error) {
        let failed_at = Utc::now();
        let mut copy = event.clone();
        copy.event_type = topics::DEAD_LETTER.to_string();
        copy.metadata.insert("originalType".into(), event.event_type.clone());
        copy.metadata.insert("error".into(), error.to_string());
        copy.metadata.insert("failedAt".into(), failed_at.to_rfc3339());

        let entry = DeadLetterEntry {
            id: Uuid::new_v4().to_string(),
            event: copy,
            original: event.clone(),
        };

        let mut ring = self.dead_letters.lock().unwrap_or_else(|p| p.into_inner());
        ring.push_back(entry);
        while ring.len() > self.dead_letter_cap {
            ring.pop_front();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(1000, 100)
    }
}
