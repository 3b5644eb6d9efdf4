//! Periodic health checks (http, tcp, command, custom) with status
//! aggregation, uptime accounting, and change events.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::clock::{Clock, Sleeper, WallTime};
use crate::error::Error;
use crate::event_bus::{topics, Event, EventBus, EventData, HealthEventData};

const RETRY_DELAY: Duration = Duration::from_millis(100);

#[async_trait]
pub trait CustomCheck: Send + Sync {
    async fn check(&self) -> Result<(), Error>;
}

#[derive(Clone)]
pub enum CheckKind {
    Http {
        url: String,
        /// When set, the response body must be strictly equal JSON.
        expected: Option<serde_json::Value>,
    },
    Tcp {
        addr: String,
    },
    Command {
        command: String,
    },
    Custom(Arc<dyn CustomCheck>),
}

impl std::fmt::Debug for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckKind::Http { url, .. } => f.debug_struct("Http").field("url", url).finish(),
            CheckKind::Tcp { addr } => f.debug_struct("Tcp").field("addr", addr).finish(),
            CheckKind::Command { command } => {
                f.debug_struct("Command").field("command", command).finish()
            }
            CheckKind::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckSpec {
    pub name: String,
    pub kind: CheckKind,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: usize,
    /// A pass slower than this degrades to a warning.
    pub warn_after: Option<Duration>,
}

impl CheckSpec {
    pub fn new(name: impl Into<String>, kind: CheckKind) -> Self {
        CheckSpec {
            name: name.into(),
            kind,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            retries: 1,
            warn_after: None,
        }
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn warn_after(mut self, threshold: Duration) -> Self {
        self.warn_after = Some(threshold);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub outcome: Outcome,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl AggregateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateStatus::Healthy => "healthy",
            AggregateStatus::Degraded => "degraded",
            AggregateStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub name: String,
    pub outcome: Outcome,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: AggregateStatus,
    pub uptime_ms: u64,
    pub checks: Vec<CheckReport>,
}

struct CheckState {
    spec: CheckSpec,
    last: Option<CheckResult>,
    history: VecDeque<CheckResult>,
}

struct AggregateState {
    status: AggregateStatus,
    uptime_ms: u64,
    last_healthy_observation_ms: Option<u64>,
}

pub struct HealthChecker {
    checks: Mutex<HashMap<String, CheckState>>,
    aggregate: Mutex<AggregateState>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    client: reqwest::Client,
    history_cap: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthChecker {
    pub fn new(bus: Arc<EventBus>) -> Self {
        HealthChecker {
            checks: Mutex::new(HashMap::new()),
            aggregate: Mutex::new(AggregateState {
                status: AggregateStatus::Healthy,
                uptime_ms: 0,
                last_healthy_observation_ms: None,
            }),
            bus,
            clock: Arc::new(WallTime),
            sleeper: Arc::new(WallTime),
            client: reqwest::Client::new(),
            history_cap: 50,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap;
        self
    }

    pub fn register(&self, spec: CheckSpec) {
        let mut checks = self.checks.lock().unwrap_or_else(|p| p.into_inner());
        checks.insert(
            spec.name.clone(),
            CheckState { spec, last: None, history: VecDeque::new() },
        );
    }

    /// Spawn one loop per registered check.
    pub fn start(self: &Arc<Self>) {
        let names: Vec<(String, Duration)> = {
            let checks = self.checks.lock().unwrap_or_else(|p| p.into_inner());
            checks.values().map(|s| (s.spec.name.clone(), s.spec.interval)).collect()
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for (name, interval) in names {
            let checker = Arc::downgrade(self);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let Some(checker) = checker.upgrade() else { break };
                    checker.run_check(&name).await;
                }
            }));
        }
    }

    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Run every registered check once and return the refreshed report.
    pub async fn run_all_once(&self) -> HealthReport {
        let names: Vec<String> = {
            let checks = self.checks.lock().unwrap_or_else(|p| p.into_inner());
            checks.keys().cloned().collect()
        };
        for name in names {
            self.run_check(&name).await;
        }
        self.report()
    }

    pub async fn run_check(&self, name: &str) {
        let spec = {
            let checks = self.checks.lock().unwrap_or_else(|p| p.into_inner());
            match checks.get(name) {
                Some(state) => state.spec.clone(),
                None => return,
            }
        };

        let result = self.execute_spec(&spec).await;
        {
            let mut checks = self.checks.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(state) = checks.get_mut(name) {
                state.last = Some(result.clone());
                state.history.push_back(result);
                while state.history.len() > self.history_cap {
                    state.history.pop_front();
                }
            }
        }
        self.refresh_aggregate().await;
    }

    async fn execute_spec(&self, spec: &CheckSpec) -> CheckResult {
        let mut last_message = None;
        for attempt in 0..=spec.retries {
            let started = self.clock.now_millis();
            let outcome = self.probe(spec).await;
            let latency_ms = self.clock.now_millis().saturating_sub(started);

            match outcome {
                Ok(()) => {
                    let slow = spec
                        .warn_after
                        .map(|threshold| latency_ms > threshold.as_millis() as u64)
                        .unwrap_or(false);
                    return CheckResult {
                        outcome: if slow { Outcome::Warn } else { Outcome::Pass },
                        latency_ms,
                        message: slow.then(|| format!("slow response: {latency_ms}ms")),
                        at: Utc::now(),
                    };
                }
                Err(error) => {
                    last_message = Some(error.to_string());
                    if attempt < spec.retries {
                        self.sleeper.sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        CheckResult {
            outcome: Outcome::Fail,
            latency_ms: 0,
            message: last_message,
            at: Utc::now(),
        }
    }

    async fn probe(&self, spec: &CheckSpec) -> Result<(), Error> {
        match &spec.kind {
            CheckKind::Http { url, expected } => {
                let response = self
                    .client
                    .get(url)
                    .timeout(spec.timeout)
                    .send()
                    .await
                    .map_err(|e| Error::TransientExternal(format!("http check: {e}")))?;
                let status = response.status();
                if status.as_u16() >= 500 {
                    return Err(Error::TransientExternal(format!(
                        "http check: status {status}"
                    )));
                }
                if let Some(expected) = expected {
                    let body: serde_json::Value = response
                        .json()
                        .await
                        .map_err(|e| Error::TransientExternal(format!("http body: {e}")))?;
                    if &body != expected {
                        return Err(Error::TransientExternal(
                            "http check: unexpected response body".into(),
                        ));
                    }
                }
                Ok(())
            }
            CheckKind::Tcp { addr } => {
                tokio::time::timeout(spec.timeout, tokio::net::TcpStream::connect(addr))
                    .await
                    .map_err(|_| Error::Timeout {
                        operation: format!("tcp connect {addr}"),
                        elapsed: spec.timeout,
                        limit: spec.timeout,
                    })?
                    .map_err(|e| Error::TransientExternal(format!("tcp check: {e}")))?;
                Ok(())
            }
            CheckKind::Command { command } => {
                let output = tokio::time::timeout(
                    spec.timeout,
                    tokio::process::Command::new("sh").arg("-c").arg(command).output(),
                )
                .await
                .map_err(|_| Error::Timeout {
                    operation: format!("command '{command}'"),
                    elapsed: spec.timeout,
                    limit: spec.timeout,
                })?
                .map_err(|e| Error::TransientExternal(format!("command spawn: {e}")))?;

                if !output.status.success() {
                    return Err(Error::TransientExternal(format!(
                        "command exited with {}",
                        output.status
                    )));
                }
                if !output.stderr.is_empty() {
                    return Err(Error::TransientExternal(format!(
                        "command wrote to stderr: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
                Ok(())
            }
            CheckKind::Custom(check) => {
                tokio::time::timeout(spec.timeout, check.check())
                    .await
                    .map_err(|_| Error::Timeout {
                        operation: format!("custom check '{}'", spec.name),
                        elapsed: spec.timeout,
                        limit: spec.timeout,
                    })?
            }
        }
    }

    async fn refresh_aggregate(&self) {
        let (current, failing) = {
            let checks = self.checks.lock().unwrap_or_else(|p| p.into_inner());
            let mut any_warn = false;
            let mut failing = Vec::new();
            for state in checks.values() {
                match state.last.as_ref().map(|r| r.outcome) {
                    Some(Outcome::Fail) => failing.push(state.spec.name.clone()),
                    Some(Outcome::Warn) => any_warn = true,
                    _ => {}
                }
            }
            let status = if !failing.is_empty() {
                AggregateStatus::Unhealthy
            } else if any_warn {
                AggregateStatus::Degraded
            } else {
                AggregateStatus::Healthy
            };
            failing.sort();
            (status, failing)
        };

        let now = self.clock.now_millis();
        let transition = {
            let mut aggregate = self.aggregate.lock().unwrap_or_else(|p| p.into_inner());
            let previous = aggregate.status;

            if current == AggregateStatus::Healthy {
                if let Some(last) = aggregate.last_healthy_observation_ms {
                    aggregate.uptime_ms += now.saturating_sub(last);
                }
                aggregate.last_healthy_observation_ms = Some(now);
            } else {
                // Any non-healthy observation resets accumulated uptime.
                aggregate.uptime_ms = 0;
                aggregate.last_healthy_observation_ms = None;
            }

            aggregate.status = current;
            (previous != current).then_some(previous)
        };

        if let Some(previous) = transition {
            tracing::info!(
                from = previous.as_str(),
                to = current.as_str(),
                failing = ?failing,
                "aggregate health changed"
            );
            self.bus
                .publish(Event::new(
                    topics::HEALTH_STATUS_CHANGED,
                    "health_checker",
                    EventData::Health(HealthEventData {
                        previous: previous.as_str().to_string(),
                        current: current.as_str().to_string(),
                        failing,
                    }),
                ))
                .await;
        }
    }

    pub fn status(&self) -> AggregateStatus {
        self.aggregate.lock().unwrap_or_else(|p| p.into_inner()).status
    }

    pub fn check_outcome(&self, name: &str) -> Option<Outcome> {
        let checks = self.checks.lock().unwrap_or_else(|p| p.into_inner());
        checks.get(name).and_then(|s| s.last.as_ref()).map(|r| r.outcome)
    }

    pub fn history(&self, name: &str) -> Vec<CheckResult> {
        let checks = self.checks.lock().unwrap_or_else(|p| p.into_inner());
        checks
            .get(name)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn report(&self) -> HealthReport {
        let checks = self.checks.lock().unwrap_or_else(|p| p.into_inner());
        let mut reports: Vec<CheckReport> = checks
            .values()
            .filter_map(|state| {
                state.last.as_ref().map(|last| CheckReport {
                    name: state.spec.name.clone(),
                    outcome: last.outcome,
                    latency_ms: last.latency_ms,
                    message: last.message.clone(),
                })
            })
            .collect();
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        drop(checks);

        let aggregate = self.aggregate.lock().unwrap_or_else(|p| p.into_inner());
        HealthReport {
            status: aggregate.status,
            uptime_ms: aggregate.uptime_ms,
            checks: reports,
        }
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
