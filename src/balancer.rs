//! Endpoint inventory and health-aware selection strategies.
//!
//! Selection is advisory: the orchestrator records the chosen endpoint for
//! observability, it does not dispatch across processes. Per-endpoint stats
//! are mutated under one lock so EMA updates never interleave.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use rand::Rng;
use serde::Serialize;

use crate::clock::{Clock, WallTime};
use crate::error::Error;
use crate::event_bus::{topics, EndpointEventData, Event, EventBus, EventData};
use crate::model::{Complexity, JobAnalysis, Priority};

const HEALTH_EMA_ALPHA: f64 = 0.3;
const REQUEST_EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Healthy => "healthy",
            EndpointStatus::Degraded => "degraded",
            EndpointStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityClass {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointMetadata {
    pub features: Vec<String>,
    pub capacity: CapacityClass,
}

#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub id: String,
    pub url: String,
    pub endpoint_type: String,
    pub status: EndpointStatus,
    pub weight: u32,
    pub current_connections: usize,
    pub average_response_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check_ms: Option<u64>,
    pub metadata: EndpointMetadata,
}

impl Endpoint {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        weight: u32,
        metadata: EndpointMetadata,
    ) -> Self {
        Endpoint {
            id: id.into(),
            url: url.into(),
            endpoint_type: "processing".into(),
            status: EndpointStatus::Healthy,
            weight: weight.max(1),
            current_connections: 0,
            average_response_ms: 50.0,
            last_health_check_ms: None,
            metadata,
        }
    }

    fn has_feature(&self, feature: &str) -> bool {
        self.metadata.features.iter().any(|f| f == feature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
    ResourceBased,
    Geographic,
    ConsistentHash,
}

/// Outcome of an advisory selection.
#[derive(Debug, Clone, Serialize)]
pub struct SelectedEndpoint {
    pub endpoint_id: String,
    pub url: String,
    pub strategy: SelectionStrategy,
}

pub struct LoadBalancer {
    endpoints: Mutex<HashMap<String, Endpoint>>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl LoadBalancer {
    pub fn new(bus: Arc<EventBus>) -> Self {
        LoadBalancer {
            endpoints: Mutex::new(HashMap::new()),
            bus,
            clock: Arc::new(WallTime),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Built-in inventory: two transcode endpoints plus one gpu-featured
    /// endpoint, so every strategy has something to choose between.
    pub fn seed_default_endpoints(&self) {
        self.register(Endpoint::new(
            "ep-transcode-01",
            "http://transcode-01.internal:8080",
            3,
            EndpointMetadata {
                features: vec!["h264".into(), "hevc".into()],
                capacity: CapacityClass::High,
            },
        ));
        self.register(Endpoint::new(
            "ep-transcode-02",
            "http://transcode-02.internal:8080",
            2,
            EndpointMetadata {
                features: vec!["h264".into()],
                capacity: CapacityClass::Medium,
            },
        ));
        self.register(Endpoint::new(
            "ep-gpu-01",
            "http://gpu-01.internal:8080",
            2,
            EndpointMetadata {
                features: vec!["gpu".into(), "hevc".into()],
                capacity: CapacityClass::High,
            },
        ));
    }

    pub fn register(&self, endpoint: Endpoint) {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());
        endpoints.insert(endpoint.id.clone(), endpoint);
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        let endpoints = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<Endpoint> = endpoints.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Pick the strategy for one job, then select under it.
    pub fn select(&self, analysis: &JobAnalysis) -> Result<SelectedEndpoint, Error> {
        let strategy = Self::strategy_for(analysis);
        self.select_with(strategy, analysis)
    }

    pub fn strategy_for(analysis: &JobAnalysis) -> SelectionStrategy {
        if analysis.resource_requirements.gpu {
            SelectionStrategy::ResourceBased
        } else if matches!(analysis.priority, Priority::Critical | Priority::High) {
            SelectionStrategy::LeastResponseTime
        } else if matches!(analysis.complexity, Complexity::Complex | Complexity::Enterprise) {
            SelectionStrategy::LeastConnections
        } else if analysis.complexity == Complexity::Simple {
            SelectionStrategy::WeightedRoundRobin
        } else {
            SelectionStrategy::RoundRobin
        }
    }

    pub fn select_with(
        &self,
        strategy: SelectionStrategy,
        analysis: &JobAnalysis,
    ) -> Result<SelectedEndpoint, Error> {
        let endpoints = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());
        let mut healthy: Vec<&Endpoint> = endpoints
            .values()
            .filter(|e| e.status == EndpointStatus::Healthy)
            .collect();
        if healthy.is_empty() {
            return Err(Error::TransientExternal(
                "no healthy processing endpoints".into(),
            ));
        }
        healthy.sort_by(|a, b| a.id.cmp(&b.id));

        let chosen = match strategy {
            SelectionStrategy::RoundRobin => {
                let index = (self.clock.now_millis() / 1000) as usize % healthy.len();
                healthy[index]
            }
            SelectionStrategy::WeightedRoundRobin => {
                let total: u64 = healthy.iter().map(|e| u64::from(e.weight)).sum();
                let mut pick = rand::rng().random_range(0..total);
                let mut chosen = healthy[healthy.len() - 1];
                for endpoint in &healthy {
                    let weight = u64::from(endpoint.weight);
                    if pick < weight {
                        chosen = endpoint;
                        break;
                    }
                    pick -= weight;
                }
                chosen
            }
            SelectionStrategy::LeastConnections => healthy
                .iter()
                .min_by_key(|e| e.current_connections)
                .copied()
                .unwrap_or(healthy[0]),
            SelectionStrategy::LeastResponseTime | SelectionStrategy::Geographic => healthy
                .iter()
                .min_by(|a, b| {
                    a.average_response_ms
                        .partial_cmp(&b.average_response_ms)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .copied()
                .unwrap_or(healthy[0]),
            SelectionStrategy::ResourceBased => healthy
                .iter()
                .max_by(|a, b| {
                    Self::resource_score(a, analysis)
                        .partial_cmp(&Self::resource_score(b, analysis))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .copied()
                .unwrap_or(healthy[0]),
            SelectionStrategy::ConsistentHash => {
                let mut hasher = DefaultHasher::new();
                format!(
                    "{}|{}|{:.0}",
                    analysis.complexity, analysis.priority, analysis.resource_requirements.cpu
                )
                .hash(&mut hasher);
                let index = (hasher.finish() % healthy.len() as u64) as usize;
                healthy[index]
            }
        };

        Ok(SelectedEndpoint {
            endpoint_id: chosen.id.clone(),
            url: chosen.url.clone(),
            strategy,
        })
    }

    fn resource_score(endpoint: &Endpoint, analysis: &JobAnalysis) -> f64 {
        let mut score = 0.0;
        if analysis.resource_requirements.gpu {
            score += if endpoint.has_feature("gpu") { 50.0 } else { -20.0 };
        }
        score += match endpoint.metadata.capacity {
            CapacityClass::High => 30.0,
            CapacityClass::Medium => 15.0,
            CapacityClass::Low => 5.0,
        };
        score += (100.0 - endpoint.average_response_ms / 10.0).max(0.0);
        score += (50.0 - 5.0 * endpoint.current_connections as f64).max(0.0);
        score
    }

    pub fn record_request_start(&self, endpoint_id: &str) {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(endpoint) = endpoints.get_mut(endpoint_id) {
            endpoint.current_connections += 1;
        }
    }

    pub fn record_request_end(&self, endpoint_id: &str, latency_ms: f64) {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(endpoint) = endpoints.get_mut(endpoint_id) {
            endpoint.current_connections = endpoint.current_connections.saturating_sub(1);
            endpoint.average_response_ms = REQUEST_EMA_ALPHA * latency_ms
                + (1.0 - REQUEST_EMA_ALPHA) * endpoint.average_response_ms;
        }
    }

    /// Fold a health-check observation into the endpoint and publish a
    /// status-change event on transitions.
    pub async fn record_health_check(
        &self,
        endpoint_id: &str,
        status: EndpointStatus,
        latency_ms: Option<f64>,
    ) {
        let transition = {
            let mut endpoints = self.endpoints.lock().unwrap_or_else(|p| p.into_inner());
            let Some(endpoint) = endpoints.get_mut(endpoint_id) else {
                tracing::warn!(endpoint_id, "health check for unknown endpoint");
                return;
            };
            endpoint.last_health_check_ms = Some(self.clock.now_millis());
            if let Some(latency) = latency_ms {
                endpoint.average_response_ms = HEALTH_EMA_ALPHA * latency
                    + (1.0 - HEALTH_EMA_ALPHA) * endpoint.average_response_ms;
            }
            let previous = endpoint.status;
            endpoint.status = status;
            (previous != status).then(|| (previous, status))
        };

        if let Some((previous, current)) = transition {
            tracing::info!(
                endpoint_id,
                from = previous.as_str(),
                to = current.as_str(),
                "endpoint status changed"
            );
            self.bus
                .publish(Event::new(
                    topics::ENDPOINT_STATUS_CHANGED,
                    "load_balancer",
                    EventData::Endpoint(EndpointEventData {
                        endpoint_id: endpoint_id.to_string(),
                        previous: previous.as_str().to_string(),
                        current: current.as_str().to_string(),
                    }),
                ))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualTime;
    use crate::model::{JobAnalysis, ResourceRequirements, Strategy};
    use std::time::Duration;

    fn analysis(gpu: bool, priority: Priority, complexity: Complexity) -> JobAnalysis {
        JobAnalysis {
            estimated_duration: Duration::from_secs(10),
            resource_requirements: ResourceRequirements {
                cpu: 2.0,
                memory_gb: 4.0,
                storage_gb: 5.0,
                bandwidth_mbps: 100.0,
                gpu,
                estimated_time: Duration::from_secs(10),
            },
            priority,
            complexity,
            strategy: Strategy::BalancedAsync,
            risks: vec![],
            optimizations: vec![],
        }
    }

    fn balancer() -> (LoadBalancer, Arc<EventBus>, VirtualTime) {
        let bus = Arc::new(EventBus::default());
        let clock = VirtualTime::new();
        let balancer = LoadBalancer::new(bus.clone()).with_clock(Arc::new(clock.clone()));
        balancer.seed_default_endpoints();
        (balancer, bus, clock)
    }

    #[test]
    fn strategy_mapping_follows_the_analysis() {
        assert_eq!(
            LoadBalancer::strategy_for(&analysis(true, Priority::Normal, Complexity::Moderate)),
            SelectionStrategy::ResourceBased
        );
        assert_eq!(
            LoadBalancer::strategy_for(&analysis(false, Priority::Critical, Complexity::Moderate)),
            SelectionStrategy::LeastResponseTime
        );
        assert_eq!(
            LoadBalancer::strategy_for(&analysis(false, Priority::Normal, Complexity::Enterprise)),
            SelectionStrategy::LeastConnections
        );
        assert_eq!(
            LoadBalancer::strategy_for(&analysis(false, Priority::Normal, Complexity::Simple)),
            SelectionStrategy::WeightedRoundRobin
        );
        assert_eq!(
            LoadBalancer::strategy_for(&analysis(false, Priority::Normal, Complexity::Moderate)),
            SelectionStrategy::RoundRobin
        );
    }

    #[test]
    fn round_robin_steps_with_the_clock() {
        let (balancer, _, clock) = balancer();
        let analysis = analysis(false, Priority::Normal, Complexity::Moderate);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let selected = balancer
                .select_with(SelectionStrategy::RoundRobin, &analysis)
                .unwrap();
            seen.push(selected.endpoint_id);
            clock.advance(1000);
        }
        assert_eq!(seen.len(), 3);
        assert_ne!(seen[0], seen[1]);
        assert_ne!(seen[1], seen[2]);
    }

    #[test]
    fn gpu_jobs_land_on_the_gpu_endpoint() {
        let (balancer, _, _) = balancer();
        let selected = balancer
            .select(&analysis(true, Priority::Normal, Complexity::Complex))
            .unwrap();
        assert_eq!(selected.strategy, SelectionStrategy::ResourceBased);
        assert_eq!(selected.endpoint_id, "ep-gpu-01");
    }

    #[test]
    fn least_connections_avoids_busy_endpoints() {
        let (balancer, _, _) = balancer();
        balancer.record_request_start("ep-transcode-01");
        balancer.record_request_start("ep-transcode-01");
        balancer.record_request_start("ep-gpu-01");

        let selected = balancer
            .select_with(
                SelectionStrategy::LeastConnections,
                &analysis(false, Priority::Normal, Complexity::Complex),
            )
            .unwrap();
        assert_eq!(selected.endpoint_id, "ep-transcode-02");
    }

    #[tokio::test]
    async fn least_response_time_prefers_the_fastest() {
        let (balancer, _, _) = balancer();
        balancer
            .record_health_check("ep-transcode-02", EndpointStatus::Healthy, Some(5.0))
            .await;
        for _ in 0..10 {
            balancer.record_request_start("ep-transcode-01");
            balancer.record_request_end("ep-transcode-01", 500.0);
        }

        let selected = balancer
            .select_with(
                SelectionStrategy::LeastResponseTime,
                &analysis(false, Priority::High, Complexity::Moderate),
            )
            .unwrap();
        assert_eq!(selected.endpoint_id, "ep-transcode-02");
    }

    #[test]
    fn consistent_hash_is_stable_for_identical_analyses() {
        let (balancer, _, _) = balancer();
        let a = analysis(false, Priority::Normal, Complexity::Moderate);
        let first = balancer
            .select_with(SelectionStrategy::ConsistentHash, &a)
            .unwrap();
        for _ in 0..5 {
            let again = balancer
                .select_with(SelectionStrategy::ConsistentHash, &a)
                .unwrap();
            assert_eq!(again.endpoint_id, first.endpoint_id);
        }
    }

    #[test]
    fn weighted_round_robin_only_picks_healthy_endpoints() {
        let (balancer, _, _) = balancer();
        let a = analysis(false, Priority::Normal, Complexity::Simple);
        for _ in 0..20 {
            let selected = balancer
                .select_with(SelectionStrategy::WeightedRoundRobin, &a)
                .unwrap();
            assert!(selected.endpoint_id.starts_with("ep-"));
        }
    }

    #[tokio::test]
    async fn unhealthy_endpoints_are_skipped_and_emptiness_errors() {
        let (balancer, _, _) = balancer();
        for id in ["ep-transcode-01", "ep-transcode-02"] {
            balancer
                .record_health_check(id, EndpointStatus::Unhealthy, None)
                .await;
        }
        let selected = balancer
            .select(&analysis(false, Priority::Normal, Complexity::Moderate))
            .unwrap();
        assert_eq!(selected.endpoint_id, "ep-gpu-01");

        balancer
            .record_health_check("ep-gpu-01", EndpointStatus::Unhealthy, None)
            .await;
        assert!(balancer
            .select(&analysis(false, Priority::Normal, Complexity::Moderate))
            .is_err());
    }

    #[tokio::test]
    async fn status_transitions_publish_events() {
        let (balancer, bus, _) = balancer();
        balancer
            .record_health_check("ep-transcode-01", EndpointStatus::Unhealthy, None)
            .await;
        // Same status again: no extra event.
        balancer
            .record_health_check("ep-transcode-01", EndpointStatus::Unhealthy, None)
            .await;
        balancer
            .record_health_check("ep-transcode-01", EndpointStatus::Healthy, None)
            .await;

        let events = bus.event_history(Some(&crate::event_bus::EventFilter::for_types([
            topics::ENDPOINT_STATUS_CHANGED,
        ])));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn ema_moves_towards_observations() {
        let (balancer, _, _) = balancer();
        let before = balancer
            .endpoints()
            .into_iter()
            .find(|e| e.id == "ep-transcode-01")
            .unwrap()
            .average_response_ms;

        balancer
            .record_health_check("ep-transcode-01", EndpointStatus::Healthy, Some(250.0))
            .await;
        let after = balancer
            .endpoints()
            .into_iter()
            .find(|e| e.id == "ep-transcode-01")
            .unwrap()
            .average_response_ms;

        // alpha 0.3 pulls 30% of the way to the observation.
        assert!((after - (0.3 * 250.0 + 0.7 * before)).abs() < 1e-9);
    }
}
