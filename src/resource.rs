//! In-memory inventory of compute nodes with utilization tracking,
//! suitability scoring, and an expiry reaper.
//!
//! Node mutation is serialized behind one lock; events are published only
//! after the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clock::{Clock, WallTime};
use crate::error::Error;
use crate::event_bus::{
    topics, AllocationEventData, Event, EventBus, EventData, NodeEventData,
};
use crate::model::{Priority, ResourceRequirements};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Compute,
    Gpu,
    Storage,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Available,
    Busy,
    Maintenance,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Available => "available",
            NodeStatus::Busy => "busy",
            NodeStatus::Maintenance => "maintenance",
            NodeStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeCapacity {
    pub cpu: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub bandwidth_mbps: f64,
    pub gpu_units: u32,
}

/// Percent-of-capacity per dimension, always within `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct NodeUtilization {
    pub cpu: f64,
    pub memory: f64,
    pub storage: f64,
    pub network: f64,
    pub gpu: f64,
}

impl NodeUtilization {
    pub fn average(&self) -> f64 {
        (self.cpu + self.memory + self.storage + self.network) / 4.0
    }

    fn clamped(value: f64) -> f64 {
        value.clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceNode {
    pub id: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub capacity: NodeCapacity,
    pub utilization: NodeUtilization,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
    pub last_heartbeat_ms: u64,
}

impl ResourceNode {
    pub fn new(id: impl Into<String>, node_type: NodeType, capacity: NodeCapacity) -> Self {
        ResourceNode {
            id: id.into(),
            node_type,
            status: NodeStatus::Available,
            capacity,
            utilization: NodeUtilization::default(),
            location: None,
            tags: HashMap::new(),
            last_heartbeat_ms: 0,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    fn free_cpu(&self) -> f64 {
        self.capacity.cpu * (1.0 - self.utilization.cpu / 100.0)
    }

    fn free_memory_gb(&self) -> f64 {
        self.capacity.memory_gb * (1.0 - self.utilization.memory / 100.0)
    }

    fn free_storage_gb(&self) -> f64 {
        self.capacity.storage_gb * (1.0 - self.utilization.storage / 100.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Constraints {
    pub node_types: Option<Vec<NodeType>>,
    pub exclude_nodes: Vec<String>,
    pub require_tags: HashMap<String, String>,
    /// Prefix-matched against the node's `location`.
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Preferences {
    pub preferred_nodes: Vec<String>,
    pub performance_optimized: bool,
    pub cost_optimized: bool,
}

#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub requirements: ResourceRequirements,
    pub duration: Option<Duration>,
    pub priority: Priority,
    pub constraints: Constraints,
    pub preferences: Preferences,
}

impl AllocationRequest {
    pub fn new(requirements: ResourceRequirements, priority: Priority) -> Self {
        AllocationRequest {
            requirements,
            duration: None,
            priority,
            constraints: Constraints::default(),
            preferences: Preferences::default(),
        }
    }

    pub fn expiring_after(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Exact per-dimension percentages applied at allocation time, retained so
/// release restores the node bit-for-bit.
#[derive(Debug, Clone, Copy, Default)]
struct AppliedDeltas {
    cpu: f64,
    memory: f64,
    storage: f64,
    network: f64,
    gpu: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub id: String,
    pub node_id: String,
    pub cpu: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub gpu: bool,
    pub allocated_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
    #[serde(skip)]
    deltas: AppliedDeltas,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeAvailability {
    pub node_id: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub free_cpu: f64,
    pub free_memory_gb: f64,
    pub free_storage_gb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceStats {
    pub total_nodes: usize,
    pub available_nodes: usize,
    pub failed_nodes: usize,
    pub active_allocations: usize,
    pub average_utilization: f64,
}

#[derive(Default)]
struct Inventory {
    nodes: HashMap<String, ResourceNode>,
    allocations: HashMap<String, Allocation>,
}

pub struct ResourceManager {
    inventory: Mutex<Inventory>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    heartbeat_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ResourceManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        ResourceManager {
            inventory: Mutex::new(Inventory::default()),
            bus,
            clock: Arc::new(WallTime),
            heartbeat_timeout: Duration::from_secs(120),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Built-in fleet used when the embedder registers nothing: two compute
    /// nodes, one gpu node, one storage node.
    pub fn seed_default_fleet(&self) {
        let now = self.clock.now_millis();
        let nodes = [
            ResourceNode::new(
                "compute-01",
                NodeType::Compute,
                NodeCapacity { cpu: 8.0, memory_gb: 16.0, storage_gb: 500.0, bandwidth_mbps: 1000.0, gpu_units: 0 },
            )
            .with_location("us-east-1a"),
            ResourceNode::new(
                "compute-02",
                NodeType::Compute,
                NodeCapacity { cpu: 8.0, memory_gb: 16.0, storage_gb: 500.0, bandwidth_mbps: 1000.0, gpu_units: 0 },
            )
            .with_location("us-east-1b"),
            ResourceNode::new(
                "gpu-01",
                NodeType::Gpu,
                NodeCapacity { cpu: 16.0, memory_gb: 64.0, storage_gb: 1000.0, bandwidth_mbps: 2000.0, gpu_units: 2 },
            )
            .with_location("us-east-1a")
            .with_tag("accelerator", "nvenc"),
            ResourceNode::new(
                "storage-01",
                NodeType::Storage,
                NodeCapacity { cpu: 4.0, memory_gb: 8.0, storage_gb: 10_000.0, bandwidth_mbps: 500.0, gpu_units: 0 },
            )
            .with_location("us-east-1c"),
        ];
        for mut node in nodes {
            node.last_heartbeat_ms = now;
            self.register_node(node);
        }
    }

    pub fn register_node(&self, node: ResourceNode) {
        let mut inventory = self.inventory.lock().unwrap_or_else(|p| p.into_inner());
        inventory.nodes.insert(node.id.clone(), node);
    }

    /// Record a heartbeat; a failed node recovers immediately.
    pub async fn heartbeat(&self, node_id: &str) {
        let recovered = {
            let mut inventory = self.inventory.lock().unwrap_or_else(|p| p.into_inner());
            let now = self.clock.now_millis();
            match inventory.nodes.get_mut(node_id) {
                None => {
                    tracing::warn!(node_id, "heartbeat from unknown node");
                    return;
                }
                Some(node) => {
                    node.last_heartbeat_ms = now;
                    if node.status == NodeStatus::Failed {
                        node.status = NodeStatus::Available;
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if recovered {
            tracing::info!(node_id, "node recovered");
            self.bus
                .publish(Event::new(
                    topics::NODE_RECOVERED,
                    "resource_manager",
                    EventData::Node(NodeEventData {
                        node_id: node_id.to_string(),
                        status: Some(NodeStatus::Available.as_str().to_string()),
                        avg_utilization: None,
                    }),
                ))
                .await;
        }
    }

    pub async fn allocate(&self, request: &AllocationRequest) -> Result<Allocation, Error> {
        let allocation = {
            let mut inventory = self.inventory.lock().unwrap_or_else(|p| p.into_inner());
            let now = self.clock.now_millis();

            let mut best: Option<(f64, String)> = None;
            for node in inventory.nodes.values() {
                if !Self::eligible(node, request) {
                    continue;
                }
                let score = Self::score(node, request);
                let better = match &best {
                    None => true,
                    // Deterministic tie-break on node id.
                    Some((best_score, best_id)) => {
                        score > *best_score || (score == *best_score && node.id < *best_id)
                    }
                };
                if better {
                    best = Some((score, node.id.clone()));
                }
            }

            let Some((score, node_id)) = best else {
                return Err(Error::NoSuitableNode {
                    reason: format!(
                        "no available node satisfies cpu={:.1} mem={:.1}GB gpu={}",
                        request.requirements.cpu,
                        request.requirements.memory_gb,
                        request.requirements.gpu,
                    ),
                });
            };
            tracing::debug!(node_id = %node_id, score, "allocation target selected");

            let node = inventory
                .nodes
                .get_mut(&node_id)
                .ok_or_else(|| Error::internal("selected node vanished under the lock"))?;
            let deltas = Self::apply_utilization(node, &request.requirements);

            let allocation = Allocation {
                id: Uuid::new_v4().to_string(),
                node_id,
                cpu: request.requirements.cpu,
                memory_gb: request.requirements.memory_gb,
                storage_gb: request.requirements.storage_gb,
                gpu: request.requirements.gpu,
                allocated_at_ms: now,
                expires_at_ms: request.duration.map(|d| now + d.as_millis() as u64),
                tags: HashMap::new(),
                deltas,
            };
            inventory.allocations.insert(allocation.id.clone(), allocation.clone());
            allocation
        };

        self.bus
            .publish(Event::new(
                topics::RESOURCE_ALLOCATED,
                "resource_manager",
                EventData::Allocation(AllocationEventData {
                    allocation_id: allocation.id.clone(),
                    node_id: allocation.node_id.clone(),
                }),
            ))
            .await;
        Ok(allocation)
    }

    /// Releasing an unknown allocation is a warned no-op.
    pub async fn release(&self, allocation_id: &str) -> bool {
        let released = {
            let mut inventory = self.inventory.lock().unwrap_or_else(|p| p.into_inner());
            match inventory.allocations.remove(allocation_id) {
                None => None,
                Some(allocation) => {
                    if let Some(node) = inventory.nodes.get_mut(&allocation.node_id) {
                        Self::revert_utilization(node, &allocation.deltas);
                    }
                    Some(allocation)
                }
            }
        };

        match released {
            None => {
                tracing::warn!(allocation_id, "release of unknown allocation ignored");
                false
            }
            Some(allocation) => {
                self.bus
                    .publish(Event::new(
                        topics::RESOURCE_RELEASED,
                        "resource_manager",
                        EventData::Allocation(AllocationEventData {
                            allocation_id: allocation.id.clone(),
                            node_id: allocation.node_id.clone(),
                        }),
                    ))
                    .await;
                true
            }
        }
    }

    pub fn get_node_utilization(&self, node_id: &str) -> Option<NodeUtilization> {
        let inventory = self.inventory.lock().unwrap_or_else(|p| p.into_inner());
        inventory.nodes.get(node_id).map(|n| n.utilization)
    }

    pub fn get_available_resources(&self) -> Vec<NodeAvailability> {
        let inventory = self.inventory.lock().unwrap_or_else(|p| p.into_inner());
        let mut nodes: Vec<NodeAvailability> = inventory
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Available)
            .map(|n| NodeAvailability {
                node_id: n.id.clone(),
                node_type: n.node_type,
                status: n.status,
                free_cpu: n.free_cpu(),
                free_memory_gb: n.free_memory_gb(),
                free_storage_gb: n.free_storage_gb(),
            })
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn get_resource_stats(&self) -> ResourceStats {
        let inventory = self.inventory.lock().unwrap_or_else(|p| p.into_inner());
        let total = inventory.nodes.len();
        let available = inventory
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Available)
            .count();
        let failed = inventory
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Failed)
            .count();
        let average_utilization = if total == 0 {
            0.0
        } else {
            inventory.nodes.values().map(|n| n.utilization.average()).sum::<f64>() / total as f64
        };
        ResourceStats {
            total_nodes: total,
            available_nodes: available,
            failed_nodes: failed,
            active_allocations: inventory.allocations.len(),
            average_utilization,
        }
    }

    /// One reaper pass: fail silent nodes, release expired allocations,
    /// flag hot nodes. Runs on an interval in production; called directly
    /// by tests.
    pub async fn reap_once(&self) {
        let now = self.clock.now_millis();
        let heartbeat_timeout = self.heartbeat_timeout.as_millis() as u64;

        let (failed, expired, hot) = {
            let mut inventory = self.inventory.lock().unwrap_or_else(|p| p.into_inner());

            let mut failed = Vec::new();
            let mut hot = Vec::new();
            for node in inventory.nodes.values_mut() {
                if matches!(node.status, NodeStatus::Available | NodeStatus::Busy)
                    && now.saturating_sub(node.last_heartbeat_ms) > heartbeat_timeout
                {
                    node.status = NodeStatus::Failed;
                    failed.push(node.id.clone());
                }
                let average = node.utilization.average();
                if node.status != NodeStatus::Failed && average > 90.0 {
                    hot.push((node.id.clone(), average));
                }
            }

            let expired: Vec<String> = inventory
                .allocations
                .values()
                .filter(|a| a.expires_at_ms.is_some_and(|at| at < now))
                .map(|a| a.id.clone())
                .collect();

            (failed, expired, hot)
        };

        for node_id in failed {
            tracing::warn!(node_id = %node_id, "node marked failed after missed heartbeats");
            self.bus
                .publish(Event::new(
                    topics::NODE_FAILED,
                    "resource_manager",
                    EventData::Node(NodeEventData {
                        node_id,
                        status: Some(NodeStatus::Failed.as_str().to_string()),
                        avg_utilization: None,
                    }),
                ))
                .await;
        }

        for allocation_id in expired {
            tracing::info!(allocation_id = %allocation_id, "releasing expired allocation");
            self.release(&allocation_id).await;
        }

        for (node_id, average) in hot {
            self.bus
                .publish(Event::new(
                    topics::HIGH_UTILIZATION,
                    "resource_manager",
                    EventData::Node(NodeEventData {
                        node_id,
                        status: None,
                        avg_utilization: Some(average),
                    }),
                ))
                .await;
        }
    }

    pub fn start_reaper(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                manager.reap_once().await;
            }
        });
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).push(handle);
    }

    /// Stand-in for per-node agents: the built-in fleet lives in this
    /// process, so it heartbeats itself while the process is healthy.
    /// Externally registered nodes are expected to call `heartbeat`
    /// themselves and are not covered by this loop.
    pub fn start_local_heartbeats(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                let ids: Vec<String> = {
                    let inventory = manager.inventory.lock().unwrap_or_else(|p| p.into_inner());
                    inventory.nodes.keys().cloned().collect()
                };
                for id in ids {
                    manager.heartbeat(&id).await;
                }
            }
        });
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).push(handle);
    }

    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    fn eligible(node: &ResourceNode, request: &AllocationRequest) -> bool {
        if node.status != NodeStatus::Available {
            return false;
        }
        let req = &request.requirements;
        if node.free_cpu() < req.cpu
            || node.free_memory_gb() < req.memory_gb
            || node.free_storage_gb() < req.storage_gb
        {
            return false;
        }
        if req.gpu && node.capacity.gpu_units == 0 {
            return false;
        }

        let constraints = &request.constraints;
        if let Some(types) = &constraints.node_types {
            if !types.contains(&node.node_type) {
                return false;
            }
        }
        if constraints.exclude_nodes.contains(&node.id) {
            return false;
        }
        for (key, value) in &constraints.require_tags {
            if node.tags.get(key) != Some(value) {
                return false;
            }
        }
        if let Some(region) = &constraints.region {
            match &node.location {
                Some(location) if location.starts_with(region.as_str()) => {}
                _ => return false,
            }
        }
        true
    }

    fn score(node: &ResourceNode, request: &AllocationRequest) -> f64 {
        let req = &request.requirements;
        let req_cpu = req.cpu.max(0.1);
        let req_mem = req.memory_gb.max(0.1);

        let mut score =
            10.0 * node.free_cpu() / req_cpu + 10.0 * node.free_memory_gb() / req_mem;
        // The gpu bonus follows the job's requirement, not the node's
        // capability: jobs that don't need a gpu must not crowd gpu nodes.
        if req.gpu {
            score += 20.0;
        }

        let preferences = &request.preferences;
        if preferences.preferred_nodes.contains(&node.id) {
            score += 15.0;
        }
        if preferences.performance_optimized && node.node_type == NodeType::Gpu {
            score += 10.0;
        }
        if preferences.cost_optimized && node.capacity.cpu <= 4.0 {
            score += 5.0;
        }

        score += match (request.priority, node.node_type) {
            (Priority::Critical, NodeType::Gpu) => 15.0,
            (Priority::High, NodeType::Compute) => 10.0,
            (Priority::Normal, _) => 5.0,
            _ => 0.0,
        };

        score - 0.1 * node.utilization.average()
    }

    fn apply_utilization(node: &mut ResourceNode, req: &ResourceRequirements) -> AppliedDeltas {
        fn applied(current: &mut f64, add_pct: f64) -> f64 {
            let before = *current;
            *current = NodeUtilization::clamped(before + add_pct);
            *current - before
        }

        let capacity = node.capacity.clone();
        let gpu_pct = if req.gpu && capacity.gpu_units > 0 {
            100.0 / f64::from(capacity.gpu_units)
        } else {
            0.0
        };

        AppliedDeltas {
            cpu: applied(&mut node.utilization.cpu, req.cpu / capacity.cpu * 100.0),
            memory: applied(&mut node.utilization.memory, req.memory_gb / capacity.memory_gb * 100.0),
            storage: applied(&mut node.utilization.storage, req.storage_gb / capacity.storage_gb * 100.0),
            network: applied(
                &mut node.utilization.network,
                req.bandwidth_mbps / capacity.bandwidth_mbps * 100.0,
            ),
            gpu: applied(&mut node.utilization.gpu, gpu_pct),
        }
    }

    fn revert_utilization(node: &mut ResourceNode, deltas: &AppliedDeltas) {
        node.utilization.cpu = NodeUtilization::clamped(node.utilization.cpu - deltas.cpu);
        node.utilization.memory = NodeUtilization::clamped(node.utilization.memory - deltas.memory);
        node.utilization.storage =
            NodeUtilization::clamped(node.utilization.storage - deltas.storage);
        node.utilization.network =
            NodeUtilization::clamped(node.utilization.network - deltas.network);
        node.utilization.gpu = NodeUtilization::clamped(node.utilization.gpu - deltas.gpu);
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualTime;

    fn requirements(cpu: f64, memory_gb: f64, gpu: bool) -> ResourceRequirements {
        ResourceRequirements {
            cpu,
            memory_gb,
            storage_gb: 5.0,
            bandwidth_mbps: 100.0,
            gpu,
            estimated_time: Duration::from_secs(10),
        }
    }

    fn manager() -> (Arc<ResourceManager>, Arc<EventBus>, VirtualTime) {
        let bus = Arc::new(EventBus::default());
        let clock = VirtualTime::new();
        let manager = Arc::new(
            ResourceManager::new(bus.clone()).with_clock(Arc::new(clock.clone())),
        );
        manager.seed_default_fleet();
        (manager, bus, clock)
    }

    #[tokio::test]
    async fn allocates_and_updates_utilization() {
        let (manager, _, _) = manager();
        let request = AllocationRequest::new(requirements(2.0, 4.0, false), Priority::Normal);
        let allocation = manager.allocate(&request).await.unwrap();

        let utilization = manager.get_node_utilization(&allocation.node_id).unwrap();
        assert!(utilization.cpu > 0.0);
        assert!(utilization.memory > 0.0);
        assert!(utilization.average() <= 100.0);
    }

    #[tokio::test]
    async fn release_restores_utilization_exactly() {
        let (manager, _, _) = manager();
        let before: Vec<_> = manager
            .get_available_resources()
            .into_iter()
            .map(|n| (n.node_id.clone(), n.free_cpu, n.free_memory_gb))
            .collect();

        let request = AllocationRequest::new(requirements(3.0, 6.0, false), Priority::Normal);
        let allocation = manager.allocate(&request).await.unwrap();
        assert!(manager.release(&allocation.id).await);

        let after: Vec<_> = manager
            .get_available_resources()
            .into_iter()
            .map(|n| (n.node_id.clone(), n.free_cpu, n.free_memory_gb))
            .collect();
        for ((id_a, cpu_a, mem_a), (id_b, cpu_b, mem_b)) in before.iter().zip(after.iter()) {
            assert_eq!(id_a, id_b);
            assert!((cpu_a - cpu_b).abs() < 1e-9);
            assert!((mem_a - mem_b).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn allocate_release_allocate_lands_on_the_same_node() {
        let (manager, _, _) = manager();
        let request = AllocationRequest::new(requirements(2.0, 4.0, false), Priority::Normal);

        let first = manager.allocate(&request).await.unwrap();
        let node = first.node_id.clone();
        manager.release(&first.id).await;

        let second = manager.allocate(&request).await.unwrap();
        assert_eq!(second.node_id, node);
    }

    #[tokio::test]
    async fn release_of_unknown_allocation_is_a_no_op() {
        let (manager, _, _) = manager();
        assert!(!manager.release("nope").await);
    }

    #[tokio::test]
    async fn gpu_requirement_selects_a_gpu_node() {
        let (manager, _, _) = manager();
        let request = AllocationRequest::new(requirements(2.0, 4.0, true), Priority::Normal);
        let allocation = manager.allocate(&request).await.unwrap();
        assert_eq!(allocation.node_id, "gpu-01");
    }

    #[tokio::test]
    async fn failed_nodes_are_ineligible() {
        let bus = Arc::new(EventBus::default());
        let manager = ResourceManager::new(bus);
        let mut node = ResourceNode::new(
            "only",
            NodeType::Compute,
            NodeCapacity { cpu: 8.0, memory_gb: 16.0, storage_gb: 100.0, bandwidth_mbps: 1000.0, gpu_units: 0 },
        );
        node.status = NodeStatus::Failed;
        manager.register_node(node);

        let request = AllocationRequest::new(requirements(1.0, 1.0, false), Priority::Normal);
        let err = manager.allocate(&request).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NoSuitableNode);
    }

    #[tokio::test]
    async fn insufficient_capacity_yields_no_suitable_node() {
        let (manager, _, _) = manager();
        let request = AllocationRequest::new(requirements(1000.0, 4.0, false), Priority::Normal);
        assert!(manager.allocate(&request).await.is_err());
    }

    #[tokio::test]
    async fn constraints_filter_by_tag_region_and_exclusion() {
        let (manager, _, _) = manager();

        let mut request = AllocationRequest::new(requirements(1.0, 1.0, false), Priority::Normal);
        request.constraints.require_tags.insert("accelerator".into(), "nvenc".into());
        assert_eq!(manager.allocate(&request).await.unwrap().node_id, "gpu-01");

        let mut request = AllocationRequest::new(requirements(1.0, 1.0, false), Priority::Normal);
        request.constraints.region = Some("us-east-1c".into());
        assert_eq!(manager.allocate(&request).await.unwrap().node_id, "storage-01");

        let mut request = AllocationRequest::new(requirements(1.0, 1.0, false), Priority::Normal);
        request.constraints.node_types = Some(vec![NodeType::Compute]);
        request.constraints.exclude_nodes = vec!["compute-01".into(), "compute-02".into()];
        assert!(manager.allocate(&request).await.is_err());
    }

    #[tokio::test]
    async fn gpu_bonus_only_applies_when_the_job_needs_a_gpu() {
        let bus = Arc::new(EventBus::default());
        let manager = ResourceManager::new(bus);
        let capacity = NodeCapacity {
            cpu: 8.0,
            memory_gb: 16.0,
            storage_gb: 500.0,
            bandwidth_mbps: 1000.0,
            gpu_units: 0,
        };
        manager.register_node(ResourceNode::new("aa-compute", NodeType::Compute, capacity.clone()));
        manager.register_node(ResourceNode::new(
            "zz-gpu",
            NodeType::Gpu,
            NodeCapacity { gpu_units: 2, ..capacity },
        ));

        // Identical free capacity: without a gpu requirement the scores tie
        // and the deterministic tie-break picks the lower id, so the gpu
        // node stays free.
        let plain = AllocationRequest::new(requirements(2.0, 4.0, false), Priority::Normal);
        assert_eq!(manager.allocate(&plain).await.unwrap().node_id, "aa-compute");

        let gpu = AllocationRequest::new(requirements(2.0, 4.0, true), Priority::Normal);
        assert_eq!(manager.allocate(&gpu).await.unwrap().node_id, "zz-gpu");
    }

    #[tokio::test]
    async fn preferred_node_wins_the_tie() {
        let (manager, _, _) = manager();
        let mut request = AllocationRequest::new(requirements(1.0, 1.0, false), Priority::Normal);
        request.constraints.node_types = Some(vec![NodeType::Compute]);
        request.preferences.preferred_nodes = vec!["compute-02".into()];
        assert_eq!(manager.allocate(&request).await.unwrap().node_id, "compute-02");
    }

    #[tokio::test]
    async fn expired_allocations_are_reaped() {
        let (manager, bus, clock) = manager();
        let request = AllocationRequest::new(requirements(2.0, 4.0, false), Priority::Normal)
            .expiring_after(Duration::from_millis(500));
        let allocation = manager.allocate(&request).await.unwrap();
        let node = allocation.node_id.clone();

        clock.advance(1000);
        manager.reap_once().await;

        assert_eq!(manager.get_resource_stats().active_allocations, 0);
        let utilization = manager.get_node_utilization(&node).unwrap();
        assert!(utilization.cpu.abs() < 1e-9);

        let released = bus.event_history(Some(&crate::event_bus::EventFilter::for_types([
            topics::RESOURCE_RELEASED,
        ])));
        assert_eq!(released.len(), 1);
    }

    #[tokio::test]
    async fn silent_nodes_fail_and_recover_on_heartbeat() {
        let (manager, bus, clock) = manager();

        clock.advance(121_000);
        manager.reap_once().await;
        assert_eq!(manager.get_resource_stats().failed_nodes, 4);
        assert!(!bus
            .event_history(Some(&crate::event_bus::EventFilter::for_types([topics::NODE_FAILED])))
            .is_empty());

        manager.heartbeat("compute-01").await;
        let stats = manager.get_resource_stats();
        assert_eq!(stats.failed_nodes, 3);
        assert_eq!(stats.available_nodes, 1);
        assert_eq!(
            bus.event_history(Some(&crate::event_bus::EventFilter::for_types([
                topics::NODE_RECOVERED
            ])))
            .len(),
            1
        );
    }

    #[tokio::test]
    async fn hot_nodes_publish_high_utilization() {
        let bus = Arc::new(EventBus::default());
        let clock = VirtualTime::new();
        let manager = ResourceManager::new(bus.clone()).with_clock(Arc::new(clock.clone()));
        let mut node = ResourceNode::new(
            "hot",
            NodeType::Compute,
            NodeCapacity { cpu: 4.0, memory_gb: 8.0, storage_gb: 100.0, bandwidth_mbps: 100.0, gpu_units: 0 },
        );
        node.utilization = NodeUtilization { cpu: 95.0, memory: 95.0, storage: 95.0, network: 95.0, gpu: 0.0 };
        node.last_heartbeat_ms = clock.now_millis();
        manager.register_node(node);

        manager.reap_once().await;
        let events = bus.event_history(Some(&crate::event_bus::EventFilter::for_types([
            topics::HIGH_UTILIZATION,
        ])));
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn utilization_stays_within_bounds_under_load() {
        let (manager, _, _) = manager();
        let request = AllocationRequest::new(requirements(2.0, 4.0, false), Priority::Normal);
        let mut allocations = Vec::new();
        while let Ok(allocation) = manager.allocate(&request).await {
            allocations.push(allocation);
            if allocations.len() > 64 {
                break;
            }
        }
        for node in ["compute-01", "compute-02", "gpu-01", "storage-01"] {
            let u = manager.get_node_utilization(node).unwrap();
            for dim in [u.cpu, u.memory, u.storage, u.network, u.gpu] {
                assert!((0.0..=100.0).contains(&dim), "{node} out of bounds: {dim}");
            }
        }
    }
}
