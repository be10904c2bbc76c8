//! Node membership and liveness.
//!
//! Nodes join with an agent handle and a description of their capacity. Each
//! heartbeat refreshes the node's liveness; a node whose last heartbeat is
//! older than the threshold is marked down by [`NodeRegistry::expire`], which
//! the reconciler calls on every sweep.
//!
//! Any change that affects scheduling bumps a counter on a watch channel so
//! the reconciler re-plans without waiting for its next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use convoy_agent_api::{NodeAgent, NodeDescription};
use convoy_id::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::allocator::NodeCandidate;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("node '{0}' not found")]
    UnknownNode(String),
}

/// Liveness as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Ready,
    Down,
}

/// Operator intent for a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    /// Accepts new tasks.
    #[default]
    Active,
    /// Keeps its tasks, accepts no new ones.
    Pause,
    /// Tasks are moved elsewhere.
    Drain,
}

/// Public view of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub description: NodeDescription,
    pub status: NodeStatus,
    pub availability: Availability,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

struct NodeEntry {
    info: NodeInfo,
    last_heartbeat: Instant,
    agent: Arc<dyn NodeAgent>,
}

/// Registry of cluster nodes.
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, NodeEntry>>,
    liveness_threshold: Duration,
    membership: watch::Sender<u64>,
}

impl NodeRegistry {
    pub fn new(liveness_threshold: Duration) -> Self {
        let (membership, _) = watch::channel(0);
        Self {
            nodes: RwLock::new(HashMap::new()),
            liveness_threshold,
            membership,
        }
    }

    pub fn liveness_threshold(&self) -> Duration {
        self.liveness_threshold
    }

    /// Receives a new value whenever membership or node state changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.membership.subscribe()
    }

    fn bump(&self) {
        self.membership.send_modify(|generation| *generation += 1);
    }

    /// Add a node, or replace the agent of a node that rejoins.
    pub async fn register(
        &self,
        agent: Arc<dyn NodeAgent>,
        description: NodeDescription,
    ) -> NodeInfo {
        let id = agent.node_id();
        let now = Utc::now();

        let mut nodes = self.nodes.write().await;
        let availability = nodes
            .get(&id)
            .map(|e| e.info.availability)
            .unwrap_or_default();
        let registered_at = nodes.get(&id).map_or(now, |e| e.info.registered_at);

        let info = NodeInfo {
            id,
            description,
            status: NodeStatus::Ready,
            availability,
            registered_at,
            last_heartbeat_at: now,
        };
        nodes.insert(
            id,
            NodeEntry {
                info: info.clone(),
                last_heartbeat: Instant::now(),
                agent,
            },
        );
        drop(nodes);

        info!(node_id = %id, hostname = %info.description.hostname, "node registered");
        self.bump();
        info
    }

    /// Refresh liveness. Returns false for unknown nodes.
    pub async fn heartbeat(&self, id: &NodeId, now: Instant) -> bool {
        let mut nodes = self.nodes.write().await;
        let Some(entry) = nodes.get_mut(id) else {
            return false;
        };

        entry.last_heartbeat = now;
        entry.info.last_heartbeat_at = Utc::now();
        let recovered = entry.info.status == NodeStatus::Down;
        entry.info.status = NodeStatus::Ready;
        drop(nodes);

        if recovered {
            info!(node_id = %id, "node recovered");
            self.bump();
        }
        true
    }

    /// Mark nodes whose heartbeat is too old as down. Returns the newly down nodes.
    pub async fn expire(&self, now: Instant) -> Vec<NodeId> {
        let mut expired = Vec::new();
        let mut nodes = self.nodes.write().await;
        for entry in nodes.values_mut() {
            if entry.info.status == NodeStatus::Ready
                && now.saturating_duration_since(entry.last_heartbeat) > self.liveness_threshold
            {
                entry.info.status = NodeStatus::Down;
                expired.push(entry.info.id);
            }
        }
        drop(nodes);

        if !expired.is_empty() {
            for id in &expired {
                warn!(node_id = %id, threshold_ms = self.liveness_threshold.as_millis() as u64, "node heartbeat expired");
            }
            self.bump();
        }
        expired
    }

    pub async fn set_availability(
        &self,
        id: &NodeId,
        availability: Availability,
    ) -> Result<NodeInfo, ClusterError> {
        let mut nodes = self.nodes.write().await;
        let entry = nodes
            .get_mut(id)
            .ok_or_else(|| ClusterError::UnknownNode(id.to_string()))?;
        let changed = entry.info.availability != availability;
        entry.info.availability = availability;
        let info = entry.info.clone();
        drop(nodes);

        if changed {
            info!(node_id = %id, ?availability, "node availability changed");
            self.bump();
        }
        Ok(info)
    }

    pub async fn agent(&self, id: &NodeId) -> Option<Arc<dyn NodeAgent>> {
        self.nodes.read().await.get(id).map(|e| e.agent.clone())
    }

    pub async fn is_ready(&self, id: &NodeId) -> bool {
        self.nodes
            .read()
            .await
            .get(id)
            .is_some_and(|e| e.info.status == NodeStatus::Ready)
    }

    pub async fn get(&self, id: &NodeId) -> Option<NodeInfo> {
        self.nodes.read().await.get(id).map(|e| e.info.clone())
    }

    /// All nodes, ordered by ID.
    pub async fn list(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<_> = self
            .nodes
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// Scheduling input: every node with its full capacity and no load yet.
    pub async fn candidates(&self) -> Vec<NodeCandidate> {
        self.list()
            .await
            .into_iter()
            .map(|n| NodeCandidate {
                id: n.id,
                ready: n.status == NodeStatus::Ready,
                availability: n.availability,
                free: n.description.resources,
                task_count: 0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use convoy_agent_api::{Ack, AgentError, Assignment, Resources, VolumeHandle};
    use convoy_id::TaskId;

    struct NullAgent(NodeId);

    #[async_trait]
    impl NodeAgent for NullAgent {
        fn node_id(&self) -> NodeId {
            self.0
        }

        async fn dispatch(&self, assignment: Assignment) -> Result<Ack, AgentError> {
            Err(AgentError::Rejected(assignment.task_id.to_string()))
        }

        async fn stop(&self, _task_id: TaskId) -> Result<(), AgentError> {
            Ok(())
        }

        async fn ensure_volume(&self, name: &str) -> Result<VolumeHandle, AgentError> {
            Err(AgentError::Volume {
                name: name.into(),
                reason: "unsupported".into(),
            })
        }
    }

    fn description() -> NodeDescription {
        NodeDescription {
            hostname: "node-a".into(),
            resources: Resources {
                nano_cpus: 1_000_000_000,
                memory_bytes: 1 << 30,
            },
            labels: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_register_bumps_membership() {
        let registry = NodeRegistry::new(Duration::from_secs(1));
        let mut rx = registry.subscribe();
        let id = NodeId::new();

        let info = registry
            .register(Arc::new(NullAgent(id)), description())
            .await;
        assert_eq!(info.status, NodeStatus::Ready);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert!(registry.is_ready(&id).await);
        assert_eq!(registry.list().await.len(), 1);
        assert!(registry.agent(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_expire_and_recover() {
        let registry = NodeRegistry::new(Duration::from_millis(100));
        let id = NodeId::new();
        registry
            .register(Arc::new(NullAgent(id)), description())
            .await;

        let start = Instant::now();
        assert!(registry.expire(start).await.is_empty());

        let later = start + Duration::from_secs(1);
        assert_eq!(registry.expire(later).await, vec![id]);
        assert!(!registry.is_ready(&id).await);
        // Already down: not reported twice.
        assert!(registry.expire(later).await.is_empty());

        let mut rx = registry.subscribe();
        assert!(registry.heartbeat(&id, later).await);
        assert!(registry.is_ready(&id).await);
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_node() {
        let registry = NodeRegistry::new(Duration::from_secs(1));
        assert!(!registry.heartbeat(&NodeId::new(), Instant::now()).await);
    }

    #[tokio::test]
    async fn test_availability_and_candidates() {
        let registry = NodeRegistry::new(Duration::from_secs(1));
        let id = NodeId::new();
        registry
            .register(Arc::new(NullAgent(id)), description())
            .await;

        let info = registry
            .set_availability(&id, Availability::Drain)
            .await
            .unwrap();
        assert_eq!(info.availability, Availability::Drain);

        let candidates = registry.candidates().await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].availability, Availability::Drain);
        assert_eq!(candidates[0].free, description().resources);

        assert!(registry
            .set_availability(&NodeId::new(), Availability::Active)
            .await
            .is_err());
    }
}
