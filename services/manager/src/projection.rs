//! Status projection: read-only view of tasks for callers.
//!
//! The reconciler publishes a fresh [`TaskSnapshot`] after every batch of
//! changes; readers load the latest one without locking. Task views carry
//! binding summaries only, never secret material.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use convoy_id::{NodeId, ServiceId, TaskId};
use convoy_reconcile::ConvergenceStatus;
use serde::Serialize;
use tokio::sync::watch;

use crate::model::ServiceVersion;
use crate::reconciler::{Task, TaskState};

/// Tasks at one point in time.
#[derive(Debug, Default)]
pub struct TaskSnapshot {
    generation: u64,
    tasks: HashMap<TaskId, Task>,
    by_service: HashMap<ServiceId, Vec<TaskId>>,
}

impl TaskSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// A service's tasks ordered by slot, oldest first within a slot.
    pub fn service_tasks(&self, service_id: &ServiceId) -> Vec<&Task> {
        self.by_service
            .get(service_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Desired vs observed counts for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub service_id: ServiceId,
    pub version: u64,
    pub desired: u64,
    pub running: u64,
    pub pending: u64,
    pub convergence: ConvergenceStatus,
}

pub struct StatusProjection {
    current: ArcSwap<TaskSnapshot>,
    changes: watch::Sender<u64>,
}

impl Default for StatusProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusProjection {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(TaskSnapshot::default()),
            changes,
        }
    }

    /// Replace the snapshot with `tasks`.
    pub(crate) fn publish<'a>(&self, tasks: impl Iterator<Item = &'a Task>) {
        let generation = self.current.load().generation + 1;

        let mut snapshot = TaskSnapshot {
            generation,
            ..Default::default()
        };
        for task in tasks {
            snapshot
                .by_service
                .entry(task.service_id)
                .or_default()
                .push(task.id);
            snapshot.tasks.insert(task.id, task.clone());
        }
        for ids in snapshot.by_service.values_mut() {
            // Task IDs sort by creation time.
            ids.sort_by_key(|id| (snapshot.tasks[id].slot, *id));
        }

        self.current.store(Arc::new(snapshot));
        self.changes.send_replace(generation);
    }

    pub fn snapshot(&self) -> Arc<TaskSnapshot> {
        self.current.load_full()
    }

    /// Receives the generation of every publish.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Wait for the next publish after `seen`. Returns the new generation.
    pub async fn wait_for_change(&self, seen: u64) -> u64 {
        let mut rx = self.subscribe();
        let generation = match rx.wait_for(|generation| *generation > seen).await {
            Ok(generation) => *generation,
            Err(_) => self.snapshot().generation(),
        };
        generation
    }

    pub fn service_tasks(&self, service_id: &ServiceId) -> Vec<Task> {
        self.snapshot()
            .service_tasks(service_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.snapshot().task(id).cloned()
    }

    /// Live tasks placed on a node.
    pub fn node_tasks(&self, node_id: &NodeId) -> Vec<Task> {
        let snapshot = self.snapshot();
        let mut tasks: Vec<Task> = snapshot
            .tasks
            .values()
            .filter(|t| t.is_live() && t.placed_node() == Some(*node_id))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.service_id, t.slot));
        tasks
    }

    pub fn service_status(&self, version: &ServiceVersion) -> ServiceStatus {
        let snapshot = self.snapshot();
        let tasks = snapshot.service_tasks(&version.service_id);

        let running = tasks
            .iter()
            .filter(|t| t.state == TaskState::Running)
            .count() as u64;
        let pending: Vec<_> = tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Pending | TaskState::Assigned))
            .collect();
        let blocked = pending.iter().filter(|t| t.error.is_some()).count() as u64;

        ServiceStatus {
            service_id: version.service_id,
            version: version.version,
            desired: version.replicas(),
            running,
            pending: pending.len() as u64,
            convergence: ConvergenceStatus::from_counts(version.replicas(), running, blocked),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{spec, store};
    use convoy_id::Slot;

    #[tokio::test]
    async fn test_publish_orders_by_slot() {
        let store = store();
        let version = store.create_service(spec("web", 2)).await.unwrap();
        let projection = StatusProjection::new();

        let second = Task::new(&version, Slot::new(2));
        let first = Task::new(&version, Slot::new(1));
        let mut running = Task::new(&version, Slot::new(1));
        running.state = TaskState::Running;

        projection.publish([&second, &first, &running].into_iter());

        let tasks = projection.service_tasks(&version.service_id);
        let order: Vec<_> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(order, vec![first.id, running.id, second.id]);
        assert_eq!(projection.task(&second.id).unwrap().slot, Slot::new(2));
        assert_eq!(projection.snapshot().generation(), 1);

        let status = projection.service_status(&version);
        assert_eq!(status.desired, 2);
        assert_eq!(status.running, 1);
        assert_eq!(status.pending, 2);
        assert_eq!(status.convergence, ConvergenceStatus::Converging);
    }

    #[tokio::test]
    async fn test_node_tasks_only_live() {
        let store = store();
        let version = store.create_service(spec("web", 2)).await.unwrap();
        let projection = StatusProjection::new();
        let node = NodeId::new();

        let mut live = Task::new(&version, Slot::new(1));
        live.node_id = Some(node);
        live.state = TaskState::Running;
        let mut dead = Task::new(&version, Slot::new(2));
        dead.node_id = Some(node);
        dead.state = TaskState::Failed;

        projection.publish([&live, &dead].into_iter());
        let on_node = projection.node_tasks(&node);
        assert_eq!(on_node.len(), 1);
        assert_eq!(on_node[0].id, live.id);
    }

    #[tokio::test]
    async fn test_wait_for_change() {
        let projection = Arc::new(StatusProjection::new());
        let waiter = {
            let projection = projection.clone();
            tokio::spawn(async move { projection.wait_for_change(0).await })
        };
        tokio::task::yield_now().await;
        projection.publish(std::iter::empty());
        assert_eq!(waiter.await.unwrap(), 1);

        // A generation already past `seen` returns without waiting.
        projection.publish(std::iter::empty());
        let generation = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            projection.wait_for_change(1),
        )
        .await
        .unwrap();
        assert_eq!(generation, 2);
    }
}
