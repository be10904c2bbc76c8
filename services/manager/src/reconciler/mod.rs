//! Reconciliation loop.
//!
//! The [`Reconciler`] owns the task table and is its only writer. It reacts
//! to store events, agent messages, membership changes and the results of its
//! own dispatch jobs, and runs a full sweep on every tick as a safety net.
//!
//! Per slot the task moves through
//! `Pending -> Assigned -> Running -> (Completed | Failed | Shutdown)`.
//! A finished slot gets a new task (new ID, same slot) when its restart
//! policy allows it.
//!
//! Binding resolution and dispatch run on spawned jobs bounded by a
//! semaphore. While a slot has a job in flight it is left alone; the job's
//! result comes back as a [`WorkResult`] through the loop.

mod table;
mod task;
mod worker;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use convoy_agent_api::{Ack, AgentError, AgentMessage, Assignment, ReportedState, StatusReport};
use convoy_id::{NodeId, ServiceId, Slot, TaskId};
use convoy_reconcile::{BackoffPolicy, RetryTracker, DEFAULT_RECONCILE_INTERVAL, DEFAULT_RETRY_WINDOW};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::allocator::{self, ClusterView, SchedulingError, SlotOccupancy, SlotPlan};
use crate::binding::{BindingError, BindingResolver};
use crate::cluster::NodeRegistry;
use crate::model::{RestartCondition, RestartPolicy, ServiceVersion};
use crate::projection::StatusProjection;
use crate::store::{SpecStore, StoreEvent};

pub use table::SlotKey;
pub use task::{ContainerStatus, DesiredState, Task, TaskState};
pub use worker::{ReconcilerInputs, ReconcilerWorker};

use table::TaskTable;

const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Period of the full sweep.
    pub interval: Duration,

    /// Dispatch jobs running at once.
    pub dispatch_concurrency: usize,

    /// Longest a dispatch job may wait on a node before it counts as
    /// unreachable and gives up its permit.
    pub dispatch_timeout: Duration,

    /// Backoff between failed dispatch attempts for one slot.
    pub retry_backoff: BackoffPolicy,

    pub retry_window: Duration,

    /// Finished tasks kept per slot.
    pub task_history_limit: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONCILE_INTERVAL,
            dispatch_concurrency: 16,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            retry_backoff: BackoffPolicy::default(),
            retry_window: DEFAULT_RETRY_WINDOW,
            task_history_limit: 5,
        }
    }
}

/// Why a dispatch job failed.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Completion of a spawned job.
#[derive(Debug)]
pub enum WorkResult {
    Dispatched {
        key: SlotKey,
        task_id: TaskId,
        node_id: NodeId,
        outcome: Result<Ack, DispatchError>,
    },
}

pub struct Reconciler {
    store: Arc<SpecStore>,
    nodes: Arc<NodeRegistry>,
    resolver: Arc<BindingResolver>,
    projection: Arc<StatusProjection>,
    table: TaskTable,
    retries: RetryTracker<SlotKey>,
    limiter: Arc<Semaphore>,
    dispatch_timeout: Duration,
    results: mpsc::UnboundedSender<WorkResult>,

    /// The table changed since the last publish.
    dirty: bool,
}

impl Reconciler {
    pub(crate) fn new(
        store: Arc<SpecStore>,
        nodes: Arc<NodeRegistry>,
        projection: Arc<StatusProjection>,
        config: &ReconcilerConfig,
        results: mpsc::UnboundedSender<WorkResult>,
    ) -> Self {
        Self {
            resolver: Arc::new(BindingResolver::new(store.clone())),
            store,
            nodes,
            projection,
            table: TaskTable::new(config.task_history_limit),
            retries: RetryTracker::new(config.retry_backoff.clone(), config.retry_window),
            limiter: Arc::new(Semaphore::new(config.dispatch_concurrency.max(1))),
            dispatch_timeout: config.dispatch_timeout,
            results,
            dirty: false,
        }
    }

    /// Push table changes to the status projection.
    pub(crate) fn publish(&mut self) {
        if self.dirty {
            self.projection.publish(self.table.tasks());
            self.dirty = false;
        }
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Full pass over every service.
    #[instrument(skip(self))]
    pub(crate) async fn sweep(&mut self, now: Instant) {
        self.check_liveness(now).await;

        let snapshot = self.store.snapshot();
        let mut versions: Vec<_> = snapshot.services().cloned().collect();
        versions.sort_by_key(|v| v.service_id);

        let mut view = self.cluster_view().await;
        for version in &versions {
            self.reconcile_service(version, &mut view, now).await;
        }

        for service_id in self.table.service_ids() {
            if snapshot.service(&service_id).is_none() {
                self.remove_service(service_id).await;
            }
        }

        self.retries.prune(now);
    }

    /// Pass over a single service.
    pub(crate) async fn reconcile_one(&mut self, service_id: ServiceId, now: Instant) {
        let version = self.store.snapshot().service(&service_id).cloned();
        match version {
            Some(version) => {
                let mut view = self.cluster_view().await;
                self.reconcile_service(&version, &mut view, now).await;
            }
            None => self.remove_service(service_id).await,
        }
    }

    pub(crate) async fn handle_store_event(&mut self, event: StoreEvent, now: Instant) {
        debug!(?event, "store event");
        match event {
            StoreEvent::SecretCreated { .. } => self.sweep(now).await,
            StoreEvent::SecretDeleted { .. } => {}
            other => {
                if let Some(service_id) = other.service_id() {
                    self.reconcile_one(service_id, now).await;
                }
            }
        }
    }

    pub(crate) async fn handle_agent_message(&mut self, message: AgentMessage, now: Instant) {
        match message {
            AgentMessage::Heartbeat(heartbeat) => {
                if !self.nodes.heartbeat(&heartbeat.node_id, now).await {
                    debug!(node_id = %heartbeat.node_id, "heartbeat from unknown node");
                }
            }
            AgentMessage::Status(report) => self.handle_status(report, now).await,
        }
    }

    pub(crate) async fn handle_work(&mut self, result: WorkResult, now: Instant) {
        match result {
            WorkResult::Dispatched {
                key,
                task_id,
                node_id,
                outcome,
            } => self.handle_dispatched(key, task_id, node_id, outcome, now).await,
        }
    }

    // =========================================================================
    // Planning
    // =========================================================================

    async fn cluster_view(&self) -> ClusterView {
        let mut view = ClusterView::new(self.nodes.candidates().await);
        for task in self.table.tasks().filter(|t| t.is_live()) {
            if let Some(node) = task.placed_node() {
                view.charge(&node, &task.reservation);
            }
        }
        view
    }

    async fn reconcile_service(
        &mut self,
        version: &Arc<ServiceVersion>,
        view: &mut ClusterView,
        now: Instant,
    ) {
        let service_id = version.service_id;
        let replicas = version.replicas();
        let policy = version.template().restart_policy;

        self.roll_outdated(version).await;

        let mut slots: BTreeSet<Slot> = self.table.active_slots(service_id).into_iter().collect();
        slots.extend(Slot::range(replicas));

        let mut occupancy = BTreeMap::new();
        let mut busy = BTreeSet::new();
        for slot in slots {
            let key = SlotKey::new(service_id, slot);
            if slot.value() <= replicas {
                self.table.slot_mut(key).retired = false;
            }

            let mut previous_nodes = self.table.failed_nodes(&key);
            let entry = self.table.slot(&key);
            previous_nodes.extend(entry.and_then(|e| e.avoid));
            if entry.is_some_and(|e| e.in_flight) {
                busy.insert(slot);
            }

            let occupant = match self.table.live(&key) {
                Some(task) => SlotOccupancy {
                    live_node: task.placed_node(),
                    wanted: true,
                    previous_nodes,
                },
                None => SlotOccupancy {
                    live_node: None,
                    wanted: self.wants_task(&key, &policy, now),
                    previous_nodes,
                },
            };
            occupancy.insert(slot, occupant);
        }

        let plan = allocator::plan_service(
            replicas,
            &version.template().reservations,
            view,
            &occupancy,
        );

        for decision in plan {
            let key = SlotKey::new(service_id, decision.slot());
            if busy.contains(&key.slot) && !matches!(decision, SlotPlan::Remove { .. }) {
                continue;
            }
            match decision {
                SlotPlan::Keep { node, .. } => self.resume_pending(version, key, node, now),
                SlotPlan::Place { node, .. } => self.place(version, key, node, now).await,
                SlotPlan::Unschedulable { error, .. } => {
                    self.hold_unschedulable(version, key, error).await
                }
                SlotPlan::Idle { .. } => {}
                SlotPlan::Remove { .. } => self.retire_slot(key, "scaled down").await,
            }
        }
    }

    /// Whether an empty slot should get a new task now.
    fn wants_task(&self, key: &SlotKey, policy: &RestartPolicy, now: Instant) -> bool {
        let Some(entry) = self.table.slot(key) else {
            return true;
        };
        let Some(last) = entry.current.and_then(|id| self.table.get(&id)) else {
            return true;
        };

        let restart = match last.state {
            // Stopped by us for a move or an update: always refill.
            TaskState::Shutdown => return true,
            TaskState::Failed => policy.condition != RestartCondition::None,
            TaskState::Completed => policy.condition == RestartCondition::Any,
            _ => true,
        };

        restart
            && entry.restart_at.is_none_or(|at| now >= at)
            && policy.max_attempts.is_none_or(|max| entry.restarts < max)
    }

    /// Stop outdated tasks, at most `parallelism` slots at a time.
    async fn roll_outdated(&mut self, version: &ServiceVersion) {
        let service_id = version.service_id;
        let mut outdated = Vec::new();
        let mut superseded = Vec::new();
        let mut updating = 0u64;

        for slot in self.table.active_slots(service_id) {
            if slot.value() > version.replicas() {
                continue;
            }
            let key = SlotKey::new(service_id, slot);
            let Some(entry) = self.table.slot(&key) else {
                continue;
            };
            if entry.replacing {
                updating += 1;
                continue;
            }
            if entry.in_flight {
                continue;
            }
            let Some(task) = self.table.live(&key) else {
                continue;
            };
            if task.template_hash == version.template_hash {
                continue;
            }
            if task.state == TaskState::Pending {
                superseded.push(task.id);
            } else {
                outdated.push((key, task.id));
            }
        }

        for task_id in superseded {
            self.shutdown_task(task_id, "superseded by a newer version")
                .await;
        }

        let budget = version
            .spec
            .update_policy
            .budget()
            .replaceable(outdated.len() as u64, updating);
        if budget > 0 {
            info!(
                service_id = %service_id,
                version = version.version,
                outdated = outdated.len(),
                replacing = budget,
                "rolling update"
            );
        }

        let reason = format!("replaced by version {}", version.version);
        for (key, task_id) in outdated.into_iter().take(budget as usize) {
            self.shutdown_task(task_id, &reason).await;
            self.table.slot_mut(key).replacing = true;
        }
    }

    // =========================================================================
    // Applying the plan
    // =========================================================================

    /// Retry dispatch for a pending task that already has its node.
    fn resume_pending(
        &mut self,
        version: &Arc<ServiceVersion>,
        key: SlotKey,
        node: NodeId,
        now: Instant,
    ) {
        let Some(task) = self.table.live(&key) else {
            return;
        };
        if task.state != TaskState::Pending || task.desired_node != Some(node) {
            return;
        }
        let task_id = task.id;
        self.try_dispatch(version, key, task_id, node, now);
    }

    async fn place(
        &mut self,
        version: &Arc<ServiceVersion>,
        key: SlotKey,
        node: NodeId,
        now: Instant,
    ) {
        let live = self.table.live(&key).map(|t| (t.id, t.state, t.node_id));
        let task_id = match live {
            Some((task_id, TaskState::Pending, None)) => {
                if let Some(task) = self.table.get_mut(&task_id) {
                    if task.desired_node != Some(node) {
                        task.desired_node = Some(node);
                        task.set_message(format!("scheduled on {node}"));
                        self.dirty = true;
                    }
                }
                task_id
            }
            Some((previous, ..)) => {
                self.shutdown_task(previous, "node no longer eligible").await;
                self.create_task(version, key, Some(node), None).await
            }
            None => self.create_task(version, key, Some(node), None).await,
        };
        self.try_dispatch(version, key, task_id, node, now);
    }

    async fn hold_unschedulable(
        &mut self,
        version: &Arc<ServiceVersion>,
        key: SlotKey,
        error: SchedulingError,
    ) {
        let message = error.to_string();
        let live = self
            .table
            .live(&key)
            .map(|t| (t.id, t.state, t.error.clone()));

        match live {
            Some((task_id, TaskState::Pending, current)) => {
                if current.as_deref() == Some(message.as_str()) {
                    return;
                }
                warn!(task_id = %task_id, slot = %key, error = %message, "task unschedulable");
                if let Some(task) = self.table.get_mut(&task_id) {
                    task.desired_node = None;
                    task.error = Some(message);
                    task.set_message("pending");
                    self.dirty = true;
                }
            }
            Some((task_id, ..)) => {
                self.shutdown_task(task_id, "node no longer eligible").await;
                warn!(slot = %key, error = %message, "task unschedulable");
                self.create_task(version, key, None, Some(message)).await;
            }
            None => {
                warn!(slot = %key, error = %message, "task unschedulable");
                self.create_task(version, key, None, Some(message)).await;
            }
        }
    }

    async fn create_task(
        &mut self,
        version: &ServiceVersion,
        key: SlotKey,
        node: Option<NodeId>,
        error: Option<String>,
    ) -> TaskId {
        let previous = self.table.current(&key).map(|t| t.state);

        let mut task = Task::new(version, key.slot);
        task.desired_node = node;
        task.message = match node {
            Some(node) => format!("scheduled on {node}"),
            None => "pending".to_string(),
        };
        task.error = error;

        let task_id = task.id;
        self.store.pin_secrets(task_id, &task.secret_ids).await;
        self.table.insert(task);

        let entry = self.table.slot_mut(key);
        entry.retired = false;
        entry.restart_at = None;
        if matches!(previous, Some(TaskState::Failed | TaskState::Completed)) {
            entry.restarts += 1;
        }
        self.dirty = true;

        info!(
            task_id = %task_id,
            slot = %key,
            version = version.version,
            node_id = ?node,
            "task created"
        );
        task_id
    }

    fn try_dispatch(
        &mut self,
        version: &Arc<ServiceVersion>,
        key: SlotKey,
        task_id: TaskId,
        node: NodeId,
        now: Instant,
    ) {
        if !self.retries.is_ready(&key, now) {
            return;
        }
        let entry = self.table.slot_mut(key);
        if entry.in_flight {
            return;
        }
        entry.in_flight = true;

        let nodes = self.nodes.clone();
        let resolver = self.resolver.clone();
        let limiter = self.limiter.clone();
        let results = self.results.clone();
        let version = version.clone();
        let timeout = self.dispatch_timeout;

        tokio::spawn(async move {
            let Ok(_permit) = limiter.acquire_owned().await else {
                return;
            };
            let job = dispatch(&nodes, &resolver, &version, task_id, key.slot, node);
            let outcome = match tokio::time::timeout(timeout, job).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        task_id = %task_id,
                        node_id = %node,
                        timeout_ms = timeout.as_millis() as u64,
                        "dispatch timed out"
                    );
                    Err(AgentError::Unreachable(node).into())
                }
            };
            // The loop owns the receiver for its whole life.
            let _ = results.send(WorkResult::Dispatched {
                key,
                task_id,
                node_id: node,
                outcome,
            });
        });
    }

    async fn retire_slot(&mut self, key: SlotKey, reason: &str) {
        let entry = self.table.slot_mut(key);
        entry.retired = true;
        entry.replacing = false;
        self.dirty = true;

        if let Some(task_id) = self.table.live(&key).map(|t| t.id) {
            self.shutdown_task(task_id, reason).await;
        }
        self.retries.clear(&key);
    }

    async fn remove_service(&mut self, service_id: ServiceId) {
        let live: Vec<TaskId> = self
            .table
            .tasks()
            .filter(|t| t.service_id == service_id && t.is_live())
            .map(|t| t.id)
            .collect();
        for task_id in live {
            self.shutdown_task(task_id, "service removed").await;
        }

        let removed = self.table.remove_service(service_id);
        for task in &removed {
            self.retries.clear(&task.slot_key());
        }
        self.dirty = true;
        info!(service_id = %service_id, tasks = removed.len(), "service tasks removed");
    }

    /// Move a live task to `Shutdown` and tell its node to stop it.
    async fn shutdown_task(&mut self, task_id: TaskId, reason: &str) {
        let Some(task) = self.table.get_mut(&task_id) else {
            return;
        };
        task.desired_state = DesiredState::Shutdown;
        if task.state.is_terminal() {
            return;
        }

        task.set_state(TaskState::Shutdown, reason);
        let node = task.node_id;
        let slot = task.slot_key();
        let secrets = task.secret_ids.clone();
        self.dirty = true;

        self.store.unpin_secrets(task_id, &secrets).await;
        if let Some(node) = node {
            self.spawn_stop(node, task_id);
        }
        info!(task_id = %task_id, slot = %slot, reason, "task shut down");
    }

    /// Record a task's end. The caller records container details first.
    async fn terminate(&mut self, task_id: TaskId, state: TaskState, detail: String, now: Instant) {
        let Some(task) = self.table.get_mut(&task_id) else {
            return;
        };
        if task.state.is_terminal() {
            return;
        }

        if state == TaskState::Failed {
            task.error = Some(detail.clone());
            task.set_state(state, "failed");
        } else {
            task.set_state(state, detail.clone());
        }
        let key = task.slot_key();
        let secrets = task.secret_ids.clone();
        self.dirty = true;

        self.store.unpin_secrets(task_id, &secrets).await;

        let delay = self
            .store
            .snapshot()
            .service(&key.service_id)
            .map(|v| v.template().restart_policy.delay())
            .unwrap_or_default();
        let entry = self.table.slot_mut(key);
        if entry.current == Some(task_id) {
            entry.replacing = false;
            entry.restart_at = (!delay.is_zero()).then(|| now + delay);
        }

        if state == TaskState::Failed {
            warn!(task_id = %task_id, slot = %key, error = %detail, "task failed");
        } else {
            info!(task_id = %task_id, slot = %key, state = %state, "task finished");
        }
    }

    fn spawn_stop(&self, node: NodeId, task_id: TaskId) {
        let nodes = self.nodes.clone();
        tokio::spawn(async move {
            let Some(agent) = nodes.agent(&node).await else {
                return;
            };
            if let Err(e) = agent.stop(task_id).await {
                warn!(task_id = %task_id, node_id = %node, error = %e, "stop failed");
            }
        });
    }

    // =========================================================================
    // Observations
    // =========================================================================

    async fn check_liveness(&mut self, now: Instant) {
        for node in self.nodes.expire(now).await {
            let detail = AgentError::Unreachable(node).to_string();
            let affected: Vec<(TaskId, bool)> = self
                .table
                .tasks()
                .filter(|t| t.is_live())
                .filter_map(|t| {
                    if t.node_id == Some(node) {
                        Some((t.id, true))
                    } else if t.desired_node == Some(node) {
                        Some((t.id, false))
                    } else {
                        None
                    }
                })
                .collect();

            for (task_id, accepted) in affected {
                if accepted {
                    self.terminate(task_id, TaskState::Failed, detail.clone(), now)
                        .await;
                } else if let Some(task) = self.table.get_mut(&task_id) {
                    task.desired_node = None;
                    self.dirty = true;
                }
            }
        }
    }

    #[instrument(skip_all, fields(task_id = %report.task_id, node_id = %report.node_id, state = %report.state))]
    async fn handle_status(&mut self, report: StatusReport, now: Instant) {
        let task_id = report.task_id;
        let Some(task) = self.table.get_mut(&task_id) else {
            if !report.state.is_terminal() {
                warn!("report for unknown task; stopping it");
                self.spawn_stop(report.node_id, task_id);
            }
            return;
        };

        if task.placed_node() != Some(report.node_id) {
            if !report.state.is_terminal() {
                warn!("report from unexpected node; stopping it there");
                self.spawn_stop(report.node_id, task_id);
            }
            return;
        }

        if task.state.is_terminal() || task.desired_state == DesiredState::Shutdown {
            task.record_exit(report.container_id, report.exit_code);
            self.dirty = true;
            if !report.state.is_terminal() {
                warn!("late report for a stopped task; stopping it again");
                self.spawn_stop(report.node_id, task_id);
            }
            return;
        }

        let key = task.slot_key();
        match report.state {
            ReportedState::Accepted | ReportedState::Starting => {
                if task.state == TaskState::Pending {
                    task.node_id = Some(report.node_id);
                    task.set_state(TaskState::Assigned, report.state.to_string());
                } else {
                    task.set_message(report.state.to_string());
                }
                self.dirty = true;
            }
            ReportedState::Running => {
                task.node_id = Some(report.node_id);
                if let Some(container_id) = report.container_id {
                    task.container = Some(ContainerStatus {
                        container_id,
                        exit_code: None,
                    });
                }
                task.error = None;
                task.set_state(TaskState::Running, "running");
                self.dirty = true;

                self.retries.clear(&key);
                let entry = self.table.slot_mut(key);
                if entry.current == Some(task_id) {
                    entry.replacing = false;
                    entry.avoid = None;
                }
                info!(slot = %key, "task running");
                self.reconcile_one(key.service_id, now).await;
            }
            ReportedState::Completed => {
                task.record_exit(report.container_id, report.exit_code);
                self.terminate(task_id, TaskState::Completed, "finished".into(), now)
                    .await;
                self.reconcile_one(key.service_id, now).await;
            }
            ReportedState::Failed => {
                task.record_exit(report.container_id, report.exit_code);
                let detail = report.message.unwrap_or_else(|| match report.exit_code {
                    Some(code) => format!("task exited with code {code}"),
                    None => "task failed".to_string(),
                });
                self.terminate(task_id, TaskState::Failed, detail, now).await;
                self.reconcile_one(key.service_id, now).await;
            }
            ReportedState::Shutdown => {
                task.record_exit(report.container_id, report.exit_code);
                self.terminate(
                    task_id,
                    TaskState::Failed,
                    "container stopped unexpectedly".into(),
                    now,
                )
                .await;
                self.reconcile_one(key.service_id, now).await;
            }
        }
    }

    async fn handle_dispatched(
        &mut self,
        key: SlotKey,
        task_id: TaskId,
        node_id: NodeId,
        outcome: Result<Ack, DispatchError>,
        now: Instant,
    ) {
        self.table.clear_in_flight(&key);

        let accepted = outcome.is_ok();
        let stopped = match self.table.get(&task_id) {
            None => true,
            Some(task) => task.state.is_terminal() || task.desired_state == DesiredState::Shutdown,
        };
        if stopped {
            if accepted {
                debug!(task_id = %task_id, node_id = %node_id, "dispatch landed after shutdown; stopping");
                self.spawn_stop(node_id, task_id);
            }
            return;
        }

        match outcome {
            Ok(ack) => {
                self.retries.clear(&key);
                if !self.nodes.is_ready(&node_id).await {
                    self.spawn_stop(node_id, task_id);
                    if let Some(task) = self.table.get_mut(&task_id) {
                        task.node_id = Some(node_id);
                    }
                    self.terminate(
                        task_id,
                        TaskState::Failed,
                        AgentError::Unreachable(node_id).to_string(),
                        now,
                    )
                    .await;
                    self.reconcile_one(key.service_id, now).await;
                    return;
                }

                if let Some(task) = self.table.get_mut(&task_id) {
                    if task.state == TaskState::Pending {
                        task.node_id = Some(node_id);
                        task.error = None;
                        task.set_state(TaskState::Assigned, format!("assigned to {node_id}"));
                        self.dirty = true;
                    }
                }
                self.table.slot_mut(key).avoid = None;
                debug!(task_id = %task_id, accepted_at = %ack.accepted_at, "dispatch acknowledged");
            }
            Err(error) => {
                let retry_at = self.retries.record_failure(key, now);
                warn!(
                    task_id = %task_id,
                    slot = %key,
                    node_id = %node_id,
                    attempts = self.retries.attempts(&key),
                    retry_in_ms = retry_at.saturating_duration_since(now).as_millis() as u64,
                    error = %error,
                    "dispatch failed"
                );
                if let Some(task) = self.table.get_mut(&task_id) {
                    task.desired_node = None;
                    task.error = Some(error.to_string());
                    task.set_message("pending: retrying");
                    self.dirty = true;
                }
                self.table.slot_mut(key).avoid = Some(node_id);
            }
        }
    }
}

/// Resolve bindings and hand the assignment to the node.
async fn dispatch(
    nodes: &NodeRegistry,
    resolver: &BindingResolver,
    version: &ServiceVersion,
    task_id: TaskId,
    slot: Slot,
    node: NodeId,
) -> Result<Ack, DispatchError> {
    let agent = nodes
        .agent(&node)
        .await
        .ok_or(AgentError::Unreachable(node))?;
    let bindings = resolver.resolve(&task_id, version, agent.as_ref()).await?;

    let assignment = Assignment {
        task_id,
        service_id: version.service_id,
        service_name: version.name().to_string(),
        slot,
        spec_version: version.version,
        container: version.template().container.container_config(),
        mounts: bindings.mounts,
        secrets: bindings.secrets,
    };
    Ok(agent.dispatch(assignment).await?)
}
