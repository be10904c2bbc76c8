//! In-process node agent.
//!
//! [`LocalAgent`] implements the manager's [`NodeAgent`] contract on top of a
//! [`Runtime`]. A dispatch is acknowledged as soon as the task is recorded;
//! materializing secrets, starting the container and waiting for its exit
//! happen on a spawned task that reports every transition on the manager's
//! agent channel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use convoy_agent_api::{
    Ack, AgentError, AgentMessage, AgentSender, Assignment, MountKind, NodeAgent,
    NodeDescription, ReportedState, ResolvedMount, StatusReport, VolumeHandle,
};
use convoy_id::{ContainerId, NodeId, TaskId};
use convoy_secrets::{remove_secret_dir, write_secret_file};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AgentConfig;
use crate::heartbeat::run_heartbeat_loop;
use crate::runtime::{ContainerInspect, ContainerSpec, MountPoint, Runtime, RuntimeError, SecretFile};
use crate::state::{StateStore, StateStoreError, TaskPhase, TaskRecord};
use crate::volumes::VolumeStore;

/// Failure to bring an agent up.
#[derive(Debug, Error)]
pub enum AgentStartError {
    #[error("failed to create data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    State(#[from] StateStoreError),
}

/// A task as tracked by the agent.
#[derive(Debug, Clone)]
struct LocalTask {
    phase: TaskPhase,
    container_id: Option<ContainerId>,
    stop_requested: bool,
}

struct Inner {
    node_id: NodeId,
    config: AgentConfig,
    runtime: Arc<dyn Runtime>,
    volumes: VolumeStore,
    state: Mutex<StateStore>,
    tasks: RwLock<HashMap<TaskId, LocalTask>>,
    reporter: AgentSender,

    /// Simulated network partition: requests fail, reports and heartbeats are
    /// dropped. Containers keep running.
    partitioned: AtomicBool,
}

/// Node agent running in the manager's process.
#[derive(Clone)]
pub struct LocalAgent {
    inner: Arc<Inner>,
}

impl LocalAgent {
    /// Open the agent's state under `config.data_dir` and recover from a
    /// previous run. Unfinished tasks whose containers are gone are reported
    /// as failed.
    pub async fn open(
        config: AgentConfig,
        runtime: Arc<dyn Runtime>,
        reporter: AgentSender,
    ) -> Result<Self, AgentStartError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|source| AgentStartError::DataDir {
            path: config.data_dir.clone(),
            source,
        })?;

        let state = StateStore::open(config.state_path())?;
        let stored = state.get_node_state()?.node_id;
        let node_id = match (config.node_id, stored) {
            (Some(configured), _) => configured,
            (None, Some(stored)) => stored,
            (None, None) => NodeId::new(),
        };
        if stored != Some(node_id) {
            state.set_node_id(&node_id)?;
        }

        let agent = Self {
            inner: Arc::new(Inner {
                node_id,
                volumes: VolumeStore::new(config.volumes_dir(), node_id),
                config,
                runtime,
                state: Mutex::new(state),
                tasks: RwLock::new(HashMap::new()),
                reporter,
                partitioned: AtomicBool::new(false),
            }),
        };
        agent.recover().await?;

        info!(
            node_id = %node_id,
            hostname = %agent.inner.config.hostname,
            data_dir = %agent.inner.config.data_dir.display(),
            "Node agent ready"
        );
        Ok(agent)
    }

    async fn recover(&self) -> Result<(), StateStoreError> {
        let unfinished = self.inner.state.lock().await.list_unfinished_tasks()?;

        for record in unfinished {
            let alive = match record.container_id {
                Some(id) => self.inner.runtime.inspect(&id).await.is_ok(),
                None => false,
            };
            if alive {
                // Still running under the runtime; resume waiting for it.
                let Some(container_id) = record.container_id else {
                    continue;
                };
                self.inner.tasks.write().await.insert(
                    record.task_id,
                    LocalTask {
                        phase: TaskPhase::Running,
                        container_id: Some(container_id),
                        stop_requested: false,
                    },
                );
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    inner.supervise(record.task_id, container_id).await;
                });
                continue;
            }

            warn!(task_id = %record.task_id, "Container lost while the agent was down");
            self.inner
                .finish(
                    record.task_id,
                    record.container_id,
                    ReportedState::Failed,
                    None,
                    Some("container lost during agent restart".to_string()),
                )
                .await;
        }
        Ok(())
    }

    pub fn description(&self) -> NodeDescription {
        let config = &self.inner.config;
        NodeDescription {
            hostname: config.hostname.clone(),
            resources: config.resources,
            labels: config.labels.clone(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Start the heartbeat loop.
    pub fn spawn_heartbeat(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(run_heartbeat_loop(self.clone(), shutdown))
    }

    /// Simulate losing (or regaining) the network. On recovery the agent
    /// re-reports its running tasks so the manager can reconcile them.
    pub async fn set_partitioned(&self, partitioned: bool) {
        let was = self.inner.partitioned.swap(partitioned, Ordering::SeqCst);
        if was == partitioned {
            return;
        }
        if partitioned {
            warn!(node_id = %self.inner.node_id, "Node partitioned");
            return;
        }

        info!(node_id = %self.inner.node_id, "Node reconnected");
        let running: Vec<(TaskId, Option<ContainerId>)> = self
            .inner
            .tasks
            .read()
            .await
            .iter()
            .filter(|(_, t)| t.phase == TaskPhase::Running)
            .map(|(id, t)| (*id, t.container_id))
            .collect();
        for (task_id, container_id) in running {
            let mut report = StatusReport::new(task_id, self.inner.node_id, ReportedState::Running);
            if let Some(container_id) = container_id {
                report = report.with_container(container_id);
            }
            self.inner.report(report).await;
        }
    }

    pub fn is_partitioned(&self) -> bool {
        self.inner.partitioned.load(Ordering::SeqCst)
    }

    /// Tasks with a running container.
    pub async fn running_tasks(&self) -> u32 {
        self.inner
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.phase == TaskPhase::Running)
            .count() as u32
    }

    /// Container of a task, once started.
    pub async fn task_container(&self, task_id: &TaskId) -> Option<ContainerId> {
        self.inner
            .tasks
            .read()
            .await
            .get(task_id)
            .and_then(|t| t.container_id)
    }

    pub async fn inspect_container(
        &self,
        container_id: &ContainerId,
    ) -> Result<ContainerInspect, RuntimeError> {
        self.inner.runtime.inspect(container_id).await
    }

    pub(crate) async fn send_heartbeat(&self) -> Result<(), AgentError> {
        if self.is_partitioned() {
            return Ok(());
        }
        let heartbeat = convoy_agent_api::Heartbeat {
            node_id: self.inner.node_id,
            running_tasks: self.running_tasks().await,
            sent_at: Utc::now(),
        };
        self.inner
            .reporter
            .send(AgentMessage::Heartbeat(heartbeat))
            .await
            .map_err(|_| AgentError::Internal("manager channel closed".to_string()))?;

        if let Err(e) = self
            .inner
            .state
            .lock()
            .await
            .set_last_heartbeat(Utc::now().timestamp())
        {
            debug!(error = %e, "Failed to record heartbeat");
        }
        Ok(())
    }

    fn ensure_reachable(&self) -> Result<(), AgentError> {
        if self.is_partitioned() {
            return Err(AgentError::Unreachable(self.inner.node_id));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeAgent for LocalAgent {
    fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    #[instrument(skip_all, fields(node_id = %self.inner.node_id, task_id = %assignment.task_id))]
    async fn dispatch(&self, assignment: Assignment) -> Result<Ack, AgentError> {
        self.ensure_reachable()?;
        let task_id = assignment.task_id;
        let ack = Ack {
            task_id,
            node_id: self.inner.node_id,
            accepted_at: Utc::now(),
        };

        {
            let mut tasks = self.inner.tasks.write().await;
            if tasks.contains_key(&task_id) {
                debug!("Duplicate dispatch acknowledged");
                return Ok(ack);
            }
            tasks.insert(
                task_id,
                LocalTask {
                    phase: TaskPhase::Accepted,
                    container_id: None,
                    stop_requested: false,
                },
            );
        }

        let now = ack.accepted_at.timestamp();
        let record = TaskRecord {
            task_id,
            service_id: assignment.service_id,
            slot: assignment.slot,
            phase: TaskPhase::Accepted,
            container_id: None,
            exit_code: None,
            created_at: now,
            updated_at: now,
        };
        let persisted = self.inner.state.lock().await.upsert_task(&record);
        if let Err(e) = persisted {
            self.inner.tasks.write().await.remove(&task_id);
            return Err(AgentError::Internal(format!("failed to record task: {e}")));
        }

        info!(
            service = %assignment.service_name,
            slot = %assignment.slot,
            image = %assignment.container.image,
            "Assignment accepted"
        );
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run(assignment).await });
        Ok(ack)
    }

    #[instrument(skip(self), fields(node_id = %self.inner.node_id))]
    async fn stop(&self, task_id: TaskId) -> Result<(), AgentError> {
        self.ensure_reachable()?;

        let container_id = {
            let mut tasks = self.inner.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else {
                debug!("Stop for unknown task ignored");
                return Ok(());
            };
            if task.phase.is_terminal() {
                return Ok(());
            }
            task.stop_requested = true;
            if task.container_id.is_some() {
                task.phase = TaskPhase::Stopping;
            }
            task.container_id
        };

        if let Some(container_id) = container_id {
            if let Err(e) = self
                .inner
                .state
                .lock()
                .await
                .set_task_phase(&task_id, TaskPhase::Stopping, None, None)
            {
                warn!(error = %e, "Failed to record stop");
            }
            match self.inner.runtime.stop(&container_id).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(AgentError::Internal(e.to_string())),
            }
        }
        Ok(())
    }

    async fn ensure_volume(&self, name: &str) -> Result<VolumeHandle, AgentError> {
        self.ensure_reachable()?;
        self.inner
            .volumes
            .ensure(name)
            .map_err(|e| AgentError::Volume {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }
}

impl Inner {
    /// Drive one task from acceptance to exit.
    #[instrument(skip_all, fields(node_id = %self.node_id, task_id = %assignment.task_id))]
    async fn run(&self, assignment: Assignment) {
        let task_id = assignment.task_id;
        self.set_phase(task_id, TaskPhase::Starting, None).await;
        self.report(StatusReport::new(task_id, self.node_id, ReportedState::Starting))
            .await;

        let spec = match self.prepare(&assignment) {
            Ok(spec) => spec,
            Err(message) => {
                self.finish(task_id, None, ReportedState::Failed, None, Some(message))
                    .await;
                return;
            }
        };

        let container_id = match self.runtime.start(spec).await {
            Ok(id) => id,
            Err(e) => {
                self.finish(task_id, None, ReportedState::Failed, None, Some(e.to_string()))
                    .await;
                return;
            }
        };

        let stop_requested = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(&task_id) {
                Some(task) => {
                    task.container_id = Some(container_id);
                    if !task.stop_requested {
                        task.phase = TaskPhase::Running;
                    }
                    task.stop_requested
                }
                None => true,
            }
        };

        if stop_requested {
            debug!("Stop arrived during start-up");
            if let Err(e) = self.runtime.stop(&container_id).await {
                warn!(error = %e, "Failed to stop container");
            }
        } else {
            self.set_phase(task_id, TaskPhase::Running, Some(container_id))
                .await;
            info!(container_id = %container_id, "Task running");
            self.report(
                StatusReport::new(task_id, self.node_id, ReportedState::Running)
                    .with_container(container_id),
            )
            .await;
        }

        self.supervise(task_id, container_id).await;
    }

    /// Wait for the container to exit and report how it ended.
    async fn supervise(&self, task_id: TaskId, container_id: ContainerId) {
        let exit = self.runtime.wait(&container_id).await;
        let stop_requested = self
            .tasks
            .read()
            .await
            .get(&task_id)
            .is_none_or(|t| t.stop_requested);

        let (state, exit_code, message) = match exit {
            Err(e) => (ReportedState::Failed, None, Some(e.to_string())),
            Ok(code) if stop_requested => (ReportedState::Shutdown, Some(code), None),
            Ok(0) => (ReportedState::Completed, Some(0), None),
            Ok(code) => (
                ReportedState::Failed,
                Some(code),
                Some(format!("task exited with code {code}")),
            ),
        };
        self.finish(task_id, Some(container_id), state, exit_code, message)
            .await;
    }

    /// Materialize secrets and build the container spec.
    fn prepare(&self, assignment: &Assignment) -> Result<ContainerSpec, String> {
        let secrets_dir = self
            .config
            .task_secrets_dir(&assignment.task_id.to_string());

        let mut secrets = Vec::with_capacity(assignment.secrets.len());
        for secret in &assignment.secrets {
            let host_path = write_secret_file(
                &secrets_dir,
                &secret.file,
                &secret.payload,
                self.config.secret_ownership,
            )
            .map_err(|e| format!("secret '{}': {e}", secret.secret_name))?;

            secrets.push(SecretFile {
                secret_id: secret.secret_id,
                secret_name: secret.secret_name.clone(),
                file_name: secret.file.name.clone(),
                host_path,
                container_path: secret.file.container_path(),
                uid: secret.file.uid.clone(),
                gid: secret.file.gid.clone(),
                mode: secret.file.mode,
            });
        }

        let mounts = assignment
            .mounts
            .iter()
            .map(|m| self.mount_point(m))
            .collect::<Result<Vec<_>, _>>()?;

        let container = &assignment.container;
        Ok(ContainerSpec {
            task_id: assignment.task_id,
            name: assignment.container_name(),
            image: container.image.clone(),
            command: container.command.clone(),
            args: container.args.clone(),
            env: container.env.clone(),
            labels: container.labels.clone(),
            mounts,
            secrets,
        })
    }

    fn mount_point(&self, mount: &ResolvedMount) -> Result<MountPoint, String> {
        let rw = !mount.read_only;
        let point = match mount.kind {
            MountKind::Volume => {
                let source = match &mount.volume {
                    Some(handle) => handle.mountpoint.clone(),
                    None => {
                        if !self.volumes.exists(&mount.source) {
                            return Err(format!("volume '{}' does not exist", mount.source));
                        }
                        self.volumes.path(&mount.source).to_string_lossy().into_owned()
                    }
                };
                MountPoint {
                    kind: MountKind::Volume,
                    name: Some(mount.source.clone()),
                    source,
                    destination: mount.target.clone(),
                    rw,
                }
            }
            MountKind::Bind => MountPoint {
                kind: MountKind::Bind,
                name: None,
                source: mount.source.clone(),
                destination: mount.target.clone(),
                rw,
            },
            MountKind::Tmpfs => MountPoint {
                kind: MountKind::Tmpfs,
                name: None,
                source: String::new(),
                destination: mount.target.clone(),
                rw,
            },
        };
        Ok(point)
    }

    async fn set_phase(&self, task_id: TaskId, phase: TaskPhase, container_id: Option<ContainerId>) {
        if let Some(task) = self.tasks.write().await.get_mut(&task_id) {
            if !task.phase.is_terminal() && task.phase != TaskPhase::Stopping {
                task.phase = phase;
            }
        }
        if let Err(e) = self
            .state
            .lock()
            .await
            .set_task_phase(&task_id, phase, container_id, None)
        {
            warn!(task_id = %task_id, error = %e, "Failed to record task phase");
        }
    }

    /// Record a task's end, clean up its secrets and report it.
    async fn finish(
        &self,
        task_id: TaskId,
        container_id: Option<ContainerId>,
        state: ReportedState,
        exit_code: Option<i32>,
        message: Option<String>,
    ) {
        let phase = match state {
            ReportedState::Failed if exit_code.is_none() => TaskPhase::Failed,
            _ => TaskPhase::Exited,
        };
        if let Some(task) = self.tasks.write().await.get_mut(&task_id) {
            task.phase = phase;
        }
        if let Err(e) = self
            .state
            .lock()
            .await
            .set_task_phase(&task_id, phase, container_id, exit_code)
        {
            warn!(task_id = %task_id, error = %e, "Failed to record task exit");
        }

        let secrets_dir = self.config.task_secrets_dir(&task_id.to_string());
        if let Err(e) = remove_secret_dir(&secrets_dir) {
            warn!(task_id = %task_id, error = %e, "Failed to remove secret files");
        }

        match &message {
            Some(message) if state == ReportedState::Failed => {
                warn!(task_id = %task_id, ?exit_code, error = %message, "Task failed")
            }
            _ => info!(task_id = %task_id, state = %state, ?exit_code, "Task finished"),
        }

        let mut report = StatusReport::new(task_id, self.node_id, state);
        if let Some(container_id) = container_id {
            report = report.with_container(container_id);
        }
        if let Some(code) = exit_code {
            report = report.with_exit_code(code);
        }
        if let Some(message) = message {
            report = report.with_message(message);
        }
        self.report(report).await;
    }

    async fn report(&self, report: StatusReport) {
        if self.partitioned.load(Ordering::SeqCst) {
            debug!(task_id = %report.task_id, state = %report.state, "Report dropped while partitioned");
            return;
        }
        if self.reporter.send(AgentMessage::Status(report)).await.is_err() {
            error!(node_id = %self.node_id, "Manager channel closed; report lost");
        }
    }
}
