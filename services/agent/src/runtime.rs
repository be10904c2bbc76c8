//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts container lifecycle operations:
//! - Creating and starting a container from a resolved spec
//! - Stopping it and waiting for its exit
//! - Inspecting its mounts and injected secret files
//!
//! [`MockRuntime`] keeps containers in memory. Tests drive exits through
//! [`MockRuntime::crash`].

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_agent_api::MountKind;
use convoy_id::{ContainerId, SecretId, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

/// Exit code reported for containers stopped on request.
pub const STOP_EXIT_CODE: i32 = 137;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container {0} not found")]
    NotFound(ContainerId),

    #[error("container failed to start: {0}")]
    Start(String),
}

/// A mount as the container sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountPoint {
    #[serde(rename = "Type")]
    pub kind: MountKind,

    /// Volume name; unset for bind and tmpfs mounts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Host path backing the mount.
    pub source: String,

    pub destination: String,

    #[serde(rename = "RW")]
    pub rw: bool,
}

/// A secret file injected into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecretFile {
    #[serde(rename = "SecretID")]
    pub secret_id: SecretId,
    pub secret_name: String,
    pub file_name: String,
    pub host_path: PathBuf,
    pub container_path: String,
    #[serde(rename = "UID")]
    pub uid: String,
    #[serde(rename = "GID")]
    pub gid: String,
    pub mode: u32,
}

/// Everything needed to create a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub task_id: TaskId,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<MountPoint>,
    pub secrets: Vec<SecretFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "Status")]
pub enum ContainerState {
    Running,
    Exited {
        #[serde(rename = "ExitCode")]
        exit_code: i32,
    },
}

/// Runtime view of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: ContainerId,
    pub task_id: TaskId,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub state: ContainerState,
    pub mounts: Vec<MountPoint>,
    pub secrets: Vec<SecretFile>,
    pub created: DateTime<Utc>,
}

/// Container runtime interface.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Create and start a container.
    async fn start(&self, spec: ContainerSpec) -> Result<ContainerId, RuntimeError>;

    /// Stop a container. Stopping an exited container is a no-op.
    async fn stop(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    /// Wait for the container to exit and return its exit code.
    async fn wait(&self, id: &ContainerId) -> Result<i32, RuntimeError>;

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerInspect, RuntimeError>;
}

struct MockContainer {
    inspect: ContainerInspect,
    exit: watch::Sender<Option<i32>>,
}

/// In-memory runtime for tests and development.
pub struct MockRuntime {
    containers: Mutex<HashMap<ContainerId, MockContainer>>,

    /// Whether containers should "fail" to start.
    fail_starts: AtomicBool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            fail_starts: AtomicBool::new(false),
        }
    }

    /// A runtime whose starts fail until [`MockRuntime::set_fail_starts`]
    /// turns them back on.
    pub fn failing() -> Self {
        let runtime = Self::new();
        runtime.set_fail_starts(true);
        runtime
    }

    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Make a running container exit with `exit_code`. Returns false if the
    /// container is unknown or already exited.
    pub fn crash(&self, id: &ContainerId, exit_code: i32) -> bool {
        let mut containers = self.containers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(container) = containers.get_mut(id) else {
            return false;
        };
        if container.inspect.state != ContainerState::Running {
            return false;
        }
        info!(container_id = %id, exit_code, "[MOCK] Container exited");
        container.inspect.state = ContainerState::Exited { exit_code };
        container.exit.send_replace(Some(exit_code));
        true
    }

    /// IDs of containers still running.
    pub fn running(&self) -> Vec<ContainerId> {
        let containers = self.containers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = containers
            .values()
            .filter(|c| c.inspect.state == ContainerState::Running)
            .map(|c| c.inspect.id)
            .collect();
        ids.sort();
        ids
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn start(&self, spec: ContainerSpec) -> Result<ContainerId, RuntimeError> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(RuntimeError::Start(
                "mock runtime configured to fail".to_string(),
            ));
        }
        if spec.image.is_empty() {
            return Err(RuntimeError::Start("no image given".to_string()));
        }

        let id = ContainerId::new();
        info!(
            task_id = %spec.task_id,
            container_id = %id,
            image = %spec.image,
            mounts = spec.mounts.len(),
            secrets = spec.secrets.len(),
            "[MOCK] Starting container"
        );

        let inspect = ContainerInspect {
            id,
            task_id: spec.task_id,
            name: spec.name,
            image: spec.image,
            command: spec.command,
            args: spec.args,
            env: spec.env,
            labels: spec.labels,
            state: ContainerState::Running,
            mounts: spec.mounts,
            secrets: spec.secrets,
            created: Utc::now(),
        };
        let (exit, _) = watch::channel(None);

        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, MockContainer { inspect, exit });
        Ok(id)
    }

    async fn stop(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let known = self
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id);
        if !known {
            return Err(RuntimeError::NotFound(*id));
        }
        debug!(container_id = %id, "[MOCK] Stopping container");
        self.crash(id, STOP_EXIT_CODE);
        Ok(())
    }

    async fn wait(&self, id: &ContainerId) -> Result<i32, RuntimeError> {
        let mut exit = self
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|c| c.exit.subscribe())
            .ok_or(RuntimeError::NotFound(*id))?;

        let code = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RuntimeError::NotFound(*id))?;
        Ok(code.unwrap_or_default())
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerInspect, RuntimeError> {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|c| c.inspect.clone())
            .ok_or(RuntimeError::NotFound(*id))
    }
}
