//! Contract between the convoy manager and its node agents.
//!
//! The manager pushes work to an agent through [`NodeAgent`]:
//!
//! - `dispatch` hands over a fully resolved [`Assignment`] and returns as soon
//!   as the agent has accepted it. Container start-up happens afterwards.
//! - `stop` asks the agent to tear a task down.
//! - `ensure_volume` creates a named volume on first use.
//!
//! Agents talk back asynchronously by sending [`AgentMessage`]s (status reports
//! and heartbeats) on the channel they were given at registration. Nothing on
//! the manager side waits for a container to start.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_id::{ContainerId, NodeId, SecretId, ServiceId, Slot, TaskId};
use convoy_secrets::{SecretFileTarget, SecretPayload};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by node agents.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    /// The agent cannot be reached (node down, channel closed).
    #[error("agent on node {0} is unreachable")]
    Unreachable(NodeId),

    /// The agent refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// A volume could not be created or looked up.
    #[error("volume '{name}' unavailable: {reason}")]
    Volume { name: String, reason: String },

    /// Unexpected agent-side failure.
    #[error("agent error: {0}")]
    Internal(String),
}

// =============================================================================
// Resources and node description
// =============================================================================

/// CPU and memory quantities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in units of 10^-9 cores.
    #[serde(default)]
    pub nano_cpus: u64,

    /// Memory in bytes.
    #[serde(default)]
    pub memory_bytes: u64,
}

impl Resources {
    /// Returns true if `self` can hold `other`.
    pub fn fits(&self, other: &Resources) -> bool {
        self.nano_cpus >= other.nano_cpus && self.memory_bytes >= other.memory_bytes
    }

    /// Component-wise saturating subtraction.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            nano_cpus: self.nano_cpus.saturating_sub(other.nano_cpus),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
        }
    }

    /// Component-wise saturating addition.
    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            nano_cpus: self.nano_cpus.saturating_add(other.nano_cpus),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
        }
    }
}

/// What a node announces when it joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub hostname: String,

    /// Capacity available to tasks.
    pub resources: Resources,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

// =============================================================================
// Assignments
// =============================================================================

/// Kind of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    /// Named volume managed by the node.
    Volume,
    /// Host path.
    Bind,
    /// In-memory filesystem.
    Tmpfs,
}

impl std::fmt::Display for MountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MountKind::Volume => "volume",
            MountKind::Bind => "bind",
            MountKind::Tmpfs => "tmpfs",
        })
    }
}

/// A named volume that exists on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeHandle {
    pub name: String,
    pub node_id: NodeId,

    /// Host path backing the volume.
    pub mountpoint: String,

    /// True if this call created the volume.
    pub created: bool,
}

/// A mount ready for the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedMount {
    pub kind: MountKind,

    /// Volume name, host path, or empty for tmpfs.
    pub source: String,

    /// Absolute path inside the container.
    pub target: String,

    pub read_only: bool,

    /// Present for volume mounts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeHandle>,
}

/// A secret ready to be written into the container.
#[derive(Debug, Clone)]
pub struct ResolvedSecret {
    pub secret_id: SecretId,
    pub secret_name: String,
    pub file: SecretFileTarget,
    pub payload: SecretPayload,
}

/// Container settings taken from the service's template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Everything a node needs to run one task.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub task_id: TaskId,
    pub service_id: ServiceId,
    pub service_name: String,
    pub slot: Slot,
    pub spec_version: u64,
    pub container: ContainerConfig,
    pub mounts: Vec<ResolvedMount>,
    pub secrets: Vec<ResolvedSecret>,
}

impl Assignment {
    /// Container name following `{service}.{slot}.{task}`.
    pub fn container_name(&self) -> String {
        format!("{}.{}.{}", self.service_name, self.slot, self.task_id.short())
    }
}

/// Acknowledgment that an agent accepted an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub accepted_at: DateTime<Utc>,
}

// =============================================================================
// Status reporting
// =============================================================================

/// Task state as observed by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedState {
    /// Assignment accepted, container not created yet.
    Accepted,
    /// Bindings materialized, container being created.
    Starting,
    /// Container is running.
    Running,
    /// Container exited with status 0.
    Completed,
    /// Container exited non-zero or could not start.
    Failed,
    /// Container stopped on request.
    Shutdown,
}

impl ReportedState {
    /// Returns true if no further reports follow for the task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Shutdown)
    }
}

impl std::fmt::Display for ReportedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Accepted => "accepted",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Status update for a single task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub state: ReportedState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<ContainerId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub reported_at: DateTime<Utc>,
}

impl StatusReport {
    /// Report without container details.
    pub fn new(task_id: TaskId, node_id: NodeId, state: ReportedState) -> Self {
        Self {
            task_id,
            node_id,
            state,
            container_id: None,
            exit_code: None,
            message: None,
            reported_at: Utc::now(),
        }
    }

    pub fn with_container(mut self, container_id: ContainerId) -> Self {
        self.container_id = Some(container_id);
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Liveness signal from a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: NodeId,
    pub running_tasks: u32,
    pub sent_at: DateTime<Utc>,
}

/// Messages flowing from agents to the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Status(StatusReport),
    Heartbeat(Heartbeat),
}

/// Sending half handed to agents at registration.
pub type AgentSender = mpsc::Sender<AgentMessage>;

// =============================================================================
// Agent trait
// =============================================================================

/// Operations the manager invokes on a node.
#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// Node this agent runs on.
    fn node_id(&self) -> NodeId;

    /// Accept an assignment. Returns once accepted, not once running.
    async fn dispatch(&self, assignment: Assignment) -> Result<Ack, AgentError>;

    /// Stop a task. Stopping an unknown task is not an error.
    async fn stop(&self, task_id: TaskId) -> Result<(), AgentError>;

    /// Make sure a named volume exists, creating it if needed.
    async fn ensure_volume(&self, name: &str) -> Result<VolumeHandle, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resources_fit() {
        let node = Resources {
            nano_cpus: 2_000_000_000,
            memory_bytes: 1 << 30,
        };
        let task = Resources {
            nano_cpus: 500_000_000,
            memory_bytes: 256 << 20,
        };
        assert!(node.fits(&task));
        assert!(!task.fits(&node));
        assert_eq!(
            node.saturating_sub(&task).saturating_add(&task),
            node
        );
        assert_eq!(task.saturating_sub(&node), Resources::default());
    }

    #[test]
    fn test_status_report_json() {
        let report = StatusReport::new(TaskId::new(), NodeId::new(), ReportedState::Running)
            .with_container(ContainerId::new());
        let json = serde_json::to_value(AgentMessage::Status(report.clone())).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["state"], "running");
        assert!(json.get("exit_code").is_none());

        let back: AgentMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, AgentMessage::Status(report));
    }

    #[test]
    fn test_terminal_states() {
        assert!(ReportedState::Failed.is_terminal());
        assert!(ReportedState::Completed.is_terminal());
        assert!(ReportedState::Shutdown.is_terminal());
        assert!(!ReportedState::Running.is_terminal());
        assert!(!ReportedState::Accepted.is_terminal());
    }

    #[test]
    fn test_mount_kind_serde() {
        assert_eq!(
            serde_json::to_string(&MountKind::Volume).unwrap(),
            "\"volume\""
        );
        assert_eq!(MountKind::Tmpfs.to_string(), "tmpfs");
    }
}
