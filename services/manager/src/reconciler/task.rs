//! Task records.

use chrono::{DateTime, Utc};
use convoy_agent_api::Resources;
use convoy_id::{ContainerId, NodeId, SecretId, ServiceId, Slot, TaskId};
use convoy_reconcile::SpecHash;
use serde::{Deserialize, Serialize};

use super::table::SlotKey;
use crate::binding::BindingSummary;
use crate::model::ServiceVersion;

/// Observed lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a node, bindings or dispatch.
    Pending,
    /// Accepted by a node.
    Assigned,
    /// Container is up.
    Running,
    /// Container exited 0.
    Completed,
    /// Container failed, or its node was lost.
    Failed,
    /// Stopped on purpose.
    Shutdown,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Shutdown)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStatus {
    pub container_id: ContainerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// One attempt at filling a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub service_id: ServiceId,
    pub service_name: String,
    pub slot: Slot,
    pub spec_version: u64,
    pub template_hash: SpecHash,

    /// Node chosen by the allocator. Cleared when placement has to be redone.
    pub desired_node: Option<NodeId>,

    /// Node that accepted the task.
    pub node_id: Option<NodeId>,

    pub state: TaskState,
    pub desired_state: DesiredState,
    pub container: Option<ContainerStatus>,
    pub bindings: BindingSummary,
    pub message: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(skip)]
    pub(crate) reservation: Resources,

    #[serde(skip)]
    pub(crate) secret_ids: Vec<SecretId>,
}

impl Task {
    pub fn new(version: &ServiceVersion, slot: Slot) -> Self {
        let id = TaskId::new();
        let now = Utc::now();
        Self {
            id,
            service_id: version.service_id,
            service_name: version.name().to_string(),
            slot,
            spec_version: version.version,
            template_hash: version.template_hash.clone(),
            desired_node: None,
            node_id: None,
            state: TaskState::Pending,
            desired_state: DesiredState::Running,
            container: None,
            bindings: BindingSummary::for_task(&id, version),
            message: "created".to_string(),
            error: None,
            created_at: now,
            updated_at: now,
            reservation: version.template().reservations,
            secret_ids: version.secret_ids(),
        }
    }

    pub fn slot_key(&self) -> SlotKey {
        SlotKey::new(self.service_id, self.slot)
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Node the task holds resources on: where it runs, else where it is headed.
    pub fn placed_node(&self) -> Option<NodeId> {
        self.node_id.or(self.desired_node)
    }

    pub(crate) fn set_state(&mut self, state: TaskState, message: impl Into<String>) {
        self.state = state;
        self.message = message.into();
        self.updated_at = Utc::now();
    }

    pub(crate) fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
        self.updated_at = Utc::now();
    }

    pub(crate) fn record_exit(&mut self, container_id: Option<ContainerId>, exit_code: Option<i32>) {
        match (&mut self.container, container_id) {
            (Some(status), _) => {
                if exit_code.is_some() {
                    status.exit_code = exit_code;
                }
            }
            (None, Some(container_id)) => {
                self.container = Some(ContainerStatus {
                    container_id,
                    exit_code,
                });
            }
            (None, None) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Assigned.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Shutdown.is_terminal());
    }

    #[test]
    fn test_state_serde() {
        assert_eq!(
            serde_json::to_string(&TaskState::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(TaskState::Shutdown.to_string(), "shutdown");
    }
}
