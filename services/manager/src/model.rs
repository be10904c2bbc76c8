//! Desired-state types: service specs, mounts, secrets.
//!
//! A [`ServiceSpec`] is what callers submit. The store validates it, resolves
//! its secret requests into [`SecretReference`]s and freezes the result as a
//! [`ServiceVersion`]. Versions are never mutated after they are published.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use convoy_agent_api::{ContainerConfig, MountKind, Resources};
use convoy_id::{SecretId, ServiceId};
use convoy_reconcile::{SpecHash, UpdateBudget};
use convoy_secrets::SecretFileTarget;
use serde::{Deserialize, Serialize};

fn default_replicas() -> u64 {
    1
}

fn default_parallelism() -> u64 {
    1
}

/// Declarative description of a replicated service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    pub task_template: TaskTemplate,

    #[serde(default = "default_replicas")]
    pub replicas: u64,

    #[serde(default)]
    pub update_policy: UpdatePolicy,
}

/// Blueprint every task of a service is created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub container: ContainerTemplate,

    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Resources held on the node for each task.
    #[serde(default)]
    pub reservations: Resources,
}

/// Container settings plus the mounts and secrets it asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerTemplate {
    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub mounts: Vec<MountRequest>,

    #[serde(default)]
    pub secrets: Vec<SecretRequest>,
}

impl ContainerTemplate {
    /// Runtime settings without mounts and secrets.
    pub fn container_config(&self) -> ContainerConfig {
        ContainerConfig {
            image: self.image.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// A filesystem mount requested by the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    #[serde(rename = "type")]
    pub kind: MountKind,

    /// Volume name or host path. Absent for tmpfs and anonymous volumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    pub target: String,

    #[serde(default)]
    pub read_only: bool,
}

impl MountRequest {
    pub fn volume(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Volume,
            source: Some(source.into()),
            target: target.into(),
            read_only: false,
        }
    }
}

/// A reference to a stored secret, by name, with optional file settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRequest {
    /// Name of the secret.
    pub source: String,

    /// File name under `/run/secrets`; defaults to the secret name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

impl SecretRequest {
    /// Request a secret with every file setting left at its default.
    pub fn named(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: None,
            uid: None,
            gid: None,
            mode: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// A secret request after normalization against the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretReference {
    pub secret_id: SecretId,
    pub secret_name: String,
    pub file: SecretFileTarget,
}

/// When a finished task's slot gets a new task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartCondition {
    /// Replace after any exit.
    #[default]
    Any,
    /// Replace only after a failure.
    OnFailure,
    /// Never replace.
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(default)]
    pub condition: RestartCondition,

    /// Wait between a task ending and its replacement being created.
    #[serde(default)]
    pub delay_ms: u64,

    /// Give up on a slot after this many restarts. Unlimited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u64>,
}

impl RestartPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// How outdated tasks are rolled over after a spec change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    /// Slots replaced at once; 0 means all at once.
    #[serde(default = "default_parallelism")]
    pub parallelism: u64,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
        }
    }
}

impl UpdatePolicy {
    pub fn budget(&self) -> UpdateBudget {
        UpdateBudget {
            parallelism: self.parallelism,
        }
    }
}

/// One immutable, validated version of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceVersion {
    pub service_id: ServiceId,

    /// Starts at 1, increases by one per update.
    pub version: u64,

    pub spec: ServiceSpec,

    /// Secret requests resolved to stored secrets, in request order.
    pub secrets: Vec<SecretReference>,

    /// Hash of the task template. Tasks carrying another hash are outdated.
    pub template_hash: SpecHash,

    pub created_at: DateTime<Utc>,
}

impl ServiceVersion {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn replicas(&self) -> u64 {
        self.spec.replicas
    }

    pub fn template(&self) -> &TaskTemplate {
        &self.spec.task_template
    }

    /// IDs of every secret this version references.
    pub fn secret_ids(&self) -> Vec<SecretId> {
        self.secrets.iter().map(|s| s.secret_id).collect()
    }
}

/// Secret metadata. The payload never leaves the store through this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretMeta {
    pub id: SecretId,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
}
