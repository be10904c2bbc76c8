//! Per-task binding resolution.
//!
//! Turns a version's mount requests and secret references into what a node
//! needs to start the container: volume handles, host paths and secret
//! plaintext. Resolution happens once per task, right before dispatch, on a
//! binding worker. Results are handed to the agent and never stored.

use std::sync::Arc;

use convoy_agent_api::{AgentError, MountKind, NodeAgent, ResolvedMount, ResolvedSecret};
use convoy_id::{NodeId, TaskId};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::model::{SecretReference, ServiceVersion};
use crate::store::{SpecStore, StoreError};

/// Failure to resolve one task's bindings. Only that task is held back.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BindingError {
    #[error("secret '{name}' not found")]
    SecretMissing { name: String },

    #[error("secret '{name}' could not be unsealed: {reason}")]
    SecretUnavailable { name: String, reason: String },

    #[error("volume '{name}' unavailable on node {node}: {source}")]
    Volume {
        name: String,
        node: NodeId,
        #[source]
        source: AgentError,
    },
}

/// Bindings ready for dispatch.
#[derive(Debug, Clone, Default)]
pub struct ResolvedBindings {
    pub mounts: Vec<ResolvedMount>,
    pub secrets: Vec<ResolvedSecret>,
}

/// Volume name used for a volume mount without a source.
pub fn anonymous_volume_name(task_id: &TaskId, index: usize) -> String {
    format!("anon-{}-{index}", task_id.short())
}

pub struct BindingResolver {
    store: Arc<SpecStore>,
}

impl BindingResolver {
    pub fn new(store: Arc<SpecStore>) -> Self {
        Self { store }
    }

    #[instrument(skip_all, fields(task_id = %task_id, node_id = %agent.node_id(), version = version.version))]
    pub async fn resolve(
        &self,
        task_id: &TaskId,
        version: &ServiceVersion,
        agent: &dyn NodeAgent,
    ) -> Result<ResolvedBindings, BindingError> {
        let container = &version.template().container;
        let mut mounts = Vec::with_capacity(container.mounts.len());

        for (index, request) in container.mounts.iter().enumerate() {
            let mount = match request.kind {
                MountKind::Volume => {
                    let name = request
                        .source
                        .clone()
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| anonymous_volume_name(task_id, index));
                    let handle = agent.ensure_volume(&name).await.map_err(|source| {
                        BindingError::Volume {
                            name: name.clone(),
                            node: agent.node_id(),
                            source,
                        }
                    })?;
                    debug!(volume = %name, created = handle.created, "volume ready");
                    ResolvedMount {
                        kind: MountKind::Volume,
                        source: name,
                        target: request.target.clone(),
                        read_only: request.read_only,
                        volume: Some(handle),
                    }
                }
                MountKind::Bind => ResolvedMount {
                    kind: MountKind::Bind,
                    source: request.source.clone().unwrap_or_default(),
                    target: request.target.clone(),
                    read_only: request.read_only,
                    volume: None,
                },
                MountKind::Tmpfs => ResolvedMount {
                    kind: MountKind::Tmpfs,
                    source: String::new(),
                    target: request.target.clone(),
                    read_only: request.read_only,
                    volume: None,
                },
            };
            mounts.push(mount);
        }

        let mut secrets = Vec::with_capacity(version.secrets.len());
        for reference in &version.secrets {
            let payload = self
                .store
                .unseal(&reference.secret_id)
                .map_err(|e| match e {
                    StoreError::NotFound { .. } => BindingError::SecretMissing {
                        name: reference.secret_name.clone(),
                    },
                    other => BindingError::SecretUnavailable {
                        name: reference.secret_name.clone(),
                        reason: other.to_string(),
                    },
                })?;
            secrets.push(ResolvedSecret {
                secret_id: reference.secret_id,
                secret_name: reference.secret_name.clone(),
                file: reference.file.clone(),
                payload,
            });
        }

        Ok(ResolvedBindings { mounts, secrets })
    }
}

/// A mount as shown on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountSummary {
    #[serde(rename = "type")]
    pub kind: MountKind,
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// What a task binds, without any secret material.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BindingSummary {
    pub mounts: Vec<MountSummary>,
    pub secrets: Vec<SecretReference>,
}

impl BindingSummary {
    pub fn for_task(task_id: &TaskId, version: &ServiceVersion) -> Self {
        let mounts = version
            .template()
            .container
            .mounts
            .iter()
            .enumerate()
            .map(|(index, m)| MountSummary {
                kind: m.kind,
                source: match (m.kind, m.source.as_deref()) {
                    (MountKind::Volume, None | Some("")) => anonymous_volume_name(task_id, index),
                    (_, source) => source.unwrap_or_default().to_string(),
                },
                target: m.target.clone(),
                read_only: m.read_only,
            })
            .collect();

        Self {
            mounts,
            secrets: version.secrets.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MountRequest, SecretRequest};
    use crate::store::tests::{spec, store};
    use async_trait::async_trait;
    use convoy_agent_api::{Ack, Assignment, VolumeHandle};
    use std::sync::Mutex;

    struct VolumeAgent {
        node: NodeId,
        fail: bool,
        requested: Mutex<Vec<String>>,
    }

    impl VolumeAgent {
        fn new(fail: bool) -> Self {
            Self {
                node: NodeId::new(),
                fail,
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NodeAgent for VolumeAgent {
        fn node_id(&self) -> NodeId {
            self.node
        }

        async fn dispatch(&self, _assignment: Assignment) -> Result<Ack, AgentError> {
            Err(AgentError::Rejected("not used".into()))
        }

        async fn stop(&self, _task_id: TaskId) -> Result<(), AgentError> {
            Ok(())
        }

        async fn ensure_volume(&self, name: &str) -> Result<VolumeHandle, AgentError> {
            self.requested.lock().unwrap().push(name.to_string());
            if self.fail {
                return Err(AgentError::Volume {
                    name: name.into(),
                    reason: "disk full".into(),
                });
            }
            Ok(VolumeHandle {
                name: name.into(),
                node_id: self.node,
                mountpoint: format!("/var/lib/convoy/volumes/{name}/_data"),
                created: true,
            })
        }
    }

    #[tokio::test]
    async fn test_resolves_mounts_one_to_one() {
        let store = Arc::new(store());
        let mut s = spec("web", 1);
        s.task_template.container.mounts = vec![
            MountRequest::volume("foo", "/foo"),
            MountRequest {
                kind: MountKind::Bind,
                source: Some("/srv/data".into()),
                target: "/data".into(),
                read_only: true,
            },
            MountRequest {
                kind: MountKind::Tmpfs,
                source: None,
                target: "/scratch".into(),
                read_only: false,
            },
        ];
        let version = store.create_service(s).await.unwrap();
        let agent = VolumeAgent::new(false);
        let task = TaskId::new();

        let resolved = BindingResolver::new(store)
            .resolve(&task, &version, &agent)
            .await
            .unwrap();

        assert_eq!(resolved.mounts.len(), 3);
        let volume = &resolved.mounts[0];
        assert_eq!(volume.source, "foo");
        assert_eq!(volume.target, "/foo");
        assert!(!volume.read_only);
        assert_eq!(volume.volume.as_ref().unwrap().node_id, agent.node);

        assert_eq!(resolved.mounts[1].source, "/srv/data");
        assert!(resolved.mounts[1].read_only);
        assert_eq!(resolved.mounts[2].kind, MountKind::Tmpfs);
        assert_eq!(*agent.requested.lock().unwrap(), vec!["foo".to_string()]);
    }

    #[tokio::test]
    async fn test_anonymous_volume_named_after_task() {
        let store = Arc::new(store());
        let mut s = spec("web", 1);
        s.task_template.container.mounts = vec![MountRequest {
            kind: MountKind::Volume,
            source: None,
            target: "/data".into(),
            read_only: false,
        }];
        let version = store.create_service(s).await.unwrap();
        let agent = VolumeAgent::new(false);
        let task = TaskId::new();

        let resolved = BindingResolver::new(store)
            .resolve(&task, &version, &agent)
            .await
            .unwrap();
        let expected = anonymous_volume_name(&task, 0);
        assert_eq!(resolved.mounts[0].source, expected);
        assert_eq!(
            BindingSummary::for_task(&task, &version).mounts[0].source,
            expected
        );
    }

    #[tokio::test]
    async fn test_resolves_secret_plaintext() {
        let store = Arc::new(store());
        store
            .create_secret("test_secret".into(), b"s3cr3t".to_vec(), Default::default())
            .await
            .unwrap();
        let mut s = spec("web", 1);
        s.task_template.container.secrets =
            vec![SecretRequest::named("test_secret").with_target("testing")];
        let version = store.create_service(s).await.unwrap();

        let resolved = BindingResolver::new(store)
            .resolve(&TaskId::new(), &version, &VolumeAgent::new(false))
            .await
            .unwrap();

        assert_eq!(resolved.secrets.len(), 1);
        let secret = &resolved.secrets[0];
        assert_eq!(secret.secret_name, "test_secret");
        assert_eq!(secret.file.name, "testing");
        assert_eq!(secret.payload.expose(), b"s3cr3t");
        assert!(!format!("{secret:?}").contains("s3cr3t"));

        let summary = BindingSummary::for_task(&TaskId::new(), &version);
        assert!(!serde_json::to_string(&summary).unwrap().contains("s3cr3t"));
    }

    #[tokio::test]
    async fn test_volume_failure_is_binding_error() {
        let store = Arc::new(store());
        let mut s = spec("web", 1);
        s.task_template.container.mounts = vec![MountRequest::volume("foo", "/foo")];
        let version = store.create_service(s).await.unwrap();

        let err = BindingResolver::new(store)
            .resolve(&TaskId::new(), &version, &VolumeAgent::new(true))
            .await
            .unwrap_err();
        assert!(matches!(err, BindingError::Volume { ref name, .. } if name == "foo"));
    }

    #[tokio::test]
    async fn test_deleted_secret_is_missing() {
        let store = Arc::new(store());
        let meta = store
            .create_secret("gone".into(), b"x".to_vec(), Default::default())
            .await
            .unwrap();
        let mut s = spec("web", 1);
        s.task_template.container.secrets = vec![SecretRequest::named("gone")];
        let version = store.create_service(s).await.unwrap();

        // The next version drops the reference; the old one still names it.
        store
            .update_service(version.service_id, spec("web", 1))
            .await
            .unwrap();
        store.delete_secret(meta.id).await.unwrap();

        let err = BindingResolver::new(store)
            .resolve(&TaskId::new(), &version, &VolumeAgent::new(false))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BindingError::SecretMissing {
                name: "gone".into()
            }
        );
    }
}
