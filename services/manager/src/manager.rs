//! The manager: spec store, node registry, reconciler and projection wired
//! together.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use convoy_agent_api::{AgentSender, NodeAgent, NodeDescription};
use convoy_id::{NodeId, SecretId, ServiceId, TaskId};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cluster::{Availability, ClusterError, NodeInfo, NodeRegistry};
use crate::model::{SecretMeta, ServiceSpec, ServiceVersion};
use crate::projection::{ServiceStatus, StatusProjection};
use crate::reconciler::{ReconcilerConfig, ReconcilerInputs, ReconcilerWorker, Task};
use crate::store::crypto::{MasterKey, SecretSealer};
use crate::store::{SpecStore, StoreError};

const AGENT_CHANNEL_CAPACITY: usize = 1024;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub reconciler: ReconcilerConfig,
    pub liveness_threshold: Duration,
    pub master_key: MasterKey,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            reconciler: ReconcilerConfig::default(),
            liveness_threshold: Duration::from_secs(15),
            master_key: MasterKey::generate(),
        }
    }
}

pub struct Manager {
    store: Arc<SpecStore>,
    nodes: Arc<NodeRegistry>,
    projection: Arc<StatusProjection>,
    agent_tx: AgentSender,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Build the components and spawn the reconciler. Needs a tokio runtime.
    pub fn start(settings: ManagerSettings) -> Self {
        let store = Arc::new(SpecStore::new(SecretSealer::new(settings.master_key)));
        let nodes = Arc::new(NodeRegistry::new(settings.liveness_threshold));
        let projection = Arc::new(StatusProjection::new());
        let (agent_tx, agent_rx) = mpsc::channel(AGENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inputs = ReconcilerInputs {
            store_events: store.subscribe(),
            agent_messages: agent_rx,
            membership: nodes.subscribe(),
        };
        let worker = ReconcilerWorker::new(
            store.clone(),
            nodes.clone(),
            projection.clone(),
            settings.reconciler,
            inputs,
        );
        let handle = tokio::spawn(worker.run(shutdown_rx));

        Self {
            store,
            nodes,
            projection,
            agent_tx,
            shutdown_tx,
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn store(&self) -> &Arc<SpecStore> {
        &self.store
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn projection(&self) -> &Arc<StatusProjection> {
        &self.projection
    }

    /// Channel agents report status and heartbeats on.
    pub fn agent_sender(&self) -> AgentSender {
        self.agent_tx.clone()
    }

    pub async fn register_node(
        &self,
        agent: Arc<dyn NodeAgent>,
        description: NodeDescription,
    ) -> NodeInfo {
        self.nodes.register(agent, description).await
    }

    pub async fn set_node_availability(
        &self,
        node_id: &NodeId,
        availability: Availability,
    ) -> Result<NodeInfo, ClusterError> {
        self.nodes.set_availability(node_id, availability).await
    }

    // =========================================================================
    // Spec store
    // =========================================================================

    pub async fn create_service(&self, spec: ServiceSpec) -> Result<Arc<ServiceVersion>, StoreError> {
        self.store.create_service(spec).await
    }

    pub async fn update_service(
        &self,
        id: ServiceId,
        spec: ServiceSpec,
    ) -> Result<Arc<ServiceVersion>, StoreError> {
        self.store.update_service(id, spec).await
    }

    pub async fn delete_service(&self, id: ServiceId) -> Result<(), StoreError> {
        self.store.delete_service(id).await
    }

    pub async fn create_secret(
        &self,
        name: impl Into<String>,
        data: Vec<u8>,
        labels: BTreeMap<String, String>,
    ) -> Result<SecretMeta, StoreError> {
        self.store.create_secret(name.into(), data, labels).await
    }

    pub async fn delete_secret(&self, id: SecretId) -> Result<(), StoreError> {
        self.store.delete_secret(id).await
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Tasks of a service, current and recent, ordered by slot.
    pub fn service_tasks(&self, id: &ServiceId) -> Result<Vec<Task>, StoreError> {
        self.store.get_service(id)?;
        Ok(self.projection.service_tasks(id))
    }

    pub fn task(&self, id: &TaskId) -> Result<Task, StoreError> {
        self.projection.task(id).ok_or_else(|| StoreError::NotFound {
            kind: "task",
            id: id.to_string(),
        })
    }

    pub fn service_status(&self, id: &ServiceId) -> Result<ServiceStatus, StoreError> {
        let version = self.store.get_service(id)?;
        Ok(self.projection.service_status(&version))
    }

    /// Stop the reconciler and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let Some(handle) = self.worker.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(())) => info!("Reconciler stopped"),
            Ok(Err(e)) => warn!(error = %e, "Reconciler task failed"),
            Err(_) => warn!("Reconciler did not shut down in time"),
        }
    }
}
