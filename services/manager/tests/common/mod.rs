//! Shared harness: a manager with in-process agents on short timers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use convoy_agent::{AgentConfig, LocalAgent, MockRuntime};
use convoy_agent_api::NodeAgent;
use convoy_id::{NodeId, ServiceId};
use convoy_manager::model::{ContainerTemplate, ServiceSpec, TaskTemplate};
use convoy_manager::reconciler::{ReconcilerConfig, Task, TaskState};
use convoy_manager::store::crypto::MasterKey;
use convoy_manager::{Manager, ManagerSettings};
use convoy_reconcile::BackoffPolicy;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct TestNode {
    pub agent: LocalAgent,
    pub runtime: Arc<MockRuntime>,
}

pub struct TestCluster {
    pub manager: Arc<Manager>,
    pub nodes: Vec<TestNode>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    heartbeats: Vec<JoinHandle<()>>,
    dir: TempDir,
}

pub fn settings() -> ManagerSettings {
    ManagerSettings {
        reconciler: ReconcilerConfig {
            interval: Duration::from_millis(100),
            retry_backoff: BackoffPolicy {
                base: Duration::from_millis(20),
                max: Duration::from_millis(200),
                multiplier: 2.0,
            },
            ..ReconcilerConfig::default()
        },
        liveness_threshold: Duration::from_millis(400),
        master_key: MasterKey::generate(),
    }
}

impl TestCluster {
    pub async fn start(node_count: usize) -> Self {
        let mut cluster = Self::with_settings(settings());
        for _ in 0..node_count {
            cluster
                .add_node(|agent| Arc::new(agent) as Arc<dyn NodeAgent>)
                .await;
        }
        cluster
    }

    /// A manager with no nodes yet.
    pub fn with_settings(settings: ManagerSettings) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            manager: Arc::new(Manager::start(settings)),
            nodes: Vec::new(),
            shutdown_tx,
            shutdown_rx,
            heartbeats: Vec::new(),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Start an agent and register it. `wrap` picks what the manager talks
    /// to; heartbeats always come from the agent itself.
    pub async fn add_node(
        &mut self,
        wrap: impl FnOnce(LocalAgent) -> Arc<dyn NodeAgent>,
    ) -> NodeId {
        let index = self.nodes.len() + 1;
        let mut config = AgentConfig::for_dir(self.dir.path().join(format!("node-{index}")));
        config.heartbeat_interval = Duration::from_millis(50);
        let runtime = Arc::new(MockRuntime::new());
        let agent = LocalAgent::open(config, runtime.clone(), self.manager.agent_sender())
            .await
            .unwrap();

        self.manager
            .register_node(wrap(agent.clone()), agent.description())
            .await;
        self.heartbeats
            .push(agent.spawn_heartbeat(self.shutdown_rx.clone()));

        let node_id = agent.node_id();
        self.nodes.push(TestNode { agent, runtime });
        node_id
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.agent.node_id() == id)
            .expect("unknown node")
    }

    /// Poll until `check` returns a value.
    pub async fn wait_for<T>(&self, what: &str, mut check: impl FnMut(&Manager) -> Option<T>) -> T {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            if let Some(value) = check(&self.manager) {
                return value;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until the service has exactly `count` running tasks and nothing
    /// else live. Returns the running tasks ordered by slot.
    pub async fn wait_running(&self, service_id: ServiceId, count: usize) -> Vec<Task> {
        self.wait_for(&format!("{count} running task(s)"), |m| {
            let tasks = m.service_tasks(&service_id).ok()?;
            let running: Vec<Task> = tasks
                .iter()
                .filter(|t| t.state == TaskState::Running)
                .cloned()
                .collect();
            let live = tasks.iter().filter(|t| t.is_live()).count();
            (running.len() == count && live == count).then_some(running)
        })
        .await
    }

    /// Containers still running across all nodes.
    pub fn running_containers(&self) -> usize {
        self.nodes.iter().map(|n| n.runtime.running().len()).sum()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.heartbeats {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
        self.manager.shutdown().await;
    }
}

pub fn service(name: &str, replicas: u64) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        labels: Default::default(),
        task_template: TaskTemplate {
            container: ContainerTemplate {
                image: "busybox:latest".to_string(),
                command: vec!["top".to_string()],
                ..Default::default()
            },
            restart_policy: Default::default(),
            reservations: Default::default(),
        },
        replicas,
        update_policy: Default::default(),
    }
}
