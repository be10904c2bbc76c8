//! Configuration for the node agent.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use convoy_agent_api::Resources;
use convoy_id::NodeId;
use convoy_secrets::Ownership;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Fixed node identity. When unset the agent reuses the ID stored in its
    /// data directory, or creates one on first start.
    pub node_id: Option<NodeId>,

    pub hostname: String,

    /// Root for the state database, volumes and materialized secrets.
    pub data_dir: PathBuf,

    pub heartbeat_interval: Duration,

    /// Capacity advertised to the manager.
    pub resources: Resources,

    pub labels: BTreeMap<String, String>,

    /// Whether secret files are chowned to the requested uid/gid.
    pub secret_ownership: Ownership,
}

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_NANO_CPUS: u64 = 4_000_000_000;
const DEFAULT_MEMORY_BYTES: u64 = 8 * 1024 * 1024 * 1024;

impl AgentConfig {
    /// Defaults rooted at `data_dir`; the hostname is the directory name.
    pub fn for_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let hostname = data_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "convoy-node".to_string());

        Self {
            node_id: None,
            hostname,
            data_dir,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            resources: Resources {
                nano_cpus: DEFAULT_NANO_CPUS,
                memory_bytes: DEFAULT_MEMORY_BYTES,
            },
            labels: BTreeMap::new(),
            secret_ownership: Ownership::Skip,
        }
    }

    /// Load configuration from `CONVOY_NODE_*` / `CONVOY_AGENT_*` variables.
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("CONVOY_AGENT_DATA_DIR")
            .unwrap_or_else(|_| "/var/lib/convoy/agent".to_string());
        let mut config = Self::for_dir(data_dir);

        if let Ok(raw) = std::env::var("CONVOY_NODE_ID") {
            config.node_id = Some(
                raw.parse()
                    .with_context(|| format!("CONVOY_NODE_ID is not a node ID: '{raw}'"))?,
            );
        }

        if let Ok(hostname) = std::env::var("CONVOY_NODE_HOSTNAME") {
            config.hostname = hostname;
        }

        if let Ok(raw) = std::env::var("CONVOY_HEARTBEAT_INTERVAL_MS") {
            let millis: u64 = raw
                .parse()
                .context("CONVOY_HEARTBEAT_INTERVAL_MS must be a number")?;
            config.heartbeat_interval = Duration::from_millis(millis);
        }

        if let Ok(raw) = std::env::var("CONVOY_NODE_NANO_CPUS") {
            config.resources.nano_cpus = raw
                .parse()
                .context("CONVOY_NODE_NANO_CPUS must be a number")?;
        }

        if let Ok(raw) = std::env::var("CONVOY_NODE_MEMORY_BYTES") {
            config.resources.memory_bytes = raw
                .parse()
                .context("CONVOY_NODE_MEMORY_BYTES must be a number")?;
        }

        if let Ok(raw) = std::env::var("CONVOY_NODE_LABELS") {
            config.labels = parse_labels(&raw)?;
        }

        config.secret_ownership = match std::env::var("CONVOY_SECRET_CHOWN").as_deref() {
            Ok("1") | Ok("true") => Ownership::Apply,
            _ => Ownership::Skip,
        };

        Ok(config)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("agent.db")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.data_dir.join("volumes")
    }

    /// Where a task's secret files are written.
    pub fn task_secrets_dir(&self, task_dir: &str) -> PathBuf {
        self.data_dir
            .join("tasks")
            .join(task_dir)
            .join("secrets")
    }
}

/// Parse `key=value,key=value`.
fn parse_labels(raw: &str) -> Result<BTreeMap<String, String>> {
    raw.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("label '{pair}' must be key=value"))?;
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}
