use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use convoy_reconcile::BackoffPolicy;

use crate::reconciler::ReconcilerConfig;
use crate::store::crypto::MasterKey;
use crate::ManagerSettings;

const DEFAULT_NODE_LIVENESS: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,

    /// Period of the reconciler's full sweep.
    pub reconcile_interval: Duration,

    /// Nodes without a heartbeat for this long are marked down.
    pub node_liveness: Duration,

    pub dispatch_concurrency: usize,

    /// Dispatch jobs still waiting on a node after this long are abandoned.
    pub dispatch_timeout: Duration,

    /// Number of in-process agents started with the manager.
    pub dev_nodes: usize,

    /// Root for the in-process agents' state.
    pub data_dir: PathBuf,

    /// Base64 master key; a random one is generated when unset.
    pub master_key: Option<String>,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    let raw = env_or(name, &default.as_millis().to_string());
    let millis = raw
        .parse::<u64>()
        .with_context(|| format!("{name} must be a number of milliseconds, got '{raw}'"))?;
    Ok(Duration::from_millis(millis))
}

impl Default for Config {
    fn default() -> Self {
        let reconciler = ReconcilerConfig::default();
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_level: "info".to_string(),
            reconcile_interval: reconciler.interval,
            node_liveness: DEFAULT_NODE_LIVENESS,
            dispatch_concurrency: reconciler.dispatch_concurrency,
            dispatch_timeout: reconciler.dispatch_timeout,
            dev_nodes: 3,
            data_dir: PathBuf::from("/var/lib/convoy"),
            master_key: None,
        }
    }
}

impl Config {
    /// Defaults overridden by `CONVOY_*` variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let listen_addr = env_or("CONVOY_LISTEN_ADDR", &defaults.listen_addr.to_string())
            .parse()
            .context("CONVOY_LISTEN_ADDR must be a socket address")?;

        let log_level = env_or("CONVOY_LOG_LEVEL", &defaults.log_level);

        let reconcile_interval =
            env_millis("CONVOY_RECONCILE_INTERVAL_MS", defaults.reconcile_interval)?;
        let node_liveness = env_millis("CONVOY_NODE_LIVENESS_MS", defaults.node_liveness)?;
        let dispatch_timeout = env_millis("CONVOY_DISPATCH_TIMEOUT_MS", defaults.dispatch_timeout)?;

        let dispatch_concurrency = env_or(
            "CONVOY_DISPATCH_CONCURRENCY",
            &defaults.dispatch_concurrency.to_string(),
        )
        .parse()
        .context("CONVOY_DISPATCH_CONCURRENCY must be a number")?;

        let dev_nodes = env_or("CONVOY_DEV_NODES", &defaults.dev_nodes.to_string())
            .parse()
            .context("CONVOY_DEV_NODES must be a number")?;

        let data_dir = std::env::var("CONVOY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let master_key = std::env::var("CONVOY_SECRETS_MASTER_KEY").ok();

        Ok(Self {
            listen_addr,
            log_level,
            reconcile_interval,
            node_liveness,
            dispatch_concurrency,
            dispatch_timeout,
            dev_nodes,
            data_dir,
            master_key,
        })
    }

    /// Settings for [`crate::Manager::start`].
    pub fn manager_settings(&self) -> Result<ManagerSettings> {
        let master_key = match &self.master_key {
            Some(raw) => MasterKey::from_base64(raw).context("CONVOY_SECRETS_MASTER_KEY")?,
            None => MasterKey::generate(),
        };

        Ok(ManagerSettings {
            reconciler: ReconcilerConfig {
                interval: self.reconcile_interval,
                dispatch_concurrency: self.dispatch_concurrency,
                dispatch_timeout: self.dispatch_timeout,
                retry_backoff: BackoffPolicy::default(),
                ..ReconcilerConfig::default()
            },
            liveness_threshold: self.node_liveness,
            master_key,
        })
    }
}
