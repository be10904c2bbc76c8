//! Heartbeat loop keeping the node alive in the manager's registry.
//!
//! Heartbeats carry the number of running tasks. A partitioned agent skips
//! them, which is how the manager notices a node is gone.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::agent::LocalAgent;

/// Run the heartbeat loop until shutdown.
pub async fn run_heartbeat_loop(agent: LocalAgent, mut shutdown: watch::Receiver<bool>) {
    let interval = agent.config().heartbeat_interval.max(Duration::from_millis(1));
    info!(
        hostname = %agent.config().hostname,
        interval_ms = interval.as_millis() as u64,
        "Starting heartbeat loop"
    );

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                match agent.send_heartbeat().await {
                    Ok(()) => {
                        consecutive_failures = 0;
                        debug!("Heartbeat sent");
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(error = %e, consecutive_failures, "Heartbeat failed");
                        } else {
                            error!(error = %e, consecutive_failures, "Heartbeat failed repeatedly");
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }
}
