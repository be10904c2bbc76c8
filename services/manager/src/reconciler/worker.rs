//! Reconciler background worker.
//!
//! Merges every input of the loop into one `select!` and publishes the task
//! table to the status projection after each handled event.

use std::sync::Arc;
use std::time::{Duration, Instant};

use convoy_agent_api::AgentMessage;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{info, instrument, warn};

use super::{Reconciler, ReconcilerConfig, WorkResult};
use crate::cluster::NodeRegistry;
use crate::projection::StatusProjection;
use crate::store::SpecStore;

/// Event sources feeding the loop.
pub struct ReconcilerInputs {
    pub store_events: broadcast::Receiver<crate::store::StoreEvent>,
    pub agent_messages: mpsc::Receiver<AgentMessage>,
    pub membership: watch::Receiver<u64>,
}

pub struct ReconcilerWorker {
    reconciler: Reconciler,
    results: mpsc::UnboundedReceiver<WorkResult>,
    inputs: ReconcilerInputs,
    interval: Duration,
}

impl ReconcilerWorker {
    pub fn new(
        store: Arc<SpecStore>,
        nodes: Arc<NodeRegistry>,
        projection: Arc<StatusProjection>,
        config: ReconcilerConfig,
        inputs: ReconcilerInputs,
    ) -> Self {
        let (results_tx, results) = mpsc::unbounded_channel();
        Self {
            reconciler: Reconciler::new(store, nodes, projection, &config, results_tx),
            results,
            inputs,
            interval: config.interval,
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip_all, name = "reconciler")]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting reconciler"
        );

        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut membership_open = true;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.reconciler.sweep(Instant::now()).await;
                }
                event = self.inputs.store_events.recv() => match event {
                    Ok(event) => {
                        self.reconciler.handle_store_event(event, Instant::now()).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Store events lagged, running full sweep");
                        self.reconciler.sweep(Instant::now()).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Spec store closed, reconciler stopping");
                        break;
                    }
                },
                Some(message) = self.inputs.agent_messages.recv() => {
                    self.reconciler.handle_agent_message(message, Instant::now()).await;
                }
                Some(result) = self.results.recv() => {
                    self.reconciler.handle_work(result, Instant::now()).await;
                }
                changed = self.inputs.membership.changed(), if membership_open => {
                    if changed.is_ok() {
                        self.reconciler.sweep(Instant::now()).await;
                    } else {
                        membership_open = false;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }

            self.reconciler.publish();
        }

        self.reconciler.publish();
    }
}
