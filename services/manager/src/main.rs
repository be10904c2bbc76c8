//! convoy manager
//!
//! Runs the reconciliation engine behind the REST API, together with a set of
//! in-process node agents backed by the mock runtime.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use convoy_agent::{AgentConfig, LocalAgent, MockRuntime};
use convoy_manager::{api, config, state::AppState, Manager};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to CONVOY_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting convoy manager");
    info!(
        listen_addr = %config.listen_addr,
        reconcile_interval_ms = config.reconcile_interval.as_millis() as u64,
        dev_nodes = config.dev_nodes,
        "Configuration loaded"
    );

    let manager = Arc::new(Manager::start(config.manager_settings()?));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Node settings shared by every dev agent; identity and storage are per node.
    let node_defaults = AgentConfig::from_env()?;
    let mut heartbeat_handles = Vec::with_capacity(config.dev_nodes);
    for i in 1..=config.dev_nodes {
        let agent_config = AgentConfig {
            node_id: None,
            hostname: format!("node-{i}"),
            data_dir: config.data_dir.join(format!("node-{i}")),
            ..node_defaults.clone()
        };
        let agent = LocalAgent::open(
            agent_config,
            Arc::new(MockRuntime::new()),
            manager.agent_sender(),
        )
        .await
        .with_context(|| format!("failed to start node agent {i}"))?;

        let node = manager
            .register_node(Arc::new(agent.clone()), agent.description())
            .await;
        info!(node_id = %node.id, hostname = %node.description.hostname, "Dev node registered");
        heartbeat_handles.push(agent.spawn_heartbeat(shutdown_rx.clone()));
    }

    let state = AppState::new(manager.clone());
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(5);
    for handle in heartbeat_handles {
        if tokio::time::timeout(shutdown_timeout, handle).await.is_err() {
            warn!("Heartbeat loop did not shut down in time");
        }
    }
    manager.shutdown().await;

    info!("Manager shutdown complete");
    Ok(())
}
