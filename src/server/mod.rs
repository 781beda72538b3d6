// src/server/mod.rs

//! Node startup and the peer-facing accept loop.

pub mod metrics_server;
pub mod peer_session;

use crate::config::Config;
use crate::core::state::ServerState;
use crate::core::storage::MemoryStore;
use crate::core::sync::controller;
use crate::core::tasks::log_cleaner;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// How long shutdown waits for in-flight peer work to drain.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the node state with the in-memory blob store and runs it until
/// shutdown.
pub async fn run(config: Config) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let state = ServerState::initialize(config, store, 0)?;
    run_with_state(state).await
}

/// Runs an already-initialized node: binds the peer listener, spawns the
/// background tasks, and serves until shutdown is requested.
pub async fn run_with_state(state: Arc<ServerState>) -> Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        "Node {} listening on {addr} ({} peers, {} self slots)",
        state.self_id(),
        state.distribution.peers().len(),
        state.distribution.self_slots().len()
    );

    if state.config.metrics.enabled {
        let metrics_state = state.clone();
        let shutdown_rx = state.subscribe_shutdown();
        tokio::spawn(metrics_server::run_metrics_server(metrics_state, shutdown_rx));
    }

    let cleaner = log_cleaner::spawn_log_cleaner(&state);
    let sync_workers = controller::spawn_sync_workers(&state);

    {
        let state = state.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                state.request_shutdown();
            }
        });
    }

    let mut shutdown_rx = state.subscribe_shutdown();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    tokio::spawn(peer_session::handle_connection(
                        state.clone(),
                        stream,
                        peer_addr,
                    ));
                }
                Err(e) => {
                    error!("Accept failed: {e}");
                }
            },
            _ = shutdown_rx.recv() => break,
        }
    }

    shutdown(&state, cleaner, sync_workers).await;
    Ok(())
}

/// Drains peers, stops background tasks, and persists the sync log.
async fn shutdown(
    state: &Arc<ServerState>,
    cleaner: tokio::task::JoinHandle<()>,
    sync_workers: Vec<tokio::task::JoinHandle<()>>,
) {
    info!("Draining peer connections for shutdown");
    state.fail_peer_waiters();

    let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
    while !state.peers_ready_for_shutdown() {
        if tokio::time::Instant::now() >= deadline {
            warn!("Shutdown drain timed out with peer work still in flight");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for worker in sync_workers {
        worker.abort();
    }
    cleaner.abort();

    if state.save_sync_log() {
        info!("Sync log persisted");
    }
    info!("Shutdown complete");
}
