// tests/integration/helpers.rs

//! Cluster scaffolding: builds N node states on loopback ports with fast
//! replication timings and runs their accept loops.

use netcached::config::{Config, PeerEntry};
use netcached::core::state::ServerState;
use netcached::core::storage::MemoryStore;
use netcached::server;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct TestNode {
    pub state: Arc<ServerState>,
    pub port: u16,
    handle: Option<JoinHandle<()>>,
}

impl TestNode {
    pub fn srv_id(&self) -> u64 {
        self.state.self_id()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.state.request_shutdown();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Picks free loopback ports by briefly binding them.
pub fn free_ports(n: usize) -> Vec<u16> {
    let listeners: Vec<StdTcpListener> = (0..n)
        .map(|_| StdTcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect()
}

/// Configuration for a cluster member: every node serves slot 1, timings are
/// tightened so periodic sync converges within a test's patience.
pub fn node_config(ports: &[u16], own_port: u16) -> Config {
    let mut config = Config::default();
    config.host = "127.0.0.1".to_string();
    config.port = own_port;
    config.mirror.servers = ports
        .iter()
        .map(|&port| PeerEntry {
            group: "grp1".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            slots: vec![1],
        })
        .collect();
    config.mirror.periodic_sync_interval = 200_000;
    config.mirror.periodic_sync_head_time = 0;
    config.mirror.periodic_sync_tail_time = 0;
    config.mirror.periodic_sync_timeout = 2_000_000;
    config.mirror.failed_sync_retry_delay = 200_000;
    config.mirror.peer_timeout = 2_000_000;
    config.mirror.peer_throttle_period = 1_000_000;
    config.mirror.cnt_errors_to_throttle = 1000;
    config.mirror.network_error_timeout = 3_600_000_000;
    config.mirror.sync_log_file = String::new();
    config
}

pub fn build_state(config: Config) -> Arc<ServerState> {
    ServerState::initialize(config, Arc::new(MemoryStore::new()), 0).unwrap()
}

/// Builds a node state and starts serving it.
pub async fn start_node(ports: &[u16], own_port: u16) -> TestNode {
    let state = build_state(node_config(ports, own_port));
    let handle = {
        let state = state.clone();
        tokio::spawn(async move {
            let _ = server::run_with_state(state).await;
        })
    };
    wait_for_listener(own_port).await;
    TestNode {
        state,
        port: own_port,
        handle: Some(handle),
    }
}

pub async fn wait_for_listener(port: u16) {
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("node on port {port} never came up");
}

/// Polls `check` until it succeeds or the timeout expires.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
