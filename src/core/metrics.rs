// src/core/metrics.rs

//! Defines and registers Prometheus metrics for node monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    // --- Mirror counters ---
    /// Total replication copy requests produced by client traffic.
    pub static ref COPY_REQUESTS_TOTAL: Counter =
        register_counter!("netcached_copy_requests_total", "Total mirror copy requests issued.").unwrap();
    /// Copy requests dropped because a peer's mirror queue was full.
    pub static ref COPY_REQUESTS_REJECTED: Counter =
        register_counter!("netcached_copy_requests_rejected_total", "Mirror copy requests dropped at the queue cap.").unwrap();
    /// Mirror events currently queued across all peers.
    pub static ref MIRROR_QUEUE_SIZE: Gauge =
        register_gauge!("netcached_mirror_queue_size", "Mirror events currently queued across all peers.").unwrap();

    // --- Sync counters ---
    /// Finished periodic sync sessions, labeled by outcome.
    pub static ref SYNC_SESSIONS_TOTAL: CounterVec =
        register_counter_vec!("netcached_sync_sessions_total", "Finished periodic sync sessions by outcome.", &["result"]).unwrap();
    /// Records currently held in the sync log.
    pub static ref SYNC_LOG_RECORDS: Gauge =
        register_gauge!("netcached_sync_log_records", "Records currently held in the sync log.").unwrap();
    /// Whether the node finished its initial sync round (1) or not (0).
    pub static ref INITIALLY_SYNCED: Gauge =
        register_gauge!("netcached_initially_synced", "Initial sync round completed (1 for true, 0 for false).").unwrap();

    // --- Peer connectivity ---
    /// Connect attempts that failed before any answer arrived.
    pub static ref PEER_CONN_ERRORS_TOTAL: Counter =
        register_counter!("netcached_peer_conn_errors_total", "Peer connect attempts failed before any answer.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
