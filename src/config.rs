// src/config.rs

//! Manages server configuration: loading, resolving raw values, and validation.

use crate::core::clock::TICKS_PER_SEC;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::warn;

/// One server entry in the mirror registry (the local node included).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerEntry {
    pub group: String,
    pub host: String,
    pub port: u16,
    /// Slot numbers served by this server, 1-based.
    pub slots: Vec<u16>,
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8878
}

/// Raw `[mirror]` section as written in the file. All time windows are whole
/// seconds here and get resolved to microseconds in [`MirrorConfig`].
#[derive(Deserialize, Debug, Clone)]
struct RawMirrorSection {
    #[serde(default)]
    servers: Vec<PeerEntry>,
    #[serde(default = "default_max_active_syncs")]
    max_active_syncs: usize,
    #[serde(default = "default_max_syncs_one_server")]
    max_syncs_one_server: usize,
    #[serde(default = "default_threads_instant")]
    threads_instant: usize,
    #[serde(default = "default_threads_deferred")]
    threads_deferred: usize,
    #[serde(default = "default_max_deferred_time_pct")]
    max_deferred_time_pct: u64,
    /// Small/big mirror queue boundary in KiB.
    #[serde(default = "default_small_blob_max_size")]
    small_blob_max_size: u64,
    #[serde(default = "default_small_blob_preferred_threads_pct")]
    small_blob_preferred_threads_pct: usize,
    #[serde(default = "default_small_blob_exclusive_threads_pct")]
    small_blob_exclusive_threads_pct: usize,
    #[serde(default = "default_max_slot_log_records")]
    max_slot_log_records: u64,
    #[serde(default = "default_clean_slot_log_reserve")]
    clean_slot_log_reserve: u64,
    #[serde(default = "default_max_clean_log_batch")]
    max_clean_log_batch: u64,
    #[serde(default = "default_min_forced_clean_log_period")]
    min_forced_clean_log_period: u64,
    #[serde(default = "default_clean_log_attempt_interval")]
    clean_log_attempt_interval: u64,
    #[serde(default = "default_deferred_sync_interval")]
    deferred_sync_interval: u64,
    #[serde(default = "default_deferred_sync_head_time")]
    deferred_sync_head_time: u64,
    #[serde(default = "default_deferred_sync_tail_time")]
    deferred_sync_tail_time: u64,
    #[serde(default = "default_deferred_sync_timeout")]
    deferred_sync_timeout: u64,
    #[serde(default = "default_failed_sync_retry_delay")]
    failed_sync_retry_delay: u64,
    #[serde(default = "default_network_error_timeout")]
    network_error_timeout: u64,
    #[serde(default = "default_max_peer_total_conns")]
    max_peer_total_conns: usize,
    #[serde(default = "default_max_peer_bg_conns")]
    max_peer_bg_conns: usize,
    #[serde(default = "default_cnt_errors_to_throttle")]
    cnt_errors_to_throttle: u32,
    #[serde(default = "default_peer_throttle_period")]
    peer_throttle_period: u64,
    #[serde(default = "default_peer_timeout")]
    peer_timeout: u64,
    #[serde(default = "default_max_mirror_queue_size")]
    max_mirror_queue_size: usize,
    #[serde(default = "default_sync_log_file")]
    sync_log_file: String,
    #[serde(default)]
    mirroring_log_file: String,
    #[serde(default)]
    periodic_log_file: String,
    #[serde(default)]
    copy_delay_log_file: String,
}

fn default_max_active_syncs() -> usize {
    4
}
fn default_max_syncs_one_server() -> usize {
    2
}
fn default_threads_instant() -> usize {
    6
}
fn default_threads_deferred() -> usize {
    30
}
fn default_max_deferred_time_pct() -> u64 {
    10
}
fn default_small_blob_max_size() -> u64 {
    100 // KiB
}
fn default_small_blob_preferred_threads_pct() -> usize {
    33
}
fn default_small_blob_exclusive_threads_pct() -> usize {
    33
}
fn default_max_slot_log_records() -> u64 {
    100_000
}
fn default_clean_slot_log_reserve() -> u64 {
    1_000
}
fn default_max_clean_log_batch() -> u64 {
    10_000
}
fn default_min_forced_clean_log_period() -> u64 {
    10 // seconds
}
fn default_clean_log_attempt_interval() -> u64 {
    1 // seconds
}
fn default_deferred_sync_interval() -> u64 {
    10 // seconds
}
fn default_deferred_sync_head_time() -> u64 {
    1 // seconds
}
fn default_deferred_sync_tail_time() -> u64 {
    10 // seconds
}
fn default_deferred_sync_timeout() -> u64 {
    10 // seconds
}
fn default_failed_sync_retry_delay() -> u64 {
    1 // seconds
}
fn default_network_error_timeout() -> u64 {
    300 // seconds
}
fn default_max_peer_total_conns() -> usize {
    100
}
fn default_max_peer_bg_conns() -> usize {
    50
}
fn default_cnt_errors_to_throttle() -> u32 {
    10
}
fn default_peer_throttle_period() -> u64 {
    10 // seconds
}
fn default_peer_timeout() -> u64 {
    10 // seconds
}
fn default_max_mirror_queue_size() -> usize {
    10_000
}
fn default_sync_log_file() -> String {
    "sync_events.log".to_string()
}

impl Default for RawMirrorSection {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            max_active_syncs: default_max_active_syncs(),
            max_syncs_one_server: default_max_syncs_one_server(),
            threads_instant: default_threads_instant(),
            threads_deferred: default_threads_deferred(),
            max_deferred_time_pct: default_max_deferred_time_pct(),
            small_blob_max_size: default_small_blob_max_size(),
            small_blob_preferred_threads_pct: default_small_blob_preferred_threads_pct(),
            small_blob_exclusive_threads_pct: default_small_blob_exclusive_threads_pct(),
            max_slot_log_records: default_max_slot_log_records(),
            clean_slot_log_reserve: default_clean_slot_log_reserve(),
            max_clean_log_batch: default_max_clean_log_batch(),
            min_forced_clean_log_period: default_min_forced_clean_log_period(),
            clean_log_attempt_interval: default_clean_log_attempt_interval(),
            deferred_sync_interval: default_deferred_sync_interval(),
            deferred_sync_head_time: default_deferred_sync_head_time(),
            deferred_sync_tail_time: default_deferred_sync_tail_time(),
            deferred_sync_timeout: default_deferred_sync_timeout(),
            failed_sync_retry_delay: default_failed_sync_retry_delay(),
            network_error_timeout: default_network_error_timeout(),
            max_peer_total_conns: default_max_peer_total_conns(),
            max_peer_bg_conns: default_max_peer_bg_conns(),
            cnt_errors_to_throttle: default_cnt_errors_to_throttle(),
            peer_throttle_period: default_peer_throttle_period(),
            peer_timeout: default_peer_timeout(),
            max_mirror_queue_size: default_max_mirror_queue_size(),
            sync_log_file: default_sync_log_file(),
            mirroring_log_file: String::new(),
            periodic_log_file: String::new(),
            copy_delay_log_file: String::new(),
        }
    }
}

/// Resolved replication settings. All time windows are in microseconds, the
/// blob boundary is in bytes, and the small-thread percentages have been
/// turned into absolute counts.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub servers: Vec<PeerEntry>,
    pub max_active_syncs: usize,
    pub max_syncs_one_server: usize,
    pub threads_instant: usize,
    pub threads_deferred: usize,
    pub max_deferred_time_pct: u64,
    pub small_blob_boundary: u64,
    pub mirror_small_preferred: usize,
    pub mirror_small_exclusive: usize,
    pub max_slot_log_records: u64,
    pub clean_slot_log_reserve: u64,
    pub max_clean_log_batch: u64,
    pub min_forced_clean_period: u64,
    /// Cleaner wakeup cadence, kept in whole seconds.
    pub clean_attempt_interval: u64,
    pub periodic_sync_interval: u64,
    pub periodic_sync_head_time: u64,
    pub periodic_sync_tail_time: u64,
    pub periodic_sync_timeout: u64,
    pub failed_sync_retry_delay: u64,
    pub network_error_timeout: u64,
    pub max_peer_total_conns: usize,
    pub max_peer_bg_conns: usize,
    pub cnt_errors_to_throttle: u32,
    pub peer_throttle_period: u64,
    pub peer_timeout: u64,
    pub max_mirror_queue_size: usize,
    pub sync_log_file: String,
    pub mirroring_log_file: String,
    pub periodic_log_file: String,
    pub copy_delay_log_file: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self::resolve(RawMirrorSection::default())
    }
}

impl MirrorConfig {
    fn resolve(raw: RawMirrorSection) -> Self {
        let threads_deferred = raw.threads_deferred.max(1);
        let threads_instant = raw.threads_instant.max(1);

        // Turn the small-blob thread percentages into absolute counts the way
        // the legacy dedicated mirror pool sized itself; the counts now bound
        // how the shared background connection budget is split between the
        // small and big queues.
        let pct_preferred = raw.small_blob_preferred_threads_pct.min(100);
        let pct_exclusive = raw.small_blob_exclusive_threads_pct.min(100);
        let mut small_preferred = (pct_preferred * threads_instant / 100).max(1);
        let mut small_exclusive = (pct_exclusive * threads_instant / 100).max(1);
        if small_preferred >= threads_instant {
            small_preferred = threads_instant;
            small_exclusive = 0;
        } else if small_exclusive > threads_instant - small_preferred {
            small_exclusive = threads_instant - small_preferred;
        }

        let max_slot_log_records = raw.max_slot_log_records.max(10);
        let clean_slot_log_reserve = raw.clean_slot_log_reserve.min(max_slot_log_records - 1);

        Self {
            servers: raw.servers,
            max_active_syncs: raw.max_active_syncs.max(1),
            max_syncs_one_server: raw.max_syncs_one_server.max(1),
            threads_instant,
            threads_deferred,
            max_deferred_time_pct: raw.max_deferred_time_pct.clamp(1, 100),
            small_blob_boundary: raw.small_blob_max_size * 1024,
            mirror_small_preferred: small_preferred,
            mirror_small_exclusive: small_exclusive,
            max_slot_log_records,
            clean_slot_log_reserve,
            max_clean_log_batch: raw.max_clean_log_batch.max(1),
            min_forced_clean_period: raw.min_forced_clean_log_period * TICKS_PER_SEC,
            clean_attempt_interval: raw.clean_log_attempt_interval.max(1),
            periodic_sync_interval: raw.deferred_sync_interval * TICKS_PER_SEC,
            periodic_sync_head_time: raw.deferred_sync_head_time * TICKS_PER_SEC,
            periodic_sync_tail_time: raw.deferred_sync_tail_time * TICKS_PER_SEC,
            periodic_sync_timeout: raw.deferred_sync_timeout * TICKS_PER_SEC,
            failed_sync_retry_delay: raw.failed_sync_retry_delay * TICKS_PER_SEC,
            network_error_timeout: raw.network_error_timeout * TICKS_PER_SEC,
            max_peer_total_conns: raw.max_peer_total_conns.max(1),
            max_peer_bg_conns: raw.max_peer_bg_conns.max(1),
            cnt_errors_to_throttle: raw.cnt_errors_to_throttle.max(1),
            peer_throttle_period: raw.peer_throttle_period * TICKS_PER_SEC,
            peer_timeout: raw.peer_timeout * TICKS_PER_SEC,
            max_mirror_queue_size: raw.max_mirror_queue_size,
            sync_log_file: raw.sync_log_file,
            mirroring_log_file: raw.mirroring_log_file,
            periodic_log_file: raw.periodic_log_file,
            copy_delay_log_file: raw.copy_delay_log_file,
        }
    }
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    mirror: RawMirrorSection,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9001
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Represents the final, validated, and resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub mirror: MirrorConfig,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            mirror: MirrorConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw_config: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let config = Config {
            host: raw_config.host,
            port: raw_config.port,
            log_level: raw_config.log_level,
            mirror: MirrorConfig::resolve(raw_config.mirror),
            metrics: raw_config.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }

        for (i, srv) in self.mirror.servers.iter().enumerate() {
            if srv.port == 0 {
                return Err(anyhow!("incorrect peer server specification #{i}: port is 0"));
            }
            if srv.host.trim().is_empty() {
                return Err(anyhow!(
                    "incorrect peer server specification #{i}: host is empty"
                ));
            }
            if srv.slots.is_empty() {
                return Err(anyhow!("no slots for server #{i}"));
            }
            if srv.slots.contains(&0) {
                return Err(anyhow!("bad slot number 0 for server #{i}"));
            }
            let mut seen = std::collections::HashSet::new();
            for slot in &srv.slots {
                if !seen.insert(*slot) {
                    return Err(anyhow!("slot {slot} provided twice for server #{i}"));
                }
            }
        }

        if self.mirror.max_peer_bg_conns > self.mirror.max_peer_total_conns {
            return Err(anyhow!(
                "max_peer_bg_conns cannot exceed max_peer_total_conns"
            ));
        }
        if self.mirror.max_syncs_one_server > self.mirror.max_active_syncs {
            warn!(
                "max_syncs_one_server ({}) exceeds max_active_syncs ({}); the global cap wins",
                self.mirror.max_syncs_one_server, self.mirror.max_active_syncs
            );
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }
        Ok(())
    }
}
