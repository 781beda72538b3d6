// src/core/state/mod.rs

//! Defines the central `ServerState` struct, the single context object
//! constructed at startup and threaded through every task and session.
//! Peer controls and connections hold non-owning back-references to it.

use crate::config::Config;
use crate::core::distribution::{DistributionMap, ServerId};
use crate::core::errors::NetCacheError;
use crate::core::metrics;
use crate::core::peer::PeerControl;
use crate::core::peer::control::PeerTunables;
use crate::core::statlog::StatLogger;
use crate::core::storage::BlobStore;
use crate::core::sync::SyncState;
use crate::core::sync_log::{SyncEvent, SyncLog, persist};
use crate::core::clock::now_us;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::info;

/// The central struct holding all shared, node-wide state. Wrapped in an
/// `Arc` and passed to nearly every task; tests construct an isolated
/// instance per case.
pub struct ServerState {
    pub config: Config,
    pub distribution: DistributionMap,
    pub sync_log: SyncLog,
    pub store: Arc<dyn BlobStore>,
    /// Peer registry; populated at startup, extended lazily for peers that
    /// appear on the wire before their first outgoing contact.
    pub peers: DashMap<ServerId, Arc<PeerControl>>,
    pub sync: SyncState,

    // Observability files.
    pub mirror_log: StatLogger,
    pub periodic_log: StatLogger,
    pub copy_delay_log: StatLogger,

    // Node-wide counters.
    pub total_copy_requests: AtomicU64,
    pub copy_reqs_rejected: AtomicU64,
    pub mirror_queue_size: AtomicI64,
    /// Servers whose initial sync round has not completed yet.
    pub sync_on_init: AtomicI32,
    /// Servers still holding the client-serving gate closed.
    pub wait_to_open_to_clients: AtomicI32,
    /// Countdown of servers whose initial sync may still abort; reaching
    /// zero means nobody could be synchronized at all.
    pub aborted_sync_clients: AtomicI32,
    blob_create_id: AtomicU32,

    initially_synced: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    self_ref: Weak<ServerState>,
}

impl ServerState {
    /// Builds the full node context from configuration: distribution map,
    /// sync log (restored from disk), peer controls, and the sync slot map.
    pub fn initialize(
        config: Config,
        store: Arc<dyn BlobStore>,
        start_log_rec_no: u64,
    ) -> Result<Arc<Self>, NetCacheError> {
        let distribution = DistributionMap::new(&config.mirror, config.port)?;
        let sync_log = SyncLog::new(distribution.self_id(), &config.mirror);
        let (shutdown_tx, _) = broadcast::channel(4);

        let mirror_log = StatLogger::open(&config.mirror.mirroring_log_file);
        let periodic_log = StatLogger::open(&config.mirror.periodic_log_file);
        let copy_delay_log = StatLogger::open(&config.mirror.copy_delay_log_file);

        let state = Arc::new_cyclic(|weak: &Weak<ServerState>| {
            let tun = PeerTunables::from_config(&config.mirror);
            let peers = DashMap::new();
            let mut peer_list = Vec::new();
            let mut cnt_to_sync: i32 = 0;
            for &srv_id in distribution.peers().keys() {
                let peer = PeerControl::new(srv_id, weak.clone(), tun.clone());
                let common = distribution.common_slots(srv_id).to_vec();
                peer.set_slots_for_init_sync(common.len() as u16);
                if !common.is_empty() {
                    cnt_to_sync += 1;
                }
                peers.insert(srv_id, peer.clone());
                peer_list.push((srv_id, peer, common));
            }
            let sync = SyncState::build(distribution.self_slots(), peer_list.into_iter());

            ServerState {
                config,
                distribution,
                sync_log,
                store,
                peers,
                sync,
                mirror_log,
                periodic_log,
                copy_delay_log,
                total_copy_requests: AtomicU64::new(0),
                copy_reqs_rejected: AtomicU64::new(0),
                mirror_queue_size: AtomicI64::new(0),
                sync_on_init: AtomicI32::new(cnt_to_sync),
                wait_to_open_to_clients: AtomicI32::new(cnt_to_sync),
                aborted_sync_clients: AtomicI32::new(cnt_to_sync),
                blob_create_id: AtomicU32::new(0),
                initially_synced: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                shutdown_tx,
                self_ref: weak.clone(),
            }
        });

        persist::load(
            &state.sync_log,
            &state.config.mirror.sync_log_file,
            start_log_rec_no,
            |srv, slot| {
                state.distribution.peers().contains_key(&srv)
                    && state.distribution.common_slots(srv).contains(&slot)
            },
        );

        if state.sync_on_init.load(Ordering::SeqCst) == 0 {
            state.initial_sync_complete();
        }
        Ok(state)
    }

    pub fn self_id(&self) -> ServerId {
        self.distribution.self_id()
    }

    /// The peer control for `srv_id`, created on first contact for servers
    /// that are not in the static registry.
    pub fn peer(&self, srv_id: ServerId) -> Arc<PeerControl> {
        if let Some(peer) = self.peers.get(&srv_id) {
            return peer.clone();
        }
        let tun = PeerTunables::from_config(&self.config.mirror);
        self.peers
            .entry(srv_id)
            .or_insert_with(|| PeerControl::new(srv_id, self.self_ref.clone(), tun))
            .clone()
    }

    pub fn next_blob_create_id(&self) -> u32 {
        self.blob_create_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Appends a mutation event to the slot journal, enforcing the key/slot
    /// agreement invariant.
    pub fn register_sync_event(&self, slot: u16, event: SyncEvent) -> u64 {
        let real_slot = self.distribution.slot_of(&event.key);
        assert_eq!(
            real_slot, slot,
            "blob {} maps to slot {real_slot}, event says {slot}",
            event.key
        );
        let rec_no = self.sync_log.append(slot, event);
        metrics::SYNC_LOG_RECORDS.set(self.sync_log.log_size() as f64);
        rec_no
    }

    /// Appends a copy-delay observability record for a replica that just
    /// landed on `write_server`.
    pub fn print_blob_copy_stat(&self, create_time: u64, create_server: u64, write_server: u64) {
        if self.copy_delay_log.is_enabled() {
            let cur_time = now_us();
            self.copy_delay_log.append(&format!(
                "{cur_time},{create_server},{write_server},{}",
                cur_time.saturating_sub(create_time)
            ));
        }
    }

    // --- Initial sync gate ---

    pub fn has_servers_for_init_sync(&self) -> bool {
        self.sync_on_init.load(Ordering::SeqCst) > 0
    }

    pub fn is_initially_synced(&self) -> bool {
        self.initially_synced.load(Ordering::SeqCst)
    }

    /// Opens the client-serving gate: every peer finished (or abandoned) its
    /// initial sync round.
    pub fn initial_sync_complete(&self) {
        if !self.initially_synced.swap(true, Ordering::SeqCst) {
            metrics::INITIALLY_SYNCED.set(1.0);
            info!("Initial synchronization complete");
        }
    }

    // --- Shutdown ---

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Starts a slow shutdown: new work is refused, the accept loop drains,
    /// and the sync log is persisted once peers go quiet.
    pub fn request_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
            let _ = self.shutdown_tx.send(());
        }
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Fails every waiter parked on any peer; runs once shutdown begins.
    pub fn fail_peer_waiters(&self) {
        for peer in self.peers.iter() {
            peer.fail_waiters_for_shutdown();
        }
    }

    /// True once nothing is in flight towards any peer.
    pub fn peers_ready_for_shutdown(&self) -> bool {
        self.peers.iter().all(|peer| peer.ready_for_shutdown())
    }

    /// Persists the sync log; called on graceful shutdown.
    pub fn save_sync_log(&self) -> bool {
        persist::save(&self.sync_log, &self.config.mirror.sync_log_file)
    }
}
