// src/core/sync/mod.rs

//! Periodic synchronization state shared by both sides of a session: the
//! per-slot and per-(slot, peer) bookkeeping, the guarded start/stop/commit
//! transitions, and the passive-side API driven by the peer-facing server
//! when a remote node initiates a sync against us.

pub mod controller;
pub mod throttler;

use crate::core::clock::now_us;
use crate::core::distribution::ServerId;
use crate::core::peer::PeerControl;
use crate::core::state::ServerState;
use crate::core::sync_log::ReducedEvents;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

/// Outcome of a whole sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    Ok,
    CrossSynced,
    ServerBusy,
    NetworkError,
    Aborted,
}

impl SyncResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncResult::Ok => "ok",
            SyncResult::CrossSynced => "cross_sync",
            SyncResult::ServerBusy => "busy",
            SyncResult::NetworkError => "network_error",
            SyncResult::Aborted => "aborted",
        }
    }
}

/// What a finished sync command did, for the per-session counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    None,
    Read,
    Write,
    Prolong,
    Remove,
}

/// How a sync start negotiation resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncInitiateResult {
    NetworkError,
    ServerBusy,
    CrossSynced,
    ProceedWithEvents,
    ProceedWithBlobs,
}

/// Whether a follow-up command of a passive sync may run.
#[derive(Debug)]
pub enum PassiveStart {
    Ok(u64),
    Busy,
    NotActive,
}

/// Mutable per-(slot, peer) session state.
#[derive(Debug, Default)]
pub struct SlotSrvInner {
    pub sync_started: bool,
    pub is_passive: bool,
    pub is_by_blobs: bool,
    pub was_blobs_sync: bool,
    pub made_initial_sync: bool,
    pub started_cmds: u32,
    pub next_sync_time: u64,
    pub last_active_time: u64,
    pub cur_sync_id: u64,
}

/// One (slot, peer) pair; lives for the process lifetime.
pub struct SyncSlotSrv {
    pub peer: Arc<PeerControl>,
    pub inner: Mutex<SlotSrvInner>,
}

/// Mutable per-slot state guarding session exclusivity and cleaning.
#[derive(Debug, Default)]
pub struct SlotDataInner {
    pub cnt_sync_started: u8,
    pub cleaning: bool,
    pub clean_required: bool,
}

/// One self-served slot with its reconciliation partners.
pub struct SyncSlotData {
    pub slot: u16,
    pub inner: Mutex<SlotDataInner>,
    pub srvs: Vec<Arc<SyncSlotSrv>>,
}

/// All periodic-sync state of the node.
pub struct SyncState {
    pub slots: HashMap<u16, Arc<SyncSlotData>>,
    /// Wakes the log cleaner when a slot becomes idle with a pending forced
    /// clean.
    pub cleaner_notify: Notify,
}

impl SyncState {
    /// Builds the slot map: one entry per self slot, one partner entry per
    /// peer sharing that slot.
    pub fn build(
        self_slots: &[u16],
        peers: impl Iterator<Item = (ServerId, Arc<PeerControl>, Vec<u16>)>,
    ) -> Self {
        let mut slots: HashMap<u16, (u16, Vec<Arc<SyncSlotSrv>>)> = self_slots
            .iter()
            .map(|&slot| (slot, (slot, Vec::new())))
            .collect();
        for (_srv_id, peer, common) in peers {
            for slot in common {
                if let Some((_, srvs)) = slots.get_mut(&slot) {
                    srvs.push(Arc::new(SyncSlotSrv {
                        peer: peer.clone(),
                        inner: Mutex::new(SlotSrvInner::default()),
                    }));
                }
            }
        }
        Self {
            slots: slots
                .into_iter()
                .map(|(slot, (_, srvs))| {
                    (
                        slot,
                        Arc::new(SyncSlotData {
                            slot,
                            inner: Mutex::new(SlotDataInner::default()),
                            srvs,
                        }),
                    )
                })
                .collect(),
            cleaner_notify: Notify::new(),
        }
    }

    pub fn find_server_slot(
        &self,
        server_id: ServerId,
        slot: u16,
    ) -> Option<(Arc<SyncSlotData>, Arc<SyncSlotSrv>)> {
        let slot_data = self.slots.get(&slot)?;
        let slot_srv = slot_data
            .srvs
            .iter()
            .find(|srv| srv.peer.srv_id() == server_id)?;
        Some((slot_data.clone(), slot_srv.clone()))
    }
}

/// Claims the (slot, peer) pair for a new session. Cleaning blocks any
/// start; a concurrent session yields `CrossSynced` unless it is a passive
/// one with no command in flight, which the new passive start displaces.
pub(crate) fn start_sync(
    slot_data: &SyncSlotData,
    slot_srv: &SyncSlotSrv,
    is_passive: bool,
) -> SyncInitiateResult {
    let mut slot_inner = slot_data.inner.lock();
    if slot_inner.cleaning || slot_inner.clean_required {
        return SyncInitiateResult::ServerBusy;
    }

    let mut srv_inner = slot_srv.inner.lock();
    if srv_inner.sync_started {
        if !is_passive || !srv_inner.is_passive || srv_inner.started_cmds != 0 {
            return SyncInitiateResult::CrossSynced;
        }
        srv_inner.sync_started = false;
        slot_inner.cnt_sync_started = slot_inner.cnt_sync_started.saturating_sub(1);
    }

    if !is_passive && !slot_srv.peer.start_active_sync() {
        return SyncInitiateResult::ServerBusy;
    }
    srv_inner.sync_started = true;
    srv_inner.is_passive = is_passive;
    srv_inner.cur_sync_id += 1;
    srv_inner.last_active_time = now_us();
    slot_inner.cnt_sync_started += 1;
    SyncInitiateResult::ProceedWithEvents
}

/// Ends the session under the caller's locks and schedules the next one.
pub(crate) fn stop_sync_locked(
    state: &ServerState,
    slot_inner: &mut SlotDataInner,
    slot_srv: &SyncSlotSrv,
    srv_inner: &mut SlotSrvInner,
    next_delay: u64,
) {
    slot_srv
        .peer
        .register_sync_stop(srv_inner.is_passive, &mut srv_inner.next_sync_time, next_delay);
    srv_inner.sync_started = false;
    slot_inner.cnt_sync_started = slot_inner.cnt_sync_started.saturating_sub(1);
    if slot_inner.cnt_sync_started == 0 && slot_inner.clean_required {
        state.sync.cleaner_notify.notify_one();
    }
}

/// Successful completion: records blob-sync history, advances initial-sync
/// accounting, and schedules the next periodic run.
pub(crate) fn commit_sync_locked(
    state: &ServerState,
    slot_inner: &mut SlotDataInner,
    slot_srv: &SyncSlotSrv,
    srv_inner: &mut SlotSrvInner,
) {
    if srv_inner.is_by_blobs {
        srv_inner.was_blobs_sync = true;
    }
    if !srv_inner.made_initial_sync && !state.is_initially_synced() {
        srv_inner.made_initial_sync = true;
        slot_srv.peer.add_initially_synced_slot();
    }
    stop_sync_locked(
        state,
        slot_inner,
        slot_srv,
        srv_inner,
        state.config.mirror.periodic_sync_interval,
    );
}

/// Passive-side front end, driven by the peer-facing server for syncs the
/// remote node initiates.
pub struct PeriodicSync;

impl PeriodicSync {
    /// Handles an incoming `SYNC_START`. On success the reduced events list
    /// (or the blob-list decision) is produced and the start positions are
    /// promoted against the persisted ones.
    pub fn initiate(
        state: &Arc<ServerState>,
        server_id: ServerId,
        slot: u16,
        local_start: &mut u64,
        remote_start: &mut u64,
        events: &mut ReducedEvents,
    ) -> (SyncInitiateResult, u64) {
        let Some((slot_data, slot_srv)) = state.sync.find_server_slot(server_id, slot) else {
            return (SyncInitiateResult::ServerBusy, 0);
        };
        slot_srv.peer.register_conn_success();

        if state.has_servers_for_init_sync() {
            let made = slot_srv.inner.lock().made_initial_sync;
            let started = slot_data.inner.lock().cnt_sync_started;
            if made || started != 0 {
                return (SyncInitiateResult::ServerBusy, 0);
            }
        }

        let res = start_sync(&slot_data, &slot_srv, true);
        if res != SyncInitiateResult::ProceedWithEvents {
            return (res, 0);
        }

        let sync_id;
        {
            let mut srv_inner = slot_srv.inner.lock();
            srv_inner.started_cmds = 1;
            sync_id = srv_inner.cur_sync_id;
        }

        let records_available =
            state
                .sync_log
                .get_events_list(server_id, slot, local_start, remote_start, events);
        let was_blobs_sync = slot_srv.inner.lock().was_blobs_sync;
        if records_available || (state.sync_log.slot_log_size(slot) == 0 && was_blobs_sync) {
            slot_srv.inner.lock().is_by_blobs = false;
            (SyncInitiateResult::ProceedWithEvents, sync_id)
        } else {
            slot_srv.inner.lock().is_by_blobs = true;
            (SyncInitiateResult::ProceedWithBlobs, sync_id)
        }
    }

    /// Guards a follow-up command of a passive session: the session must
    /// still be active, and an abortable command is refused once a forced
    /// clean is pending.
    pub fn can_start_sync_command(
        state: &Arc<ServerState>,
        server_id: ServerId,
        slot: u16,
        can_abort: bool,
    ) -> PassiveStart {
        let Some((slot_data, slot_srv)) = state.sync.find_server_slot(server_id, slot) else {
            return PassiveStart::NotActive;
        };
        let slot_inner = slot_data.inner.lock();
        if slot_inner.clean_required && can_abort {
            return PassiveStart::Busy;
        }
        let mut srv_inner = slot_srv.inner.lock();
        if !srv_inner.sync_started || !srv_inner.is_passive {
            return PassiveStart::NotActive;
        }
        srv_inner.started_cmds += 1;
        PassiveStart::Ok(srv_inner.cur_sync_id)
    }

    /// Remembers that the current passive session switched to blob lists.
    pub fn mark_cur_sync_by_blobs(
        state: &Arc<ServerState>,
        server_id: ServerId,
        slot: u16,
        sync_id: u64,
    ) {
        let Some((slot_data, slot_srv)) = state.sync.find_server_slot(server_id, slot) else {
            return;
        };
        let _slot_inner = slot_data.inner.lock();
        let mut srv_inner = slot_srv.inner.lock();
        if srv_inner.sync_started && srv_inner.is_passive && srv_inner.cur_sync_id == sync_id {
            srv_inner.is_by_blobs = true;
        }
    }

    /// Marks one passive command finished, stamping the activity time that
    /// the idle-timeout watchdog observes.
    pub fn sync_command_finished(
        state: &Arc<ServerState>,
        server_id: ServerId,
        slot: u16,
        sync_id: u64,
    ) {
        let Some((slot_data, slot_srv)) = state.sync.find_server_slot(server_id, slot) else {
            return;
        };
        let _slot_inner = slot_data.inner.lock();
        let mut srv_inner = slot_srv.inner.lock();
        if srv_inner.sync_started && srv_inner.is_passive && srv_inner.cur_sync_id == sync_id {
            if srv_inner.started_cmds == 0 {
                return;
            }
            srv_inner.started_cmds -= 1;
            if srv_inner.started_cmds == 0 {
                srv_inner.last_active_time = now_us();
            }
        }
    }

    /// Commits the passive session at the positions the initiator computed.
    pub fn commit(
        state: &Arc<ServerState>,
        server_id: ServerId,
        slot: u16,
        sync_id: u64,
        local_synced_rec_no: u64,
        remote_synced_rec_no: u64,
    ) {
        state
            .sync_log
            .set_last_synced(server_id, slot, local_synced_rec_no, remote_synced_rec_no);

        let Some((slot_data, slot_srv)) = state.sync.find_server_slot(server_id, slot) else {
            return;
        };
        let mut slot_inner = slot_data.inner.lock();
        let mut srv_inner = slot_srv.inner.lock();
        if srv_inner.sync_started && srv_inner.is_passive && srv_inner.cur_sync_id == sync_id {
            commit_sync_locked(state, &mut slot_inner, &slot_srv, &mut srv_inner);
        }
    }

    /// Cancels the passive session; the pair becomes immediately eligible
    /// for a fresh sync.
    pub fn cancel(state: &Arc<ServerState>, server_id: ServerId, slot: u16, sync_id: u64) {
        let Some((slot_data, slot_srv)) = state.sync.find_server_slot(server_id, slot) else {
            return;
        };
        let mut slot_inner = slot_data.inner.lock();
        let mut srv_inner = slot_srv.inner.lock();
        if srv_inner.sync_started && srv_inner.is_passive && srv_inner.cur_sync_id == sync_id {
            stop_sync_locked(state, &mut slot_inner, &slot_srv, &mut srv_inner, 0);
        }
    }
}
