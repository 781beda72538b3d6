// src/core/sync/controller.rs

//! The active side of periodic sync: worker loops that scan the slot map,
//! open one reconciliation session per due (peer, slot) pair, compute the
//! diff, dispatch tasks over the peer's background connections, and finish
//! with a commit or cancel.

use crate::core::clock::now_us;
use crate::core::errors::NetCacheError;
use crate::core::metrics;
use crate::core::peer::connection::SyncStartReply;
use crate::core::peer::{ActiveConnection, PeerControl};
use crate::core::state::ServerState;
use crate::core::storage::{BlobKey, BlobSummary};
use crate::core::sync::throttler::TimeThrottler;
use crate::core::sync::{
    self, SyncAction, SyncInitiateResult, SyncResult, SyncSlotData, SyncSlotSrv,
};
use crate::core::sync_log::{BlobEvent, EventType, ReducedEvents, SyncEvent};
use rand::Rng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Spawns the configured number of sync workers. Each worker drives at most
/// one session at a time, so this is also the global session cap.
pub fn spawn_sync_workers(state: &Arc<ServerState>) -> Vec<JoinHandle<()>> {
    (0..state.config.mirror.max_active_syncs)
        .map(|idx| {
            let state = state.clone();
            tokio::spawn(worker_main(state, idx))
        })
        .collect()
}

async fn worker_main(state: Arc<ServerState>, worker_idx: usize) {
    let mut shutdown_rx = state.subscribe_shutdown();
    let mut throttler = TimeThrottler::new(state.config.mirror.max_deferred_time_pct);
    let sync_interval = state.config.mirror.periodic_sync_interval;
    let mut force_init_sync = false;
    debug!("Sync worker {worker_idx} started");

    while !state.is_shutting_down() {
        let mut min_next_time = u64::MAX;
        let mut did_sync = false;

        let mut slot_list: Vec<Arc<SyncSlotData>> = state.sync.slots.values().cloned().collect();
        slot_list.shuffle(&mut rand::thread_rng());

        for slot_data in &slot_list {
            let cnt_started = slot_data.inner.lock().cnt_sync_started;
            if cnt_started == 0 || force_init_sync {
                let mut srvs = slot_data.srvs.clone();
                srvs.shuffle(&mut rand::thread_rng());
                for slot_srv in &srvs {
                    let now = now_us();
                    let next_time = slot_srv
                        .inner
                        .lock()
                        .next_sync_time
                        .max(slot_srv.peer.next_sync_time());
                    let made_initial = slot_srv.inner.lock().made_initial_sync;
                    if next_time <= now
                        && (!state.has_servers_for_init_sync() || !made_initial)
                    {
                        let wait = throttler.begin(slot_srv.peer.srv_id());
                        if !wait.is_zero() {
                            tokio::select! {
                                _ = tokio::time::sleep(wait) => {}
                                _ = shutdown_rx.recv() => return,
                            }
                        }
                        let session_start = Instant::now();
                        let synced = do_periodic_sync(&state, slot_data, slot_srv).await;
                        throttler.end(slot_srv.peer.srv_id(), session_start.elapsed());
                        if synced {
                            did_sync = true;
                            break;
                        }
                    }
                }
            }

            // Passive sessions left idle past the timeout are force-stopped;
            // idle pairs contribute their wakeup time.
            let now = now_us();
            for slot_srv in &slot_data.srvs {
                let mut slot_inner = slot_data.inner.lock();
                let mut srv_inner = slot_srv.inner.lock();
                if srv_inner.sync_started {
                    if srv_inner.is_passive
                        && srv_inner.started_cmds == 0
                        && now.saturating_sub(srv_inner.last_active_time)
                            >= state.config.mirror.periodic_sync_timeout
                    {
                        sync::stop_sync_locked(&state, &mut slot_inner, slot_srv, &mut srv_inner, 0);
                    }
                } else {
                    let next_time = srv_inner.next_sync_time.max(slot_srv.peer.next_sync_time());
                    min_next_time = min_next_time.min(next_time);
                }
            }

            if state.is_shutting_down() {
                return;
            }
        }

        force_init_sync = state.has_servers_for_init_sync() && !did_sync;

        let now = now_us();
        let wait_us = if min_next_time > now {
            (min_next_time - now).min(sync_interval)
        } else {
            rand::thread_rng().gen_range(0..10_000)
        };
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_micros(wait_us)) => {}
            _ = shutdown_rx.recv() => return,
        }
    }
}

/// One unit of reconciliation work produced by the diff.
enum SyncTask {
    EventSend(Arc<SyncEvent>),
    EventGet(Arc<SyncEvent>),
    BlobUpdateOur {
        key: String,
        local: BlobSummary,
        remote: BlobSummary,
    },
    BlobUpdatePeer {
        key: String,
        local: BlobSummary,
        remote: BlobSummary,
    },
    BlobSend {
        key: String,
    },
    BlobGet {
        key: String,
        remote: BlobSummary,
    },
}

/// Lazy merged cursor over the diff outputs; yields tasks one at a time in
/// dispatch order.
#[derive(Default)]
struct TaskCursor {
    by_blobs: bool,
    send_events: Vec<Arc<SyncEvent>>,
    get_events: Vec<Arc<SyncEvent>>,
    send_idx: usize,
    get_idx: usize,
    local_blobs: Vec<(String, BlobSummary)>,
    remote_blobs: Vec<(String, BlobSummary)>,
    local_idx: usize,
    remote_idx: usize,
}

impl TaskCursor {
    fn next_task(&mut self) -> Option<SyncTask> {
        if !self.by_blobs {
            if self.send_idx < self.send_events.len() {
                self.send_idx += 1;
                return Some(SyncTask::EventSend(
                    self.send_events[self.send_idx - 1].clone(),
                ));
            }
            if self.get_idx < self.get_events.len() {
                self.get_idx += 1;
                return Some(SyncTask::EventGet(self.get_events[self.get_idx - 1].clone()));
            }
            return None;
        }

        loop {
            let local = self.local_blobs.get(self.local_idx);
            let remote = self.remote_blobs.get(self.remote_idx);
            match (local, remote) {
                (Some((lk, ls)), Some((rk, rs))) => {
                    if lk == rk {
                        if ls.is_equal(rs) {
                            // Equivalent blobs, skip them.
                            self.local_idx += 1;
                            self.remote_idx += 1;
                            continue;
                        }
                        let task = if ls.is_older(rs) {
                            SyncTask::BlobUpdateOur {
                                key: lk.clone(),
                                local: *ls,
                                remote: *rs,
                            }
                        } else {
                            SyncTask::BlobUpdatePeer {
                                key: lk.clone(),
                                local: *ls,
                                remote: *rs,
                            }
                        };
                        self.local_idx += 1;
                        self.remote_idx += 1;
                        return Some(task);
                    }
                    if lk < rk {
                        self.local_idx += 1;
                        return Some(SyncTask::BlobSend { key: lk.clone() });
                    }
                    self.remote_idx += 1;
                    return Some(SyncTask::BlobGet {
                        key: rk.clone(),
                        remote: *rs,
                    });
                }
                (Some((lk, _)), None) => {
                    self.local_idx += 1;
                    return Some(SyncTask::BlobSend { key: lk.clone() });
                }
                (None, Some((rk, rs))) => {
                    self.remote_idx += 1;
                    return Some(SyncTask::BlobGet {
                        key: rk.clone(),
                        remote: *rs,
                    });
                }
                (None, None) => return None,
            }
        }
    }
}

#[derive(Default)]
struct SessionCounters {
    read_ok: u64,
    read_err: u64,
    write_ok: u64,
    write_err: u64,
    prolong_ok: u64,
    prolong_err: u64,
    del_ok: u64,
    del_err: u64,
}

impl SessionCounters {
    fn apply(&mut self, res: SyncResult, action: SyncAction) {
        let ok = res == SyncResult::Ok;
        match action {
            SyncAction::Read => {
                if ok {
                    self.read_ok += 1
                } else {
                    self.read_err += 1
                }
            }
            SyncAction::Write => {
                if ok {
                    self.write_ok += 1
                } else {
                    self.write_err += 1
                }
            }
            SyncAction::Prolong => {
                if ok {
                    self.prolong_ok += 1
                } else {
                    self.prolong_err += 1
                }
            }
            SyncAction::Remove => {
                if ok {
                    self.del_ok += 1
                } else {
                    self.del_err += 1
                }
            }
            SyncAction::None => {}
        }
    }
}

fn merge_result(total: &mut SyncResult, res: SyncResult) {
    if res == SyncResult::Aborted && *total != SyncResult::NetworkError {
        *total = SyncResult::Aborted;
    } else if res != SyncResult::Ok {
        *total = res;
    }
}

/// Runs one full session against `slot_srv`'s peer. Returns true when the
/// session committed.
async fn do_periodic_sync(
    state: &Arc<ServerState>,
    slot_data: &Arc<SyncSlotData>,
    slot_srv: &Arc<SyncSlotSrv>,
) -> bool {
    if sync::start_sync(slot_data, slot_srv, false) != SyncInitiateResult::ProceedWithEvents {
        return false;
    }
    slot_srv.inner.lock().is_by_blobs = false;

    let peer = slot_srv.peer.clone();
    let srv_id = peer.srv_id();
    let slot = slot_data.slot;
    let start_time = now_us();
    debug!("Starting sync with {srv_id} for slot {slot}");

    let (mut local_start, mut remote_start) = state.sync_log.get_last_synced(srv_id, slot);
    let mut result = SyncResult::Ok;
    let mut by_blobs = false;
    let mut remote_session_open = false;
    let mut remote_events = ReducedEvents::new();
    let mut cursor = TaskCursor::default();
    let mut local_synced = 0u64;
    let mut remote_synced = 0u64;

    match peer.get_bg_conn().await {
        Err(_) => result = SyncResult::NetworkError,
        Ok(mut conn) => match conn.sync_start(slot, local_start, remote_start).await {
            Ok(SyncStartReply::Events {
                local_start: ls,
                remote_start: rs,
                events,
            }) => {
                remote_session_open = true;
                local_start = ls;
                remote_start = rs;
                for evt in events {
                    let evt = Arc::new(evt);
                    let cell = remote_events.entry(evt.key.raw()).or_insert_with(BlobEvent::default);
                    if evt.event_type == EventType::Prolong {
                        cell.prolong = Some(evt);
                    } else {
                        cell.wr_or_rm = Some(evt);
                    }
                }
            }
            Ok(SyncStartReply::Blobs {
                local_start: ls,
                remote_start: rs,
                blobs,
            }) => {
                remote_session_open = true;
                local_start = ls;
                remote_start = rs;
                by_blobs = true;
                slot_srv.inner.lock().is_by_blobs = true;
                cursor.remote_blobs = blobs;
            }
            Ok(SyncStartReply::CrossSync) => {
                result = SyncResult::CrossSynced;
            }
            Ok(SyncStartReply::InProgress) => {
                result = SyncResult::ServerBusy;
            }
            Ok(SyncStartReply::Aborted) => {
                result = SyncResult::Aborted;
            }
            Err(_) => result = SyncResult::NetworkError,
        },
    }

    if result == SyncResult::Ok {
        if by_blobs {
            prepare_by_blobs(state, slot, remote_start, &mut cursor, &mut local_synced, &mut remote_synced).await;
        } else {
            match state
                .sync_log
                .get_sync_operations(srv_id, slot, local_start, remote_start, &remote_events)
            {
                Some(ops) => {
                    cursor.send_events = ops.to_send;
                    cursor.get_events = ops.to_get;
                    local_synced = ops.local_synced;
                    remote_synced = ops.remote_synced;
                }
                None => {
                    let was_blobs_sync = slot_srv.inner.lock().was_blobs_sync;
                    if state.sync_log.slot_log_size(slot) == 0 && was_blobs_sync {
                        // Nothing to exchange; commit keeps the old positions.
                        local_synced = local_start;
                        remote_synced = remote_start;
                    } else {
                        by_blobs = true;
                        slot_srv.inner.lock().is_by_blobs = true;
                        match peer.get_bg_conn().await {
                            Ok(mut conn) => match conn.sync_blobs_list(slot).await {
                                Ok(blobs) => {
                                    cursor.remote_blobs = blobs;
                                    prepare_by_blobs(
                                        state,
                                        slot,
                                        remote_start,
                                        &mut cursor,
                                        &mut local_synced,
                                        &mut remote_synced,
                                    )
                                    .await;
                                }
                                Err(NetCacheError::SyncAborted) => result = SyncResult::Aborted,
                                Err(_) => result = SyncResult::NetworkError,
                            },
                            Err(_) => result = SyncResult::NetworkError,
                        }
                    }
                }
            }
        }
    }

    cursor.by_blobs = by_blobs;

    let mut counters = SessionCounters::default();
    if result == SyncResult::Ok {
        result = execute_tasks(state, &peer, slot_data, slot, &mut cursor, &mut counters).await;
    }

    // Finalize on the remote side.
    if result == SyncResult::Ok {
        state
            .sync_log
            .set_last_synced(srv_id, slot, local_synced, remote_synced);
        match peer.get_bg_conn_waiting().await {
            Ok(mut conn) => {
                if conn.sync_commit(slot, local_synced, remote_synced).await.is_err() {
                    result = SyncResult::NetworkError;
                }
            }
            Err(_) => result = SyncResult::NetworkError,
        }
    } else if result == SyncResult::Aborted && remote_session_open {
        if let Ok(mut conn) = peer.get_bg_conn().await {
            let _ = conn.sync_cancel(slot).await;
        }
    }

    let end_time = now_us();
    metrics::SYNC_SESSIONS_TOTAL
        .with_label_values(&[result.as_str()])
        .inc();
    state.periodic_log.append(&format!(
        "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
        state.distribution.self_id(),
        srv_id,
        slot,
        start_time,
        end_time,
        end_time - start_time,
        u8::from(by_blobs),
        result_code(result),
        state.sync_log.log_size(),
        counters.read_ok,
        counters.read_err,
        counters.write_ok,
        counters.write_err,
        counters.prolong_ok,
        counters.prolong_err,
        state.total_copy_requests.load(std::sync::atomic::Ordering::Relaxed),
        state.copy_reqs_rejected.load(std::sync::atomic::Ordering::Relaxed),
    ));
    if result == SyncResult::Ok {
        info!(
            "Synced slot {slot} with {srv_id}: {} sent, {} received, {} prolonged ({})",
            counters.write_ok,
            counters.read_ok,
            counters.prolong_ok,
            if by_blobs { "blobs" } else { "events" },
        );
    }

    let mut slot_inner = slot_data.inner.lock();
    let mut srv_inner = slot_srv.inner.lock();
    if result == SyncResult::Ok {
        sync::commit_sync_locked(state, &mut slot_inner, slot_srv, &mut srv_inner);
    } else {
        sync::stop_sync_locked(
            state,
            &mut slot_inner,
            slot_srv,
            &mut srv_inner,
            state.config.mirror.failed_sync_retry_delay,
        );
    }
    result == SyncResult::Ok
}

fn result_code(result: SyncResult) -> u8 {
    match result {
        SyncResult::Ok => 0,
        SyncResult::CrossSynced => 1,
        SyncResult::ServerBusy => 2,
        SyncResult::NetworkError => 3,
        SyncResult::Aborted => 4,
    }
}

/// Blob-based preparation: the local inventory is re-enumerated from storage
/// and the synced positions pin the log at the session start.
async fn prepare_by_blobs(
    state: &Arc<ServerState>,
    slot: u16,
    remote_start: u64,
    cursor: &mut TaskCursor,
    local_synced: &mut u64,
    remote_synced: &mut u64,
) {
    *local_synced = state.sync_log.current_rec_no(slot);
    *remote_synced = remote_start;
    cursor.local_blobs = state
        .store
        .full_blobs_list(slot)
        .await
        .into_iter()
        .collect();
    cursor.remote_blobs.sort_by(|a, b| a.0.cmp(&b.0));
}

/// Dispatches diff tasks over the peer's background connections, several in
/// flight at once, and folds their outcomes into the session result.
async fn execute_tasks(
    state: &Arc<ServerState>,
    peer: &Arc<PeerControl>,
    slot_data: &Arc<SyncSlotData>,
    slot: u16,
    cursor: &mut TaskCursor,
    counters: &mut SessionCounters,
) -> SyncResult {
    let mut result = SyncResult::Ok;
    let (tx, mut rx) = mpsc::unbounded_channel::<(SyncResult, SyncAction)>();
    let mut started = 0usize;

    loop {
        while let Ok((res, action)) = rx.try_recv() {
            counters.apply(res, action);
            merge_result(&mut result, res);
            started -= 1;
        }
        if slot_data.inner.lock().clean_required && result != SyncResult::NetworkError {
            result = SyncResult::Aborted;
        }
        if state.is_shutting_down() && result == SyncResult::Ok {
            result = SyncResult::Aborted;
        }
        if result != SyncResult::Ok {
            break;
        }
        let Some(task) = cursor.next_task() else {
            break;
        };
        let conn = match peer.get_bg_conn_waiting().await {
            Ok(conn) => conn,
            Err(_) => {
                merge_result(&mut result, SyncResult::NetworkError);
                break;
            }
        };
        started += 1;
        let tx = tx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let out = execute_one(state, conn, slot, task).await;
            let _ = tx.send(out);
        });
    }
    drop(tx);

    while started > 0 {
        match rx.recv().await {
            Some((res, action)) => {
                counters.apply(res, action);
                merge_result(&mut result, res);
                started -= 1;
            }
            None => break,
        }
    }
    result
}

fn map_task_result(res: Result<(), NetCacheError>) -> SyncResult {
    match res {
        Ok(()) | Err(NetCacheError::NotFound) => SyncResult::Ok,
        Err(NetCacheError::SyncAborted) => SyncResult::Aborted,
        Err(_) => SyncResult::NetworkError,
    }
}

async fn execute_one(
    state: Arc<ServerState>,
    mut conn: ActiveConnection,
    slot: u16,
    task: SyncTask,
) -> (SyncResult, SyncAction) {
    match task {
        SyncTask::EventSend(evt) => match evt.event_type {
            EventType::Write => (
                map_task_result(conn.copy_put(Some(slot), &evt.key, slot, evt.orig_rec_no).await),
                SyncAction::Write,
            ),
            EventType::Prolong => (
                map_task_result(conn.sync_prolong_peer(slot, &evt.key, Some(&evt), None).await),
                SyncAction::Prolong,
            ),
            EventType::Remove => (
                map_task_result(
                    conn.copy_remove(&evt.key, slot, evt.orig_rec_no, evt.orig_time)
                        .await,
                ),
                SyncAction::Remove,
            ),
        },
        SyncTask::EventGet(evt) => match evt.event_type {
            EventType::Write => (
                map_task_result(conn.sync_read(slot, &evt.key, evt.orig_time, Some(&evt)).await),
                SyncAction::Read,
            ),
            EventType::Prolong => (
                map_task_result(conn.sync_prolong_our(slot, &evt.key, Some(&evt), None).await),
                SyncAction::Prolong,
            ),
            EventType::Remove => {
                // The removal is applied locally; the peer already made it.
                let res = async {
                    state.store.remove_blob(&evt.key).await?;
                    state.register_sync_event(
                        slot,
                        SyncEvent {
                            rec_no: 0,
                            blob_size: 0,
                            key: evt.key.clone(),
                            event_type: EventType::Remove,
                            orig_time: evt.orig_time,
                            orig_server: evt.orig_server,
                            orig_rec_no: evt.orig_rec_no,
                            local_time: 0,
                        },
                    );
                    Ok(())
                }
                .await;
                (map_task_result(res), SyncAction::Remove)
            }
        },
        SyncTask::BlobUpdateOur { key, local, remote } => {
            let key = BlobKey::unpack(&key);
            if local.is_same_create(&remote) {
                (
                    map_task_result(conn.sync_prolong_our(slot, &key, None, Some(remote)).await),
                    SyncAction::Prolong,
                )
            } else {
                (
                    map_task_result(conn.sync_read(slot, &key, remote.create_time, None).await),
                    SyncAction::Read,
                )
            }
        }
        SyncTask::BlobUpdatePeer { key, local, remote } => {
            let key = BlobKey::unpack(&key);
            if local.is_same_create(&remote) {
                (
                    map_task_result(conn.sync_prolong_peer(slot, &key, None, Some(local)).await),
                    SyncAction::Prolong,
                )
            } else {
                (
                    map_task_result(conn.copy_put(Some(slot), &key, slot, 0).await),
                    SyncAction::Write,
                )
            }
        }
        SyncTask::BlobSend { key } => {
            let key = BlobKey::unpack(&key);
            (
                map_task_result(conn.copy_put(Some(slot), &key, slot, 0).await),
                SyncAction::Write,
            )
        }
        SyncTask::BlobGet { key, remote } => {
            let key = BlobKey::unpack(&key);
            (
                map_task_result(conn.sync_read(slot, &key, remote.create_time, None).await),
                SyncAction::Read,
            )
        }
    }
}
