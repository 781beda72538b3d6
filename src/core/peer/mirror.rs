// src/core/peer/mirror.rs

//! The mirror dispatcher: entry points the blob storage layer calls after a
//! successful client mutation. Each call fans the event out to every peer
//! responsible for the blob's slot; the work is fire-and-forget and never
//! fails the client request.

use crate::core::clock::now_us;
use crate::core::errors::NetCacheError;
use crate::core::peer::MirrorEvent;
use crate::core::state::ServerState;
use crate::core::storage::{BlobKey, BlobSummary};
use crate::core::sync_log::{EventType, SyncEvent};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Queues a write-through copy of the blob towards every responsible peer.
pub fn mirror_write(state: &Arc<ServerState>, key: &BlobKey, slot: u16, orig_rec_no: u64, size: u64) {
    for srv_id in state.distribution.raw_servers_for_slot(slot) {
        state.peer(srv_id).add_mirror_event(MirrorEvent::Write {
            key: key.clone(),
            slot,
            orig_rec_no,
            size,
        });
    }
}

/// Queues a prolongation towards every responsible peer. The blob summary is
/// snapshotted at call time.
pub fn mirror_prolong(
    state: &Arc<ServerState>,
    key: &BlobKey,
    slot: u16,
    orig_rec_no: u64,
    orig_time: u64,
    summary: BlobSummary,
) {
    for srv_id in state.distribution.raw_servers_for_slot(slot) {
        state.peer(srv_id).add_mirror_event(MirrorEvent::Prolong {
            key: key.clone(),
            slot,
            orig_rec_no,
            orig_time,
            summary,
        });
    }
}

/// Queues a removal towards every responsible peer.
pub fn mirror_remove(
    state: &Arc<ServerState>,
    key: &BlobKey,
    slot: u16,
    orig_rec_no: u64,
    orig_time: u64,
) {
    for srv_id in state.distribution.raw_servers_for_slot(slot) {
        state.peer(srv_id).add_mirror_event(MirrorEvent::Remove {
            key: key.clone(),
            slot,
            orig_rec_no,
            orig_time,
        });
    }
}

/// A client write landed in local storage: journal it and mirror it out.
pub async fn client_write(
    state: &Arc<ServerState>,
    key: &BlobKey,
    data: Bytes,
    dead_time: i32,
    expire: i32,
    ver_expire: i32,
) -> Result<BlobSummary, NetCacheError> {
    let slot = state.distribution.slot_of(key);
    let summary = BlobSummary {
        create_time: now_us(),
        create_server: state.distribution.self_id(),
        create_id: state.next_blob_create_id(),
        dead_time,
        expire,
        ver_expire,
        size: data.len() as u64,
    };
    state
        .store
        .write_blob(key, slot, summary, data.clone())
        .await?;

    let rec_no = state.register_sync_event(
        slot,
        SyncEvent {
            rec_no: 0,
            blob_size: summary.size,
            key: key.clone(),
            event_type: EventType::Write,
            orig_time: summary.create_time,
            orig_server: state.distribution.self_id(),
            orig_rec_no: 0,
            local_time: 0,
        },
    );
    mirror_write(state, key, slot, rec_no, summary.size);
    Ok(summary)
}

/// A client prolong landed in local storage: journal and mirror it.
pub async fn client_prolong(
    state: &Arc<ServerState>,
    key: &BlobKey,
    dead_time: i32,
    expire: i32,
    ver_expire: i32,
) -> Result<bool, NetCacheError> {
    let slot = state.distribution.slot_of(key);
    let Some(mut summary) = state.store.read_meta(key).await? else {
        return Ok(false);
    };
    summary.dead_time = summary.dead_time.max(dead_time);
    summary.expire = summary.expire.max(expire);
    summary.ver_expire = summary.ver_expire.max(ver_expire);
    if !state.store.prolong_blob(key, &summary).await? {
        return Ok(false);
    }

    let orig_time = now_us();
    let rec_no = state.register_sync_event(
        slot,
        SyncEvent {
            rec_no: 0,
            blob_size: summary.size,
            key: key.clone(),
            event_type: EventType::Prolong,
            orig_time,
            orig_server: state.distribution.self_id(),
            orig_rec_no: 0,
            local_time: 0,
        },
    );
    mirror_prolong(state, key, slot, rec_no, orig_time, summary);
    Ok(true)
}

/// A client removal landed in local storage: journal and mirror it.
pub async fn client_remove(
    state: &Arc<ServerState>,
    key: &BlobKey,
) -> Result<bool, NetCacheError> {
    let slot = state.distribution.slot_of(key);
    if !state.store.remove_blob(key).await? {
        return Ok(false);
    }
    let orig_time = now_us();
    let rec_no = state.register_sync_event(
        slot,
        SyncEvent {
            rec_no: 0,
            blob_size: 0,
            key: key.clone(),
            event_type: EventType::Remove,
            orig_time,
            orig_server: state.distribution.self_id(),
            orig_rec_no: 0,
            local_time: 0,
        },
    );
    mirror_remove(state, key, slot, rec_no, orig_time);
    Ok(true)
}

/// Total mirror events currently queued across all peers.
pub fn mirror_queue_size(state: &ServerState) -> i64 {
    state.mirror_queue_size.load(Ordering::Relaxed)
}
