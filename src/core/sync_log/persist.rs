// src/core/sync_log/persist.rs

//! On-disk form of the sync log, written on graceful shutdown and read back
//! on startup. Layout, all little-endian:
//!
//! 1. `u64` count of (peer, slot) pairs, then per pair
//!    `{u64 peer, u16 slot, u64 local_rec_no, u64 remote_rec_no}`.
//! 2. Until EOF, per event a fixed part
//!    `{u64 rec_no, u8 event_type, u16 slot, u64 orig_time, u64 orig_server,
//!      u64 orig_rec_no, u64 local_time}` followed by
//!    `{u64 key_len, key bytes}`.
//!
//! Any parse failure discards all restored state; the caller's fallback
//! record number takes over.

use super::{EventType, SyncEvent, SyncLog};
use crate::core::distribution::ServerId;
use crate::core::storage::BlobKey;
use bytes::{Buf, BufMut, BytesMut};
use std::io::{Read, Write};
use tracing::{error, warn};

const MAX_KEY_LENGTH: u64 = 1024;

/// Persists the log to `path`. Each slot is cleaned first so excessive data
/// is not saved. Event `Arc`s stay alive in memory; this runs at shutdown.
pub fn save(log: &SyncLog, path: &str) -> bool {
    if path.is_empty() {
        return false;
    }

    let slots = log.snapshot_slots_for_clean();
    for slot in slots {
        log.clean(slot);
    }

    let mut buf = BytesMut::new();
    let pairs = log.synced_pairs();
    buf.put_u64_le(pairs.len() as u64);
    for (server, slot, local, remote) in pairs {
        buf.put_u64_le(server);
        buf.put_u16_le(slot);
        buf.put_u64_le(local);
        buf.put_u64_le(remote);
    }

    for (slot, events) in log.snapshot() {
        for event in events {
            buf.put_u64_le(event.rec_no);
            buf.put_u8(event.event_type as u8);
            buf.put_u16_le(slot);
            buf.put_u64_le(event.orig_time);
            buf.put_u64_le(event.orig_server);
            buf.put_u64_le(event.orig_rec_no);
            buf.put_u64_le(event.local_time);
            let key = event.key.raw();
            buf.put_u64_le(key.len() as u64);
            buf.put_slice(key.as_bytes());
        }
    }

    let write_result = std::fs::File::create(path).and_then(|mut f| f.write_all(&buf));
    match write_result {
        Ok(()) => true,
        Err(e) => {
            error!("Cannot write sync log file {path}: {e}");
            false
        }
    }
}

/// Restores the log from `path`. Pairs whose peer or slot is no longer in
/// the configuration are dropped through `pair_valid`. On any malformed
/// content all restored state is discarded and the log starts from
/// `start_log_rec_no`.
pub fn load<F>(log: &SyncLog, path: &str, start_log_rec_no: u64, pair_valid: F)
where
    F: Fn(ServerId, u16) -> bool,
{
    log.reset(start_log_rec_no);
    if path.is_empty() {
        return;
    }

    let mut raw = Vec::new();
    match std::fs::File::open(path) {
        Ok(mut f) => {
            if let Err(e) = f.read_to_end(&mut raw) {
                warn!("Cannot read sync log file {path}: {e}");
                return;
            }
        }
        Err(e) => {
            warn!("Cannot open sync log file {path}: {e}");
            return;
        }
    }

    let mut buf = &raw[..];
    let Some((pairs, events)) = parse(&mut buf, &pair_valid) else {
        error!("Cannot read records from {path}. Invalid file?");
        log.reset(start_log_rec_no);
        return;
    };
    log.restore(pairs, events, start_log_rec_no);
}

type ParsedLog = (Vec<(ServerId, u16, u64, u64)>, Vec<(u16, SyncEvent)>);

fn parse<F>(buf: &mut &[u8], pair_valid: &F) -> Option<ParsedLog>
where
    F: Fn(ServerId, u16) -> bool,
{
    if buf.remaining() < 8 {
        return None;
    }
    let pair_count = buf.get_u64_le();
    let mut pairs = Vec::new();
    for _ in 0..pair_count {
        if buf.remaining() < 8 + 2 + 8 + 8 {
            return None;
        }
        let server = buf.get_u64_le();
        let slot = buf.get_u16_le();
        let local = buf.get_u64_le();
        let remote = buf.get_u64_le();
        if pair_valid(server, slot) {
            pairs.push((server, slot, local, remote));
        }
    }

    let mut events = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 8 + 1 + 2 + 8 + 8 + 8 + 8 + 8 {
            return None;
        }
        let rec_no = buf.get_u64_le();
        let event_type = EventType::from_u8(buf.get_u8())?;
        let slot = buf.get_u16_le();
        let orig_time = buf.get_u64_le();
        let orig_server = buf.get_u64_le();
        let orig_rec_no = buf.get_u64_le();
        let local_time = buf.get_u64_le();
        let key_len = buf.get_u64_le();
        if key_len > MAX_KEY_LENGTH || buf.remaining() < key_len as usize {
            return None;
        }
        let key_bytes = buf.copy_to_bytes(key_len as usize);
        let key = String::from_utf8(key_bytes.to_vec()).ok()?;
        events.push((
            slot,
            SyncEvent {
                rec_no,
                blob_size: 0,
                key: BlobKey::unpack(&key),
                event_type,
                orig_time,
                orig_server,
                orig_rec_no,
                local_time,
            },
        ));
    }
    Some((pairs, events))
}
