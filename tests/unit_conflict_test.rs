//! Decision-procedure tests: one side's view is appended to a real log, the
//! other side's reduced map is built by hand, and the computed send/get
//! operation lists are checked against the conflict resolution rules.

use netcached::config::MirrorConfig;
use netcached::core::storage::BlobKey;
use netcached::core::sync_log::{BlobEvent, EventType, ReducedEvents, SyncEvent, SyncLog};
use std::sync::Arc;

const SELF_ID: u64 = 0x7f00_0001_0000_2329;
const PEER_ID: u64 = 0x7f00_0001_0000_232a;

fn test_log(head_time: u64) -> SyncLog {
    let mut mirror = MirrorConfig::default();
    mirror.periodic_sync_head_time = head_time;
    SyncLog::new(SELF_ID, &mirror)
}

fn event(
    key: &str,
    event_type: EventType,
    orig_time: u64,
    orig_server: u64,
    orig_rec_no: u64,
) -> SyncEvent {
    SyncEvent {
        rec_no: 0,
        blob_size: 0,
        key: BlobKey::new("c", key, ""),
        event_type,
        orig_time,
        orig_server,
        orig_rec_no,
        local_time: 0,
    }
}


/// The quiet-window check compares microsecond timestamps; give appended
/// events a moment to fall behind `now`.
fn settle() {
    std::thread::sleep(std::time::Duration::from_millis(2));
}

fn remote_cell(events: &mut ReducedEvents, key: &str, evt: SyncEvent, rec_no: u64) {
    let mut evt = evt;
    evt.rec_no = rec_no;
    evt.local_time = 1;
    let cell = events
        .entry(BlobKey::new("c", key, "").raw())
        .or_insert_with(BlobEvent::default);
    let evt = Arc::new(evt);
    if evt.event_type == EventType::Prolong {
        cell.prolong = Some(evt);
    } else {
        cell.wr_or_rm = Some(evt);
    }
}

#[test]
fn test_local_write_wins_over_older_remote_write() {
    let log = test_log(0);
    log.append(1, event("k1", EventType::Write, 100, SELF_ID, 0));

    let mut remote = ReducedEvents::new();
    remote_cell(
        &mut remote,
        "k1",
        event("k1", EventType::Write, 50, PEER_ID, 3),
        5,
    );

    settle();
    let ops = log.get_sync_operations(PEER_ID, 1, 0, 0, &remote).unwrap();
    assert_eq!(ops.to_send.len(), 1);
    assert_eq!(ops.to_send[0].orig_time, 100);
    assert!(ops.to_get.is_empty());
    assert_eq!(ops.local_synced, 1);
}

#[test]
fn test_newer_remote_write_is_pulled() {
    let log = test_log(0);
    log.append(1, event("k1", EventType::Write, 50, SELF_ID, 0));

    let mut remote = ReducedEvents::new();
    remote_cell(
        &mut remote,
        "k1",
        event("k1", EventType::Write, 100, PEER_ID, 3),
        5,
    );

    settle();
    let ops = log.get_sync_operations(PEER_ID, 1, 0, 0, &remote).unwrap();
    assert!(ops.to_send.is_empty());
    assert_eq!(ops.to_get.len(), 1);
    assert_eq!(ops.to_get[0].orig_time, 100);
    assert_eq!(ops.remote_synced, 5);
}

#[test]
fn test_same_origin_event_moves_nothing() {
    let log = test_log(0);
    let mut evt = event("k1", EventType::Write, 100, PEER_ID, 3);
    evt.orig_rec_no = 3;
    log.append(1, evt);

    let mut remote = ReducedEvents::new();
    remote_cell(
        &mut remote,
        "k1",
        event("k1", EventType::Write, 100, PEER_ID, 3),
        5,
    );

    settle();
    let ops = log.get_sync_operations(PEER_ID, 1, 0, 0, &remote).unwrap();
    assert!(ops.to_send.is_empty());
    assert!(ops.to_get.is_empty());
}

#[test]
fn test_local_only_events_are_sent() {
    let log = test_log(0);
    log.append(1, event("k1", EventType::Write, 100, SELF_ID, 0));
    log.append(1, event("k2", EventType::Prolong, 120, SELF_ID, 0));

    let remote = ReducedEvents::new();
    settle();
    let ops = log.get_sync_operations(PEER_ID, 1, 0, 0, &remote).unwrap();
    assert_eq!(ops.to_send.len(), 2);
    assert!(ops.to_get.is_empty());
}

#[test]
fn test_newer_prolong_is_sent_when_writes_agree() {
    let log = test_log(0);
    log.append(1, event("k1", EventType::Prolong, 200, SELF_ID, 0));

    let mut remote = ReducedEvents::new();
    remote_cell(
        &mut remote,
        "k1",
        event("k1", EventType::Prolong, 150, PEER_ID, 3),
        5,
    );

    settle();
    let ops = log.get_sync_operations(PEER_ID, 1, 0, 0, &remote).unwrap();
    assert_eq!(ops.to_send.len(), 1);
    assert_eq!(ops.to_send[0].event_type, EventType::Prolong);
}

#[test]
fn test_prolong_beats_older_remote_write() {
    let log = test_log(0);
    log.append(1, event("k1", EventType::Prolong, 200, SELF_ID, 0));

    let mut remote = ReducedEvents::new();
    remote_cell(
        &mut remote,
        "k1",
        event("k1", EventType::Write, 150, PEER_ID, 3),
        5,
    );

    settle();
    let ops = log.get_sync_operations(PEER_ID, 1, 0, 0, &remote).unwrap();
    // The lone local prolong is newer than the remote write, so it travels;
    // the remote write is also pulled because this side has no write at all.
    assert_eq!(ops.to_send.len(), 1);
    assert_eq!(ops.to_send[0].event_type, EventType::Prolong);
    assert_eq!(ops.to_get.len(), 1);
    assert_eq!(ops.to_get[0].event_type, EventType::Write);
}

#[test]
fn test_remove_beats_older_write() {
    let log = test_log(0);
    log.append(1, event("k1", EventType::Remove, 300, SELF_ID, 0));

    let mut remote = ReducedEvents::new();
    remote_cell(
        &mut remote,
        "k1",
        event("k1", EventType::Write, 100, PEER_ID, 3),
        5,
    );

    settle();
    let ops = log.get_sync_operations(PEER_ID, 1, 0, 0, &remote).unwrap();
    assert_eq!(ops.to_send.len(), 1);
    assert_eq!(ops.to_send[0].event_type, EventType::Remove);
    assert!(ops.to_get.is_empty());
}

#[test]
fn test_write_beats_non_write_on_time_tie() {
    let a = event("k1", EventType::Write, 100, SELF_ID, 1);
    let b = event("k1", EventType::Prolong, 100, PEER_ID, 2);
    // Identical timestamps on different servers: the write is the newer one.
    assert!(b.is_older(&a));
    assert!(!a.is_older(&b));
}

#[test]
fn test_quiet_head_window_excludes_fresh_events() {
    // A one-hour head window: everything appended now is in flight.
    let log = test_log(3_600_000_000);
    log.append(1, event("k1", EventType::Write, 100, SELF_ID, 0));

    let remote = ReducedEvents::new();
    settle();
    let ops = log.get_sync_operations(PEER_ID, 1, 0, 0, &remote).unwrap();
    assert!(ops.to_send.is_empty());
    assert_eq!(ops.local_synced, 0, "synced position must not cross the window");
}
