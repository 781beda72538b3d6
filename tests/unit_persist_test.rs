use netcached::config::MirrorConfig;
use netcached::core::storage::BlobKey;
use netcached::core::sync_log::{EventType, ReducedEvents, SyncEvent, SyncLog, persist};
use std::io::Write;

const SELF_ID: u64 = 0x7f00_0001_0000_2329;
const PEER_ID: u64 = 0x7f00_0001_0000_232a;

fn test_log() -> SyncLog {
    let mut mirror = MirrorConfig::default();
    mirror.periodic_sync_head_time = 0;
    SyncLog::new(SELF_ID, &mirror)
}

fn write_event(key: &str) -> SyncEvent {
    SyncEvent {
        rec_no: 0,
        blob_size: 0,
        key: BlobKey::new("c", key, ""),
        event_type: EventType::Write,
        orig_time: 123,
        orig_server: SELF_ID,
        orig_rec_no: 0,
        local_time: 0,
    }
}

fn reduced(log: &SyncLog, slot: u16) -> ReducedEvents {
    let mut events = ReducedEvents::new();
    let (mut local, mut remote) = (0, 0);
    log.get_events_list(PEER_ID, slot, &mut local, &mut remote, &mut events);
    events
}

#[test]
fn test_save_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync_events.log");
    let path = path.to_str().unwrap();

    let log = test_log();
    for i in 0..10 {
        log.append((i % 2) + 1, write_event(&format!("k{i}")));
    }
    log.append(1, SyncEvent {
        event_type: EventType::Prolong,
        ..write_event("k0")
    });
    log.set_last_synced(PEER_ID, 1, 5, 7);
    assert!(persist::save(&log, path));

    let restored = test_log();
    persist::load(&restored, path, 0, |srv, slot| {
        srv == PEER_ID && (slot == 1 || slot == 2)
    });

    assert_eq!(restored.log_size(), log.log_size());
    assert_eq!(restored.last_rec_no(), log.last_rec_no());
    assert_eq!(restored.get_last_synced(PEER_ID, 1), (5, 7));

    // The restored slots produce the same reduced views.
    for slot in [1u16, 2] {
        let before: Vec<_> = reduced(&log, slot)
            .iter()
            .map(|(k, c)| (k.clone(), c.wr_or_rm.as_ref().map(|e| e.rec_no)))
            .collect();
        let after: Vec<_> = reduced(&restored, slot)
            .iter()
            .map(|(k, c)| (k.clone(), c.wr_or_rm.as_ref().map(|e| e.rec_no)))
            .collect();
        assert_eq!(before, after);
    }
}

#[test]
fn test_load_drops_pairs_for_unknown_peers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync_events.log");
    let path = path.to_str().unwrap();

    let log = test_log();
    log.append(1, write_event("k"));
    log.set_last_synced(PEER_ID, 1, 1, 1);
    log.set_last_synced(PEER_ID + 1, 1, 9, 9);
    assert!(persist::save(&log, path));

    let restored = test_log();
    persist::load(&restored, path, 0, |srv, _slot| srv == PEER_ID);
    assert_eq!(restored.get_last_synced(PEER_ID, 1), (1, 1));
    assert_eq!(restored.get_last_synced(PEER_ID + 1, 1), (0, 0));
}

#[test]
fn test_corrupt_file_discards_all_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync_events.log");

    let log = test_log();
    log.append(1, write_event("k"));
    log.set_last_synced(PEER_ID, 1, 1, 1);
    assert!(persist::save(&log, path.to_str().unwrap()));

    // Chop the file mid-event.
    let data = std::fs::read(&path).unwrap();
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&data[..data.len() - 5]).unwrap();
    drop(file);

    let restored = test_log();
    persist::load(&restored, path.to_str().unwrap(), 42, |_, _| true);
    assert_eq!(restored.log_size(), 0);
    assert_eq!(restored.get_last_synced(PEER_ID, 1), (0, 0));
    // The caller-provided fallback record number takes over.
    assert_eq!(restored.last_rec_no(), 42);
}

#[test]
fn test_missing_file_starts_from_fallback() {
    let log = test_log();
    persist::load(&log, "/nonexistent/sync_events.log", 17, |_, _| true);
    assert_eq!(log.last_rec_no(), 17);
    assert_eq!(log.log_size(), 0);
}
