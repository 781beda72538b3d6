// tests/property/log_test.rs

//! Sync log properties: record numbers are strictly monotonic across slots,
//! synced positions never move backwards, cleaning respects the cap or the
//! batch bound, and persistence round-trips any valid log state.

use netcached::config::MirrorConfig;
use netcached::core::storage::BlobKey;
use netcached::core::sync_log::{EventType, SyncEvent, SyncLog, persist};
use proptest::prelude::*;

const SELF_ID: u64 = 0x7f00_0001_0000_2329;
const PEER_ID: u64 = 0x7f00_0001_0000_232a;

fn log_with(max_records: u64, reserve: u64, batch: u64) -> SyncLog {
    let mut mirror = MirrorConfig::default();
    mirror.periodic_sync_head_time = 0;
    mirror.max_slot_log_records = max_records.max(10);
    mirror.clean_slot_log_reserve = reserve.min(mirror.max_slot_log_records - 1);
    mirror.max_clean_log_batch = batch.max(1);
    SyncLog::new(SELF_ID, &mirror)
}

fn write_event(key: &str) -> SyncEvent {
    SyncEvent {
        rec_no: 0,
        blob_size: 0,
        key: BlobKey::new("c", key, ""),
        event_type: EventType::Write,
        orig_time: 1,
        orig_server: SELF_ID,
        orig_rec_no: 0,
        local_time: 0,
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_rec_no_strictly_monotonic(slots in prop::collection::vec(1u16..8, 1..200)) {
        let log = log_with(100_000, 1000, 10_000);
        let mut prev = log.last_rec_no();
        for (i, slot) in slots.iter().enumerate() {
            let rec_no = log.append(*slot, write_event(&format!("k{i}")));
            prop_assert!(rec_no > prev);
            prev = rec_no;
        }
    }

    #[test]
    fn test_synced_position_never_decreases(
        updates in prop::collection::vec((0u64..1000, 0u64..1000), 1..100)
    ) {
        let log = log_with(100_000, 1000, 10_000);
        let mut max_local = 0;
        let mut max_remote = 0;
        for (local, remote) in updates {
            log.set_last_synced(PEER_ID, 1, local, remote);
            max_local = max_local.max(local);
            max_remote = max_remote.max(remote);
            let (stored_local, stored_remote) = log.get_last_synced(PEER_ID, 1);
            prop_assert_eq!(stored_local, max_local);
            prop_assert_eq!(stored_remote, max_remote);
        }
    }

    #[test]
    fn test_clean_meets_cap_or_batch(
        cnt_events in 1usize..400,
        max_records in 10u64..100,
        batch in 1u64..100
    ) {
        let log = log_with(max_records, 2, batch);
        for i in 0..cnt_events {
            log.append(1, write_event(&format!("k{i}")));
        }
        let max_records = max_records.max(10);
        let batch = batch.max(1);

        let cleaned = log.clean(1);
        prop_assert!(
            log.slot_log_size(1) <= max_records || cleaned >= batch,
            "size {} over cap {} with only {} cleaned (batch {})",
            log.slot_log_size(1), max_records, cleaned, batch
        );
    }

    #[test]
    fn test_persistence_roundtrip(
        records in prop::collection::vec(
            (1u16..5, "[a-z]{1,12}", 0u8..3, 1u64..100_000),
            0..60
        ),
        pairs in prop::collection::vec((1u16..5, 0u64..50, 0u64..50), 0..8)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_events.log");
        let path = path.to_str().unwrap();

        // Saving runs a best-effort clean on the live log first, so the
        // round-trip is compared against the post-save state.
        let log = log_with(1_000_000, 1, 1);
        for (slot, key, kind, orig_time) in &records {
            let event_type = match kind {
                0 => EventType::Write,
                1 => EventType::Prolong,
                _ => EventType::Remove,
            };
            log.append(*slot, SyncEvent {
                rec_no: 0,
                blob_size: 0,
                key: BlobKey::new("c", key, ""),
                event_type,
                orig_time: *orig_time,
                orig_server: PEER_ID,
                orig_rec_no: 7,
                local_time: 0,
            });
        }
        for (slot, local, remote) in &pairs {
            log.set_last_synced(PEER_ID, *slot, *local, *remote);
        }
        prop_assert!(persist::save(&log, path));

        let restored = log_with(1_000_000, 1, 1);
        persist::load(&restored, path, 0, |_, _| true);
        prop_assert_eq!(restored.last_rec_no(), log.last_rec_no());
        prop_assert_eq!(restored.log_size(), log.log_size());
        for slot in 1u16..5 {
            prop_assert_eq!(restored.slot_log_size(slot), log.slot_log_size(slot));
            prop_assert_eq!(
                restored.get_last_synced(PEER_ID, slot),
                log.get_last_synced(PEER_ID, slot)
            );
            prop_assert_eq!(restored.current_rec_no(slot), log.current_rec_no(slot));
        }
    }

    #[test]
    fn test_clean_converges_below_cap(cnt_events in 1usize..400) {
        let log = log_with(50, 5, 17);
        for i in 0..cnt_events {
            log.append(1, write_event(&format!("k{i}")));
        }
        // With no peers inside the window, repeated cleaning must always
        // reach the cap.
        for _ in 0..100 {
            if !log.is_over_limit(1) {
                break;
            }
            prop_assert!(log.clean(1) > 0);
        }
        prop_assert!(log.slot_log_size(1) <= 50);
    }
}
