// tests/property/conflict_test.rs

//! Conflict-resolution symmetry: for the same pair of views, the events one
//! side decides to push are exactly the events the other side decides to
//! pull, in both directions.

use netcached::config::MirrorConfig;
use netcached::core::storage::BlobKey;
use netcached::core::sync_log::{EventType, ReducedEvents, SyncEvent, SyncLog};
use proptest::prelude::*;

const A_ID: u64 = 0x7f00_0001_0000_2329;
const B_ID: u64 = 0x7f00_0001_0000_232a;
// Origin servers distinct from both nodes, so origin record numbers survive
// the append fixup and same-origin pairs can exist on both sides.
const ORIGIN_X: u64 = 0x7f00_0001_0000_3001;
const ORIGIN_Y: u64 = 0x7f00_0001_0000_3002;

#[derive(Debug, Clone)]
struct GenEvent {
    key: usize,
    event_type: EventType,
    orig_time: u64,
    origin: u64,
    orig_rec_no: u64,
    /// 0 = only A sees it, 1 = only B, 2 = both (same origin).
    dest: u8,
}

fn gen_event(idx: usize) -> impl Strategy<Value = GenEvent> {
    (
        0usize..6,
        prop_oneof![
            Just(EventType::Write),
            Just(EventType::Prolong),
            Just(EventType::Remove)
        ],
        1u64..200,
        prop_oneof![Just(ORIGIN_X), Just(ORIGIN_Y)],
        0u8..3,
    )
        .prop_map(move |(key, event_type, orig_time, origin, dest)| GenEvent {
            key,
            event_type,
            orig_time,
            origin,
            orig_rec_no: idx as u64 + 1,
            dest,
        })
}

fn gen_events() -> impl Strategy<Value = Vec<GenEvent>> {
    prop::collection::vec(0u8..1, 1..40).prop_flat_map(|seed| {
        seed.iter()
            .enumerate()
            .map(|(i, _)| gen_event(i))
            .collect::<Vec<_>>()
    })
}

fn build_log(self_id: u64, events: &[&GenEvent]) -> SyncLog {
    let mut mirror = MirrorConfig::default();
    mirror.periodic_sync_head_time = 0;
    let log = SyncLog::new(self_id, &mirror);
    for evt in events {
        log.append(
            1,
            SyncEvent {
                rec_no: 0,
                blob_size: 0,
                key: BlobKey::new("c", &format!("k{}", evt.key), ""),
                event_type: evt.event_type,
                orig_time: evt.orig_time,
                orig_server: evt.origin,
                orig_rec_no: evt.orig_rec_no,
                local_time: 0,
            },
        );
    }
    log
}

fn reduced(log: &SyncLog, peer: u64) -> ReducedEvents {
    let mut events = ReducedEvents::new();
    let (mut local, mut remote) = (0, 0);
    assert!(log.get_events_list(peer, 1, &mut local, &mut remote, &mut events));
    events
}

/// Identity of a diffed operation, independent of local record numbers.
fn op_ids(ops: &[std::sync::Arc<SyncEvent>]) -> Vec<(String, u8, u64, u64, u64)> {
    let mut ids: Vec<_> = ops
        .iter()
        .map(|e| {
            (
                e.key.raw(),
                e.event_type as u8,
                e.orig_time,
                e.orig_server,
                e.orig_rec_no,
            )
        })
        .collect();
    ids.sort();
    ids
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_push_and_pull_agree(events in gen_events()) {
        let a_events: Vec<&GenEvent> =
            events.iter().filter(|e| e.dest != 1).collect();
        let b_events: Vec<&GenEvent> =
            events.iter().filter(|e| e.dest != 0).collect();
        if a_events.is_empty() || b_events.is_empty() {
            return Ok(());
        }

        let log_a = build_log(A_ID, &a_events);
        let log_b = build_log(B_ID, &b_events);
        std::thread::sleep(std::time::Duration::from_millis(2));

        let a_view = reduced(&log_a, B_ID);
        let b_view = reduced(&log_b, A_ID);

        let ops_a = log_a.get_sync_operations(B_ID, 1, 0, 0, &b_view).unwrap();
        let ops_b = log_b.get_sync_operations(A_ID, 1, 0, 0, &a_view).unwrap();

        // What A pushes is what B would pull, and vice versa.
        prop_assert_eq!(op_ids(&ops_a.to_send), op_ids(&ops_b.to_get));
        prop_assert_eq!(op_ids(&ops_a.to_get), op_ids(&ops_b.to_send));
    }
}
