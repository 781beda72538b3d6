use netcached::core::storage::{BlobKey, BlobSummary};
use netcached::core::sync_log::{BlobEvent, EventType, ReducedEvents, SyncEvent};
use netcached::core::protocol::lists;
use std::collections::BTreeMap;
use std::sync::Arc;

fn event(key: &str, event_type: EventType, rec_no: u64) -> Arc<SyncEvent> {
    Arc::new(SyncEvent {
        rec_no,
        blob_size: 0,
        key: BlobKey::new("cache", key, "sub"),
        event_type,
        orig_time: rec_no * 1000,
        orig_server: 42,
        orig_rec_no: rec_no,
        local_time: rec_no * 2000,
    })
}

#[test]
fn test_events_list_roundtrip() {
    let mut reduced = ReducedEvents::new();
    reduced.insert(
        BlobKey::new("cache", "a", "sub").raw(),
        BlobEvent {
            wr_or_rm: Some(event("a", EventType::Write, 3)),
            prolong: None,
        },
    );
    reduced.insert(
        BlobKey::new("cache", "b", "sub").raw(),
        BlobEvent {
            wr_or_rm: Some(event("b", EventType::Remove, 5)),
            prolong: Some(event("b", EventType::Prolong, 4)),
        },
    );

    let body = lists::encode_events(&reduced);
    let decoded = lists::decode_events(&body).unwrap();
    assert_eq!(decoded.len(), 3);

    let write = decoded.iter().find(|e| e.rec_no == 3).unwrap();
    assert_eq!(write.event_type, EventType::Write);
    assert_eq!(write.key, BlobKey::new("cache", "a", "sub"));
    assert_eq!(write.orig_time, 3000);
    assert_eq!(write.orig_server, 42);
    assert_eq!(write.local_time, 6000);

    assert!(decoded.iter().any(|e| e.event_type == EventType::Remove));
    assert!(decoded.iter().any(|e| e.event_type == EventType::Prolong));
}

#[test]
fn test_blobs_list_roundtrip() {
    let mut blobs: BTreeMap<String, BlobSummary> = BTreeMap::new();
    blobs.insert(
        "key-one".to_string(),
        BlobSummary {
            create_time: 111,
            create_server: 222,
            create_id: 7,
            dead_time: -1,
            expire: 500,
            ver_expire: 600,
            size: 12345,
        },
    );
    blobs.insert(
        "key-two".to_string(),
        BlobSummary {
            create_time: 999,
            create_server: 888,
            create_id: 9,
            dead_time: 10,
            expire: 20,
            ver_expire: 30,
            size: 0,
        },
    );

    let body = lists::encode_blobs(blobs.iter());
    let decoded = lists::decode_blobs(&body).unwrap();
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[0].0, "key-one");
    assert_eq!(decoded[0].1.create_time, 111);
    assert_eq!(decoded[0].1.dead_time, -1);
    // Sizes do not travel in the list; the diff works off creation triples.
    assert_eq!(decoded[0].1.size, 0);
    assert_eq!(decoded[1].0, "key-two");
    assert_eq!(decoded[1].1.create_id, 9);
}

#[test]
fn test_truncated_bodies_are_rejected() {
    let mut reduced = ReducedEvents::new();
    reduced.insert(
        "k".to_string(),
        BlobEvent {
            wr_or_rm: Some(event("k", EventType::Write, 1)),
            prolong: None,
        },
    );
    let body = lists::encode_events(&reduced);
    assert!(lists::decode_events(&body[..body.len() - 1]).is_err());

    let mut blobs: BTreeMap<String, BlobSummary> = BTreeMap::new();
    blobs.insert("k".to_string(), BlobSummary::default());
    let body = lists::encode_blobs(blobs.iter());
    assert!(lists::decode_blobs(&body[..body.len() - 3]).is_err());
}
