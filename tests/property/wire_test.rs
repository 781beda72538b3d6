// tests/property/wire_test.rs

//! Wire-format round-trips: framed blob payloads survive the codec in both
//! byte orders, and list bodies decode back to what was encoded.

use bytes::BytesMut;
use netcached::core::protocol::codec::{PeerWireCodec, WireFrame};
use netcached::core::protocol::{framing, lists};
use netcached::core::storage::{BlobKey, BlobSummary};
use netcached::core::sync_log::{BlobEvent, EventType, ReducedEvents, SyncEvent};
use proptest::prelude::*;
use std::sync::Arc;
use tokio_util::codec::Decoder;

fn decode_framed_blob(wire: &[u8], expected: u64) -> bytes::Bytes {
    let mut codec = PeerWireCodec::new();
    codec.expect_blob(expected);
    let mut buf = BytesMut::from(wire);
    match codec.decode(&mut buf).unwrap() {
        Some(WireFrame::Blob(data)) => data,
        other => panic!("expected a blob frame, got {other:?}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_framed_blob_roundtrip(payload in prop::collection::vec(any::<u8>(), 0..10_000)) {
        let wire = framing::frame_blob(&payload);
        let decoded = decode_framed_blob(&wire, payload.len() as u64);
        prop_assert_eq!(&decoded[..], &payload[..]);
    }

    #[test]
    fn test_framed_blob_roundtrip_swapped(payload in prop::collection::vec(any::<u8>(), 0..4_096)) {
        // Re-emit the frame with every length word byte-swapped, as a
        // foreign-endian sender would.
        let wire = framing::frame_blob(&payload);
        let mut swapped = BytesMut::new();
        let mut pos = 0usize;
        while pos < wire.len() {
            let word = u32::from_le_bytes(wire[pos..pos + 4].try_into().unwrap());
            swapped.extend_from_slice(&word.swap_bytes().to_le_bytes());
            pos += 4;
            if word != framing::BLOB_STREAM_SIGNATURE && word != framing::CHUNK_SENTINEL {
                let len = word as usize;
                swapped.extend_from_slice(&wire[pos..pos + len]);
                pos += len;
            }
        }
        let decoded = decode_framed_blob(&swapped, payload.len() as u64);
        prop_assert_eq!(&decoded[..], &payload[..]);
    }

    #[test]
    fn test_events_body_roundtrip(
        records in prop::collection::vec(
            ("[a-z]{1,16}", 0u64..1_000_000, 1u64..100, 0u8..2),
            1..30
        )
    ) {
        let mut reduced = ReducedEvents::new();
        for (i, (key, orig_time, orig_rec_no, is_prolong)) in records.iter().enumerate() {
            let event_type = if *is_prolong == 1 {
                EventType::Prolong
            } else {
                EventType::Write
            };
            let evt = Arc::new(SyncEvent {
                rec_no: i as u64 + 1,
                blob_size: 0,
                key: BlobKey::new("c", key, ""),
                event_type,
                orig_time: *orig_time,
                orig_server: 42,
                orig_rec_no: *orig_rec_no,
                local_time: i as u64,
            });
            let cell = reduced.entry(evt.key.raw()).or_insert_with(BlobEvent::default);
            if event_type == EventType::Prolong {
                cell.prolong = Some(evt);
            } else {
                cell.wr_or_rm = Some(evt);
            }
        }

        let expected: usize = reduced
            .values()
            .map(|c| usize::from(c.wr_or_rm.is_some()) + usize::from(c.prolong.is_some()))
            .sum();
        let body = lists::encode_events(&reduced);
        let decoded = lists::decode_events(&body).unwrap();
        prop_assert_eq!(decoded.len(), expected);
        for evt in &decoded {
            let cell = &reduced[&evt.key.raw()];
            let original = if evt.event_type == EventType::Prolong {
                cell.prolong.as_ref().unwrap()
            } else {
                cell.wr_or_rm.as_ref().unwrap()
            };
            prop_assert_eq!(evt.rec_no, original.rec_no);
            prop_assert_eq!(evt.orig_time, original.orig_time);
            prop_assert_eq!(evt.orig_rec_no, original.orig_rec_no);
            prop_assert_eq!(evt.local_time, original.local_time);
        }
    }

    #[test]
    fn test_blobs_body_roundtrip(
        records in prop::collection::btree_map(
            "[a-z0-9]{1,24}",
            (0u64..u64::MAX / 2, 0u64..u64::MAX / 2, any::<u32>(), any::<i32>(), any::<i32>(), any::<i32>()),
            1..30
        )
    ) {
        let blobs: std::collections::BTreeMap<String, BlobSummary> = records
            .into_iter()
            .map(|(key, (ct, cs, id, dt, ex, vex))| {
                (
                    key,
                    BlobSummary {
                        create_time: ct,
                        create_server: cs,
                        create_id: id,
                        dead_time: dt,
                        expire: ex,
                        ver_expire: vex,
                        size: 0,
                    },
                )
            })
            .collect();

        let body = lists::encode_blobs(blobs.iter());
        let decoded = lists::decode_blobs(&body).unwrap();
        prop_assert_eq!(decoded.len(), blobs.len());
        for (key, sum) in decoded {
            prop_assert_eq!(&blobs[&key], &sum);
        }
    }
}
