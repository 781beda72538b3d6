// tests/property/slot_test.rs

//! Slot assignment properties: every key maps to a valid slot, the mapping
//! is deterministic, and every node computes the same answer.

use netcached::config::{MirrorConfig, PeerEntry};
use netcached::core::distribution::DistributionMap;
use netcached::core::storage::BlobKey;
use proptest::prelude::*;

fn cluster_mirror() -> MirrorConfig {
    let mut mirror = MirrorConfig::default();
    mirror.servers = vec![
        PeerEntry {
            group: "grp1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9001,
            slots: vec![1, 2, 3, 4],
        },
        PeerEntry {
            group: "grp1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9002,
            slots: vec![3, 4, 5, 6],
        },
    ];
    mirror
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_slot_is_stable_and_in_range(
        cache in "[a-z]{0,8}",
        key in ".{1,64}",
        subkey in "[a-z0-9]{0,8}"
    ) {
        let mirror = cluster_mirror();
        let map_a = DistributionMap::new(&mirror, 9001).unwrap();
        let map_b = DistributionMap::new(&mirror, 9002).unwrap();

        let blob_key = BlobKey::new(&cache, &key, &subkey);
        let slot = map_a.slot_of(&blob_key);
        prop_assert!((1..=map_a.max_slot_number()).contains(&slot));
        prop_assert_eq!(slot, map_a.slot_of(&blob_key));
        prop_assert_eq!(slot, map_b.slot_of(&blob_key));
    }

    #[test]
    fn test_generated_keys_stay_on_self_slots(_seed in 0u32..64) {
        let mirror = cluster_mirror();
        let map = DistributionMap::new(&mirror, 9001).unwrap();
        let key = BlobKey::generated(map.generate_blob_key(9001));
        let slot = map.slot_of(&key);
        prop_assert!(map.is_served_locally(slot));
    }

    #[test]
    fn test_key_packing_roundtrip(
        cache in "[a-z]{1,8}",
        key in "[ -~]{1,32}",
        subkey in "[a-z0-9]{0,8}"
    ) {
        let blob_key = BlobKey::new(&cache, &key, &subkey);
        prop_assert_eq!(BlobKey::unpack(&blob_key.raw()), blob_key);
    }
}
