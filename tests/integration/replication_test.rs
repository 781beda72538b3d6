// tests/integration/replication_test.rs

use super::helpers::{build_state, free_ports, node_config, start_node, wait_until};
use bytes::Bytes;
use netcached::core::clock::now_us;
use netcached::core::peer::mirror;
use netcached::core::storage::BlobKey;
use netcached::core::sync_log::{EventType, SyncEvent};
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mirror_write_reaches_peer() {
    let ports = free_ports(2);
    let node_a = start_node(&ports, ports[0]).await;
    let node_b = start_node(&ports, ports[1]).await;

    let key = BlobKey::new("cache", "mirrored-blob", "");
    let payload = Bytes::from_static(b"mirror me");
    mirror::client_write(&node_a.state, &key, payload.clone(), 3600, 3600, 3600)
        .await
        .unwrap();

    let state_b = node_b.state.clone();
    let key_b = key.clone();
    wait_until("mirror copy to land on B", Duration::from_secs(10), move || {
        let state_b = state_b.clone();
        let key_b = key_b.clone();
        async move {
            matches!(state_b.store.open_read(&key_b).await, Ok(Some((_, data))) if data == "mirror me")
        }
    })
    .await;

    // The replica carries the same version identity.
    let sum_a = node_a.state.store.read_meta(&key).await.unwrap().unwrap();
    let sum_b = node_b.state.store.read_meta(&key).await.unwrap().unwrap();
    assert!(sum_a.is_same_create(&sum_b));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_periodic_sync_replicates_local_write() {
    let ports = free_ports(2);
    let node_a = start_node(&ports, ports[0]).await;
    let node_b = start_node(&ports, ports[1]).await;

    // Plant the blob on A behind the mirror's back: only periodic sync can
    // deliver it.
    let key = BlobKey::new("cache", "synced-blob", "");
    let slot = node_a.state.distribution.slot_of(&key);
    assert_eq!(slot, 1);
    let summary = netcached::core::storage::BlobSummary {
        create_time: now_us(),
        create_server: node_a.srv_id(),
        create_id: 1,
        dead_time: 3600,
        expire: 3600,
        ver_expire: 3600,
        size: 9,
    };
    node_a
        .state
        .store
        .write_blob(&key, slot, summary, Bytes::from_static(b"sync data"))
        .await
        .unwrap();
    let rec_no = node_a.state.register_sync_event(
        slot,
        SyncEvent {
            rec_no: 0,
            blob_size: 9,
            key: key.clone(),
            event_type: EventType::Write,
            orig_time: summary.create_time,
            orig_server: node_a.srv_id(),
            orig_rec_no: 0,
            local_time: 0,
        },
    );

    let state_b = node_b.state.clone();
    let key_b = key.clone();
    wait_until("periodic sync to deliver the blob", Duration::from_secs(15), move || {
        let state_b = state_b.clone();
        let key_b = key_b.clone();
        async move {
            matches!(state_b.store.open_read(&key_b).await, Ok(Some((_, data))) if data == "sync data")
        }
    })
    .await;

    let sum_b = node_b.state.store.read_meta(&key).await.unwrap().unwrap();
    assert!(summary.is_same_create(&sum_b));

    // The synced position on A advances past the delivered write.
    let state_a = node_a.state.clone();
    let peer_b = node_b.srv_id();
    wait_until("synced position to advance", Duration::from_secs(15), move || {
        let state_a = state_a.clone();
        async move { state_a.sync_log.get_last_synced(peer_b, 1).0 >= rec_no }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_reports_initially_synced() {
    let ports = free_ports(2);
    let node_a = start_node(&ports, ports[0]).await;
    let node_b = start_node(&ports, ports[1]).await;

    for node in [&node_a, &node_b] {
        let state = node.state.clone();
        wait_until("initial sync flag", Duration::from_secs(15), move || {
            let state = state.clone();
            async move { state.is_initially_synced() }
        })
        .await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mirror_queue_is_bounded_when_peer_is_down() {
    let ports = free_ports(2);
    // Only A runs; B stays dark so every copy request eventually fails.
    let mut config = node_config(&ports, ports[0]);
    config.mirror.max_mirror_queue_size = 5;
    config.mirror.max_peer_total_conns = 1;
    config.mirror.max_peer_bg_conns = 1;
    config.mirror.peer_timeout = 300_000;
    let state = build_state(config);

    let total: u64 = 50;
    for i in 0..total {
        let key = BlobKey::new("cache", &format!("queued-{i}"), "");
        mirror::client_write(&state, &key, Bytes::from_static(b"x"), 60, 60, 60)
            .await
            .unwrap();
    }
    assert_eq!(state.total_copy_requests.load(Ordering::Relaxed), total);

    // No silent loss: every request is either still queued, in flight, or
    // counted as rejected. With the peer down they all drain into the
    // rejected counter.
    wait_until("copy requests to drain", Duration::from_secs(20), || {
        let state = state.clone();
        async move {
            let rejected = state.copy_reqs_rejected.load(Ordering::Relaxed);
            let queued = mirror::mirror_queue_size(&state) as u64;
            rejected + queued == total && queued == 0
        }
    })
    .await;
    state.request_shutdown();
}
