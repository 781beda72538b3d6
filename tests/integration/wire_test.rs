// tests/integration/wire_test.rs

//! Drives the passive side of the protocol over a raw socket, impersonating
//! the configured peer.

use super::helpers::{free_ports, start_node};
use bytes::Bytes;
use netcached::core::distribution::make_server_id;
use netcached::core::peer::mirror;
use netcached::core::protocol::lists;
use netcached::core::storage::BlobKey;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

struct RawPeer {
    stream: BufStream<TcpStream>,
}

impl RawPeer {
    async fn connect(port: u16, srv_id: u64) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut stream = BufStream::new(stream);
        stream
            .write_all(format!("\"\" netcached_peer srv_id={srv_id}\r\n").as_bytes())
            .await
            .unwrap();
        stream.flush().await.unwrap();
        Self { stream }
    }

    async fn exchange(&mut self, cmd: &str) -> String {
        self.stream
            .write_all(format!("{cmd}\r\n").as_bytes())
            .await
            .unwrap();
        self.stream.flush().await.unwrap();
        let mut reply = String::new();
        self.stream.read_line(&mut reply).await.unwrap();
        reply.trim_end().to_string()
    }

    async fn read_body(&mut self, size: u64) -> Vec<u8> {
        let mut body = vec![0u8; size as usize];
        self.stream.read_exact(&mut body).await.unwrap();
        body
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sync_start_negotiation_and_commit() {
    let ports = free_ports(2);
    // Only node A runs; this test plays node B on a raw socket.
    let node_a = start_node(&ports, ports[0]).await;
    let fake_b = make_server_id("127.0.0.1".parse().unwrap(), ports[1]);

    let key = BlobKey::new("cache", "wire-blob", "");
    mirror::client_write(&node_a.state, &key, Bytes::from_static(b"payload"), 60, 60, 60)
        .await
        .unwrap();

    let mut peer = RawPeer::connect(ports[0], fake_b).await;

    // A may have an active session of its own racing us; retry on
    // CROSS_SYNC until the passive start is accepted.
    let mut reply = String::new();
    for _ in 0..50 {
        reply = peer.exchange(&format!("SYNC_START {fake_b} 1 0 0")).await;
        if reply.starts_with("OK:") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    // An empty-window log forces the full blob list.
    assert!(reply.contains("ALL_BLOBS"), "unexpected reply: {reply}");
    let size: u64 = reply
        .split("SIZE=")
        .nth(1)
        .unwrap()
        .split(' ')
        .next()
        .unwrap()
        .parse()
        .unwrap();
    let body = peer.read_body(size).await;
    let blobs = lists::decode_blobs(&body).unwrap();
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0].0, key.raw());

    // The inventory can be re-requested mid-session.
    let reply = peer.exchange(&format!("SYNC_BLIST {fake_b} 1")).await;
    assert!(reply.starts_with("OK:SIZE="), "unexpected reply: {reply}");
    let size: u64 = reply.strip_prefix("OK:SIZE=").unwrap().parse().unwrap();
    peer.read_body(size).await;

    // Commit at position 5/5 and verify it stuck, swapped into A's view.
    let reply = peer.exchange(&format!("SYNC_COMMIT {fake_b} 1 5 5")).await;
    assert_eq!(reply, "OK:");
    assert_eq!(node_a.state.sync_log.get_last_synced(fake_b, 1), (5, 5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sync_commands_outside_session_are_refused() {
    let ports = free_ports(2);
    let _node_a = start_node(&ports, ports[0]).await;
    let fake_b = make_server_id("127.0.0.1".parse().unwrap(), ports[1]);

    let mut peer = RawPeer::connect(ports[0], fake_b).await;
    let reply = peer
        .exchange(&format!("SYNC_GET {fake_b} 1 \"c\" \"k\" \"\" 0 0 0 0"))
        .await;
    assert_eq!(reply, "ERR:NEED_ABORT");

    let reply = peer.exchange(&format!("SYNC_COMMIT {fake_b} 1 1 1")).await;
    assert_eq!(reply, "ERR:NEED_ABORT");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_proxy_meta_reports_blob_summary() {
    let ports = free_ports(2);
    let node_a = start_node(&ports, ports[0]).await;
    let fake_b = make_server_id("127.0.0.1".parse().unwrap(), ports[1]);

    let key = BlobKey::new("cache", "meta-blob", "");
    let summary = mirror::client_write(
        &node_a.state,
        &key,
        Bytes::from_static(b"0123456789"),
        60,
        60,
        60,
    )
    .await
    .unwrap();

    let mut peer = RawPeer::connect(ports[0], fake_b).await;
    let reply = peer
        .exchange("PROXY_META \"cache\" \"meta-blob\" \"\"")
        .await;
    assert!(reply.starts_with("OK:SIZE=0 "), "unexpected reply: {reply}");
    let fields: Vec<&str> = reply.split(' ').collect();
    assert_eq!(fields[1].parse::<u64>().unwrap(), summary.create_time);
    assert_eq!(fields[7].parse::<u64>().unwrap(), 10);

    let reply = peer.exchange("PROXY_META \"cache\" \"missing\" \"\"").await;
    assert_eq!(reply, "ERR:BLOB not found");
}
