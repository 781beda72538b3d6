// src/core/peer/connection.rs

//! One outgoing connection to one peer. A connection executes a single
//! command at a time: write the command line, interpret the one-line reply,
//! then run the command-specific tail (blob stream, list body, confirm
//! line). Sockets that finish a command cleanly return to the peer's pool
//! through `Drop`.
//!
//! Failure contract: a socket error while no byte of the current reply has
//! arrived triggers exactly one replace (fresh socket, command resent); a
//! second failure, or any error after the reply line, fails the command. A
//! command-level inactivity timeout closes the socket and fails the command
//! without a replace.

use crate::core::clock::now_us;
use crate::core::distribution::ServerId;
use crate::core::errors::NetCacheError;
use crate::core::peer::control::PeerControl;
use crate::core::protocol::{
    self, CmdBuilder, framing, lists, TOK_ALL_BLOBS, TOK_BLOB_NOT_FOUND, TOK_CROSS_SYNC,
    TOK_HAVE_NEWER, TOK_HAVE_NEWER1, TOK_IN_PROGRESS, TOK_NEED_ABORT, TOK_NEED_ABORT1,
};
use crate::core::state::ServerState;
use crate::core::storage::{BlobKey, BlobSummary};
use crate::core::sync_log::{EventType, SyncEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::debug;

bitflags::bitflags! {
    /// Socket-level status independent of the command in flight.
    #[derive(Debug, Clone, Copy, Default)]
    pub(crate) struct SockFlags: u8 {
        /// At least one reply line ever arrived on this socket.
        const GOT_ANY_ANSWER = 0b0001;
    }
}

/// An established, handshaken socket to a peer. Pooled between commands.
pub(crate) struct PeerSocket {
    stream: BufStream<TcpStream>,
    flags: SockFlags,
    /// Byte-order memory for the blob framing sublayer.
    swap_hint: Option<bool>,
}

impl PeerSocket {
    pub(crate) async fn connect(
        srv_id: ServerId,
        self_id: ServerId,
        timeout: Duration,
    ) -> Result<Self, NetCacheError> {
        let addr = crate::core::distribution::server_id_addr(srv_id);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetCacheError::Network(format!("connect to {addr} timed out")))?
            .map_err(|e| NetCacheError::Network(format!("connect to {addr} failed: {e}")))?;
        stream.set_nodelay(true).ok();
        let mut sock = Self {
            stream: BufStream::new(stream),
            flags: SockFlags::default(),
            swap_hint: None,
        };
        // The handshake line authenticates by identity only.
        let auth = format!("\"\" netcached_peer srv_id={self_id}\r\n");
        sock.stream.write_all(auth.as_bytes()).await?;
        sock.stream.flush().await?;
        Ok(sock)
    }
}

/// How the negotiated remote side answered `SYNC_START`.
#[derive(Debug)]
pub enum SyncStartReply {
    /// Event-based reconciliation can proceed from the given positions.
    Events {
        local_start: u64,
        remote_start: u64,
        events: Vec<SyncEvent>,
    },
    /// The remote side has lost the event window; full blob lists follow.
    Blobs {
        local_start: u64,
        remote_start: u64,
        blobs: Vec<(String, BlobSummary)>,
    },
    CrossSync,
    InProgress,
    Aborted,
}

enum ExchangeFailure {
    Timeout,
    Io(std::io::Error),
}

/// A connection checked out from a [`PeerControl`]. Dropping it releases the
/// budget slot and, when the command finished cleanly, returns the socket to
/// the pool.
pub struct ActiveConnection {
    peer: Arc<PeerControl>,
    state: Arc<ServerState>,
    sock: Option<PeerSocket>,
    reserved_for_bg: bool,
    healthy: bool,
}

impl std::fmt::Debug for ActiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveConnection")
            .field("reserved_for_bg", &self.reserved_for_bg)
            .field("healthy", &self.healthy)
            .finish()
    }
}

impl ActiveConnection {
    pub(crate) fn new(
        peer: Arc<PeerControl>,
        state: Arc<ServerState>,
        sock: PeerSocket,
        reserved_for_bg: bool,
    ) -> Self {
        Self {
            peer,
            state,
            sock: Some(sock),
            reserved_for_bg,
            healthy: true,
        }
    }

    fn peer_timeout(&self) -> Duration {
        Duration::from_micros(self.peer.tunables().peer_timeout)
    }

    fn self_id(&self) -> ServerId {
        self.state.distribution.self_id()
    }

    /// Key/slot agreement is a hard invariant; a mismatch means the caller
    /// routed an event into the wrong slot and must not be masked.
    fn verify_slot(&self, key: &BlobKey, slot: u16) {
        let real = self.state.distribution.slot_of(key);
        assert_eq!(real, slot, "blob {key} maps to slot {real}, command says {slot}");
    }

    async fn exchange_once(
        sock: &mut PeerSocket,
        cmd: &str,
        timeout: Duration,
    ) -> Result<String, ExchangeFailure> {
        let mut line = String::with_capacity(cmd.len() + 4);
        line.push_str(cmd);
        line.push_str("\r\n");
        let io = async {
            sock.stream.write_all(line.as_bytes()).await?;
            sock.stream.flush().await?;
            let mut reply = String::new();
            let n = sock.stream.read_line(&mut reply).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                ));
            }
            Ok(reply)
        };
        match tokio::time::timeout(timeout, io).await {
            Ok(Ok(reply)) => {
                sock.flags.insert(SockFlags::GOT_ANY_ANSWER);
                Ok(reply.trim_end().to_string())
            }
            Ok(Err(e)) => Err(ExchangeFailure::Io(e)),
            Err(_) => Err(ExchangeFailure::Timeout),
        }
    }

    /// Sends one command line and returns the one-line reply, applying the
    /// single-shot replace policy.
    async fn exchange(&mut self, cmd: &str) -> Result<String, NetCacheError> {
        let timeout = self.peer_timeout();
        for attempt in 0..2 {
            if self.sock.is_none() {
                match self.peer.create_socket(&self.state).await {
                    Ok(sock) => self.sock = Some(sock),
                    Err(e) => {
                        self.healthy = false;
                        return Err(e);
                    }
                }
            }
            let Some(sock) = self.sock.as_mut() else {
                continue;
            };
            match Self::exchange_once(sock, cmd, timeout).await {
                Ok(reply) => return Ok(reply),
                Err(ExchangeFailure::Timeout) => {
                    debug!("Peer {} doesn't respond, closing connection", self.peer.srv_id());
                    self.sock = None;
                    self.healthy = false;
                    return Err(NetCacheError::Network("Peer doesn't respond".to_string()));
                }
                Err(ExchangeFailure::Io(e)) => {
                    let never_answered = !sock.flags.contains(SockFlags::GOT_ANY_ANSWER);
                    if never_answered {
                        self.peer.register_conn_error();
                    }
                    self.sock = None;
                    if attempt == 1 {
                        self.healthy = false;
                        return Err(NetCacheError::Network(
                            "Connection closed by peer".to_string(),
                        ));
                    }
                    debug!("Replacing connection to peer {} after {e}", self.peer.srv_id());
                }
            }
        }
        self.healthy = false;
        Err(NetCacheError::Network("Connection closed by peer".to_string()))
    }

    /// Reads the one-line confirm that follows a blob stream. Errors here
    /// never trigger a replace: the command's reply was already received.
    async fn read_tail_line(&mut self) -> Result<String, NetCacheError> {
        let timeout = self.peer_timeout();
        let Some(sock) = self.sock.as_mut() else {
            self.healthy = false;
            return Err(NetCacheError::Network("Connection closed by peer".to_string()));
        };
        let io = async {
            let mut reply = String::new();
            let n = sock.stream.read_line(&mut reply).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                ));
            }
            Ok(reply)
        };
        match tokio::time::timeout(timeout, io).await {
            Ok(Ok(reply)) => Ok(reply.trim_end().to_string()),
            Ok(Err(_)) => {
                self.sock = None;
                self.healthy = false;
                Err(NetCacheError::Network("Connection closed by peer".to_string()))
            }
            Err(_) => {
                self.sock = None;
                self.healthy = false;
                Err(NetCacheError::Network("Peer doesn't respond".to_string()))
            }
        }
    }

    async fn read_body(&mut self, size: u64) -> Result<Vec<u8>, NetCacheError> {
        let timeout = self.peer_timeout();
        let Some(sock) = self.sock.as_mut() else {
            self.healthy = false;
            return Err(NetCacheError::Network("Connection closed by peer".to_string()));
        };
        let mut body = vec![0u8; size as usize];
        match tokio::time::timeout(timeout, sock.stream.read_exact(&mut body)).await {
            Ok(Ok(_)) => Ok(body),
            Ok(Err(_)) | Err(_) => {
                self.sock = None;
                self.healthy = false;
                Err(NetCacheError::Network("Connection closed by peer".to_string()))
            }
        }
    }

    async fn write_blob_stream(&mut self, data: &[u8]) -> Result<(), NetCacheError> {
        let Some(sock) = self.sock.as_mut() else {
            self.healthy = false;
            return Err(NetCacheError::Network("Connection closed by peer".to_string()));
        };
        let res = async {
            framing::write_blob(&mut sock.stream, data).await?;
            sock.stream.flush().await?;
            Ok::<(), NetCacheError>(())
        }
        .await;
        if res.is_err() {
            self.sock = None;
            self.healthy = false;
        }
        res
    }

    async fn write_fake_blob_stream(&mut self) -> Result<(), NetCacheError> {
        let Some(sock) = self.sock.as_mut() else {
            self.healthy = false;
            return Err(NetCacheError::Network("Connection closed by peer".to_string()));
        };
        let res = async {
            framing::write_fake_blob(&mut sock.stream).await?;
            sock.stream.flush().await?;
            Ok::<(), NetCacheError>(())
        }
        .await;
        if res.is_err() {
            self.sock = None;
            self.healthy = false;
        }
        res
    }

    async fn read_blob_stream(&mut self, expected: u64) -> Result<bytes::Bytes, NetCacheError> {
        let timeout = self.peer_timeout();
        let Some(sock) = self.sock.as_mut() else {
            self.healthy = false;
            return Err(NetCacheError::Network("Connection closed by peer".to_string()));
        };
        let res =
            tokio::time::timeout(timeout, framing::read_blob(&mut sock.stream, expected, &mut sock.swap_hint))
                .await;
        match res {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => {
                self.sock = None;
                self.healthy = false;
                Err(e)
            }
            Err(_) => {
                self.sock = None;
                self.healthy = false;
                Err(NetCacheError::Network("Peer doesn't respond".to_string()))
            }
        }
    }

    // --- Blob metadata helpers ---

    fn put_cmd(&self, sync_slot: Option<u16>) -> CmdBuilder {
        match sync_slot {
            Some(slot) => CmdBuilder::new("SYNC_PUT").u64(self.self_id()).u16(slot),
            None => CmdBuilder::new("COPY_PUT"),
        }
    }

    fn prolong_cmd(&self, sync_slot: Option<u16>) -> CmdBuilder {
        match sync_slot {
            Some(slot) => CmdBuilder::new("SYNC_PROLONG").u64(self.self_id()).u16(slot),
            None => CmdBuilder::new("COPY_PROLONG"),
        }
    }

    // --- Public command surface ---

    /// Looks the blob's metadata up on the peer. `Ok(None)` means the peer
    /// does not have the blob.
    pub async fn search_meta(&mut self, key: &BlobKey) -> Result<Option<BlobSummary>, NetCacheError> {
        let cmd = CmdBuilder::new("PROXY_META")
            .quoted(&key.cache)
            .quoted(&key.key)
            .quoted(&key.subkey)
            .u64(1)
            .u64(0)
            .finish();
        let reply = self.exchange(&cmd).await?;
        if protocol::contains_token(&reply, TOK_BLOB_NOT_FOUND) {
            return Ok(None);
        }
        if !protocol::is_ok_reply(&reply) {
            return Err(NetCacheError::Peer(protocol::reply_text(&reply).to_string()));
        }
        let fields = protocol::split_fields(&reply)?;
        Ok(Some(BlobSummary {
            create_time: protocol::field_u64(&fields, 1, "create_time")?,
            create_server: protocol::field_u64(&fields, 2, "create_server")?,
            create_id: protocol::field_u64(&fields, 3, "create_id")? as u32,
            dead_time: protocol::field_i32(&fields, 4, "dead_time")?,
            expire: protocol::field_i32(&fields, 5, "expire")?,
            ver_expire: protocol::field_i32(&fields, 6, "ver_expire")?,
            size: protocol::field_u64(&fields, 7, "size")?,
        }))
    }

    /// Pushes a blob to the peer (`COPY_PUT`, or `SYNC_PUT` inside a sync
    /// session). An absent local blob is success: the copy became moot.
    pub async fn copy_put(
        &mut self,
        sync_slot: Option<u16>,
        key: &BlobKey,
        slot: u16,
        orig_rec_no: u64,
    ) -> Result<(), NetCacheError> {
        self.verify_slot(key, slot);
        let Some((summary, data)) = self.state.store.open_read(key).await? else {
            return Ok(());
        };

        let cmd = self
            .put_cmd(sync_slot)
            .quoted(&key.cache)
            .quoted(&key.key)
            .quoted(&key.subkey)
            .u64(1)
            .quoted("")
            .u64(summary.create_time)
            .u64(0)
            .i32(summary.dead_time)
            .i32(summary.expire)
            .u64(data.len() as u64)
            .u64(0)
            .i32(summary.ver_expire)
            .u64(summary.create_server)
            .u32(summary.create_id)
            .u64(orig_rec_no)
            .u64(1)
            .finish();
        let reply = self.exchange(&cmd).await?;

        if protocol::contains_token(&reply, TOK_NEED_ABORT) {
            if protocol::contains_token(&reply, TOK_NEED_ABORT1) {
                self.write_fake_blob_stream().await?;
                self.read_tail_line().await?;
            }
            return Err(NetCacheError::SyncAborted);
        }
        if protocol::contains_token(&reply, TOK_HAVE_NEWER) {
            if protocol::contains_token(&reply, TOK_HAVE_NEWER1) {
                self.write_fake_blob_stream().await?;
                self.read_tail_line().await?;
            }
            return Ok(());
        }
        if !protocol::is_ok_reply(&reply) {
            return Err(NetCacheError::Peer(protocol::reply_text(&reply).to_string()));
        }

        self.write_blob_stream(&data).await?;
        let confirm = self.read_tail_line().await?;
        if protocol::is_ok_reply(&confirm) {
            self.state
                .print_blob_copy_stat(summary.create_time, summary.create_server, self.self_id());
            Ok(())
        } else if protocol::contains_token(&confirm, TOK_NEED_ABORT) {
            Err(NetCacheError::SyncAborted)
        } else {
            Err(NetCacheError::Peer(protocol::reply_text(&confirm).to_string()))
        }
    }

    /// Prolongs a blob on the peer. A missing blob on the remote side falls
    /// back to a full copy when the event's origin record is known.
    #[allow(clippy::too_many_arguments)]
    pub async fn copy_prolong(
        &mut self,
        sync_slot: Option<u16>,
        key: &BlobKey,
        slot: u16,
        orig_rec_no: u64,
        orig_time: u64,
        orig_server: ServerId,
        summary: &BlobSummary,
    ) -> Result<(), NetCacheError> {
        self.verify_slot(key, slot);
        let cmd = self
            .prolong_cmd(sync_slot)
            .quoted(&key.cache)
            .quoted(&key.key)
            .quoted(&key.subkey)
            .u64(summary.create_time)
            .u64(summary.create_server)
            .u32(summary.create_id)
            .i32(summary.dead_time)
            .i32(summary.expire)
            .i32(summary.ver_expire)
            .u64(orig_time)
            .u64(orig_server)
            .u64(orig_rec_no)
            .finish();
        let reply = self.exchange(&cmd).await?;

        if protocol::is_ok_reply(&reply) {
            return Ok(());
        }
        if protocol::contains_token(&reply, TOK_BLOB_NOT_FOUND) {
            if orig_rec_no != 0 {
                return self.copy_put(sync_slot, key, slot, orig_rec_no).await;
            }
            return Ok(());
        }
        if protocol::contains_token(&reply, TOK_NEED_ABORT) {
            return Err(NetCacheError::SyncAborted);
        }
        Err(NetCacheError::Peer(protocol::reply_text(&reply).to_string()))
    }

    /// Forwards a blob removal to the peer.
    pub async fn copy_remove(
        &mut self,
        key: &BlobKey,
        slot: u16,
        orig_rec_no: u64,
        orig_time: u64,
    ) -> Result<(), NetCacheError> {
        self.verify_slot(key, slot);
        let cmd = CmdBuilder::new("COPY_RMV")
            .quoted(&key.cache)
            .quoted(&key.key)
            .quoted(&key.subkey)
            .u64(orig_time)
            .u64(self.self_id())
            .u64(orig_rec_no)
            .finish();
        let reply = self.exchange(&cmd).await?;
        if protocol::is_ok_reply(&reply) || protocol::contains_token(&reply, TOK_BLOB_NOT_FOUND) {
            Ok(())
        } else {
            Err(NetCacheError::Peer(protocol::reply_text(&reply).to_string()))
        }
    }

    /// Opens a sync session on the peer.
    pub async fn sync_start(
        &mut self,
        slot: u16,
        local_rec_no: u64,
        remote_rec_no: u64,
    ) -> Result<SyncStartReply, NetCacheError> {
        let cmd = CmdBuilder::new("SYNC_START")
            .u64(self.self_id())
            .u16(slot)
            .u64(local_rec_no)
            .u64(remote_rec_no)
            .finish();
        let reply = self.exchange(&cmd).await?;

        if protocol::contains_token(&reply, TOK_CROSS_SYNC) {
            return Ok(SyncStartReply::CrossSync);
        }
        if protocol::contains_token(&reply, TOK_IN_PROGRESS) {
            return Ok(SyncStartReply::InProgress);
        }
        if protocol::contains_token(&reply, TOK_NEED_ABORT) {
            return Ok(SyncStartReply::Aborted);
        }
        if !protocol::is_ok_reply(&reply) {
            return Err(NetCacheError::Peer(protocol::reply_text(&reply).to_string()));
        }

        let size = protocol::parse_size(&reply)?;
        let fields = protocol::split_fields(&reply)?;
        if fields.len() < 3 {
            return Err(NetCacheError::Protocol(format!(
                "short SYNC_START reply: {reply}"
            )));
        }
        // The responder reports its own (local, remote) view; swap for ours.
        let their_local = protocol::field_u64(&fields, fields.len() - 2, "local_rec_no")?;
        let their_remote = protocol::field_u64(&fields, fields.len() - 1, "remote_rec_no")?;
        let by_blobs = protocol::contains_token(&reply, TOK_ALL_BLOBS);

        let body = self.read_body(size).await?;
        if by_blobs {
            Ok(SyncStartReply::Blobs {
                local_start: their_remote,
                remote_start: their_local,
                blobs: lists::decode_blobs(&body)?,
            })
        } else {
            Ok(SyncStartReply::Events {
                local_start: their_remote,
                remote_start: their_local,
                events: lists::decode_events(&body)?,
            })
        }
    }

    /// Requests the peer's full blob inventory for the slot.
    pub async fn sync_blobs_list(
        &mut self,
        slot: u16,
    ) -> Result<Vec<(String, BlobSummary)>, NetCacheError> {
        let cmd = CmdBuilder::new("SYNC_BLIST")
            .u64(self.self_id())
            .u16(slot)
            .finish();
        let reply = self.exchange(&cmd).await?;
        if protocol::contains_token(&reply, TOK_NEED_ABORT) {
            return Err(NetCacheError::SyncAborted);
        }
        if !protocol::is_ok_reply(&reply) {
            return Err(NetCacheError::Peer(protocol::reply_text(&reply).to_string()));
        }
        let size = protocol::parse_size(&reply)?;
        let body = self.read_body(size).await?;
        lists::decode_blobs(&body)
    }

    /// Pulls a blob version from the peer and installs it locally, skipping
    /// the transfer when the local copy is already newer.
    pub async fn sync_read(
        &mut self,
        slot: u16,
        key: &BlobKey,
        orig_time: u64,
        orig: Option<&SyncEvent>,
    ) -> Result<(), NetCacheError> {
        self.verify_slot(key, slot);
        let local = self.state.store.read_meta(key).await?;
        if let Some(local) = &local {
            if local.create_time > orig_time {
                return Ok(());
            }
        }
        let (cur_time, cur_srv, cur_id) = local
            .map(|s| (s.create_time, s.create_server, s.create_id))
            .unwrap_or((0, 0, 0));

        let cmd = CmdBuilder::new("SYNC_GET")
            .u64(self.self_id())
            .u16(slot)
            .quoted(&key.cache)
            .quoted(&key.key)
            .quoted(&key.subkey)
            .u64(orig_time)
            .u64(cur_time)
            .u64(cur_srv)
            .u32(cur_id)
            .finish();
        let reply = self.exchange(&cmd).await?;

        if protocol::contains_token(&reply, TOK_BLOB_NOT_FOUND)
            || protocol::contains_token(&reply, TOK_HAVE_NEWER)
        {
            return Ok(());
        }
        if protocol::contains_token(&reply, TOK_NEED_ABORT) {
            return Err(NetCacheError::SyncAborted);
        }
        if !protocol::is_ok_reply(&reply) {
            return Err(NetCacheError::Peer(protocol::reply_text(&reply).to_string()));
        }

        let size = protocol::parse_size(&reply)?;
        let fields = protocol::split_fields(&reply)?;
        let n = fields.len();
        if n < 7 {
            return Err(NetCacheError::Protocol(format!("short SYNC_GET reply: {reply}")));
        }
        let summary = BlobSummary {
            create_time: protocol::field_u64(&fields, n - 6, "create_time")?,
            dead_time: protocol::field_i32(&fields, n - 5, "dead_time")?,
            expire: protocol::field_i32(&fields, n - 4, "expire")?,
            ver_expire: protocol::field_i32(&fields, n - 3, "ver_expire")?,
            create_server: protocol::field_u64(&fields, n - 2, "create_server")?,
            create_id: protocol::field_u64(&fields, n - 1, "create_id")? as u32,
            size,
        };

        let data = self.read_blob_stream(size).await?;
        self.state
            .store
            .write_blob(key, slot, summary, data)
            .await?;

        let (evt_orig_time, evt_orig_server, evt_orig_rec_no) = match orig {
            Some(evt) => (evt.orig_time, evt.orig_server, evt.orig_rec_no),
            None => (summary.create_time, summary.create_server, 0),
        };
        self.state.register_sync_event(
            slot,
            SyncEvent {
                rec_no: 0,
                blob_size: summary.size,
                key: key.clone(),
                event_type: EventType::Write,
                orig_time: evt_orig_time,
                orig_server: evt_orig_server,
                orig_rec_no: evt_orig_rec_no,
                local_time: 0,
            },
        );
        self.state
            .print_blob_copy_stat(summary.create_time, summary.create_server, self.self_id());
        Ok(())
    }

    /// Prolongs the peer's copy from the local blob's summary.
    pub async fn sync_prolong_peer(
        &mut self,
        slot: u16,
        key: &BlobKey,
        orig: Option<&SyncEvent>,
        known_summary: Option<BlobSummary>,
    ) -> Result<(), NetCacheError> {
        let summary = match known_summary {
            Some(sum) => sum,
            None => match self.state.store.read_meta(key).await? {
                Some(sum) => sum,
                // The blob disappeared between diff and dispatch.
                None => return Ok(()),
            },
        };
        let (orig_time, orig_server, orig_rec_no) = match orig {
            Some(evt) => (evt.orig_time, evt.orig_server, evt.orig_rec_no),
            None => (0, 0, 0),
        };
        self.copy_prolong(
            Some(slot),
            key,
            slot,
            orig_rec_no,
            orig_time,
            orig_server,
            &summary,
        )
        .await
    }

    /// Prolongs the local copy, asking the peer for its summary first when it
    /// is not already known from a blob-list diff.
    pub async fn sync_prolong_our(
        &mut self,
        slot: u16,
        key: &BlobKey,
        orig: Option<&SyncEvent>,
        known_summary: Option<BlobSummary>,
    ) -> Result<(), NetCacheError> {
        self.verify_slot(key, slot);
        let remote = match known_summary {
            Some(sum) => sum,
            None => {
                let cmd = CmdBuilder::new("SYNC_PROINFO")
                    .u64(self.self_id())
                    .u16(slot)
                    .quoted(&key.cache)
                    .quoted(&key.key)
                    .quoted(&key.subkey)
                    .finish();
                let reply = self.exchange(&cmd).await?;
                if protocol::contains_token(&reply, TOK_BLOB_NOT_FOUND) {
                    return Ok(());
                }
                if protocol::contains_token(&reply, TOK_NEED_ABORT) {
                    return Err(NetCacheError::SyncAborted);
                }
                if !protocol::is_ok_reply(&reply) {
                    return Err(NetCacheError::Peer(protocol::reply_text(&reply).to_string()));
                }
                let fields = protocol::split_fields(&reply)?;
                let n = fields.len();
                if n < 7 {
                    return Err(NetCacheError::Protocol(format!(
                        "short SYNC_PROINFO reply: {reply}"
                    )));
                }
                BlobSummary {
                    create_time: protocol::field_u64(&fields, n - 6, "create_time")?,
                    create_server: protocol::field_u64(&fields, n - 5, "create_server")?,
                    create_id: protocol::field_u64(&fields, n - 4, "create_id")? as u32,
                    dead_time: protocol::field_i32(&fields, n - 3, "dead_time")?,
                    expire: protocol::field_i32(&fields, n - 2, "expire")?,
                    ver_expire: protocol::field_i32(&fields, n - 1, "ver_expire")?,
                    size: 0,
                }
            }
        };

        if !self.state.store.prolong_blob(key, &remote).await? {
            return Ok(());
        }
        let (orig_time, orig_server, orig_rec_no) = match orig {
            Some(evt) => (evt.orig_time, evt.orig_server, evt.orig_rec_no),
            None => (now_us(), self.self_id(), 0),
        };
        self.state.register_sync_event(
            slot,
            SyncEvent {
                rec_no: 0,
                blob_size: 0,
                key: key.clone(),
                event_type: EventType::Prolong,
                orig_time,
                orig_server,
                orig_rec_no,
                local_time: 0,
            },
        );
        Ok(())
    }

    /// Commits the session: both synced positions become durable on the peer.
    pub async fn sync_commit(
        &mut self,
        slot: u16,
        local_rec_no: u64,
        remote_rec_no: u64,
    ) -> Result<(), NetCacheError> {
        let cmd = CmdBuilder::new("SYNC_COMMIT")
            .u64(self.self_id())
            .u16(slot)
            .u64(local_rec_no)
            .u64(remote_rec_no)
            .finish();
        let reply = self.exchange(&cmd).await?;
        if protocol::is_ok_reply(&reply) {
            Ok(())
        } else {
            Err(NetCacheError::Peer(protocol::reply_text(&reply).to_string()))
        }
    }

    /// Cancels the session on the peer.
    pub async fn sync_cancel(&mut self, slot: u16) -> Result<(), NetCacheError> {
        let cmd = CmdBuilder::new("SYNC_CANCEL")
            .u64(self.self_id())
            .u16(slot)
            .finish();
        let reply = self.exchange(&cmd).await?;
        if protocol::is_ok_reply(&reply) {
            Ok(())
        } else {
            Err(NetCacheError::Peer(protocol::reply_text(&reply).to_string()))
        }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        let sock = if self.healthy { self.sock.take() } else { None };
        self.peer.release_connection(sock, self.reserved_for_bg);
    }
}
