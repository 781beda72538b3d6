// src/server/peer_session.rs

//! One incoming peer connection: parses `SYNC_*`/`COPY_*`/`PROXY_META`
//! command lines, drives the passive side of periodic sync, and streams blob
//! payloads through the line/binary codec. Every failure is flushed as a
//! single `ERR:<msg>` line; nothing else crosses the wire.

use crate::core::distribution::ServerId;
use crate::core::errors::NetCacheError;
use crate::core::protocol::codec::{PeerWireCodec, WireFrame, WireOut};
use crate::core::protocol::{self, PeerVerb, framing, lists};
use crate::core::state::ServerState;
use crate::core::storage::{BlobKey, BlobSummary};
use crate::core::sync::{PassiveStart, PeriodicSync, SyncInitiateResult};
use crate::core::sync_log::{EventType, ReducedEvents, SyncEvent};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

type PeerFramed = Framed<TcpStream, PeerWireCodec>;

pub async fn handle_connection(state: Arc<ServerState>, stream: TcpStream, addr: SocketAddr) {
    stream.set_nodelay(true).ok();
    let mut framed = Framed::new(stream, PeerWireCodec::new());
    debug!("Peer connection accepted from {addr}");

    while let Some(frame) = framed.next().await {
        let line = match frame {
            Ok(WireFrame::Line(line)) => line,
            Ok(WireFrame::Blob(_)) => {
                warn!("Unexpected blob frame from {addr}");
                break;
            }
            Err(e) => {
                debug!("Peer connection from {addr} failed: {e}");
                break;
            }
        };
        if line.is_empty() {
            continue;
        }
        // The handshake line opens with an empty quoted client name.
        if line.starts_with('"') {
            debug!("Peer handshake from {addr}: {line}");
            continue;
        }
        if state.is_shutting_down() {
            let _ = framed
                .send(WireOut::Line("ERR:Server is shutting down".to_string()))
                .await;
            break;
        }
        match dispatch(&state, &mut framed, &line).await {
            Ok(()) => {}
            Err(e) => {
                let _ = framed.send(WireOut::Line(format!("ERR:{e}"))).await;
                break;
            }
        }
    }
}

async fn send_line(framed: &mut PeerFramed, line: String) -> Result<(), NetCacheError> {
    framed.send(WireOut::Line(line)).await
}

async fn send_body(framed: &mut PeerFramed, body: Bytes) -> Result<(), NetCacheError> {
    framed.send(WireOut::Bytes(body)).await
}

/// Reads one framed blob payload of at most `expected` bytes.
async fn read_blob(framed: &mut PeerFramed, expected: u64) -> Result<Bytes, NetCacheError> {
    framed.codec_mut().expect_blob(expected);
    match framed.next().await {
        Some(Ok(WireFrame::Blob(data))) => Ok(data),
        Some(Ok(WireFrame::Line(_))) => Err(NetCacheError::Protocol(
            "expected blob data, got a command line".to_string(),
        )),
        Some(Err(e)) => Err(e),
        None => Err(NetCacheError::Network("Connection closed by peer".to_string())),
    }
}

async fn dispatch(
    state: &Arc<ServerState>,
    framed: &mut PeerFramed,
    line: &str,
) -> Result<(), NetCacheError> {
    let fields = protocol::split_fields(line)?;
    let Some(verb_token) = fields.first() else {
        return Ok(());
    };
    let Some(verb) = PeerVerb::parse(verb_token) else {
        return Err(NetCacheError::Protocol(format!("unknown command {verb_token}")));
    };

    match verb {
        PeerVerb::SyncStart => handle_sync_start(state, framed, &fields).await,
        PeerVerb::SyncBlobsList => handle_sync_blist(state, framed, &fields).await,
        PeerVerb::SyncPut => handle_put(state, framed, &fields, true).await,
        PeerVerb::CopyPut => handle_put(state, framed, &fields, false).await,
        PeerVerb::SyncProlong => handle_prolong(state, framed, &fields, true).await,
        PeerVerb::CopyProlong => handle_prolong(state, framed, &fields, false).await,
        PeerVerb::SyncGet => handle_sync_get(state, framed, &fields).await,
        PeerVerb::SyncProInfo => handle_sync_proinfo(state, framed, &fields).await,
        PeerVerb::SyncCommit => handle_sync_commit(state, framed, &fields).await,
        PeerVerb::SyncCancel => handle_sync_cancel(state, framed, &fields).await,
        PeerVerb::CopyRemove => handle_copy_remove(state, framed, &fields).await,
        PeerVerb::ProxyMeta => handle_proxy_meta(state, framed, &fields).await,
    }
}

fn sync_header(fields: &[String]) -> Result<(ServerId, u16), NetCacheError> {
    let srv = protocol::field_u64(fields, 1, "server_id")?;
    let slot = protocol::field_u64(fields, 2, "slot")? as u16;
    Ok((srv, slot))
}

async fn handle_sync_start(
    state: &Arc<ServerState>,
    framed: &mut PeerFramed,
    fields: &[String],
) -> Result<(), NetCacheError> {
    let (srv, slot) = sync_header(fields)?;
    // The initiator reports its positions from its own point of view; they
    // land swapped in ours.
    let mut local_start = protocol::field_u64(fields, 4, "remote_rec_no")?;
    let mut remote_start = protocol::field_u64(fields, 3, "local_rec_no")?;

    let mut events = ReducedEvents::new();
    let (res, sync_id) = PeriodicSync::initiate(
        state,
        srv,
        slot,
        &mut local_start,
        &mut remote_start,
        &mut events,
    );
    match res {
        SyncInitiateResult::ProceedWithEvents => {
            let body = lists::encode_events(&events);
            send_line(
                framed,
                format!("OK:SIZE={} {local_start} {remote_start}", body.len()),
            )
            .await?;
            send_body(framed, body).await?;
            PeriodicSync::sync_command_finished(state, srv, slot, sync_id);
        }
        SyncInitiateResult::ProceedWithBlobs => {
            let blobs = state.store.full_blobs_list(slot).await;
            let body = lists::encode_blobs(blobs.iter());
            send_line(
                framed,
                format!("OK:ALL_BLOBS SIZE={} {local_start} {remote_start}", body.len()),
            )
            .await?;
            send_body(framed, body).await?;
            PeriodicSync::sync_command_finished(state, srv, slot, sync_id);
        }
        SyncInitiateResult::CrossSynced => send_line(framed, "ERR:CROSS_SYNC".to_string()).await?,
        SyncInitiateResult::ServerBusy => send_line(framed, "ERR:IN_PROGRESS".to_string()).await?,
        SyncInitiateResult::NetworkError => {
            send_line(framed, "ERR:NEED_ABORT".to_string()).await?
        }
    }
    Ok(())
}

async fn handle_sync_blist(
    state: &Arc<ServerState>,
    framed: &mut PeerFramed,
    fields: &[String],
) -> Result<(), NetCacheError> {
    let (srv, slot) = sync_header(fields)?;
    match PeriodicSync::can_start_sync_command(state, srv, slot, true) {
        PassiveStart::Ok(sync_id) => {
            PeriodicSync::mark_cur_sync_by_blobs(state, srv, slot, sync_id);
            let blobs = state.store.full_blobs_list(slot).await;
            let body = lists::encode_blobs(blobs.iter());
            send_line(framed, format!("OK:SIZE={}", body.len())).await?;
            send_body(framed, body).await?;
            PeriodicSync::sync_command_finished(state, srv, slot, sync_id);
        }
        PassiveStart::Busy => send_line(framed, "ERR:IN_PROGRESS".to_string()).await?,
        PassiveStart::NotActive => send_line(framed, "ERR:NEED_ABORT".to_string()).await?,
    }
    Ok(())
}

/// Positional layout of the blob metadata tail shared by the put commands.
struct PutFields {
    key: BlobKey,
    summary: BlobSummary,
    orig_rec_no: u64,
}

fn parse_put_fields(fields: &[String], base: usize) -> Result<PutFields, NetCacheError> {
    let key = BlobKey::new(
        protocol::field_str(fields, base, "cache")?,
        protocol::field_str(fields, base + 1, "key")?,
        protocol::field_str(fields, base + 2, "subkey")?,
    );
    let summary = BlobSummary {
        create_time: protocol::field_u64(fields, base + 5, "create_time")?,
        dead_time: protocol::field_i32(fields, base + 7, "dead_time")?,
        expire: protocol::field_i32(fields, base + 8, "expire")?,
        size: protocol::field_u64(fields, base + 9, "size")?,
        ver_expire: protocol::field_i32(fields, base + 11, "ver_expire")?,
        create_server: protocol::field_u64(fields, base + 12, "create_server")?,
        create_id: protocol::field_u64(fields, base + 13, "create_id")? as u32,
    };
    let orig_rec_no = protocol::field_u64(fields, base + 14, "orig_rec_no")?;
    Ok(PutFields {
        key,
        summary,
        orig_rec_no,
    })
}

async fn handle_put(
    state: &Arc<ServerState>,
    framed: &mut PeerFramed,
    fields: &[String],
    is_sync: bool,
) -> Result<(), NetCacheError> {
    let (sync_ctx, base) = if is_sync {
        let (srv, slot) = sync_header(fields)?;
        match PeriodicSync::can_start_sync_command(state, srv, slot, true) {
            PassiveStart::Ok(sync_id) => (Some((srv, slot, sync_id)), 3),
            PassiveStart::Busy | PassiveStart::NotActive => {
                // The writer is already committed to a blob stream; keep it
                // in lockstep with a fake payload before failing.
                send_line(framed, "ERR:NEED_ABORT1".to_string()).await?;
                let _ = read_blob(framed, 0).await?;
                send_line(framed, "ERR:NEED_ABORT".to_string()).await?;
                return Ok(());
            }
        }
    } else {
        (None, 1)
    };

    let put = parse_put_fields(fields, base)?;
    let slot = state.distribution.slot_of(&put.key);

    let local = state.store.read_meta(&put.key).await?;
    let have_newer = match &local {
        Some(local) => put.summary.is_same_create(local) || put.summary.is_older(local),
        None => false,
    };
    if have_newer {
        send_line(framed, "OK:HAVE_NEWER1".to_string()).await?;
        let _ = read_blob(framed, 0).await?;
        send_line(framed, "OK:HAVE_NEWER".to_string()).await?;
    } else {
        send_line(framed, "OK:READY".to_string()).await?;
        let data = read_blob(framed, put.summary.size).await?;
        let mut summary = put.summary;
        summary.size = data.len() as u64;
        state.store.write_blob(&put.key, slot, summary, data).await?;
        state.register_sync_event(
            slot,
            SyncEvent {
                rec_no: 0,
                blob_size: summary.size,
                key: put.key.clone(),
                event_type: EventType::Write,
                orig_time: summary.create_time,
                orig_server: summary.create_server,
                orig_rec_no: put.orig_rec_no,
                local_time: 0,
            },
        );
        state.print_blob_copy_stat(summary.create_time, summary.create_server, state.self_id());
        send_line(framed, "OK:".to_string()).await?;
    }

    if let Some((srv, slot, sync_id)) = sync_ctx {
        PeriodicSync::sync_command_finished(state, srv, slot, sync_id);
    }
    Ok(())
}

async fn handle_prolong(
    state: &Arc<ServerState>,
    framed: &mut PeerFramed,
    fields: &[String],
    is_sync: bool,
) -> Result<(), NetCacheError> {
    let (sync_ctx, base) = if is_sync {
        let (srv, slot) = sync_header(fields)?;
        match PeriodicSync::can_start_sync_command(state, srv, slot, true) {
            PassiveStart::Ok(sync_id) => (Some((srv, slot, sync_id)), 3),
            PassiveStart::Busy | PassiveStart::NotActive => {
                send_line(framed, "ERR:NEED_ABORT".to_string()).await?;
                return Ok(());
            }
        }
    } else {
        (None, 1)
    };

    let key = BlobKey::new(
        protocol::field_str(fields, base, "cache")?,
        protocol::field_str(fields, base + 1, "key")?,
        protocol::field_str(fields, base + 2, "subkey")?,
    );
    let summary = BlobSummary {
        create_time: protocol::field_u64(fields, base + 3, "create_time")?,
        create_server: protocol::field_u64(fields, base + 4, "create_server")?,
        create_id: protocol::field_u64(fields, base + 5, "create_id")? as u32,
        dead_time: protocol::field_i32(fields, base + 6, "dead_time")?,
        expire: protocol::field_i32(fields, base + 7, "expire")?,
        ver_expire: protocol::field_i32(fields, base + 8, "ver_expire")?,
        size: 0,
    };
    // Origin triple is optional; mirror prolongs always carry it.
    let (orig_time, orig_server, orig_rec_no) = if fields.len() > base + 11 {
        (
            protocol::field_u64(fields, base + 9, "orig_time")?,
            protocol::field_u64(fields, base + 10, "orig_server")?,
            protocol::field_u64(fields, base + 11, "orig_rec_no")?,
        )
    } else {
        (summary.create_time, summary.create_server, 0)
    };

    let slot = state.distribution.slot_of(&key);
    let reply = if state.store.prolong_blob(&key, &summary).await? {
        state.register_sync_event(
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
        "OK:".to_string()
    } else {
        "ERR:BLOB not found".to_string()
    };
    send_line(framed, reply).await?;

    if let Some((srv, slot, sync_id)) = sync_ctx {
        PeriodicSync::sync_command_finished(state, srv, slot, sync_id);
    }
    Ok(())
}

async fn handle_sync_get(
    state: &Arc<ServerState>,
    framed: &mut PeerFramed,
    fields: &[String],
) -> Result<(), NetCacheError> {
    let (srv, slot) = sync_header(fields)?;
    let sync_id = match PeriodicSync::can_start_sync_command(state, srv, slot, false) {
        PassiveStart::Ok(sync_id) => sync_id,
        _ => {
            send_line(framed, "ERR:NEED_ABORT".to_string()).await?;
            return Ok(());
        }
    };

    let key = BlobKey::new(
        protocol::field_str(fields, 3, "cache")?,
        protocol::field_str(fields, 4, "key")?,
        protocol::field_str(fields, 5, "subkey")?,
    );
    let cur_time = protocol::field_u64(fields, 7, "cur_create_time")?;
    let cur_srv = protocol::field_u64(fields, 8, "cur_create_server")?;
    let cur_id = protocol::field_u64(fields, 9, "cur_create_id")? as u32;

    match state.store.open_read(&key).await? {
        None => send_line(framed, "ERR:BLOB not found".to_string()).await?,
        Some((sum, data)) => {
            let same_version = sum.create_time == cur_time
                && sum.create_server == cur_srv
                && sum.create_id == cur_id;
            let requester_newer = (sum.create_time, sum.create_server, sum.create_id)
                < (cur_time, cur_srv, cur_id);
            if same_version || requester_newer {
                send_line(framed, "OK:HAVE_NEWER".to_string()).await?;
            } else {
                send_line(
                    framed,
                    format!(
                        "OK:BLOB found. SIZE={} {} {} {} {} {} {}",
                        data.len(),
                        sum.create_time,
                        sum.dead_time,
                        sum.expire,
                        sum.ver_expire,
                        sum.create_server,
                        sum.create_id
                    ),
                )
                .await?;
                send_body(framed, framing::frame_blob(&data)).await?;
            }
        }
    }
    PeriodicSync::sync_command_finished(state, srv, slot, sync_id);
    Ok(())
}

async fn handle_sync_proinfo(
    state: &Arc<ServerState>,
    framed: &mut PeerFramed,
    fields: &[String],
) -> Result<(), NetCacheError> {
    let (srv, slot) = sync_header(fields)?;
    let sync_id = match PeriodicSync::can_start_sync_command(state, srv, slot, false) {
        PassiveStart::Ok(sync_id) => sync_id,
        _ => {
            send_line(framed, "ERR:NEED_ABORT".to_string()).await?;
            return Ok(());
        }
    };

    let key = BlobKey::new(
        protocol::field_str(fields, 3, "cache")?,
        protocol::field_str(fields, 4, "key")?,
        protocol::field_str(fields, 5, "subkey")?,
    );
    let reply = match state.store.read_meta(&key).await? {
        Some(sum) => format!(
            "OK:SIZE=0 {} {} {} {} {} {}",
            sum.create_time,
            sum.create_server,
            sum.create_id,
            sum.dead_time,
            sum.expire,
            sum.ver_expire
        ),
        None => "ERR:BLOB not found".to_string(),
    };
    send_line(framed, reply).await?;
    PeriodicSync::sync_command_finished(state, srv, slot, sync_id);
    Ok(())
}

async fn handle_sync_commit(
    state: &Arc<ServerState>,
    framed: &mut PeerFramed,
    fields: &[String],
) -> Result<(), NetCacheError> {
    let (srv, slot) = sync_header(fields)?;
    // The initiator reports the positions from its side; they are ours
    // swapped.
    let remote_synced = protocol::field_u64(fields, 3, "local_rec_no")?;
    let local_synced = protocol::field_u64(fields, 4, "remote_rec_no")?;
    match PeriodicSync::can_start_sync_command(state, srv, slot, false) {
        PassiveStart::Ok(sync_id) => {
            PeriodicSync::commit(state, srv, slot, sync_id, local_synced, remote_synced);
            PeriodicSync::sync_command_finished(state, srv, slot, sync_id);
            send_line(framed, "OK:".to_string()).await?;
        }
        _ => send_line(framed, "ERR:NEED_ABORT".to_string()).await?,
    }
    Ok(())
}

async fn handle_sync_cancel(
    state: &Arc<ServerState>,
    framed: &mut PeerFramed,
    fields: &[String],
) -> Result<(), NetCacheError> {
    let (srv, slot) = sync_header(fields)?;
    match PeriodicSync::can_start_sync_command(state, srv, slot, false) {
        PassiveStart::Ok(sync_id) => {
            PeriodicSync::cancel(state, srv, slot, sync_id);
            PeriodicSync::sync_command_finished(state, srv, slot, sync_id);
            send_line(framed, "OK:".to_string()).await?;
        }
        _ => send_line(framed, "ERR:NEED_ABORT".to_string()).await?,
    }
    Ok(())
}

async fn handle_copy_remove(
    state: &Arc<ServerState>,
    framed: &mut PeerFramed,
    fields: &[String],
) -> Result<(), NetCacheError> {
    let key = BlobKey::new(
        protocol::field_str(fields, 1, "cache")?,
        protocol::field_str(fields, 2, "key")?,
        protocol::field_str(fields, 3, "subkey")?,
    );
    let orig_time = protocol::field_u64(fields, 4, "orig_time")?;
    let orig_server = protocol::field_u64(fields, 5, "orig_server")?;
    let orig_rec_no = protocol::field_u64(fields, 6, "orig_rec_no")?;

    let slot = state.distribution.slot_of(&key);
    let reply = if state.store.remove_blob(&key).await? {
        state.register_sync_event(
            slot,
            SyncEvent {
                rec_no: 0,
                blob_size: 0,
                key: key.clone(),
                event_type: EventType::Remove,
                orig_time,
                orig_server,
                orig_rec_no,
                local_time: 0,
            },
        );
        "OK:".to_string()
    } else {
        "ERR:BLOB not found".to_string()
    };
    send_line(framed, reply).await
}

async fn handle_proxy_meta(
    state: &Arc<ServerState>,
    framed: &mut PeerFramed,
    fields: &[String],
) -> Result<(), NetCacheError> {
    let key = BlobKey::new(
        protocol::field_str(fields, 1, "cache")?,
        protocol::field_str(fields, 2, "key")?,
        protocol::field_str(fields, 3, "subkey")?,
    );
    let reply = match state.store.read_meta(&key).await? {
        Some(sum) => format!(
            "OK:SIZE=0 {} {} {} {} {} {} {}",
            sum.create_time,
            sum.create_server,
            sum.create_id,
            sum.dead_time,
            sum.expire,
            sum.ver_expire,
            sum.size
        ),
        None => "ERR:BLOB not found".to_string(),
    };
    send_line(framed, reply).await
}
