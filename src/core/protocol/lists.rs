// src/core/protocol/lists.rs

//! Binary bodies exchanged during sync start negotiation: the reduced events
//! list and the full blobs list. Both are concatenations of little-endian
//! records prefixed with a `u16` key length; the enclosing reply line
//! announces the total byte count via `SIZE=<n>`.

use crate::core::errors::NetCacheError;
use crate::core::storage::{BlobKey, BlobSummary};
use crate::core::sync_log::{EventType, ReducedEvents, SyncEvent};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encodes a reduced events map. Each retained cell contributes its
/// Write/Remove and its Prolong record, if present.
pub fn encode_events(events: &ReducedEvents) -> Bytes {
    let mut buf = BytesMut::new();
    for cell in events.values() {
        if let Some(evt) = &cell.wr_or_rm {
            encode_event(&mut buf, evt);
        }
        if let Some(evt) = &cell.prolong {
            encode_event(&mut buf, evt);
        }
    }
    buf.freeze()
}

fn encode_event(buf: &mut BytesMut, evt: &SyncEvent) {
    let key = evt.key.raw();
    buf.put_u16_le(key.len() as u16);
    buf.put_slice(key.as_bytes());
    buf.put_u8(evt.event_type as u8);
    buf.put_u64_le(evt.rec_no);
    buf.put_u64_le(evt.local_time);
    buf.put_u64_le(evt.orig_rec_no);
    buf.put_u64_le(evt.orig_server);
    buf.put_u64_le(evt.orig_time);
}

/// Decodes an events-list body into individual records.
pub fn decode_events(mut buf: &[u8]) -> Result<Vec<SyncEvent>, NetCacheError> {
    let mut events = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 2 {
            return Err(NetCacheError::Protocol("truncated events list".to_string()));
        }
        let key_len = buf.get_u16_le() as usize;
        if buf.remaining() < key_len + 1 + 8 * 5 {
            return Err(NetCacheError::Protocol("truncated events list".to_string()));
        }
        let key_bytes = buf.copy_to_bytes(key_len);
        let key = String::from_utf8(key_bytes.to_vec())?;
        let event_type = EventType::from_u8(buf.get_u8())
            .ok_or_else(|| NetCacheError::Protocol("unknown event type".to_string()))?;
        let rec_no = buf.get_u64_le();
        let local_time = buf.get_u64_le();
        let orig_rec_no = buf.get_u64_le();
        let orig_server = buf.get_u64_le();
        let orig_time = buf.get_u64_le();
        events.push(SyncEvent {
            rec_no,
            blob_size: 0,
            key: BlobKey::unpack(&key),
            event_type,
            orig_time,
            orig_server,
            orig_rec_no,
            local_time,
        });
    }
    Ok(events)
}

/// Encodes a blobs-list body from a key-sorted inventory.
pub fn encode_blobs<'a, I>(blobs: I) -> Bytes
where
    I: IntoIterator<Item = (&'a String, &'a BlobSummary)>,
{
    let mut buf = BytesMut::new();
    for (key, sum) in blobs {
        buf.put_u16_le(key.len() as u16);
        buf.put_slice(key.as_bytes());
        buf.put_u64_le(sum.create_time);
        buf.put_u64_le(sum.create_server);
        buf.put_u32_le(sum.create_id);
        buf.put_i32_le(sum.dead_time);
        buf.put_i32_le(sum.expire);
        buf.put_i32_le(sum.ver_expire);
    }
    buf.freeze()
}

/// Decodes a blobs-list body. Sizes are not carried on the wire; the blob
/// diff decides by creation triple and expiration fields only.
pub fn decode_blobs(mut buf: &[u8]) -> Result<Vec<(String, BlobSummary)>, NetCacheError> {
    let mut blobs = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 2 {
            return Err(NetCacheError::Protocol("truncated blobs list".to_string()));
        }
        let key_len = buf.get_u16_le() as usize;
        if buf.remaining() < key_len + 8 + 8 + 4 + 4 + 4 + 4 {
            return Err(NetCacheError::Protocol("truncated blobs list".to_string()));
        }
        let key_bytes = buf.copy_to_bytes(key_len);
        let key = String::from_utf8(key_bytes.to_vec())?;
        let create_time = buf.get_u64_le();
        let create_server = buf.get_u64_le();
        let create_id = buf.get_u32_le();
        let dead_time = buf.get_i32_le();
        let expire = buf.get_i32_le();
        let ver_expire = buf.get_i32_le();
        blobs.push((
            key,
            BlobSummary {
                create_time,
                create_server,
                create_id,
                dead_time,
                expire,
                ver_expire,
                size: 0,
            },
        ));
    }
    Ok(blobs)
}
