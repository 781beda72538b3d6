// src/core/protocol/framing.rs

//! The blob transfer sublayer. A payload starts with the 4-byte signature
//! word `0x01020304`; the receiver infers the sender's byte order from how
//! the word arrives and swaps every subsequent chunk length accordingly.
//! Chunks are `{u32 len, len bytes}`; `0xFFFFFFFF` terminates the payload
//! and `0xFFFFFFFE` is the largest permitted chunk.

use crate::core::errors::NetCacheError;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const BLOB_STREAM_SIGNATURE: u32 = 0x0102_0304;
pub const CHUNK_SENTINEL: u32 = 0xFFFF_FFFF;
pub const MAX_CHUNK_SIZE: u32 = 0xFFFF_FFFE;

/// Chunk granularity on the write side.
const WRITE_CHUNK: usize = 256 * 1024;

/// Builds a fully framed blob payload in memory.
pub fn frame_blob(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 16);
    buf.put_u32_le(BLOB_STREAM_SIGNATURE);
    for chunk in data.chunks(WRITE_CHUNK) {
        buf.put_u32_le(chunk.len() as u32);
        buf.put_slice(chunk);
    }
    buf.put_u32_le(CHUNK_SENTINEL);
    buf.freeze()
}

/// Writes a fully framed blob payload.
pub async fn write_blob<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), NetCacheError> {
    writer.write_all(&frame_blob(data)).await?;
    Ok(())
}

/// Writes a payload with no chunks at all: signature followed by the
/// sentinel. Used when a command exchange has already committed to a blob
/// stream that turns out to be unnecessary (`HAVE_NEWER1`, `NEED_ABORT1`).
pub async fn write_fake_blob<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), NetCacheError> {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(BLOB_STREAM_SIGNATURE);
    buf.put_u32_le(CHUNK_SENTINEL);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Reads the signature word and decides whether subsequent chunk lengths
/// need a byte swap. Rejects anything that is not the signature in either
/// byte order.
async fn read_signature<R: AsyncRead + Unpin>(reader: &mut R) -> Result<bool, NetCacheError> {
    let word = reader.read_u32_le().await?;
    if word == BLOB_STREAM_SIGNATURE {
        Ok(false)
    } else if word.swap_bytes() == BLOB_STREAM_SIGNATURE {
        Ok(true)
    } else {
        Err(NetCacheError::Protocol(format!(
            "bad blob stream signature {word:#010x}"
        )))
    }
}

/// Reads one framed blob payload. `expected_size` bounds the total payload
/// (as announced by the `SIZE=` reply field); `swap_hint` caches the
/// detected byte order across the connection's payloads.
pub async fn read_blob<R: AsyncRead + Unpin>(
    reader: &mut R,
    expected_size: u64,
    swap_hint: &mut Option<bool>,
) -> Result<Bytes, NetCacheError> {
    let swap = read_signature(reader).await?;
    if let Some(known) = *swap_hint {
        if known != swap {
            return Err(NetCacheError::Protocol(
                "blob stream byte order changed mid-connection".to_string(),
            ));
        }
    } else {
        *swap_hint = Some(swap);
    }

    let mut data = BytesMut::with_capacity(expected_size.min(1 << 20) as usize);
    loop {
        let raw_len = reader.read_u32_le().await?;
        let chunk_len = if swap { raw_len.swap_bytes() } else { raw_len };
        if chunk_len == CHUNK_SENTINEL {
            break;
        }
        if chunk_len > MAX_CHUNK_SIZE {
            return Err(NetCacheError::Protocol(format!(
                "blob chunk length {chunk_len} out of range"
            )));
        }
        if data.len() as u64 + chunk_len as u64 > expected_size {
            return Err(NetCacheError::Protocol(format!(
                "blob stream exceeds announced size {expected_size}"
            )));
        }
        let start = data.len();
        data.resize(start + chunk_len as usize, 0);
        reader.read_exact(&mut data[start..]).await?;
    }
    Ok(data.freeze())
}
