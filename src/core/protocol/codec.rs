// src/core/protocol/codec.rs

//! Line/binary codec for the peer-facing server session. The stream is
//! line-oriented by default; after announcing a blob transfer the session
//! switches the decoder into blob mode, which consumes one framed payload
//! (signature, chunks, sentinel) and yields it as a single frame.

use super::framing::{BLOB_STREAM_SIGNATURE, CHUNK_SENTINEL, MAX_CHUNK_SIZE};
use crate::core::errors::NetCacheError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Incoming frames.
#[derive(Debug)]
pub enum WireFrame {
    Line(String),
    Blob(Bytes),
}

/// Outgoing frames: command/reply lines get CRLF appended, raw bytes go out
/// verbatim (list bodies, pre-framed blob payloads).
#[derive(Debug)]
pub enum WireOut {
    Line(String),
    Bytes(Bytes),
}

#[derive(Debug)]
enum BlobPhase {
    Signature,
    ChunkLen,
    Chunk(usize),
}

#[derive(Debug)]
enum Mode {
    Line,
    Blob { expected: u64, phase: BlobPhase },
}

/// Stateful decoder for the peer wire.
#[derive(Debug)]
pub struct PeerWireCodec {
    mode: Mode,
    swap: Option<bool>,
    collected: BytesMut,
}

impl Default for PeerWireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerWireCodec {
    pub fn new() -> Self {
        Self {
            mode: Mode::Line,
            swap: None,
            collected: BytesMut::new(),
        }
    }

    /// Switches the decoder to consume one framed blob payload of at most
    /// `expected` bytes; it returns to line mode after the sentinel.
    pub fn expect_blob(&mut self, expected: u64) {
        self.mode = Mode::Blob {
            expected,
            phase: BlobPhase::Signature,
        };
        self.collected.clear();
    }
}

impl Decoder for PeerWireCodec {
    type Item = WireFrame;
    type Error = NetCacheError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireFrame>, NetCacheError> {
        loop {
            match &mut self.mode {
                Mode::Line => {
                    let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                        return Ok(None);
                    };
                    let mut line = src.split_to(pos + 1);
                    line.truncate(pos);
                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }
                    let text = String::from_utf8(line.to_vec())?;
                    return Ok(Some(WireFrame::Line(text)));
                }
                Mode::Blob { expected, phase } => match phase {
                    BlobPhase::Signature => {
                        if src.len() < 4 {
                            return Ok(None);
                        }
                        let word = src.get_u32_le();
                        let swap = if word == BLOB_STREAM_SIGNATURE {
                            false
                        } else if word.swap_bytes() == BLOB_STREAM_SIGNATURE {
                            true
                        } else {
                            return Err(NetCacheError::Protocol(format!(
                                "bad blob stream signature {word:#010x}"
                            )));
                        };
                        if let Some(known) = self.swap {
                            if known != swap {
                                return Err(NetCacheError::Protocol(
                                    "blob stream byte order changed mid-connection".to_string(),
                                ));
                            }
                        } else {
                            self.swap = Some(swap);
                        }
                        *phase = BlobPhase::ChunkLen;
                    }
                    BlobPhase::ChunkLen => {
                        if src.len() < 4 {
                            return Ok(None);
                        }
                        let raw = src.get_u32_le();
                        let len = if self.swap == Some(true) {
                            raw.swap_bytes()
                        } else {
                            raw
                        };
                        if len == CHUNK_SENTINEL {
                            let data = self.collected.split().freeze();
                            self.mode = Mode::Line;
                            return Ok(Some(WireFrame::Blob(data)));
                        }
                        if len > MAX_CHUNK_SIZE {
                            return Err(NetCacheError::Protocol(format!(
                                "blob chunk length {len} out of range"
                            )));
                        }
                        if self.collected.len() as u64 + len as u64 > *expected {
                            return Err(NetCacheError::Protocol(format!(
                                "blob stream exceeds announced size {expected}"
                            )));
                        }
                        *phase = BlobPhase::Chunk(len as usize);
                    }
                    BlobPhase::Chunk(len) => {
                        if src.len() < *len {
                            return Ok(None);
                        }
                        self.collected.extend_from_slice(&src.split_to(*len));
                        *phase = BlobPhase::ChunkLen;
                    }
                },
            }
        }
    }
}

impl Encoder<WireOut> for PeerWireCodec {
    type Error = NetCacheError;

    fn encode(&mut self, item: WireOut, dst: &mut BytesMut) -> Result<(), NetCacheError> {
        match item {
            WireOut::Line(line) => {
                dst.reserve(line.len() + 2);
                dst.put_slice(line.as_bytes());
                dst.put_slice(b"\r\n");
            }
            WireOut::Bytes(bytes) => {
                dst.extend_from_slice(&bytes);
            }
        }
        Ok(())
    }
}
