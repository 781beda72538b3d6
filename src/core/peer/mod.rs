// src/core/peer/mod.rs

//! Everything that talks to one remote peer: the per-peer control object
//! (connection budget, mirror queues, throttling), the active connection
//! driving outgoing commands, and the mirror dispatcher fanning client
//! mutations out to the responsible peers.

pub mod connection;
pub mod control;
pub mod mirror;

pub use connection::ActiveConnection;
pub use control::PeerControl;

use crate::core::storage::{BlobKey, BlobSummary};

/// One opportunistic replication event queued towards a peer.
#[derive(Debug, Clone)]
pub enum MirrorEvent {
    Write {
        key: BlobKey,
        slot: u16,
        orig_rec_no: u64,
        size: u64,
    },
    Prolong {
        key: BlobKey,
        slot: u16,
        orig_rec_no: u64,
        orig_time: u64,
        /// Snapshot of the blob summary taken when the event was produced.
        summary: BlobSummary,
    },
    Remove {
        key: BlobKey,
        slot: u16,
        orig_rec_no: u64,
        orig_time: u64,
    },
}

impl MirrorEvent {
    /// The payload size deciding the small/big queue split.
    pub fn queue_size(&self) -> u64 {
        match self {
            MirrorEvent::Write { size, .. } => *size,
            _ => 0,
        }
    }
}
