// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::num::ParseIntError;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all observable failures within the node.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations.
#[derive(Error, Debug)]
pub enum NetCacheError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// An unparsable reply token or field count on the peer wire. The
    /// connection carrying it is closed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An `ERR:` reply from a peer, surfaced to the caller as command failure.
    #[error("Peer error: {0}")]
    Peer(String),

    /// `BLOB not found` reply. Success-empty in sync paths, an error in
    /// direct proxy reads.
    #[error("BLOB not found")]
    NotFound,

    /// Socket close, connect refusal, or command timeout.
    #[error("Network error: {0}")]
    Network(String),

    /// The peer is inside its throttle window and refuses new connections.
    #[error("Connection is throttled")]
    Throttled,

    /// Both sides attempted to drive a sync on the same (peer, slot) pair.
    #[error("Sync crossed with remote initiation")]
    CrossSync,

    /// The remote side refused a sync start because it is busy or cleaning.
    #[error("Server is busy")]
    ServerBusy,

    /// The sync session was aborted (remote NEED_ABORT or local shutdown).
    #[error("Sync aborted")]
    SyncAborted,

    /// The storage accessor reported an error mid-transfer.
    #[error("Blob data is corrupted")]
    BlobDataCorrupted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for NetCacheError {
    fn clone(&self) -> Self {
        match self {
            NetCacheError::Io(e) => NetCacheError::Io(Arc::clone(e)),
            NetCacheError::Protocol(s) => NetCacheError::Protocol(s.clone()),
            NetCacheError::Peer(s) => NetCacheError::Peer(s.clone()),
            NetCacheError::NotFound => NetCacheError::NotFound,
            NetCacheError::Network(s) => NetCacheError::Network(s.clone()),
            NetCacheError::Throttled => NetCacheError::Throttled,
            NetCacheError::CrossSync => NetCacheError::CrossSync,
            NetCacheError::ServerBusy => NetCacheError::ServerBusy,
            NetCacheError::SyncAborted => NetCacheError::SyncAborted,
            NetCacheError::BlobDataCorrupted => NetCacheError::BlobDataCorrupted,
            NetCacheError::Config(s) => NetCacheError::Config(s.clone()),
            NetCacheError::InvalidState(s) => NetCacheError::InvalidState(s.clone()),
            NetCacheError::Internal(s) => NetCacheError::Internal(s.clone()),
        }
    }
}

impl PartialEq for NetCacheError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NetCacheError::Io(e1), NetCacheError::Io(e2)) => e1.to_string() == e2.to_string(),
            (NetCacheError::Protocol(s1), NetCacheError::Protocol(s2)) => s1 == s2,
            (NetCacheError::Peer(s1), NetCacheError::Peer(s2)) => s1 == s2,
            (NetCacheError::Network(s1), NetCacheError::Network(s2)) => s1 == s2,
            (NetCacheError::Config(s1), NetCacheError::Config(s2)) => s1 == s2,
            (NetCacheError::InvalidState(s1), NetCacheError::InvalidState(s2)) => s1 == s2,
            (NetCacheError::Internal(s1), NetCacheError::Internal(s2)) => s1 == s2,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for NetCacheError {
    fn from(e: std::io::Error) -> Self {
        NetCacheError::Io(Arc::new(e))
    }
}

impl From<ParseIntError> for NetCacheError {
    fn from(e: ParseIntError) -> Self {
        NetCacheError::Protocol(format!("invalid integer field: {e}"))
    }
}

impl From<std::str::Utf8Error> for NetCacheError {
    fn from(_: std::str::Utf8Error) -> Self {
        NetCacheError::Protocol("non-UTF8 data in text field".to_string())
    }
}

impl From<std::string::FromUtf8Error> for NetCacheError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        NetCacheError::Protocol("non-UTF8 data in text field".to_string())
    }
}
