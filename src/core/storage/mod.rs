// src/core/storage/mod.rs

//! The storage seam: blob keys, per-version summaries, and the `BlobStore`
//! capability the replication engine drives. The real cache engine lives
//! behind this trait; `MemoryStore` is the in-process implementation backing
//! the node and the test suites.

use crate::core::errors::NetCacheError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;

/// Separator used when packing a `(cache, key, subkey)` triple into a single
/// raw key string. Generated keys are stored as the bare key field.
const KEY_PACK_SEP: char = '\u{1f}';

/// Prefix of self-describing node-generated blob keys.
pub const GENERATED_KEY_PREFIX: &str = "NC_1_";

/// A structured blob identifier. Two forms exist: node-generated keys carry
/// everything in `key` (cache and subkey empty), user keys are a full
/// `(cache, key, subkey)` triple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlobKey {
    pub cache: String,
    pub key: String,
    pub subkey: String,
}

impl BlobKey {
    pub fn new(cache: &str, key: &str, subkey: &str) -> Self {
        Self {
            cache: cache.to_string(),
            key: key.to_string(),
            subkey: subkey.to_string(),
        }
    }

    /// Wraps a node-generated key string.
    pub fn generated(key: String) -> Self {
        Self {
            cache: String::new(),
            key,
            subkey: String::new(),
        }
    }

    /// True for self-describing node-generated keys, which embed their own
    /// slot token.
    pub fn is_generated(&self) -> bool {
        self.cache.is_empty() && self.subkey.is_empty() && self.key.starts_with(GENERATED_KEY_PREFIX)
    }

    /// Packs the key into its single-string storage representation.
    pub fn raw(&self) -> String {
        if self.cache.is_empty() && self.subkey.is_empty() {
            self.key.clone()
        } else {
            format!(
                "{}{sep}{}{sep}{}",
                self.cache,
                self.key,
                self.subkey,
                sep = KEY_PACK_SEP
            )
        }
    }

    /// Reverses [`BlobKey::raw`].
    pub fn unpack(raw: &str) -> Self {
        let mut parts = raw.split(KEY_PACK_SEP);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(cache), Some(key), Some(subkey)) => Self::new(cache, key, subkey),
            _ => Self::generated(raw.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty() && self.key.is_empty() && self.subkey.is_empty()
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cache.is_empty() && self.subkey.is_empty() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}/{}/{}", self.cache, self.key, self.subkey)
        }
    }
}

/// Compact per-version blob metadata. Two summaries describe the same blob
/// version iff their `(create_time, create_server, create_id)` triples match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlobSummary {
    /// Creation timestamp in microseconds.
    pub create_time: u64,
    /// Server id the blob was created on.
    pub create_server: u64,
    /// Creation sequence number on the origin server.
    pub create_id: u32,
    pub dead_time: i32,
    pub expire: i32,
    pub ver_expire: i32,
    pub size: u64,
}

impl BlobSummary {
    /// Same blob version: identical creation triple.
    pub fn is_same_create(&self, other: &BlobSummary) -> bool {
        self.create_time == other.create_time
            && self.create_server == other.create_server
            && self.create_id == other.create_id
    }

    /// Identical creation triple and identical expiration lifetimes.
    pub fn is_equal(&self, other: &BlobSummary) -> bool {
        self.is_same_create(other)
            && self.dead_time == other.dead_time
            && self.expire == other.expire
            && self.ver_expire == other.ver_expire
    }

    /// Creation-order comparison; for the same creation triple the one with
    /// the shorter remaining life is the older one.
    pub fn is_older(&self, other: &BlobSummary) -> bool {
        if self.create_time != other.create_time {
            return self.create_time < other.create_time;
        }
        if self.create_server != other.create_server {
            return self.create_server < other.create_server;
        }
        if self.create_id != other.create_id {
            return self.create_id < other.create_id;
        }
        if self.dead_time != other.dead_time {
            return self.dead_time < other.dead_time;
        }
        if self.expire != other.expire {
            return self.expire < other.expire;
        }
        self.ver_expire < other.ver_expire
    }
}

/// Sorted blob inventory of one slot, keyed by raw key.
pub type BlobSumList = BTreeMap<String, BlobSummary>;

/// The capability surface the replication engine needs from the local blob
/// storage engine. All methods are async; a backend that has to touch disk
/// suspends the caller instead of reporting would-block.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Reads a blob's summary without touching its data.
    async fn read_meta(&self, key: &BlobKey) -> Result<Option<BlobSummary>, NetCacheError>;

    /// Opens a blob for reading: summary plus the full payload.
    async fn open_read(&self, key: &BlobKey) -> Result<Option<(BlobSummary, Bytes)>, NetCacheError>;

    /// Creates or replaces a blob with the given summary and payload. The
    /// caller always knows the slot from the distribution map.
    async fn write_blob(
        &self,
        key: &BlobKey,
        slot: u16,
        summary: BlobSummary,
        data: Bytes,
    ) -> Result<(), NetCacheError>;

    /// Applies the expiration fields of `summary` to an existing blob of the
    /// same version. Returns false when the blob is absent or the versions
    /// differ.
    async fn prolong_blob(&self, key: &BlobKey, summary: &BlobSummary)
    -> Result<bool, NetCacheError>;

    /// Removes a blob. Returns false when it was absent.
    async fn remove_blob(&self, key: &BlobKey) -> Result<bool, NetCacheError>;

    /// Enumerates the full inventory of one slot, sorted by raw key.
    async fn full_blobs_list(&self, slot: u16) -> BlobSumList;
}

/// In-memory `BlobStore` backed by a sharded concurrent map. Entries remember
/// the slot they were stored under so per-slot enumeration stays cheap
/// relative to the store size.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: DashMap<String, StoredBlob>,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    slot: u16,
    summary: BlobSummary,
    data: Bytes,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn read_meta(&self, key: &BlobKey) -> Result<Option<BlobSummary>, NetCacheError> {
        Ok(self.blobs.get(&key.raw()).map(|b| b.summary))
    }

    async fn open_read(
        &self,
        key: &BlobKey,
    ) -> Result<Option<(BlobSummary, Bytes)>, NetCacheError> {
        Ok(self
            .blobs
            .get(&key.raw())
            .map(|b| (b.summary, b.data.clone())))
    }

    async fn write_blob(
        &self,
        key: &BlobKey,
        slot: u16,
        summary: BlobSummary,
        data: Bytes,
    ) -> Result<(), NetCacheError> {
        self.blobs.insert(key.raw(), StoredBlob { slot, summary, data });
        Ok(())
    }

    async fn prolong_blob(
        &self,
        key: &BlobKey,
        summary: &BlobSummary,
    ) -> Result<bool, NetCacheError> {
        match self.blobs.get_mut(&key.raw()) {
            Some(mut blob) if blob.summary.is_same_create(summary) => {
                blob.summary.dead_time = blob.summary.dead_time.max(summary.dead_time);
                blob.summary.expire = blob.summary.expire.max(summary.expire);
                blob.summary.ver_expire = blob.summary.ver_expire.max(summary.ver_expire);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_blob(&self, key: &BlobKey) -> Result<bool, NetCacheError> {
        Ok(self.blobs.remove(&key.raw()).is_some())
    }

    async fn full_blobs_list(&self, slot: u16) -> BlobSumList {
        self.blobs
            .iter()
            .filter(|entry| entry.slot == slot)
            .map(|entry| (entry.key().clone(), entry.summary))
            .collect()
    }
}
