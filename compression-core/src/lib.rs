//! Compression core library: canonical hashing, content-addressed digests,
//! the binary Merkle commitment engine, and the batching state machine that
//! seals records into commitments for on-chain anchoring.
#![deny(missing_docs)]

mod batcher;
mod config;
mod digest;
mod error;
mod merkle;
mod record;

pub use batcher::{
    Batcher, BatchCommitment, BatchStatus, BatcherConfig, CommitSink, RecordHandle, Signature,
    Stats,
};
pub use config::{Config, StorageConfig, StorageKind};
pub use digest::{
    canonical_encode, content_digest, field_digest, ContentDigest, Digest, FieldDigest, Id,
    StorageKey,
};
pub use error::{CompressionError, Result};
pub use merkle::{build as build_tree, proof, root, verify, verify_with_len, Tree};
pub use record::{record_leaf, Record, RecordInput, RecordKind};

/// Self-reported identity of an `ObjectStore` backend, returned by
/// `node_info`. Shape mirrors the original service's node-info probe: an
/// identifier, versioning strings, and a count of retained objects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Info {
    /// Backend identifier (e.g. a node id or `"in-memory"`).
    pub id: String,
    /// Backend implementation version string.
    pub agent_version: String,
    /// Protocol version the backend speaks.
    pub protocol_version: String,
    /// Number of objects currently retained.
    pub storage_items: usize,
}

/// Trait implemented by content-addressed storage backends the batcher
/// writes payload bytes through before sealing a batch. Kept here (rather
/// than only in `compression-store`) so `Batcher` can depend on the trait
/// without depending on any concrete backend.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under its content digest, returning the key. Writes are
    /// idempotent: storing the same bytes twice is a no-op the second time.
    async fn put(&self, bytes: &[u8]) -> Result<StorageKey>;

    /// Fetch the bytes stored under `key`.
    async fn get(&self, key: &StorageKey) -> Result<Vec<u8>>;

    /// Whether `key` is present without fetching its bytes.
    async fn exists(&self, key: &StorageKey) -> Result<bool>;

    /// Mark `key` as pinned, preventing garbage collection by the backend.
    async fn pin(&self, key: &StorageKey) -> Result<()>;

    /// Unmark `key` as pinned, allowing the backend to evict it later.
    /// Default: a no-op success, for backends (and test doubles) that never
    /// evict.
    async fn unpin(&self, _key: &StorageKey) -> Result<()> {
        Ok(())
    }

    /// Backend identity and occupancy. Default: an empty, version-less
    /// `Info` for backends that don't track this.
    async fn node_info(&self) -> Result<Info> {
        Ok(Info::default())
    }
}
