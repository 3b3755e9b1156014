//! The immutable compressed entry appended to a batch.

use serde::{Deserialize, Serialize};

use crate::digest::{
    canonical_encode, field_digest, ContentDigest, Digest, FieldDigest, Id, StorageKey,
};
use crate::error::Result;

/// Tagged variant of a compressed record's payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Free-form text message content.
    Text,
    /// Opaque structured data.
    Data,
    /// An agent command invocation.
    Command,
    /// A response to a prior command.
    Response,
    /// Channel participant metadata.
    Participant,
}

/// An immutable compressed entry. Fields are declared in alphabetical order,
/// matching the canonical wire encoding exactly, so `Record` doubles as its
/// own canonical form under `canonical_encode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Channel identifier.
    pub channel: Id,
    /// Hash of the stored payload.
    pub content_hash: ContentDigest,
    /// Millisecond Unix timestamp assigned at enqueue.
    pub created_at: u64,
    /// CAS key for the stored payload; equals `content_hash` under the
    /// default hashing backend.
    pub external_ref: StorageKey,
    /// Payload kind.
    pub kind: RecordKind,
    /// Digest of the record this one replies to, if any.
    pub reply_to: Option<Digest>,
    /// Sender identifier.
    pub sender: Id,
}

/// Caller-supplied inputs for `Batcher::enqueue`.
#[derive(Debug, Clone)]
pub struct RecordInput {
    /// Channel identifier.
    pub channel: Id,
    /// Sender identifier.
    pub sender: Id,
    /// Raw payload bytes to store in the object store.
    pub content_bytes: Vec<u8>,
    /// Payload kind.
    pub kind: RecordKind,
    /// Digest of the record this one replies to, if any.
    pub reply_to: Option<Digest>,
}

/// The leaf digest a record contributes to its batch's Merkle tree:
/// `field_digest(canonical_encode(record))`. Exposed as a standalone
/// operation so a verifier holding a `Record` independently can recompute
/// the leaf without re-deriving the two-step encode-then-hash chain itself.
pub fn record_leaf(record: &Record) -> Result<FieldDigest> {
    Ok(field_digest(&canonical_encode(record)?))
}
