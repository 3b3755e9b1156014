//! Error surface shared by the compression core's components.

use thiserror::Error;

/// Errors raised by the content-addressed store, Merkle engine, and batcher.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// Store was called while `storage.disabled = true`.
    #[error("storage disabled")]
    StorageDisabled,
    /// Backend I/O error; retryable at the caller's discretion.
    #[error("storage failed: {0}")]
    StorageFailed(String),
    /// Key absent from the store.
    #[error("not found: {0}")]
    NotFound(String),
    /// `MerkleEngine::build` called with zero leaves.
    #[error("empty input")]
    EmptyInput,
    /// Leaf index outside `[0, n)`.
    #[error("index out of range: {0}")]
    IndexOutOfRange(usize),
    /// Supplied proof length does not match the tree's derived depth.
    #[error("malformed proof: expected {expected} siblings, got {got}")]
    MalformedProof {
        /// Expected number of sibling digests.
        expected: usize,
        /// Number of sibling digests actually supplied.
        got: usize,
    },
    /// The commit sink rejected a sealed batch; the batch remains sealed for retry.
    #[error("batch commit failed: {0}")]
    BatchCommitFailed(String),
    /// The batcher has been shut down and refuses further enqueues.
    #[error("batcher closed")]
    Closed,
    /// Corrupted state that cannot be recovered from; the batcher must close.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),
}

/// Convenience alias for fallible operations within the core.
pub type Result<T> = std::result::Result<T, CompressionError>;
