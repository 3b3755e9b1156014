//! The batching state machine: accumulates enqueued records into an open
//! batch, seals on size or time triggers, and drives the commit sink.
//!
//! State is guarded by a single `tokio::sync::Mutex` covering the open
//! batch, the sealed-batch registry, and the flush timer together, per the
//! single-writer model the rest of this crate assumes.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::digest::{content_digest, ContentDigest, Digest};
use crate::error::{CompressionError, Result};
use crate::merkle;
use crate::record::{record_leaf, Record, RecordInput};
use crate::ObjectStore;

/// Opaque signature returned by the commit sink; the core never interprets
/// its bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

/// External sink that accepts a sealed batch's commitment and returns a
/// signature. Errors surface verbatim, wrapped as `BatchCommitFailed`.
#[async_trait::async_trait]
pub trait CommitSink: Send + Sync {
    /// Submit `commitment` for on-chain anchoring.
    async fn commit(&self, commitment: &BatchCommitment) -> anyhow::Result<Signature>;
}

/// A sealed batch's commitment: root, leaves in enqueue order, and a
/// per-leaf inclusion proof.
#[derive(Debug, Clone)]
pub struct BatchCommitment {
    /// Identifier of the batch this commitment seals.
    pub batch_id: u64,
    /// Merkle root over `leaves`.
    pub root: Digest,
    /// Leaf digests in enqueue order.
    pub leaves: Vec<Digest>,
    /// `proofs[i]` is the inclusion proof for `leaves[i]`.
    pub proofs: Vec<Vec<Digest>>,
    /// Millisecond Unix timestamp at which the batch was sealed.
    pub sealed_at: u64,
}

/// Lifecycle state of a sealed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Sealed, commit not yet attempted or not yet successful.
    Sealed,
    /// Commit sink accepted the batch.
    Committed,
    /// Commit sink rejected the batch; retryable via `retry_batch`.
    Failed,
}

/// Handle returned from a successful enqueue.
#[derive(Debug, Clone, Copy)]
pub struct RecordHandle {
    /// The batch the record was appended to.
    pub batch_id: u64,
    /// The record's index within that batch's leaf vector.
    pub leaf_index: usize,
    /// Content digest of the record's stored payload.
    pub content_hash: ContentDigest,
}

/// Point-in-time batcher statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Records currently buffered in the open batch.
    pub queue_len: usize,
    /// When the most recent successful commit occurred.
    pub last_commit_at: Option<u64>,
    /// Total sealed batches across this batcher's lifetime.
    pub total_batches: u64,
    /// Total records ever enqueued.
    pub total_records: u64,
}

/// Closed configuration set; unrecognized options have no representation.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Hard upper bound on records per batch.
    pub max_batch_size: usize,
    /// Deadline from first enqueue of an open batch.
    pub flush_interval: Duration,
    /// When false, every enqueue immediately seals a singleton batch and
    /// blocks until the commit hook returns.
    pub batching_enabled: bool,
    /// First `batch_id` assigned; subsequent ids increase strictly.
    pub base_batch_id: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            flush_interval: Duration::from_millis(5000),
            batching_enabled: true,
            base_batch_id: 0,
        }
    }
}

/// An abstract flush-timer capability: exactly one may be armed at a time,
/// and arming implicitly cancels whatever was armed before it.
#[derive(Default)]
struct FlushTimer {
    handle: Option<JoinHandle<()>>,
}

impl FlushTimer {
    fn arm<F>(&mut self, duration: Duration, callback: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            callback.await;
        }));
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct OpenBatch {
    id: u64,
    leaves: Vec<Digest>,
}

struct SealedEntry {
    leaves: Vec<Digest>,
    root: Digest,
    proofs: Vec<Vec<Digest>>,
    sealed_at: u64,
    status: BatchStatus,
    signature: Option<Signature>,
}

struct Inner {
    open: Option<OpenBatch>,
    registry: BTreeMap<u64, SealedEntry>,
    next_batch_id: u64,
    total_records: u64,
    last_commit_at: Option<u64>,
    closed: bool,
    timer: FlushTimer,
}

/// Accumulates compressed records and emits Merkle-committed batches on
/// size- or time-triggered flush.
pub struct Batcher {
    inner: Mutex<Inner>,
    config: BatcherConfig,
    storage: Arc<dyn ObjectStore>,
    sink: Arc<dyn CommitSink>,
}

impl Batcher {
    /// Construct a batcher with its storage backend and commit sink
    /// injected. Returned as an `Arc` because the flush timer holds a
    /// back-reference to schedule itself.
    pub fn new(
        config: BatcherConfig,
        storage: Arc<dyn ObjectStore>,
        sink: Arc<dyn CommitSink>,
    ) -> Arc<Self> {
        let next_batch_id = config.base_batch_id;
        Arc::new(Self {
            inner: Mutex::new(Inner {
                open: None,
                registry: BTreeMap::new(),
                next_batch_id,
                total_records: 0,
                last_commit_at: None,
                closed: false,
                timer: FlushTimer::default(),
            }),
            config,
            storage,
            sink,
        })
    }

    /// Store the record's payload, append it to the current open batch
    /// (opening one and arming the flush timer if needed), and trigger an
    /// immediate flush if the batch just reached `max_batch_size` or if
    /// batching is disabled.
    pub async fn enqueue(self: &Arc<Self>, input: RecordInput) -> Result<RecordHandle> {
        let content_hash = content_digest(&input.content_bytes);
        let external_ref = match self.storage.put(&input.content_bytes).await {
            Ok(key) => key,
            Err(CompressionError::StorageDisabled) => content_hash,
            Err(e) => return Err(e),
        };

        let record = Record {
            channel: input.channel,
            content_hash,
            created_at: now_millis(),
            external_ref,
            kind: input.kind,
            reply_to: input.reply_to,
            sender: input.sender,
        };
        let leaf = record_leaf(&record)?;

        let (batch_id, leaf_index, should_flush) = {
            let mut guard = self.inner.lock().await;
            if guard.closed {
                return Err(CompressionError::Closed);
            }

            if guard.open.is_none() {
                let id = guard.next_batch_id;
                guard.next_batch_id += 1;
                guard.open = Some(OpenBatch {
                    id,
                    leaves: Vec::new(),
                });
                if self.config.batching_enabled {
                    let this = Arc::clone(self);
                    guard.timer.arm(self.config.flush_interval, async move {
                        this.on_timer_fired(id).await;
                    });
                }
            }

            let open = guard.open.as_mut().expect("open batch was just ensured");
            let leaf_index = open.leaves.len();
            open.leaves.push(leaf);
            let batch_id = open.id;
            let reached_capacity = open.leaves.len() >= self.config.max_batch_size;
            guard.total_records += 1;

            (batch_id, leaf_index, !self.config.batching_enabled || reached_capacity)
        };

        if should_flush {
            self.flush().await?;
        }

        Ok(RecordHandle {
            batch_id,
            leaf_index,
            content_hash,
        })
    }

    /// Seal the current open batch if non-empty, build its Merkle tree, and
    /// submit it to the commit sink. Returns the commitment if a flush
    /// occurred, or `None` if there was nothing to flush.
    pub async fn flush(self: &Arc<Self>) -> Result<Option<BatchCommitment>> {
        let (batch_id, leaves) = {
            let mut guard = self.inner.lock().await;
            guard.timer.cancel();
            match guard.open.take() {
                Some(open) if !open.leaves.is_empty() => (open.id, open.leaves),
                _ => return Ok(None),
            }
        };

        let tree = merkle::build(&leaves)?;
        let root = tree.root();
        let proofs: Vec<Vec<Digest>> = (0..leaves.len())
            .map(|i| merkle::proof(&tree, i))
            .collect::<Result<_>>()?;
        let sealed_at = now_millis();

        let commitment = BatchCommitment {
            batch_id,
            root,
            leaves: leaves.clone(),
            proofs: proofs.clone(),
            sealed_at,
        };

        {
            let mut guard = self.inner.lock().await;
            guard.registry.insert(
                batch_id,
                SealedEntry {
                    leaves,
                    root,
                    proofs,
                    sealed_at,
                    status: BatchStatus::Sealed,
                    signature: None,
                },
            );
        }

        self.submit(batch_id, &commitment).await?;
        Ok(Some(commitment))
    }

    /// Flush any pending records, disarm the timer, and refuse further
    /// enqueues.
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        {
            let mut guard = self.inner.lock().await;
            if guard.closed {
                return Ok(());
            }
            guard.closed = true;
        }
        self.flush().await?;
        let mut guard = self.inner.lock().await;
        guard.timer.cancel();
        Ok(())
    }

    /// Re-submit a sealed batch's already-computed root to the commit sink.
    /// The root is never recomputed, so the sink sees byte-identical bytes
    /// across retries.
    pub async fn retry_batch(&self, batch_id: u64) -> Result<Signature> {
        let commitment = {
            let guard = self.inner.lock().await;
            let entry = guard
                .registry
                .get(&batch_id)
                .ok_or_else(|| CompressionError::NotFound(batch_id.to_string()))?;
            BatchCommitment {
                batch_id,
                root: entry.root,
                leaves: entry.leaves.clone(),
                proofs: entry.proofs.clone(),
                sealed_at: entry.sealed_at,
            }
        };
        self.submit(batch_id, &commitment).await?;
        Ok(self
            .inner
            .lock()
            .await
            .registry
            .get(&batch_id)
            .and_then(|e| e.signature)
            .expect("submit just recorded a signature on success"))
    }

    /// Current queue depth, commit recency, and lifetime counters.
    pub async fn stats(&self) -> Stats {
        let guard = self.inner.lock().await;
        Stats {
            queue_len: guard.open.as_ref().map_or(0, |o| o.leaves.len()),
            last_commit_at: guard.last_commit_at,
            total_batches: guard.registry.len() as u64,
            total_records: guard.total_records,
        }
    }

    /// Lifecycle state of a previously sealed batch, for tests and
    /// operators inspecting a failed commit before retrying.
    pub async fn batch_status(&self, batch_id: u64) -> Option<BatchStatus> {
        self.inner
            .lock()
            .await
            .registry
            .get(&batch_id)
            .map(|e| e.status)
    }

    async fn submit(&self, batch_id: u64, commitment: &BatchCommitment) -> Result<()> {
        match self.sink.commit(commitment).await {
            Ok(signature) => {
                let mut guard = self.inner.lock().await;
                if let Some(entry) = guard.registry.get_mut(&batch_id) {
                    entry.status = BatchStatus::Committed;
                    entry.signature = Some(signature);
                }
                guard.last_commit_at = Some(commitment.sealed_at);
                Ok(())
            }
            Err(e) => {
                let mut guard = self.inner.lock().await;
                if let Some(entry) = guard.registry.get_mut(&batch_id) {
                    entry.status = BatchStatus::Failed;
                }
                Err(CompressionError::BatchCommitFailed(e.to_string()))
            }
        }
    }

    async fn on_timer_fired(self: &Arc<Self>, batch_id: u64) {
        let is_current = {
            let guard = self.inner.lock().await;
            guard.open.as_ref().map(|o| o.id) == Some(batch_id)
        };
        if is_current {
            if let Err(e) = self.flush().await {
                tracing::warn!(batch_id, error = %e, "timer-triggered flush failed");
            }
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Id;
    use crate::record::RecordKind;
    use parking_lot::RwLock;
    use std::collections::HashMap as StdHashMap;

    struct MemStore {
        objects: RwLock<StdHashMap<Digest, Vec<u8>>>,
    }

    impl MemStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                objects: RwLock::new(StdHashMap::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl ObjectStore for MemStore {
        async fn put(&self, bytes: &[u8]) -> Result<Digest> {
            let key = content_digest(bytes);
            self.objects
                .write()
                .entry(key)
                .or_insert_with(|| bytes.to_vec());
            Ok(key)
        }

        async fn get(&self, key: &Digest) -> Result<Vec<u8>> {
            self.objects
                .read()
                .get(key)
                .cloned()
                .ok_or_else(|| CompressionError::NotFound(key.to_hex()))
        }

        async fn exists(&self, key: &Digest) -> Result<bool> {
            Ok(self.objects.read().contains_key(key))
        }

        async fn pin(&self, _key: &Digest) -> Result<()> {
            Ok(())
        }
    }

    struct AlwaysOkSink;

    #[async_trait::async_trait]
    impl CommitSink for AlwaysOkSink {
        async fn commit(&self, commitment: &BatchCommitment) -> anyhow::Result<Signature> {
            let mut sig = [0u8; 64];
            sig[..32].copy_from_slice(commitment.root.as_bytes());
            Ok(Signature(sig))
        }
    }

    struct FailOnceSink {
        failed_once: std::sync::atomic::AtomicBool,
    }

    impl FailOnceSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                failed_once: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait::async_trait]
    impl CommitSink for FailOnceSink {
        async fn commit(&self, commitment: &BatchCommitment) -> anyhow::Result<Signature> {
            if !self
                .failed_once
                .swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                anyhow::bail!("sink temporarily unavailable");
            }
            let mut sig = [0u8; 64];
            sig[..32].copy_from_slice(commitment.root.as_bytes());
            Ok(Signature(sig))
        }
    }

    fn input(content: &[u8]) -> RecordInput {
        RecordInput {
            channel: Id::from_bytes([0x01; 32]),
            sender: Id::from_bytes([0x02; 32]),
            content_bytes: content.to_vec(),
            kind: RecordKind::Text,
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn single_message_flushes_to_a_verifiable_leaf() {
        let batcher = Batcher::new(BatcherConfig::default(), MemStore::new(), Arc::new(AlwaysOkSink));
        let handle = batcher.enqueue(input(b"hi")).await.unwrap();
        let commitment = batcher.flush().await.unwrap().unwrap();
        assert_eq!(commitment.leaves.len(), 1);
        assert_eq!(commitment.proofs[0].len(), 0);
        assert!(merkle::verify(
            &commitment.root,
            &commitment.leaves[0],
            handle.leaf_index,
            &commitment.proofs[0]
        ));
    }

    #[tokio::test]
    async fn size_triggered_flush_splits_into_two_batches() {
        let config = BatcherConfig {
            max_batch_size: 2,
            ..BatcherConfig::default()
        };
        let batcher = Batcher::new(config, MemStore::new(), Arc::new(AlwaysOkSink));
        let h0 = batcher.enqueue(input(b"a")).await.unwrap();
        let h1 = batcher.enqueue(input(b"b")).await.unwrap();
        let h2 = batcher.enqueue(input(b"c")).await.unwrap();

        assert_eq!(h0.batch_id, h1.batch_id);
        assert!(h2.batch_id > h1.batch_id);

        let stats = batcher.stats().await;
        assert_eq!(stats.total_batches, 1); // third record's batch isn't sealed until flush/timer

        batcher.flush().await.unwrap();
        let stats = batcher.stats().await;
        assert_eq!(stats.total_batches, 2);
    }

    #[tokio::test]
    async fn time_triggered_flush_seals_without_reaching_capacity() {
        let config = BatcherConfig {
            flush_interval: Duration::from_millis(50),
            ..BatcherConfig::default()
        };
        let batcher = Batcher::new(config, MemStore::new(), Arc::new(AlwaysOkSink));
        batcher.enqueue(input(b"solo")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let stats = batcher.stats().await;
        assert_eq!(stats.total_batches, 1);
        assert_eq!(stats.queue_len, 0);
    }

    #[tokio::test]
    async fn disabled_batching_flushes_every_enqueue() {
        let config = BatcherConfig {
            batching_enabled: false,
            ..BatcherConfig::default()
        };
        let batcher = Batcher::new(config, MemStore::new(), Arc::new(AlwaysOkSink));
        batcher.enqueue(input(b"one")).await.unwrap();
        batcher.enqueue(input(b"two")).await.unwrap();
        let stats = batcher.stats().await;
        assert_eq!(stats.total_batches, 2);
        assert_eq!(stats.queue_len, 0);
    }

    #[tokio::test]
    async fn commit_retry_reuses_the_precomputed_root() {
        let sink = FailOnceSink::new();
        let batcher = Batcher::new(BatcherConfig::default(), MemStore::new(), sink);
        batcher.enqueue(input(b"x")).await.unwrap();
        let err = batcher.flush().await.unwrap_err();
        assert!(matches!(err, CompressionError::BatchCommitFailed(_)));

        let status = batcher.batch_status(0).await.unwrap();
        assert_eq!(status, BatchStatus::Failed);

        let sig = batcher.retry_batch(0).await.unwrap();
        assert_ne!(sig.0, [0u8; 64]);
        assert_eq!(batcher.batch_status(0).await.unwrap(), BatchStatus::Committed);
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_records_and_then_refuses_enqueues() {
        let batcher = Batcher::new(BatcherConfig::default(), MemStore::new(), Arc::new(AlwaysOkSink));
        batcher.enqueue(input(b"last")).await.unwrap();
        batcher.shutdown().await.unwrap();
        let stats = batcher.stats().await;
        assert_eq!(stats.total_batches, 1);
        let err = batcher.enqueue(input(b"too-late")).await.unwrap_err();
        assert!(matches!(err, CompressionError::Closed));
    }
}
