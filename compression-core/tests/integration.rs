use std::collections::HashMap as StdHashMap;
use std::sync::Arc;

use compression_core::*;
use parking_lot::RwLock;
use proptest::prelude::*;

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
    async fn put(&self, bytes: &[u8]) -> Result<StorageKey> {
        let key = content_digest(bytes);
        self.objects
            .write()
            .entry(key)
            .or_insert_with(|| bytes.to_vec());
        Ok(key)
    }

    async fn get(&self, key: &StorageKey) -> Result<Vec<u8>> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| CompressionError::NotFound(key.to_hex()))
    }

    async fn exists(&self, key: &StorageKey) -> Result<bool> {
        Ok(self.objects.read().contains_key(key))
    }

    async fn pin(&self, _key: &StorageKey) -> Result<()> {
        Ok(())
    }
}

struct EchoSink;

#[async_trait::async_trait]
impl CommitSink for EchoSink {
    async fn commit(&self, commitment: &BatchCommitment) -> anyhow::Result<Signature> {
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
async fn idempotent_storage_writes_bytes_once() {
    let store = MemStore::new();
    let k1 = store.put(b"same bytes").await.unwrap();
    let k2 = store.put(b"same bytes").await.unwrap();
    assert_eq!(k1, k2);
    assert_eq!(store.get(&k1).await.unwrap(), b"same bytes");
}

#[tokio::test]
async fn storage_disabled_store_accepts_content_hash_but_refuses_bytes() {
    struct DisabledStore;
    #[async_trait::async_trait]
    impl ObjectStore for DisabledStore {
        async fn put(&self, _bytes: &[u8]) -> Result<StorageKey> {
            Err(CompressionError::StorageDisabled)
        }
        async fn get(&self, _key: &StorageKey) -> Result<Vec<u8>> {
            Err(CompressionError::StorageDisabled)
        }
        async fn exists(&self, _key: &StorageKey) -> Result<bool> {
            Err(CompressionError::StorageDisabled)
        }
        async fn pin(&self, _key: &StorageKey) -> Result<()> {
            Err(CompressionError::StorageDisabled)
        }
    }

    let batcher = Batcher::new(
        BatcherConfig::default(),
        Arc::new(DisabledStore),
        Arc::new(EchoSink),
    );
    let handle = batcher.enqueue(input(b"x")).await.unwrap();
    let commitment = batcher.flush().await.unwrap().unwrap();
    assert_eq!(commitment.leaves.len(), 1);

    let store = DisabledStore;
    let err = store.get(&handle.content_hash).await.unwrap_err();
    assert!(matches!(err, CompressionError::StorageDisabled));
}

#[tokio::test]
async fn batch_ids_increase_strictly_across_many_flushes() {
    let config = BatcherConfig {
        max_batch_size: 1,
        ..BatcherConfig::default()
    };
    let batcher = Batcher::new(config, MemStore::new(), Arc::new(EchoSink));
    let mut ids = Vec::new();
    for i in 0..10u8 {
        let handle = batcher.enqueue(input(&[i])).await.unwrap();
        ids.push(handle.batch_id);
    }
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn leaf_index_follows_enqueue_order_within_a_batch() {
    let batcher = Batcher::new(BatcherConfig::default(), MemStore::new(), Arc::new(EchoSink));
    let mut handles = Vec::new();
    for tag in [b'a', b'b', b'c', b'd'] {
        handles.push(batcher.enqueue(input(&[tag])).await.unwrap());
    }
    for (expected, handle) in handles.iter().enumerate() {
        assert_eq!(handle.leaf_index, expected);
    }
}

#[tokio::test]
async fn record_round_trips_through_canonical_encoding() {
    let record = Record {
        channel: Id::from_bytes([0x03; 32]),
        content_hash: content_digest(b"payload"),
        created_at: 1_700_000_000_000,
        external_ref: content_digest(b"payload"),
        kind: RecordKind::Command,
        reply_to: Some(content_digest(b"parent")),
        sender: Id::from_bytes([0x04; 32]),
    };
    let bytes = canonical_encode(&record).unwrap();
    let decoded: Record = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(record, decoded);
}

proptest! {
    #[test]
    fn merkle_soundness_holds_for_arbitrary_nonempty_leaf_sets(
        tags in prop::collection::vec(prop::string::string_regex("[a-z0-9]{1,16}").unwrap(), 1..200)
    ) {
        let leaves: Vec<Digest> = tags.iter().map(|t| content_digest(t.as_bytes())).collect();
        let tree = build_tree(&leaves).unwrap();
        for (i, leaf) in leaves.iter().enumerate() {
            let p = proof(&tree, i).unwrap();
            prop_assert!(verify(&tree.root(), leaf, i, &p));
        }
    }

    #[test]
    fn merkle_distinctness_across_reordered_leaf_sets(
        a in prop::string::string_regex("[a-z]{1,8}").unwrap(),
        b in prop::string::string_regex("[a-z]{1,8}").unwrap(),
    ) {
        prop_assume!(a != b);
        let forward = vec![content_digest(a.as_bytes()), content_digest(b.as_bytes())];
        let reversed = vec![content_digest(b.as_bytes()), content_digest(a.as_bytes())];
        let forward_root = build_tree(&forward).unwrap().root();
        let reversed_root = build_tree(&reversed).unwrap().root();
        prop_assert_ne!(forward_root, reversed_root);
    }
}
