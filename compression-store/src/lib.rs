//! Content-addressed object store backends: an in-memory map (default;
//! used in tests and whenever a deployment disables remote storage) and an
//! HTTP gateway-backed remote store. Mirrors `ledger-transport`'s pattern of
//! several adapters behind one trait, selected by configuration rather than
//! by type — here `ObjectStore` stands in for `Transport`.
#![deny(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use compression_core::{
    content_digest, CompressionError, Info, ObjectStore, Result, StorageConfig, StorageKey,
    StorageKind,
};
use parking_lot::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct Entry {
    bytes: Vec<u8>,
    pinned: bool,
}

/// Process-local, non-persistent object store. Default backend; used in
/// tests and whenever a deployment disables remote storage.
#[derive(Debug)]
pub struct InMemoryStore {
    objects: RwLock<HashMap<StorageKey, Entry>>,
    disabled: bool,
}

impl InMemoryStore {
    /// Construct an enabled, empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: RwLock::new(HashMap::new()),
            disabled: false,
        })
    }

    /// Construct a store that rejects every operation with `StorageDisabled`:
    /// the content hash is still computable by the caller, but bytes are
    /// never persisted here.
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            objects: RwLock::new(HashMap::new()),
            disabled: true,
        })
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn put(&self, bytes: &[u8]) -> Result<StorageKey> {
        if self.disabled {
            return Err(CompressionError::StorageDisabled);
        }
        let key = content_digest(bytes);
        let mut objects = self.objects.write();
        match objects.get(&key) {
            Some(existing) if existing.bytes != bytes => {
                return Err(CompressionError::InvariantViolated(format!(
                    "key {} already holds different bytes",
                    key.to_hex()
                )));
            }
            Some(_) => {}
            None => {
                objects.insert(
                    key,
                    Entry {
                        bytes: bytes.to_vec(),
                        pinned: false,
                    },
                );
            }
        }
        Ok(key)
    }

    async fn get(&self, key: &StorageKey) -> Result<Vec<u8>> {
        if self.disabled {
            return Err(CompressionError::StorageDisabled);
        }
        self.objects
            .read()
            .get(key)
            .map(|e| e.bytes.clone())
            .ok_or_else(|| CompressionError::NotFound(key.to_hex()))
    }

    async fn exists(&self, key: &StorageKey) -> Result<bool> {
        if self.disabled {
            return Err(CompressionError::StorageDisabled);
        }
        Ok(self.objects.read().contains_key(key))
    }

    async fn pin(&self, key: &StorageKey) -> Result<()> {
        if self.disabled {
            return Err(CompressionError::StorageDisabled);
        }
        let mut objects = self.objects.write();
        let entry = objects
            .get_mut(key)
            .ok_or_else(|| CompressionError::NotFound(key.to_hex()))?;
        entry.pinned = true;
        Ok(())
    }

    async fn unpin(&self, key: &StorageKey) -> Result<()> {
        if self.disabled {
            return Err(CompressionError::StorageDisabled);
        }
        let mut objects = self.objects.write();
        let entry = objects
            .get_mut(key)
            .ok_or_else(|| CompressionError::NotFound(key.to_hex()))?;
        entry.pinned = false;
        Ok(())
    }

    async fn node_info(&self) -> Result<Info> {
        if self.disabled {
            return Err(CompressionError::StorageDisabled);
        }
        Ok(Info {
            id: "in-memory".into(),
            agent_version: env!("CARGO_PKG_VERSION").into(),
            protocol_version: "1.0.0".into(),
            storage_items: self.objects.read().len(),
        })
    }
}

/// HTTP gateway-backed object store. The gateway's `PUT` returns a body
/// containing the hex-encoded 32-byte key (we compute the key locally and
/// treat the gateway as a dumb blob store rather than trust its echoed
/// value), `GET` returns raw bytes, `DELETE` is idempotent. Pin state is
/// tracked locally since the gateway interface exposes no separate pin
/// verb; `unpin` issues an immediate `DELETE` (the interface gives us no
/// other eviction trigger to defer to).
pub struct RemoteStore {
    client: reqwest::Client,
    gateway_url: String,
    disabled: bool,
    pinned: RwLock<HashSet<StorageKey>>,
}

impl RemoteStore {
    /// Build a client against `gateway_url` (trailing slash optional).
    pub fn new(gateway_url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            gateway_url: gateway_url.into().trim_end_matches('/').to_string(),
            disabled: false,
            pinned: RwLock::new(HashSet::new()),
        })
    }

    /// Build a store that rejects every operation with `StorageDisabled`.
    pub fn disabled(gateway_url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            gateway_url: gateway_url.into().trim_end_matches('/').to_string(),
            disabled: true,
            pinned: RwLock::new(HashSet::new()),
        })
    }

    fn object_url(&self, key: &StorageKey) -> String {
        format!("{}/{}", self.gateway_url, key.to_hex())
    }
}

#[async_trait]
impl ObjectStore for RemoteStore {
    async fn put(&self, bytes: &[u8]) -> Result<StorageKey> {
        if self.disabled {
            return Err(CompressionError::StorageDisabled);
        }
        let key = content_digest(bytes);
        let url = self.object_url(&key);
        let response = self
            .client
            .put(&url)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| CompressionError::StorageFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CompressionError::StorageFailed(format!(
                "gateway PUT {url} returned {}",
                response.status()
            )));
        }
        info!(key = %key.to_hex(), "stored object at gateway");
        Ok(key)
    }

    async fn get(&self, key: &StorageKey) -> Result<Vec<u8>> {
        if self.disabled {
            return Err(CompressionError::StorageDisabled);
        }
        let url = self.object_url(key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CompressionError::StorageFailed(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CompressionError::NotFound(key.to_hex()));
        }
        if !response.status().is_success() {
            return Err(CompressionError::StorageFailed(format!(
                "gateway GET {url} returned {}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| CompressionError::StorageFailed(e.to_string()))
    }

    async fn exists(&self, key: &StorageKey) -> Result<bool> {
        if self.disabled {
            return Err(CompressionError::StorageDisabled);
        }
        let url = self.object_url(key);
        match self.client.head(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    async fn pin(&self, key: &StorageKey) -> Result<()> {
        if self.disabled {
            return Err(CompressionError::StorageDisabled);
        }
        if !self.exists(key).await? {
            return Err(CompressionError::NotFound(key.to_hex()));
        }
        self.pinned.write().insert(*key);
        Ok(())
    }

    async fn unpin(&self, key: &StorageKey) -> Result<()> {
        if self.disabled {
            return Err(CompressionError::StorageDisabled);
        }
        if !self.exists(key).await? {
            return Err(CompressionError::NotFound(key.to_hex()));
        }
        self.pinned.write().remove(key);
        let url = self.object_url(key);
        if let Err(err) = self.client.delete(&url).send().await {
            warn!(error = %err, "gateway DELETE failed during unpin; object stays queryable");
        }
        Ok(())
    }

    async fn node_info(&self) -> Result<Info> {
        if self.disabled {
            return Err(CompressionError::StorageDisabled);
        }
        Ok(Info {
            id: self.gateway_url.clone(),
            agent_version: env!("CARGO_PKG_VERSION").into(),
            protocol_version: "1.0.0".into(),
            storage_items: self.pinned.read().len(),
        })
    }
}

/// Build a concrete `ObjectStore` from configuration. Callers never match on
/// backend type themselves; this is the single place that does.
pub fn build_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    let gateway_url = || {
        config.gateway_url.clone().ok_or_else(|| {
            CompressionError::InvariantViolated(
                "storage.gateway_url is required when storage.kind is remote".into(),
            )
        })
    };
    Ok(match (config.kind, config.disabled) {
        (StorageKind::InMemory, false) => InMemoryStore::new(),
        (StorageKind::InMemory, true) => InMemoryStore::disabled(),
        (StorageKind::Remote, false) => RemoteStore::new(gateway_url()?),
        (StorageKind::Remote, true) => RemoteStore::disabled(gateway_url()?),
    })
}
