//! The closed configuration envelope: a fixed, enumerated option set,
//! loadable from JSON, with a constructor that rejects out-of-range values
//! rather than admitting a dynamic map of unknown keys.

use serde::{Deserialize, Serialize};

use crate::batcher::BatcherConfig;
use crate::error::{CompressionError, Result};

const MAX_BATCH_SIZE_RANGE: std::ops::RangeInclusive<usize> = 1..=10_000;
const FLUSH_INTERVAL_MS_RANGE: std::ops::RangeInclusive<u64> = 1..=3_600_000;

/// Which `ObjectStore` backend a deployment selects. Selection is
/// configuration, not API: callers never match on this directly, they pass
/// `StorageConfig` to `compression_store::build_store`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Process-local, non-persistent backend. Default; used in tests and
    /// when remote storage is unavailable.
    InMemory,
    /// HTTP gateway-backed backend.
    Remote,
}

/// The `storage.*` configuration block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Which backend to construct.
    pub kind: StorageKind,
    /// Gateway base URL; required when `kind == Remote`.
    #[serde(default)]
    pub gateway_url: Option<String>,
    /// When true, every store operation fails with `StorageDisabled` and
    /// callers fall back to embedding payloads by hash alone.
    #[serde(default)]
    pub disabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::InMemory,
            gateway_url: None,
            disabled: false,
        }
    }
}

impl StorageConfig {
    fn validate(&self) -> Result<()> {
        if self.kind == StorageKind::Remote && self.gateway_url.is_none() {
            return Err(CompressionError::InvariantViolated(
                "storage.gateway_url is required when storage.kind is remote".into(),
            ));
        }
        Ok(())
    }
}

/// The full configuration envelope recognized by the compression pipeline:
/// exactly the options declared below, nothing else. Unknown keys in the
/// source JSON are silently ignored by `serde_json`'s default behavior, but
/// every field this struct declares is validated on construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hard upper bound on records per batch. Must be in `1..=10_000`.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Deadline, in milliseconds, from first enqueue of an open batch. Must
    /// be in `1..=3_600_000`.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// When false, every enqueue immediately seals a singleton batch.
    #[serde(default = "default_batching_enabled")]
    pub batching_enabled: bool,
    /// Storage backend selection.
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_max_batch_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    5000
}

fn default_batching_enabled() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            batching_enabled: default_batching_enabled(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Parse and validate a configuration envelope from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let config: Config = serde_json::from_slice(bytes)
            .map_err(|e| CompressionError::InvariantViolated(format!("bad config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values. Called automatically by `from_json`;
    /// exposed for callers that build a `Config` programmatically.
    pub fn validate(&self) -> Result<()> {
        if !MAX_BATCH_SIZE_RANGE.contains(&self.max_batch_size) {
            return Err(CompressionError::InvariantViolated(format!(
                "max_batch_size {} outside {:?}",
                self.max_batch_size, MAX_BATCH_SIZE_RANGE
            )));
        }
        if !FLUSH_INTERVAL_MS_RANGE.contains(&self.flush_interval_ms) {
            return Err(CompressionError::InvariantViolated(format!(
                "flush_interval_ms {} outside {:?}",
                self.flush_interval_ms, FLUSH_INTERVAL_MS_RANGE
            )));
        }
        self.storage.validate()
    }

    /// Project the batching-relevant fields into a `BatcherConfig`, carrying
    /// forward the caller's chosen base batch id.
    pub fn to_batcher_config(&self, base_batch_id: u64) -> BatcherConfig {
        BatcherConfig {
            max_batch_size: self.max_batch_size,
            flush_interval: std::time::Duration::from_millis(self.flush_interval_ms),
            batching_enabled: self.batching_enabled,
            base_batch_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.flush_interval_ms, 5000);
        assert!(config.batching_enabled);
        assert_eq!(config.storage.kind, StorageKind::InMemory);
        assert!(!config.storage.disabled);
    }

    #[test]
    fn rejects_max_batch_size_out_of_range() {
        let config = Config {
            max_batch_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_flush_interval_out_of_range() {
        let config = Config {
            flush_interval_ms: 3_600_001,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn remote_storage_requires_gateway_url() {
        let config = Config {
            storage: StorageConfig {
                kind: StorageKind::Remote,
                gateway_url: None,
                disabled: false,
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            storage: StorageConfig {
                kind: StorageKind::Remote,
                gateway_url: Some("https://gateway.example.com".into()),
                disabled: false,
            },
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_json_envelope() {
        let json = br#"{
            "max_batch_size": 50,
            "flush_interval_ms": 2000,
            "batching_enabled": false,
            "storage": {"kind": "in_memory", "disabled": true}
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.max_batch_size, 50);
        assert!(!config.batching_enabled);
        assert!(config.storage.disabled);
    }

    #[test]
    fn to_batcher_config_carries_base_batch_id() {
        let config = Config::default();
        let batcher_config = config.to_batcher_config(42);
        assert_eq!(batcher_config.base_batch_id, 42);
        assert_eq!(batcher_config.max_batch_size, config.max_batch_size);
    }
}
