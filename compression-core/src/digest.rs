//! Canonical encoding and digest derivation.
//!
//! `canonical_encode` relies on `serde_json`'s default map representation
//! (a `BTreeMap`, since this crate does not enable the `preserve_order`
//! feature): object keys come out lexicographically sorted at every nesting
//! level with no extra work, and `Record`'s fields are declared in
//! alphabetical order, so a plain `serde_json::to_vec` is already bit-stable
//! across implementations.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{CompressionError, Result};

/// A 32-byte digest. The same representation serves both as a
/// `ContentDigest` (plain `SHA256`) and a `FieldDigest` (`SHA256` with the
/// high byte zeroed so the value fits a BN254 scalar) — the two are
/// distinguished by which constructor produced them, not by type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; 32]);

/// `ContentDigest` is `SHA256` of canonical bytes.
pub type ContentDigest = Digest;
/// `FieldDigest` is a `ContentDigest` with byte 0 zeroed to fit a BN254 scalar.
pub type FieldDigest = Digest;
/// The CAS key under which a payload is stored; equal to its `ContentDigest`
/// when the default hashing backend is used.
pub type StorageKey = Digest;

impl Digest {
    /// Build a digest from raw bytes (e.g. when decoding a wire format).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Borrow the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding, used in the canonical record wire format.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a lowercase hex digest.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| CompressionError::InvariantViolated(format!("bad hex digest: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CompressionError::InvariantViolated("digest must be 32 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Opaque 32-byte identifier (channel or sender).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(pub [u8; 32]);

impl Id {
    /// Build an id from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({})", self.to_hex())
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("id must be 32 bytes"))?;
        Ok(Self(arr))
    }
}

/// JSON-encode `value` with keys sorted lexicographically at every object
/// level, no insignificant whitespace, numbers in their shortest
/// round-tripping form, UTF-8 throughout.
pub fn canonical_encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| CompressionError::InvariantViolated(format!("canonical encode: {e}")))
}

/// `SHA256(bytes)`.
pub fn content_digest(bytes: &[u8]) -> ContentDigest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Digest(hasher.finalize().into())
}

/// `SHA256(bytes ++ 0xFF)`, then byte 0 of the digest is zeroed so the value
/// fits below the BN254 scalar field prime. This drops ~8 bits of collision
/// resistance relative to a full digest, which downstream on-chain verifiers
/// accept as sufficient.
pub fn field_digest(bytes: &[u8]) -> FieldDigest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.update([0xFF]);
    let mut out: [u8; 32] = hasher.finalize().into();
    out[0] = 0x00;
    Digest(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_digest_is_plain_sha256() {
        let d = content_digest(b"hi");
        let mut hasher = Sha256::new();
        hasher.update(b"hi");
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(d.0, expected);
    }

    #[test]
    fn field_digest_zeroes_high_byte() {
        let d = field_digest(b"hi");
        assert_eq!(d.0[0], 0x00);
    }

    #[test]
    fn field_digest_matches_bump_seed_construction() {
        let mut hasher = Sha256::new();
        hasher.update(b"hi");
        hasher.update([0xFF]);
        let mut expected: [u8; 32] = hasher.finalize().into();
        expected[0] = 0;
        assert_eq!(field_digest(b"hi").0, expected);
    }

    #[test]
    fn canonical_encode_sorts_object_keys() {
        let value = serde_json::json!({"b": 1, "a": 2, "c": {"z": 1, "y": 2}});
        let bytes = canonical_encode(&value).unwrap();
        let s = String::from_utf8(bytes).unwrap();
        assert_eq!(s, r#"{"a":2,"b":1,"c":{"y":2,"z":1}}"#);
    }

    #[test]
    fn digest_hex_round_trips() {
        let d = content_digest(b"roundtrip");
        let hex = d.to_hex();
        let back = Digest::from_hex(&hex).unwrap();
        assert_eq!(d, back);
    }
}
