//! Content addressing for blobs and commits.
//!
//! Every payload is hashed as SHA-256 over its canonical JSON encoding:
//! object keys sorted recursively, compact separators, no insignificant
//! whitespace. Hashes are carried as 64-char lowercase hex strings so they
//! round-trip through storage and serde without conversion.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A SHA-256 content hash in lowercase hex form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw bytes.
    pub fn of_bytes(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        Self(hex::encode(digest))
    }

    /// Hash a JSON value through its canonical encoding.
    pub fn of_canonical_json(value: &Value) -> Self {
        let mut value = value.clone();
        canonicalize(&mut value);
        let bytes = serde_json::to_vec(&value).unwrap_or_default();
        Self::of_bytes(&bytes)
    }

    /// Wrap an existing hex string with validation.
    pub fn new(hash: impl Into<String>) -> Result<Self, String> {
        let hash = hash.into();
        if !Self::is_valid(&hash) {
            return Err(format!("Invalid SHA-256 hash format: {hash}"));
        }
        Ok(Self(hash))
    }

    /// Check valid format (64 lowercase hex chars).
    pub fn is_valid(hash: &str) -> bool {
        hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// Inner hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 hex chars, for logs and error messages.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> Self {
        h.0
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

/// Recursively sort object keys so that hashing is order-independent.
pub fn canonicalize(value: &mut Value) {
    match value {
        Value::Array(items) => {
            for item in items.iter_mut() {
                canonicalize(item);
            }
        }
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = serde_json::Map::with_capacity(entries.len());
            for (key, mut value) in entries {
                canonicalize(&mut value);
                sorted.insert(key, value);
            }
            *map = sorted;
        }
        _ => {}
    }
}

/// Canonical compact encoding of a JSON value.
pub fn canonical_vec(value: &Value) -> Vec<u8> {
    let mut value = value.clone();
    canonicalize(&mut value);
    serde_json::to_vec(&value).unwrap_or_default()
}

/// Canonical compact encoding as a string (stored in blob rows).
pub fn canonical_string(value: &Value) -> String {
    String::from_utf8(canonical_vec(value)).unwrap_or_default()
}
