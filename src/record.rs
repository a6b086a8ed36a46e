//! Record — the validated unit callers hand to the store.
//!
//! `Record::new` is the only producer of records; everything downstream of it
//! (hashing, routing, storage) assumes the key is well-formed and never
//! re-checks it.

use serde::Serialize;
use serde_json::Value;

use crate::errors::{Result, StoreError};

/// Minimum accepted key length, in bytes.
pub const MIN_KEY_LEN: usize = 3;
/// Maximum accepted key length, in bytes.
pub const MAX_KEY_LEN: usize = 999;

/// A validated key/value pair: 3–999 ASCII characters keyed to any JSON value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    key: String,
    value: Value,
}

impl Record {
    /// Validate `key` and build a record. This is the boundary where
    /// [`StoreError::InvalidKey`] is raised; the store core trusts its output.
    pub fn new(key: impl Into<String>, value: Value) -> Result<Self> {
        let key = key.into();
        validate_key(&key)?;
        Ok(Self { key, value })
    }

    pub(crate) fn from_stored(key: String, value: Value) -> Self {
        Self { key, value }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_parts(self) -> (String, Value) {
        (self.key, self.value)
    }
}

/// Check the key constraints without building a record.
pub fn validate_key(key: &str) -> Result<()> {
    if key.len() < MIN_KEY_LEN || key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidKey(format!(
            "key length {} outside {MIN_KEY_LEN}..={MAX_KEY_LEN}",
            key.len()
        )));
    }
    if !key.is_ascii() {
        return Err(StoreError::InvalidKey("key must be ASCII".to_string()));
    }
    Ok(())
}

/// A row as persisted inside exactly one (shard, table).
///
/// `key_hash` is the encoded primary key and `key` the original key text;
/// both are unique within their table, enforced by the storage engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow {
    pub key_hash: Vec<u8>,
    pub key: String,
    pub value: Value,
    pub timestamp: i64,
    pub microsecond: i64,
}

impl StoredRow {
    /// Rebuild the caller-facing record. The stored key was validated on the
    /// way in, so this cannot fail.
    pub fn into_record(self) -> Record {
        Record::from_stored(self.key, self.value)
    }
}
