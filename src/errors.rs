//! Error types for the store.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Raised by the [`Record`](crate::record::Record) validator before any
    /// core component runs; the core itself never re-validates keys.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A primary key's leading character fell outside the 64-symbol alphabet.
    /// Unreachable for correctly encoded keys; indicates an encoding defect.
    #[error("unsupported leading symbol {0:?} in primary key")]
    UnsupportedSymbol(char),

    /// A shard failed to initialize or lost its worker. Scoped to that shard;
    /// the rest of the store keeps operating. Cleared only by explicit
    /// reinitialization of the shard.
    #[error("shard {shard} unavailable: {reason}")]
    ShardUnavailable { shard: String, reason: String },

    /// The shard's pending-operation queue hit its bound under the reject
    /// policy. Safe to retry with backoff.
    #[error("shard {shard} queue is saturated")]
    QueueSaturated { shard: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    pub(crate) fn shard_unavailable(
        shard: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        StoreError::ShardUnavailable {
            shard: shard.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
