//! Store configuration.

use std::path::PathBuf;

/// What `send` does when a shard's pending-operation queue is at its bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaturationPolicy {
    /// Fail the submission with `QueueSaturated`; the caller retries with
    /// backoff (default).
    #[default]
    Reject,
    /// Suspend the submitting task until a queue slot frees.
    Block,
}

/// How startup treats a shard that fails to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupPolicy {
    /// Start degraded: operations on the failed shard report
    /// `ShardUnavailable`, every other shard operates normally (default).
    #[default]
    BestEffort,
    /// Any shard failure aborts the store open.
    AllOrNothing,
}

/// Default bound on in-flight operations per shard.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// Configuration for a store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding one SQLite file per shard.
    pub dir: PathBuf,

    /// Bound on pending operations per shard.
    pub queue_depth: usize,

    /// Behavior when a shard's queue is full.
    pub saturation: SaturationPolicy,

    /// Behavior when a shard fails to initialize.
    pub startup: StartupPolicy,

    /// Fixed secret mixed into every key digest. Must not change over the
    /// lifetime of the data on disk, or existing keys become unreachable.
    pub secret: Option<Vec<u8>>,
}

impl StoreConfig {
    /// Create a config with the given data directory and defaults elsewhere.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            saturation: SaturationPolicy::default(),
            startup: StartupPolicy::default(),
            secret: None,
        }
    }

    /// Set the per-shard queue bound.
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the queue saturation policy.
    pub fn saturation(mut self, policy: SaturationPolicy) -> Self {
        self.saturation = policy;
        self
    }

    /// Set the startup policy.
    pub fn startup(mut self, policy: StartupPolicy) -> Self {
        self.startup = policy;
        self
    }

    /// Set the hashing secret.
    pub fn secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}
