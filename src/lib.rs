//! cellstore — a key-value store partitioned across many SQLite shard files.
//!
//! Keys are digested into a fixed 64-symbol primary key whose leading
//! character routes every row to exactly one (shard, table). Each shard file
//! is owned by a dedicated worker thread behind a bounded FIFO queue, so
//! operations are serialized per shard and fully parallel across shards.
//!
//! ```no_run
//! use cellstore::{Record, Store, StoreConfig};
//!
//! # async fn demo() -> cellstore::Result<()> {
//! let store = Store::open(StoreConfig::new("./data"))?;
//! store
//!     .set(&Record::new("alpha", serde_json::json!({"a": 1}))?)
//!     .await?;
//! assert!(store.get("alpha").await?.is_some());
//! store.close();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod errors;
pub mod hashing;
pub mod partition;
pub mod record;
pub mod registry;
pub mod serializer;
pub mod store;

pub use config::{SaturationPolicy, StartupPolicy, StoreConfig};
pub use errors::{Result, StoreError};
pub use hashing::{KeyHasher, PrimaryKey};
pub use partition::{PartitionMap, ShardId};
pub use record::{Record, StoredRow};
pub use store::Store;
