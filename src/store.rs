//! Store façade: hash → route → registry → serializer.
//!
//! The store itself is stateless and freely shared between tasks; every
//! operation suspends only while awaiting its shard's queue.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::errors::{Result, StoreError};
use crate::hashing::{KeyHasher, PrimaryKey};
use crate::partition::{PartitionMap, ShardId, ShardSpec, Slot};
use crate::record::{Record, StoredRow};
use crate::registry::ShardRegistry;
use crate::serializer::{OpResult, Operation, WriteSerializer};

/// A key-value store partitioned across sharded SQLite files.
pub struct Store {
    hasher: KeyHasher,
    partitions: Arc<PartitionMap>,
    registry: ShardRegistry,
    serializer: WriteSerializer,
}

impl Store {
    /// Open every shard eagerly and start one worker per shard. Under the
    /// best-effort startup policy a failed shard leaves the store degraded
    /// rather than closed; operations routed to it report `ShardUnavailable`
    /// until [`Store::reinit_shard`] succeeds.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let hasher = match &config.secret {
            Some(secret) => KeyHasher::with_secret(secret.clone()),
            None => KeyHasher::new(),
        };
        let partitions = Arc::new(PartitionMap::new());
        let (registry, failures) =
            ShardRegistry::open_all(&config.dir, &partitions, config.startup)?;
        let serializer = WriteSerializer::new(config.queue_depth, config.saturation);
        for handle in registry.handles() {
            match handle.session() {
                Ok(session) => serializer.spawn(handle.shard, handle.name, session)?,
                Err(err) => warn!(shard = handle.name, error = %err, "no worker started"),
            }
        }
        if !failures.is_empty() {
            warn!(failed = failures.len(), "store opened degraded");
        }
        info!(
            dir = %config.dir.display(),
            shards = partitions.shard_count(),
            "store open"
        );
        Ok(Self {
            hasher,
            partitions,
            registry,
            serializer,
        })
    }

    /// Insert or replace the record. On a primary-key conflict the stored
    /// value and creation time are replaced; exactly one row per key exists
    /// afterwards.
    pub async fn set(&self, record: &Record) -> Result<()> {
        let (pk, slot) = self.locate(record.key())?;
        let (timestamp, microsecond) = now_parts();
        let op = Operation::Upsert {
            table: slot.table.clone(),
            key_hash: pk.as_str().as_bytes().to_vec(),
            key: record.key().as_bytes().to_vec(),
            value: serde_json::to_string(record.value())?,
            timestamp,
            microsecond,
        };
        match self.serializer.send(slot.shard, op).await?.await? {
            OpResult::Done => Ok(()),
            other => Err(unexpected_reply("set", other)),
        }
    }

    /// Look up a key. A miss is `Ok(None)`, never an error; the lookup uses
    /// the same deterministic primary key as `set`.
    pub async fn get(&self, key: &str) -> Result<Option<Record>> {
        let (pk, slot) = self.locate(key)?;
        let op = Operation::Get {
            table: slot.table.clone(),
            key_hash: pk.as_str().as_bytes().to_vec(),
        };
        match self.serializer.send(slot.shard, op).await?.await? {
            OpResult::Row(row) => Ok(row.map(StoredRow::into_record)),
            other => Err(unexpected_reply("get", other)),
        }
    }

    /// Delete a key, reporting whether a row existed. Idempotent: deleting an
    /// absent key succeeds with `false`.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let (pk, slot) = self.locate(key)?;
        let op = Operation::Delete {
            table: slot.table.clone(),
            key_hash: pk.as_str().as_bytes().to_vec(),
        };
        match self.serializer.send(slot.shard, op).await?.await? {
            OpResult::Deleted(existed) => Ok(existed),
            other => Err(unexpected_reply("delete", other)),
        }
    }

    /// Every row currently stored in one shard, ordered by table then key.
    /// Scans run through the shard's queue like any other operation, so each
    /// table snapshot sits at a consistent point in that shard's FIFO order.
    /// This is the mirroring surface for an external full-text indexer.
    pub async fn rows(&self, shard: ShardId) -> Result<Vec<StoredRow>> {
        let spec = self.shard_spec(shard)?;
        let mut rows = Vec::new();
        for table in &spec.tables {
            let op = Operation::Scan {
                table: table.name.clone(),
            };
            match self.serializer.send(shard, op).await?.await? {
                OpResult::Rows(chunk) => rows.extend(chunk),
                other => return Err(unexpected_reply("rows", other)),
            }
        }
        Ok(rows)
    }

    /// The static shard layout, in shard-id order.
    pub fn shards(&self) -> impl Iterator<Item = &ShardSpec> {
        self.partitions.shards()
    }

    /// Rebuild one shard's handle and worker after a failure. The previous
    /// handle is replaced wholesale; the previous worker (if any) winds down
    /// once its queue drains.
    pub fn reinit_shard(&self, shard: ShardId) -> Result<()> {
        let spec = self.shard_spec(shard)?;
        let handle = self.registry.reopen(spec)?;
        let session = handle.session()?;
        self.serializer.spawn(shard, handle.name, session)
    }

    /// Close every queue and join every worker. Enqueued operations finish
    /// first.
    pub fn close(self) {
        self.serializer.shutdown();
    }

    fn locate(&self, key: &str) -> Result<(PrimaryKey, &Slot)> {
        let pk = self.hasher.primary_key(key);
        let slot = self.partitions.route(pk.leading_symbol())?;
        Ok((pk, slot))
    }

    fn shard_spec(&self, shard: ShardId) -> Result<&ShardSpec> {
        self.partitions
            .shard(shard)
            .ok_or_else(|| StoreError::shard_unavailable(shard.to_string(), "unknown shard id"))
    }
}

fn now_parts() -> (i64, i64) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs() as i64, now.subsec_micros() as i64)
}

fn unexpected_reply(op: &str, got: OpResult) -> StoreError {
    StoreError::Storage(format!("unexpected reply for {op}: {got:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs;

    use serde_json::json;

    use crate::config::{SaturationPolicy, StartupPolicy};

    fn open_store(dir: &std::path::Path) -> Store {
        Store::open(StoreConfig::new(dir).startup(StartupPolicy::AllOrNothing)).unwrap()
    }

    /// Find a key that routes to the given shard, by suffix search.
    fn key_on_shard(store: &Store, shard: ShardId, tag: &str) -> String {
        for i in 0..10_000 {
            let key = format!("{tag}-{i}");
            let (_, slot) = store.locate(&key).unwrap();
            if slot.shard == shard {
                return key;
            }
        }
        panic!("no key found for {shard}");
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .set(&Record::new("alpha", json!({"a": 1})).unwrap())
            .await
            .unwrap();
        let rec = store.get("alpha").await.unwrap().unwrap();
        assert_eq!(rec.key(), "alpha");
        assert_eq!(rec.value(), &json!({"a": 1}));
        store.close();
    }

    #[tokio::test]
    async fn test_upsert_replaces_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .set(&Record::new("alpha", json!({"a": 1})).unwrap())
            .await
            .unwrap();
        store
            .set(&Record::new("alpha", json!({"a": 2})).unwrap())
            .await
            .unwrap();

        let rec = store.get("alpha").await.unwrap().unwrap();
        assert_eq!(rec.value(), &json!({"a": 2}));

        // Exactly one row exists for the key, across the whole store.
        let mut total = 0;
        for spec in store.shards().collect::<Vec<_>>() {
            total += store.rows(spec.id).await.unwrap().len();
        }
        assert_eq!(total, 1);
        store.close();
    }

    #[tokio::test]
    async fn test_miss_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        assert!(store.get("never-set").await.unwrap().is_none());
        store.close();
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .set(&Record::new("alpha", json!(1)).unwrap())
            .await
            .unwrap();
        assert!(store.delete("alpha").await.unwrap());
        assert!(!store.delete("alpha").await.unwrap());
        assert!(store.get("alpha").await.unwrap().is_none());
        store.close();
    }

    #[tokio::test]
    async fn test_distinct_shards_use_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let key_a = key_on_shard(&store, ShardId(2), "low");
        let key_b = key_on_shard(&store, ShardId(8), "up");
        store
            .set(&Record::new(key_a.clone(), json!("a")).unwrap())
            .await
            .unwrap();
        store
            .set(&Record::new(key_b.clone(), json!("b")).unwrap())
            .await
            .unwrap();

        // Inspect the shard files directly.
        for (shard, key) in [(ShardId(2), &key_a), (ShardId(8), &key_b)] {
            let rows = store.rows(shard).await.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(&rows[0].key, key);
        }
        let lower = rusqlite::Connection::open(dir.path().join("lower-a-e.db")).unwrap();
        let count: i64 = lower
            .query_row(
                "SELECT SUM(cnt) FROM (
                     SELECT COUNT(*) AS cnt FROM lower_ab
                     UNION ALL SELECT COUNT(*) FROM lower_cd
                     UNION ALL SELECT COUNT(*) FROM lower_e)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        store.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hundred_concurrent_sets() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(dir.path()));

        let mut tasks = Vec::new();
        for i in 0..100 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let key = format!("concurrent-key-{i:03}");
                store.set(&Record::new(key, json!({"i": i})).unwrap()).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Every key is retrievable and exactly one row exists per key.
        let mut seen = HashSet::new();
        for spec in store.shards().collect::<Vec<_>>() {
            for row in store.rows(spec.id).await.unwrap() {
                assert!(seen.insert(row.key.clone()), "duplicate row {}", row.key);
            }
        }
        assert_eq!(seen.len(), 100);
        for i in 0..100 {
            let key = format!("concurrent-key-{i:03}");
            let rec = store.get(&key).await.unwrap().unwrap();
            assert_eq!(rec.value(), &json!({"i": i}));
        }
    }

    #[tokio::test]
    async fn test_degraded_shard_leaves_others_operating() {
        let dir = tempfile::tempdir().unwrap();
        // Break shard 0 before the store opens.
        fs::create_dir(dir.path().join("digit-lo.db")).unwrap();
        let store =
            Store::open(StoreConfig::new(dir.path()).startup(StartupPolicy::BestEffort)).unwrap();

        let broken = key_on_shard(&store, ShardId(0), "broken");
        let healthy = key_on_shard(&store, ShardId(5), "healthy");

        assert!(matches!(
            store.set(&Record::new(broken, json!(1)).unwrap()).await,
            Err(StoreError::ShardUnavailable { .. })
        ));
        store
            .set(&Record::new(healthy.clone(), json!(2)).unwrap())
            .await
            .unwrap();
        assert!(store.get(&healthy).await.unwrap().is_some());
        store.close();
    }

    #[tokio::test]
    async fn test_reinit_recovers_failed_shard() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("digit-lo.db")).unwrap();
        let store =
            Store::open(StoreConfig::new(dir.path()).startup(StartupPolicy::BestEffort)).unwrap();
        let key = key_on_shard(&store, ShardId(0), "recover");

        assert!(store
            .set(&Record::new(key.clone(), json!(1)).unwrap())
            .await
            .is_err());

        fs::remove_dir(dir.path().join("digit-lo.db")).unwrap();
        store.reinit_shard(ShardId(0)).unwrap();
        store
            .set(&Record::new(key.clone(), json!(1)).unwrap())
            .await
            .unwrap();
        assert!(store.get(&key).await.unwrap().is_some());
        store.close();
    }

    #[tokio::test]
    async fn test_backpressure_surfaces_to_caller() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            Store::open(
                StoreConfig::new(dir.path())
                    .startup(StartupPolicy::AllOrNothing)
                    .queue_depth(1)
                    .saturation(SaturationPolicy::Reject),
            )
            .unwrap(),
        );

        // Saturate one shard with concurrent submissions; with a queue bound
        // of 1 at least one must be rejected, and rejected submissions
        // succeed on retry once the queue drains.
        let key = key_on_shard(&store, ShardId(4), "burst");
        let mut results = Vec::new();
        let mut tasks = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                store.set(&Record::new(key, json!({"i": i})).unwrap()).await
            }));
        }
        for task in tasks {
            results.push(task.await.unwrap());
        }
        let saturated = results
            .iter()
            .filter(|r| matches!(r, Err(StoreError::QueueSaturated { .. })))
            .count();
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(saturated + succeeded, 32);
        assert!(succeeded > 0);

        store
            .set(&Record::new(key.clone(), json!("retry")).unwrap())
            .await
            .unwrap();
        assert!(store.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rows_exposes_inserts_for_mirroring() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        for i in 0..20 {
            store
                .set(&Record::new(format!("mirror-{i:02}"), json!(i)).unwrap())
                .await
                .unwrap();
        }
        let mut mirrored = 0;
        for spec in store.shards().collect::<Vec<_>>() {
            for row in store.rows(spec.id).await.unwrap() {
                assert!(row.key.starts_with("mirror-"));
                assert!(row.timestamp > 0);
                mirrored += 1;
            }
        }
        assert_eq!(mirrored, 20);
        store.close();
    }

    #[tokio::test]
    async fn test_secret_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(
            StoreConfig::new(dir.path())
                .startup(StartupPolicy::AllOrNothing)
                .secret(*b"per-store-secret"),
        )
        .unwrap();
        store
            .set(&Record::new("alpha", json!(true)).unwrap())
            .await
            .unwrap();
        assert!(store.get("alpha").await.unwrap().is_some());
        store.close();
    }
}
