//! Shard lifecycle: storage handles, schema creation, session factories.
//!
//! Every shard known to the partition map is opened eagerly at store startup.
//! A shard that fails to open is reported as a shard-scoped error and, under
//! the best-effort policy, does not stop the others from initializing.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::config::StartupPolicy;
use crate::errors::{Result, StoreError};
use crate::partition::{PartitionMap, ShardId, ShardSpec};
use crate::record::StoredRow;

/// Creates pragma-configured connections bound to one shard file.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    path: PathBuf,
}

impl SessionFactory {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Open a new session. The pragma set is the connect-time hook: every
    /// session of every shard gets WAL journaling, NORMAL sync, and foreign
    /// keys on.
    pub fn connect(&self) -> Result<ShardSession> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(ShardSession { conn })
    }
}

/// Immutable per-shard resources: name, storage path, schema, and the session
/// factory derived from them. Never mutated in place; replaced wholesale when
/// a shard is reinitialized.
#[derive(Debug)]
pub struct ShardHandle {
    pub shard: ShardId,
    pub name: &'static str,
    pub path: PathBuf,
    pub schema: Vec<String>,
    factory: SessionFactory,
}

impl ShardHandle {
    /// A fresh session against this shard, with shard context attached on
    /// failure.
    pub fn session(&self) -> Result<ShardSession> {
        self.factory
            .connect()
            .map_err(|err| StoreError::shard_unavailable(self.name, err))
    }
}

/// Owns one [`ShardHandle`] per shard for the store's lifetime.
pub struct ShardRegistry {
    root: PathBuf,
    handles: RwLock<BTreeMap<ShardId, Arc<ShardHandle>>>,
}

impl ShardRegistry {
    /// Eagerly open every shard in the map. Returns the registry plus the
    /// per-shard failures that the best-effort policy tolerated; under
    /// [`StartupPolicy::AllOrNothing`] the first failure aborts the open.
    pub fn open_all(
        root: &Path,
        partitions: &PartitionMap,
        policy: StartupPolicy,
    ) -> Result<(Self, BTreeMap<ShardId, StoreError>)> {
        fs::create_dir_all(root)?;
        let mut handles = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for spec in partitions.shards() {
            match open_shard(root, spec) {
                Ok(handle) => {
                    handles.insert(spec.id, Arc::new(handle));
                }
                Err(err) => {
                    warn!(shard = spec.name, error = %err, "shard failed to initialize");
                    if policy == StartupPolicy::AllOrNothing {
                        return Err(StoreError::shard_unavailable(spec.name, err));
                    }
                    failures.insert(spec.id, err);
                }
            }
        }
        info!(
            root = %root.display(),
            shards = handles.len(),
            failed = failures.len(),
            "shard registry initialized"
        );
        Ok((
            Self {
                root: root.to_path_buf(),
                handles: RwLock::new(handles),
            },
            failures,
        ))
    }

    pub fn get(&self, shard: ShardId) -> Option<Arc<ShardHandle>> {
        self.handles.read().get(&shard).cloned()
    }

    /// Snapshot of all live handles, in shard-id order.
    pub fn handles(&self) -> Vec<Arc<ShardHandle>> {
        self.handles.read().values().cloned().collect()
    }

    /// Rebuild one shard's resources from scratch, replacing any previous
    /// handle wholesale.
    pub fn reopen(&self, spec: &ShardSpec) -> Result<Arc<ShardHandle>> {
        let handle = Arc::new(open_shard(&self.root, spec)?);
        self.handles.write().insert(spec.id, handle.clone());
        info!(shard = spec.name, "shard reinitialized");
        Ok(handle)
    }
}

fn open_shard(root: &Path, spec: &ShardSpec) -> Result<ShardHandle> {
    let path = root.join(format!("{}.db", spec.name));
    let factory = SessionFactory::new(path.clone());
    let session = factory.connect()?;
    let schema = shard_schema(spec);
    for statement in &schema {
        session.conn.execute_batch(statement)?;
    }
    Ok(ShardHandle {
        shard: spec.id,
        name: spec.name,
        path,
        schema,
        factory,
    })
}

/// CREATE statements for every table the shard owns. Idempotent, so reopening
/// an existing shard file is a no-op migration.
fn shard_schema(spec: &ShardSpec) -> Vec<String> {
    spec.tables
        .iter()
        .flat_map(|table| {
            let name = &table.name;
            [
                format!(
                    "CREATE TABLE IF NOT EXISTS {name} (
                        key_hash    BLOB PRIMARY KEY,
                        key         BLOB NOT NULL,
                        value       TEXT NOT NULL,
                        timestamp   INTEGER NOT NULL,
                        microsecond INTEGER NOT NULL
                    )"
                ),
                format!("CREATE UNIQUE INDEX IF NOT EXISTS {name}_key ON {name} (key)"),
            ]
        })
        .collect()
}

/// One pragma-configured connection to a shard file. Owned exclusively by the
/// shard's worker; table names always come from the partition map, never from
/// caller input.
pub struct ShardSession {
    pub(crate) conn: Connection,
}

impl ShardSession {
    /// Insert a row; on a primary-key conflict replace value and creation
    /// time, leaving the key columns untouched.
    pub fn upsert_row(
        &self,
        table: &str,
        key_hash: &[u8],
        key: &[u8],
        value: &str,
        timestamp: i64,
        microsecond: i64,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {table} (key_hash, key, value, timestamp, microsecond)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key_hash) DO UPDATE SET
                 value = excluded.value,
                 timestamp = excluded.timestamp,
                 microsecond = excluded.microsecond"
        );
        self.conn
            .execute(&sql, params![key_hash, key, value, timestamp, microsecond])?;
        Ok(())
    }

    /// Point lookup by primary key.
    pub fn get_row(&self, table: &str, key_hash: &[u8]) -> Result<Option<StoredRow>> {
        let sql = format!(
            "SELECT key_hash, key, value, timestamp, microsecond
             FROM {table} WHERE key_hash = ?1"
        );
        let raw = self
            .conn
            .query_row(&sql, params![key_hash], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .optional()?;
        raw.map(decode_row).transpose()
    }

    /// Delete by primary key; reports whether a row existed.
    pub fn delete_row(&self, table: &str, key_hash: &[u8]) -> Result<bool> {
        let sql = format!("DELETE FROM {table} WHERE key_hash = ?1");
        let changed = self.conn.execute(&sql, params![key_hash])?;
        Ok(changed > 0)
    }

    /// All rows of one table, ordered by key.
    pub fn scan_table(&self, table: &str) -> Result<Vec<StoredRow>> {
        let sql = format!(
            "SELECT key_hash, key, value, timestamp, microsecond
             FROM {table} ORDER BY key"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(decode_row).collect()
    }
}

fn decode_row(
    (key_hash, key, value, timestamp, microsecond): (Vec<u8>, Vec<u8>, String, i64, i64),
) -> Result<StoredRow> {
    let key = String::from_utf8(key)
        .map_err(|err| StoreError::Storage(format!("stored key is not UTF-8: {err}")))?;
    Ok(StoredRow {
        key_hash,
        key,
        value: serde_json::from_str(&value)?,
        timestamp,
        microsecond,
    })
}
