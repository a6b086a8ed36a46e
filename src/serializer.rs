//! Per-shard write serialization: bounded FIFO queues and dedicated workers.
//!
//! Each shard owns exactly one worker thread and one bounded channel. The
//! worker's exclusive ownership of the shard session is what makes writes
//! single-flight: operations on one shard execute strictly in submission
//! order, operations on different shards in parallel.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::config::SaturationPolicy;
use crate::errors::{Result, StoreError};
use crate::partition::ShardId;
use crate::record::StoredRow;
use crate::registry::ShardSession;

/// An operation executed under a shard's exclusive session.
#[derive(Debug)]
pub enum Operation {
    Upsert {
        table: String,
        key_hash: Vec<u8>,
        key: Vec<u8>,
        value: String,
        timestamp: i64,
        microsecond: i64,
    },
    Get {
        table: String,
        key_hash: Vec<u8>,
    },
    Delete {
        table: String,
        key_hash: Vec<u8>,
    },
    Scan {
        table: String,
    },
    #[cfg(test)]
    Sleep(std::time::Duration),
}

/// Reply to an executed [`Operation`].
#[derive(Debug)]
pub enum OpResult {
    Done,
    Row(Option<StoredRow>),
    Deleted(bool),
    Rows(Vec<StoredRow>),
}

struct Job {
    op: Operation,
    reply: oneshot::Sender<Result<OpResult>>,
}

/// The future for a submitted operation.
///
/// Dropping the ticket (or calling [`Ticket::cancel`]) before the operation
/// begins execution abandons it: the worker observes the closed reply channel
/// and skips the job without touching storage. Once execution has begun, the
/// operation runs to completion regardless.
pub struct Ticket {
    shard: &'static str,
    rx: oneshot::Receiver<Result<OpResult>>,
}

impl Ticket {
    /// Abandon the operation. No effect once execution has begun.
    pub fn cancel(self) {}
}

impl Future for Ticket {
    type Output = Result<OpResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(StoreError::shard_unavailable(
                self.shard,
                "worker exited before completing the operation",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct ShardWorker {
    name: &'static str,
    tx: mpsc::Sender<Job>,
    thread: JoinHandle<()>,
}

/// One bounded FIFO execution context per shard.
pub struct WriteSerializer {
    workers: RwLock<BTreeMap<ShardId, ShardWorker>>,
    queue_depth: usize,
    policy: SaturationPolicy,
}

impl WriteSerializer {
    pub fn new(queue_depth: usize, policy: SaturationPolicy) -> Self {
        Self {
            workers: RwLock::new(BTreeMap::new()),
            queue_depth,
            policy,
        }
    }

    /// Start the worker for one shard, taking exclusive ownership of its
    /// session. An existing worker for the shard is replaced wholesale; it
    /// winds down once its queue drains.
    pub fn spawn(&self, shard: ShardId, name: &'static str, session: ShardSession) -> Result<()> {
        // A zero-capacity channel is invalid; the queue bound is at least one.
        let (tx, rx) = mpsc::channel(self.queue_depth.max(1));
        let thread = thread::Builder::new()
            .name(format!("cellstore-{name}"))
            .spawn(move || worker_loop(name, session, rx))?;
        self.workers
            .write()
            .insert(shard, ShardWorker { name, tx, thread });
        Ok(())
    }

    /// Enqueue an operation on the shard's queue and return its ticket. The
    /// operation executes strictly after everything enqueued before it on the
    /// same shard.
    pub async fn send(&self, shard: ShardId, op: Operation) -> Result<Ticket> {
        let (name, tx) = {
            let workers = self.workers.read();
            let worker = workers.get(&shard).ok_or_else(|| {
                StoreError::shard_unavailable(shard.to_string(), "no worker running")
            })?;
            (worker.name, worker.tx.clone())
        };
        let (reply, rx) = oneshot::channel();
        let job = Job { op, reply };
        match self.policy {
            SaturationPolicy::Reject => tx.try_send(job).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => StoreError::QueueSaturated {
                    shard: name.to_string(),
                },
                mpsc::error::TrySendError::Closed(_) => {
                    StoreError::shard_unavailable(name, "worker stopped")
                }
            })?,
            SaturationPolicy::Block => tx
                .send(job)
                .await
                .map_err(|_| StoreError::shard_unavailable(name, "worker stopped"))?,
        }
        Ok(Ticket { shard: name, rx })
    }

    /// Close every queue and join every worker. Operations already enqueued
    /// are drained before the workers exit.
    pub fn shutdown(&self) {
        let drained: Vec<ShardWorker> = {
            let mut workers = self.workers.write();
            std::mem::take(&mut *workers).into_values().collect()
        };
        for worker in drained {
            let ShardWorker { name, tx, thread } = worker;
            drop(tx);
            if thread.join().is_err() {
                warn!(shard = name, "shard worker panicked");
            }
        }
    }
}

fn worker_loop(name: &'static str, session: ShardSession, mut rx: mpsc::Receiver<Job>) {
    debug!(shard = name, "shard worker started");
    while let Some(job) = rx.blocking_recv() {
        if job.reply.is_closed() {
            trace!(shard = name, "operation abandoned before execution");
            continue;
        }
        let result = execute(&session, job.op);
        if let Err(err) = &result {
            debug!(shard = name, error = %err, "operation failed");
        }
        if job.reply.send(result).is_err() {
            trace!(shard = name, "caller went away before the reply was delivered");
        }
    }
    debug!(shard = name, "shard worker stopped");
}

fn execute(session: &ShardSession, op: Operation) -> Result<OpResult> {
    match op {
        Operation::Upsert {
            table,
            key_hash,
            key,
            value,
            timestamp,
            microsecond,
        } => session
            .upsert_row(&table, &key_hash, &key, &value, timestamp, microsecond)
            .map(|_| OpResult::Done),
        Operation::Get { table, key_hash } => session.get_row(&table, &key_hash).map(OpResult::Row),
        Operation::Delete { table, key_hash } => {
            session.delete_row(&table, &key_hash).map(OpResult::Deleted)
        }
        Operation::Scan { table } => session.scan_table(&table).map(OpResult::Rows),
        #[cfg(test)]
        Operation::Sleep(duration) => {
            thread::sleep(duration);
            Ok(OpResult::Done)
        }
    }
}
