//! Interfaces to the backing transactional key-value store.
//!
//! The physical FoundationDB client is consumed through the [`Database`] and
//! [`Transaction`] traits; the crate never talks to a cluster directly.
//! [`Db`] wraps a database handle with the retry loop every transactional
//! operation in the runtime goes through: a fresh transaction per attempt,
//! retriable errors retried with exponential backoff up to a budget, and
//! budget exhaustion surfaced as [`Error::TransactionConflict`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use std::{fmt, future::Future, sync::Arc, time::Duration};

use crate::{Error, Result};

/// Atomic mutations applied server-side at commit time.
///
/// `Add`, `Min` and `Max` interpret operands as 8-byte little-endian
/// integers. The versionstamped variants substitute the 80-bit commit
/// version into the key (respectively value) at the 4-byte little-endian
/// offset trailing the operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    /// Little-endian integer addition.
    Add,
    /// Little-endian integer minimum.
    Min,
    /// Little-endian integer maximum.
    Max,
    /// Substitute the commit versionstamp into the key.
    SetVersionstampedKey,
    /// Substitute the commit versionstamp into the value.
    SetVersionstampedValue,
}

/// One key-value pair returned by a range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The full key.
    pub key: Vec<u8>,
    /// The value bytes.
    pub value: Vec<u8>,
}

/// Options for a range read.
#[derive(Debug, Clone, Copy)]
pub struct RangeOptions {
    /// Maximum number of pairs to return; `0` lets the backend choose.
    pub limit: usize,
    /// Return pairs in descending key order.
    pub reverse: bool,
    /// Read at the snapshot isolation level (no conflict ranges recorded).
    pub snapshot: bool,
}

impl Default for RangeOptions {
    fn default() -> Self {
        Self {
            limit: 0,
            reverse: false,
            snapshot: true,
        }
    }
}

/// The result of a range read.
#[derive(Debug, Clone)]
pub struct RangeResult {
    /// Pairs in key order (descending when the read was reversed).
    pub entries: Vec<KeyValue>,
    /// `true` if the range holds further pairs past the returned ones.
    pub more: bool,
}

/// One attempt at a transactional unit of work.
///
/// Writes (`set`, `clear`, `clear_range`, `atomic_op`) mutate a local buffer
/// and never fail; reads and `commit` may suspend and fail. Either the whole
/// buffered write set commits or none of it does.
#[async_trait]
pub trait Transaction: Send + Sync + fmt::Debug {
    /// Reads a single key.
    async fn get(&self, key: &[u8], snapshot: bool) -> Result<Option<Vec<u8>>>;

    /// Reads a key range `[begin, end)`.
    async fn get_range(&self, begin: &[u8], end: &[u8], options: RangeOptions)
        -> Result<RangeResult>;

    /// Buffers a write of `key = value`.
    fn set(&self, key: &[u8], value: &[u8]);

    /// Buffers a clear of a single key.
    fn clear(&self, key: &[u8]);

    /// Buffers a clear of the range `[begin, end)`.
    fn clear_range(&self, begin: &[u8], end: &[u8]);

    /// Buffers an atomic mutation.
    fn atomic_op(&self, op: AtomicOp, key: &[u8], param: &[u8]);

    /// Commits the buffered writes.
    async fn commit(&self) -> Result<()>;

    /// Abandons the attempt. Further use of the handle yields
    /// [`Error::Cancelled`].
    fn cancel(&self);
}

/// A shareable handle to one transaction attempt.
pub type TransactionHandle = Arc<dyn Transaction>;

/// A handle to the backing database; creates transaction attempts.
///
/// Implementations must be safe to share across tasks.
#[async_trait]
pub trait Database: Send + Sync + fmt::Debug {
    /// Opens a fresh transaction.
    async fn create_transaction(&self) -> Result<TransactionHandle>;
}

/// Retry budget and backoff for [`Db::with_transaction`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryOptions {
    /// Maximum number of attempts before surfacing
    /// [`Error::TransactionConflict`].
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per retry.
    pub initial_backoff_ms: u64,
    /// Ceiling for the doubling backoff.
    pub max_backoff_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 5,
            max_backoff_ms: 1_000,
        }
    }
}

/// A database handle plus retry policy.
///
/// Cloning is cheap; all clones share the same backend handle.
#[derive(Debug, Clone)]
pub struct Db {
    database: Arc<dyn Database>,
    retry: RetryOptions,
}

impl Db {
    /// Wraps a backend handle with the default retry policy.
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self::with_retry(database, RetryOptions::default())
    }

    /// Wraps a backend handle with an explicit retry policy.
    pub fn with_retry(database: Arc<dyn Database>, retry: RetryOptions) -> Self {
        Self { database, retry }
    }

    /// The underlying backend handle.
    pub fn database(&self) -> &Arc<dyn Database> {
        &self.database
    }

    /// Runs `body` inside a transaction, committing on success.
    ///
    /// The body runs once per attempt against a fresh transaction; it must
    /// tolerate re-execution. Errors classified retriable by
    /// [`Error::is_retriable`] trigger a backoff and a new attempt until the
    /// budget runs out.
    pub async fn with_transaction<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: Fn(TransactionHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = Duration::from_millis(self.retry.initial_backoff_ms);
        let max_backoff = Duration::from_millis(self.retry.max_backoff_ms);
        let attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=attempts {
            let txn = self.database.create_transaction().await?;
            let outcome = match body(Arc::clone(&txn)).await {
                Ok(value) => txn.commit().await.map(|()| value),
                Err(err) => {
                    txn.cancel();
                    Err(err)
                }
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() && attempt < attempts => {
                    warn!(attempt, error = %err, "retrying transaction");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(err) if err.is_retriable() => {
                    return Err(Error::TransactionConflict { attempts });
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::TransactionConflict { attempts })
    }
}
