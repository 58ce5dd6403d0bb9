//! Stateless record CRUD over one subspace.
//!
//! A [`Store`] owns nothing but a database handle and a namespace root; all
//! state lives in the transaction the caller supplies. Index maintenance is
//! deliberately not here: callers (the [`Context`](crate::Context) save path
//! and the migration data operations) sequence maintainer updates around
//! these primitives.

use std::collections::VecDeque;

use crate::{
    db::{Db, RangeOptions, TransactionHandle},
    keyspace::KeySpace,
    subspace::key_after,
    tuple::Tuple,
    Result, Subspace,
};

/// Records fetched per round-trip while scanning.
const SCAN_BATCH: usize = 256;

/// CRUD facade for records stored under one namespace root.
#[derive(Debug, Clone)]
pub struct Store {
    db: Db,
    keyspace: KeySpace,
}

impl Store {
    /// Creates a store over `subspace`.
    pub fn new(db: Db, subspace: Subspace) -> Self {
        Self {
            db,
            keyspace: KeySpace::new(subspace),
        }
    }

    /// The layout helper for this store's namespace.
    pub fn keyspace(&self) -> &KeySpace {
        &self.keyspace
    }

    /// The namespace root this store writes under.
    pub fn subspace(&self) -> &Subspace {
        self.keyspace.root()
    }

    /// Writes the record `(type_name, id)`. Performs no read.
    pub fn save(&self, type_name: &str, id: &Tuple, bytes: &[u8], txn: &TransactionHandle) {
        txn.set(&self.keyspace.record_key(type_name, id), bytes);
    }

    /// Reads the record `(type_name, id)`.
    pub async fn load(
        &self,
        type_name: &str,
        id: &Tuple,
        txn: &TransactionHandle,
        snapshot: bool,
    ) -> Result<Option<Vec<u8>>> {
        txn.get(&self.keyspace.record_key(type_name, id), snapshot)
            .await
    }

    /// Clears the record key. Does not touch index entries.
    pub fn delete(&self, type_name: &str, id: &Tuple, txn: &TransactionHandle) {
        txn.clear(&self.keyspace.record_key(type_name, id));
    }

    /// Clears every record of `type_name`.
    pub fn clear(&self, type_name: &str, txn: &TransactionHandle) {
        let (begin, end) = self.keyspace.record_subspace(type_name).range();
        txn.clear_range(&begin, &end);
    }

    /// Scans the type's records in key order within `txn`.
    pub fn scan<'a>(&self, type_name: &str, txn: &'a TransactionHandle) -> RecordScan<'a> {
        RecordScan::new(self.keyspace.record_subspace(type_name), txn, true)
    }

    /// Like [`scan`](Self::scan), but with conflict-range tracking instead
    /// of snapshot isolation.
    pub fn scan_serializable<'a>(
        &self,
        type_name: &str,
        txn: &'a TransactionHandle,
    ) -> RecordScan<'a> {
        RecordScan::new(self.keyspace.record_subspace(type_name), txn, false)
    }

    /// [`save`](Self::save) wrapped in its own retrying transaction.
    pub async fn save_one(&self, type_name: &str, id: &Tuple, bytes: &[u8]) -> Result<()> {
        self.db
            .with_transaction(|txn| async move {
                self.save(type_name, id, bytes, &txn);
                Ok(())
            })
            .await
    }

    /// [`load`](Self::load) wrapped in its own retrying transaction.
    pub async fn load_one(&self, type_name: &str, id: &Tuple) -> Result<Option<Vec<u8>>> {
        self.db
            .with_transaction(|txn| async move { self.load(type_name, id, &txn, false).await })
            .await
    }

    /// [`delete`](Self::delete) wrapped in its own retrying transaction.
    pub async fn delete_one(&self, type_name: &str, id: &Tuple) -> Result<()> {
        self.db
            .with_transaction(|txn| async move {
                self.delete(type_name, id, &txn);
                Ok(())
            })
            .await
    }
}

/// A pull cursor over the records of one type, in id order.
///
/// Pages through the backend's range reads inside a single transaction;
/// yields `(id, payload)` pairs with the id unpacked from the key.
#[derive(Debug)]
pub struct RecordScan<'a> {
    subspace: Subspace,
    txn: &'a TransactionHandle,
    cursor: Vec<u8>,
    end: Vec<u8>,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    exhausted: bool,
    snapshot: bool,
}

impl<'a> RecordScan<'a> {
    fn new(subspace: Subspace, txn: &'a TransactionHandle, snapshot: bool) -> Self {
        let (begin, end) = subspace.range();
        Self {
            subspace,
            txn,
            cursor: begin,
            end,
            buffer: VecDeque::new(),
            exhausted: false,
            snapshot,
        }
    }

    /// The next `(id, payload)` pair, or `None` past the last record.
    pub async fn next(&mut self) -> Result<Option<(Tuple, Vec<u8>)>> {
        loop {
            if let Some((key, value)) = self.buffer.pop_front() {
                let id = self.subspace.unpack(&key)?;
                return Ok(Some((id, value)));
            }
            if self.exhausted {
                return Ok(None);
            }
            let result = self
                .txn
                .get_range(
                    &self.cursor,
                    &self.end,
                    RangeOptions {
                        limit: SCAN_BATCH,
                        reverse: false,
                        snapshot: self.snapshot,
                    },
                )
                .await?;
            if let Some(last) = result.entries.last() {
                self.cursor = key_after(&last.key);
            }
            self.exhausted = !result.more || result.entries.is_empty();
            self.buffer
                .extend(result.entries.into_iter().map(|kv| (kv.key, kv.value)));
        }
    }

    /// Drains the cursor into a vector.
    pub async fn collect(mut self) -> Result<Vec<(Tuple, Vec<u8>)>> {
        let mut out = Vec::new();
        while let Some(pair) = self.next().await? {
            out.push(pair);
        }
        Ok(out)
    }
}
