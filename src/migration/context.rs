//! The context handed to custom migration hooks.
//!
//! Every data operation respects the backend's per-transaction time and
//! size limits: work is chunked, each chunk runs in a fresh transaction, and
//! a chunk commits early once its [`BatchBudget`] is spent.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    container::Container,
    db::Db,
    keyspace::MetadataSpace,
    schema::{Record, Schema},
    Result, Subspace,
};

/// Soft per-transaction wall-clock limit, below the backend's hard 5 s.
const MAX_ELAPSED: Duration = Duration::from_secs(4);
/// Soft per-transaction write-volume limit, below the backend's hard 10 MB.
const MAX_WRITTEN: usize = 9 << 20;

/// Tracks how much of a transaction's time and size budget a batch has
/// spent.
#[derive(Debug)]
pub(crate) struct BatchBudget {
    started: Instant,
    written: usize,
}

impl BatchBudget {
    pub(crate) fn start() -> Self {
        Self {
            started: Instant::now(),
            written: 0,
        }
    }

    /// Records `bytes` of writes.
    pub(crate) fn charge(&mut self, bytes: usize) {
        self.written += bytes;
    }

    /// `true` once the transaction should commit and a fresh one take over.
    pub(crate) fn exhausted(&self) -> bool {
        self.started.elapsed() >= MAX_ELAPSED || self.written >= MAX_WRITTEN
    }
}

/// Data access for custom stage hooks.
///
/// Mutations go through the same record-plus-indexes path as a context save,
/// so every index in state `write-only` or above stays consistent with the
/// records the hook rewrites.
#[derive(Debug)]
pub struct MigrationContext {
    container: Arc<Container>,
    schema: Schema,
    batch_size: usize,
}

impl MigrationContext {
    pub(crate) fn new(container: Arc<Container>, schema: Schema) -> Self {
        let batch_size = container.options().build_batch_size;
        Self {
            container,
            schema,
            batch_size,
        }
    }

    /// The database handle.
    pub fn database(&self) -> &Db {
        self.container.db()
    }

    /// The stage's target schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The metadata namespace.
    pub fn metadata(&self) -> &MetadataSpace {
        self.container.metadata()
    }

    /// Per-type storage locations: `type_name -> (record subspace, index
    /// root subspace)`.
    pub fn store_registry(&self) -> BTreeMap<String, (Subspace, Subspace)> {
        let keyspace = self.container.keyspace();
        self.schema
            .entities()
            .iter()
            .map(|entity| {
                (
                    entity.type_name().to_owned(),
                    (
                        keyspace.record_subspace(entity.type_name()),
                        keyspace.index_root(),
                    ),
                )
            })
            .collect()
    }

    /// Visits every record of `R`, a fresh transaction per batch; `f`
    /// returning `false` stops early. Returns the number of records
    /// visited.
    pub async fn enumerate<R: Record>(&self, mut f: impl FnMut(R) -> bool + Send) -> Result<u64> {
        let subspace = self
            .container
            .keyspace()
            .record_subspace(R::TYPE_NAME);
        super::enumerate_raw(self.container.db(), &subspace, self.batch_size, &mut |_,
            bytes| {
            let record =
                R::from_bytes(std::borrow::Cow::Owned(bytes)).map_err(crate::Error::Serialization)?;
            Ok(f(record))
        })
        .await
    }

    /// Counts the records of `type_name` without decoding them.
    pub async fn count(&self, type_name: &str) -> Result<u64> {
        let subspace = self.container.keyspace().record_subspace(type_name);
        super::enumerate_raw(self.container.db(), &subspace, self.batch_size, &mut |_, _| {
            Ok(true)
        })
        .await
    }

    /// Writes one record, maintaining its indexes.
    pub async fn update<R: Record>(&self, record: &R) -> Result<()> {
        self.batch_update(std::slice::from_ref(record)).await
    }

    /// Deletes one record, maintaining its indexes.
    pub async fn delete<R: Record>(&self, record: &R) -> Result<()> {
        self.batch_delete(std::slice::from_ref(record)).await
    }

    /// Writes many records, chunked into fresh transactions.
    pub async fn batch_update<R: Record>(&self, records: &[R]) -> Result<()> {
        self.apply_batched(records, true).await
    }

    /// Deletes many records, chunked into fresh transactions.
    pub async fn batch_delete<R: Record>(&self, records: &[R]) -> Result<()> {
        self.apply_batched(records, false).await
    }

    async fn apply_batched<R: Record>(&self, records: &[R], write: bool) -> Result<()> {
        let container = &self.container;
        let store = container.store(container.subspace());
        let store = &store;
        let index_names: Vec<String> = container
            .index_manager()
            .for_type(R::TYPE_NAME)
            .into_iter()
            .map(|descriptor| descriptor.name().to_owned())
            .collect();
        let index_names = &index_names;

        let mut start = 0;
        while start < records.len() {
            let chunk = &records[start..records.len().min(start + self.batch_size.max(1))];
            let processed = container
                .with_transaction(|txn| async move {
                    let names: Vec<&str> = index_names.iter().map(String::as_str).collect();
                    let states = container
                        .index_manager()
                        .registry()
                        .states(&txn, &names)
                        .await?;
                    let mut budget = BatchBudget::start();
                    let mut processed = 0_usize;
                    for record in chunk {
                        let id = record.primary_key();
                        let bytes = record.to_bytes();
                        let new = write.then_some(bytes.as_slice());
                        container
                            .apply_mutation(&txn, store, R::TYPE_NAME, &id, new, &states)
                            .await?;
                        budget.charge(bytes.len());
                        processed += 1;
                        if budget.exhausted() {
                            break;
                        }
                    }
                    Ok(processed)
                })
                .await?;
            start += processed.max(1);
        }
        Ok(())
    }
}
